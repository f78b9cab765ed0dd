//! Mutable level state that has to match on every peer: trigger switches
//! and the animation offset of destructible tiles.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const TRIGGER_COUNT: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileMapState {
    triggers: Vec<bool>,
    tile_animations: BTreeMap<(i32, i32), i32>,
}

impl Default for TileMapState {
    fn default() -> Self {
        Self::new()
    }
}

impl TileMapState {
    pub fn new() -> Self {
        Self {
            triggers: vec![false; TRIGGER_COUNT],
            tile_animations: BTreeMap::new(),
        }
    }

    pub fn set_trigger(&mut self, trigger_id: u8, state: bool) {
        self.triggers[trigger_id as usize] = state;
    }

    pub fn trigger(&self, trigger_id: u8) -> bool {
        self.triggers.get(trigger_id as usize).copied().unwrap_or(false)
    }

    pub fn advance_tile_animation(&mut self, tile_x: i32, tile_y: i32, amount: i32) {
        let offset = self.tile_animations.entry((tile_x, tile_y)).or_insert(0);
        *offset = offset.saturating_add(amount);
    }

    pub fn tile_animation(&self, tile_x: i32, tile_y: i32) -> i32 {
        self.tile_animations
            .get(&(tile_x, tile_y))
            .copied()
            .unwrap_or(0)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut state: TileMapState = bincode::deserialize(data)?;
        state.triggers.resize(TRIGGER_COUNT, false);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_trigger_and_animation_state_transfer() {
        let mut state = TileMapState::new();
        state.set_trigger(5, true);
        state.set_trigger(255, true);
        state.advance_tile_animation(3, -4, 2);
        state.advance_tile_animation(3, -4, 1);

        let bytes = assert_ok!(state.encode());
        let copy = assert_ok!(TileMapState::decode(&bytes));
        assert!(copy.trigger(5));
        assert!(copy.trigger(255));
        assert!(!copy.trigger(6));
        assert_eq!(copy.tile_animation(3, -4), 3);
        assert_eq!(copy.tile_animation(0, 0), 0);
        assert_eq!(copy, state);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_err!(TileMapState::decode(&[0xff, 0xff, 0xff]));
    }
}

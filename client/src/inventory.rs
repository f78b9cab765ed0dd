//! Weapon and collectible counters of the local player, as last reported by
//! the server.

use log::debug;

/// Number of weapon slots a player carries
pub const WEAPON_COUNT: usize = 10;

/// Number of gem colors
pub const GEM_TYPE_COUNT: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerInventory {
    pub current_weapon: u8,
    pub ammo: [u16; WEAPON_COUNT],
    pub weapon_upgrades: [u8; WEAPON_COUNT],
    pub coins: i32,
    pub gems: [i32; GEM_TYPE_COUNT],
}

impl PlayerInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for an unknown weapon type
    pub fn set_current_weapon(&mut self, weapon_type: u8) -> bool {
        if (weapon_type as usize) >= WEAPON_COUNT {
            debug!("Unknown weapon type {}", weapon_type);
            return false;
        }
        self.current_weapon = weapon_type;
        true
    }

    pub fn set_ammo(&mut self, weapon_type: u8, ammo: u16) -> bool {
        match self.ammo.get_mut(weapon_type as usize) {
            Some(slot) => {
                *slot = ammo;
                true
            }
            None => {
                debug!("Ammo for unknown weapon type {}", weapon_type);
                false
            }
        }
    }

    pub fn set_weapon_upgrades(&mut self, weapon_type: u8, upgrades: u8) -> bool {
        match self.weapon_upgrades.get_mut(weapon_type as usize) {
            Some(slot) => {
                *slot = upgrades;
                true
            }
            None => {
                debug!("Upgrades for unknown weapon type {}", weapon_type);
                false
            }
        }
    }

    pub fn set_gems(&mut self, gem_type: u8, count: i32) -> bool {
        match self.gems.get_mut(gem_type as usize) {
            Some(slot) => {
                *slot = count;
                true
            }
            None => {
                debug!("Unknown gem type {}", gem_type);
                false
            }
        }
    }
}

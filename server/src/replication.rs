//! Network identities of server-side actors and players.

use shared::world::{ActorHandle, ReplicationMode};
use shared::{ActorId, FIRST_ACTOR_ID, MAX_PLAYER_COUNT};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationRecord {
    pub actor_id: ActorId,
    pub mode: ReplicationMode,
    pub handle: ActorHandle,
}

/// Bidirectional map between world actors and their [`ActorId`]s.
///
/// Ids start at [`FIRST_ACTOR_ID`]; allocation takes the lowest id not
/// currently mapped, so an id only comes back after its owner was
/// unregistered.
#[derive(Debug, Default)]
pub struct ActorReplicationTable {
    by_handle: HashMap<ActorHandle, ActorId>,
    records: BTreeMap<ActorId, ReplicationRecord>,
}

impl ActorReplicationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_free_id(&self) -> Option<ActorId> {
        let mut candidate = FIRST_ACTOR_ID;
        for &id in self.records.keys() {
            if id > candidate {
                break;
            }
            candidate = id.checked_add(1)?;
        }
        Some(candidate)
    }

    /// Assigns an id to `handle`. Registering the same handle twice
    /// returns the id it already has.
    pub fn register(&mut self, handle: ActorHandle, mode: ReplicationMode) -> Option<ActorId> {
        if let Some(&actor_id) = self.by_handle.get(&handle) {
            return Some(actor_id);
        }
        let actor_id = self.find_free_id()?;
        self.by_handle.insert(handle, actor_id);
        self.records.insert(
            actor_id,
            ReplicationRecord {
                actor_id,
                mode,
                handle,
            },
        );
        Some(actor_id)
    }

    pub fn unregister(&mut self, handle: ActorHandle) -> Option<ReplicationRecord> {
        let actor_id = self.by_handle.remove(&handle)?;
        self.records.remove(&actor_id)
    }

    pub fn id_of(&self, handle: ActorHandle) -> Option<ActorId> {
        self.by_handle.get(&handle).copied()
    }

    pub fn get(&self, actor_id: ActorId) -> Option<&ReplicationRecord> {
        self.records.get(&actor_id)
    }

    /// In ascending id order.
    pub fn records(&self) -> impl Iterator<Item = &ReplicationRecord> + '_ {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Free list of player indices `0..max`.
#[derive(Debug)]
pub struct PlayerSlots {
    free: BTreeSet<u32>,
    capacity: u32,
}

impl PlayerSlots {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.min(MAX_PLAYER_COUNT);
        Self {
            free: (0..capacity).collect(),
            capacity,
        }
    }

    /// Lowest free index.
    pub fn allocate(&mut self) -> Option<u32> {
        let index = *self.free.iter().next()?;
        self.free.remove(&index);
        Some(index)
    }

    pub fn release(&mut self, index: u32) {
        if index < self.capacity {
            self.free.insert(index);
        }
    }

    pub fn in_use(&self) -> usize {
        (self.capacity as usize) - self.free.len()
    }
}

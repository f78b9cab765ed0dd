//! Per-peer bookkeeping for the authoritative server
//!
//! This module tracks everything the server knows about a connected peer:
//! - How far the peer got in loading and synchronizing the level
//! - Which player (index and world actor) the peer controls
//! - The newest accepted player update timestamp, used to drop stale or
//!   reordered unreliable updates
//!
//! The registry is owned by the server coordinator and only ever mutated on
//! the game thread. It never owns the connection itself; peers are referred
//! to by their transport [`PeerId`].

use log::{debug, info};
use shared::transport::PeerId;
use shared::world::ActorHandle;
use std::collections::BTreeMap;

/// Level synchronization progress of a peer
///
/// States are ordered and a peer only ever moves forward:
/// `Unknown → LevelLoaded → LevelSynchronized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyncState {
    /// Connected, level not loaded yet
    Unknown,
    /// Client reported the level as loaded, waiting for the next
    /// maintenance pass to receive its player and the world state
    LevelLoaded,
    /// Player spawned and world replicated, receives snapshots
    LevelSynchronized,
}

/// Player controlled by a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerBinding {
    pub player_index: u32,
    pub handle: ActorHandle,
}

/// Everything the server tracks for one connected peer
#[derive(Debug, Clone)]
pub struct PeerDesc {
    /// Player assigned once the peer is synchronized
    pub player: Option<PlayerBinding>,
    /// Current synchronization state, see [`SyncState`]
    pub sync_state: SyncState,
    /// Timestamp of the newest player update applied for this peer
    pub last_accepted_timestamp: u64,
    /// Newest warp sequence number reported by the client
    pub last_warp_seq: u64,
    /// Name sent during authentication
    pub player_name: Option<String>,
}

impl PeerDesc {
    /// Creates the descriptor of a freshly connected peer
    pub fn new() -> Self {
        Self {
            player: None,
            sync_state: SyncState::Unknown,
            last_accepted_timestamp: 0,
            last_warp_seq: 0,
            player_name: None,
        }
    }

    /// Moves the peer to `state` if that is a step forward
    ///
    /// Returns true if the state changed. Requests to stay in the same
    /// state or to go back are ignored, which makes repeated "level ready"
    /// messages harmless.
    pub fn advance_to(&mut self, state: SyncState) -> bool {
        if state > self.sync_state {
            self.sync_state = state;
            true
        } else {
            false
        }
    }

    /// Accepts a player update timestamp if it is strictly newer than the
    /// last accepted one
    ///
    /// Unreliable updates may arrive late or out of order; anything not
    /// newer than what was already applied is rejected so the state always
    /// corresponds to the newest report.
    pub fn accept_timestamp(&mut self, timestamp: u64) -> bool {
        if timestamp > self.last_accepted_timestamp {
            self.last_accepted_timestamp = timestamp;
            true
        } else {
            false
        }
    }

    /// Returns the controlled player index, if any
    pub fn player_index(&self) -> Option<u32> {
        self.player.map(|binding| binding.player_index)
    }
}

impl Default for PeerDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// All connected peers, ordered by id
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerDesc>,
}

impl PeerRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly connected peer
    ///
    /// Returns false if the peer was already known.
    pub fn add_peer(&mut self, peer: PeerId) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        info!("{} joined", peer);
        self.peers.insert(peer, PeerDesc::new());
        true
    }

    /// Removes a peer and returns what was known about it
    pub fn remove_peer(&mut self, peer: PeerId) -> Option<PeerDesc> {
        let desc = self.peers.remove(&peer);
        if desc.is_some() {
            debug!("{} removed from registry", peer);
        }
        desc
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerDesc> {
        self.peers.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut PeerDesc> {
        self.peers.get_mut(&peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns the synchronization state of a peer
    pub fn sync_state(&self, peer: PeerId) -> Option<SyncState> {
        self.peers.get(&peer).map(|desc| desc.sync_state)
    }

    /// Returns true if the peer receives snapshots and world updates
    pub fn is_synchronized(&self, peer: PeerId) -> bool {
        self.sync_state(peer) == Some(SyncState::LevelSynchronized)
    }

    /// Returns true if the peer has at least loaded the level
    pub fn has_loaded_level(&self, peer: PeerId) -> bool {
        self.sync_state(peer)
            .map_or(false, |state| state >= SyncState::LevelLoaded)
    }

    /// Lists peers currently in exactly the given state
    pub fn peers_in_state(&self, state: SyncState) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, desc)| desc.sync_state == state)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Finds the peer controlling a player
    pub fn find_by_player(&self, player_index: u32) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, desc)| desc.player_index() == Some(player_index))
            .map(|(peer, _)| *peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &PeerDesc)> + '_ {
        self.peers.iter().map(|(peer, desc)| (*peer, desc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::world::{Actor, World};

    #[test]
    fn test_sync_state_only_moves_forward() {
        let mut desc = PeerDesc::new();
        assert!(desc.advance_to(SyncState::LevelLoaded));
        assert!(desc.advance_to(SyncState::LevelSynchronized));

        // Repeated or backwards transitions are no-ops
        assert!(!desc.advance_to(SyncState::LevelLoaded));
        assert!(!desc.advance_to(SyncState::LevelSynchronized));
        assert!(!desc.advance_to(SyncState::Unknown));
        assert_eq!(desc.sync_state, SyncState::LevelSynchronized);
    }

    #[test]
    fn test_timestamps_must_be_strictly_newer() {
        let mut desc = PeerDesc::new();
        assert!(desc.accept_timestamp(1000));
        assert!(!desc.accept_timestamp(900));
        assert!(!desc.accept_timestamp(1000));
        assert!(desc.accept_timestamp(1001));
        assert_eq!(desc.last_accepted_timestamp, 1001);
    }

    #[test]
    fn test_add_and_remove_peers() {
        let mut registry = PeerRegistry::new();
        assert!(registry.add_peer(PeerId(1)));
        assert!(!registry.add_peer(PeerId(1)));
        assert!(registry.add_peer(PeerId(2)));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove_peer(PeerId(1)).is_some());
        assert!(registry.remove_peer(PeerId(1)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_state_queries() {
        let mut registry = PeerRegistry::new();
        registry.add_peer(PeerId(1));
        registry.add_peer(PeerId(2));
        registry.add_peer(PeerId(3));
        registry.get_mut(PeerId(2)).unwrap().advance_to(SyncState::LevelLoaded);
        registry
            .get_mut(PeerId(3))
            .unwrap()
            .advance_to(SyncState::LevelSynchronized);

        assert_eq!(registry.peers_in_state(SyncState::LevelLoaded), vec![PeerId(2)]);
        assert!(registry.is_synchronized(PeerId(3)));
        assert!(!registry.is_synchronized(PeerId(2)));
        assert!(registry.has_loaded_level(PeerId(2)));
        assert!(!registry.has_loaded_level(PeerId(1)));
        assert!(!registry.has_loaded_level(PeerId(9)));
    }

    #[test]
    fn test_find_by_player() {
        let mut world = World::new();
        let handle = world.add_actor(Actor::default());
        let mut registry = PeerRegistry::new();
        registry.add_peer(PeerId(4));
        registry.get_mut(PeerId(4)).unwrap().player = Some(PlayerBinding {
            player_index: 2,
            handle,
        });

        assert_eq!(registry.find_by_player(2), Some(PeerId(4)));
        assert_eq!(registry.find_by_player(0), None);
    }
}

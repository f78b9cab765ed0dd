//! Client-side view of replicated actors, keyed by the id the server chose.

use log::debug;
use shared::interpolation::InterpolationBuffer;
use shared::world::{ActorHandle, ReplicationMode};
use shared::ActorId;
use std::collections::BTreeMap;

/// Local stand-in for an actor owned by the server
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    pub handle: ActorHandle,
    pub mode: ReplicationMode,
    /// Present for remoted actors only; mirrored ones simulate locally
    pub interpolation: Option<InterpolationBuffer>,
}

#[derive(Debug, Default)]
pub struct RemoteActorTable {
    proxies: BTreeMap<ActorId, RemoteProxy>,
}

impl RemoteActorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a proxy and returns the one it replaced, if the id was taken
    pub fn insert(&mut self, actor_id: ActorId, proxy: RemoteProxy) -> Option<RemoteProxy> {
        let previous = self.proxies.insert(actor_id, proxy);
        if previous.is_some() {
            debug!("Actor {} recreated", actor_id);
        }
        previous
    }

    pub fn remove(&mut self, actor_id: ActorId) -> Option<RemoteProxy> {
        self.proxies.remove(&actor_id)
    }

    pub fn resolve_remote(&self, actor_id: ActorId) -> Option<&RemoteProxy> {
        self.proxies.get(&actor_id)
    }

    pub fn get_mut(&mut self, actor_id: ActorId) -> Option<&mut RemoteProxy> {
        self.proxies.get_mut(&actor_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActorId, &RemoteProxy)> + '_ {
        self.proxies.iter().map(|(id, proxy)| (*id, proxy))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ActorId, &mut RemoteProxy)> + '_ {
        self.proxies.iter_mut().map(|(id, proxy)| (*id, proxy))
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn clear(&mut self) {
        self.proxies.clear();
    }
}

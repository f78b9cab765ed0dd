//! Minimal world model the replication layer reads from and writes to.
//!
//! Gameplay code owns the actors; replication only ever refers to them
//! through [`ActorHandle`]s, which stay valid (and are never reused for a
//! different actor) until the actor is removed.

use crate::math::Vector2f;

/// Size of the parameter block carried by a spawn event.
pub const SPAWN_PARAMS_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorHandle {
    index: u32,
    generation: u32,
}

/// Replication hint attached to an actor when it is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationTag {
    /// Transform and animation pushed every tick.
    #[default]
    Remoted,
    /// Recreated on every peer from its spawn event, then simulated locally.
    Mirrored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Mirrored,
    Remoted,
}

/// Level event that created an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnEvent {
    pub event_type: u32,
    pub params: [u8; SPAWN_PARAMS_SIZE],
    pub actor_flags: u32,
    pub tile_x: i32,
    pub tile_y: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpawnDescriptor {
    pub tag: ReplicationTag,
    pub event: Option<SpawnEvent>,
    /// Metadata (sprites, animations) the remote side loads for a proxy.
    pub metadata_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub pos: Vector2f,
    pub speed: Vector2f,
    pub animation: Option<u32>,
    pub rotation: f32,
    pub facing_left: bool,
    pub visible: bool,
    pub anim_paused: bool,
    pub renderer_type: u8,
    pub layer: u16,
    pub state_flags: u32,
    /// Special move reported by the controlling client (3 bits on the wire).
    pub special_move: u8,
    pub actively_pushing: bool,
    pub health: i32,
    pub spawn: SpawnDescriptor,
    pub player_index: Option<u32>,
    pub team: u8,
    /// Set when the actor teleported; cleared after the next snapshot.
    pub just_warped: bool,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            pos: Vector2f::ZERO,
            speed: Vector2f::ZERO,
            animation: None,
            rotation: 0.0,
            facing_left: false,
            visible: true,
            anim_paused: false,
            renderer_type: 0,
            layer: 0,
            state_flags: 0,
            special_move: 0,
            actively_pushing: false,
            health: 0,
            spawn: SpawnDescriptor::default(),
            player_index: None,
            team: 0,
            just_warped: false,
        }
    }
}

impl Actor {
    pub fn new(pos: Vector2f) -> Self {
        Self {
            pos,
            ..Self::default()
        }
    }

    pub fn with_animation(mut self, animation: u32) -> Self {
        self.animation = Some(animation);
        self
    }

    pub fn with_spawn(mut self, spawn: SpawnDescriptor) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn is_player(&self) -> bool {
        self.player_index.is_some()
    }

    /// Mirrored when the actor can be recreated from its spawn event and is
    /// either tagged for mirroring or has no visual state worth streaming.
    pub fn replication_mode(&self) -> ReplicationMode {
        match (&self.spawn.event, self.spawn.tag) {
            (Some(_), ReplicationTag::Mirrored) => ReplicationMode::Mirrored,
            (Some(_), ReplicationTag::Remoted) if self.animation.is_none() => {
                ReplicationMode::Mirrored
            }
            _ => ReplicationMode::Remoted,
        }
    }

    /// Moves without interpolation on the remote side.
    pub fn warp_to(&mut self, pos: Vector2f) {
        self.pos = pos;
        self.just_warped = true;
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    actor: Option<Actor>,
    pending_destroy: bool,
}

#[derive(Debug, Default)]
pub struct World {
    slots: Vec<Slot>,
    free: Vec<u32>,
    count: usize,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add_actor(&mut self, actor: Actor) -> ActorHandle {
        self.count += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.actor = Some(actor);
            slot.pending_destroy = false;
            return ActorHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            actor: Some(actor),
            pending_destroy: false,
        });
        ActorHandle {
            index,
            generation: 0,
        }
    }

    fn slot(&self, handle: ActorHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.actor.is_some())
    }

    fn slot_mut(&mut self, handle: ActorHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.actor.is_some())
    }

    pub fn contains(&self, handle: ActorHandle) -> bool {
        self.slot(handle).is_some()
    }

    pub fn get(&self, handle: ActorHandle) -> Option<&Actor> {
        self.slot(handle).and_then(|slot| slot.actor.as_ref())
    }

    pub fn get_mut(&mut self, handle: ActorHandle) -> Option<&mut Actor> {
        self.slot_mut(handle).and_then(|slot| slot.actor.as_mut())
    }

    pub fn is_destroyed(&self, handle: ActorHandle) -> bool {
        self.slot(handle).map_or(true, |slot| slot.pending_destroy)
    }

    /// Schedules removal at the end of the frame. Returns `false` for
    /// unknown handles.
    pub fn mark_destroyed(&mut self, handle: ActorHandle) -> bool {
        match self.slot_mut(handle) {
            Some(slot) => {
                slot.pending_destroy = true;
                true
            }
            None => false,
        }
    }

    /// Removes every actor marked destroyed, calling `before_destroy` for
    /// each one first.
    pub fn remove_destroyed<F>(&mut self, mut before_destroy: F) -> usize
    where
        F: FnMut(ActorHandle, &Actor),
    {
        let mut removed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.pending_destroy {
                continue;
            }
            if let Some(actor) = slot.actor.take() {
                let handle = ActorHandle {
                    index: index as u32,
                    generation: slot.generation,
                };
                before_destroy(handle, &actor);
                slot.generation = slot.generation.wrapping_add(1);
                slot.pending_destroy = false;
                self.free.push(index as u32);
                removed += 1;
            }
        }
        self.count -= removed;
        removed
    }

    /// Live actors, including those pending removal.
    pub fn iter(&self) -> impl Iterator<Item = (ActorHandle, &Actor)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.actor.as_ref().map(|actor| {
                (
                    ActorHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    actor,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_event() -> SpawnEvent {
        SpawnEvent {
            event_type: 12,
            params: [0; SPAWN_PARAMS_SIZE],
            actor_flags: 0,
            tile_x: 4,
            tile_y: 9,
        }
    }

    #[test]
    fn test_classification() {
        let animated = Actor::new(Vector2f::ZERO).with_animation(3);
        assert_eq!(animated.replication_mode(), ReplicationMode::Remoted);

        let static_object = Actor::new(Vector2f::ZERO).with_spawn(SpawnDescriptor {
            event: Some(spawn_event()),
            ..SpawnDescriptor::default()
        });
        assert_eq!(static_object.replication_mode(), ReplicationMode::Mirrored);

        let tagged = Actor::new(Vector2f::ZERO)
            .with_animation(1)
            .with_spawn(SpawnDescriptor {
                tag: ReplicationTag::Mirrored,
                event: Some(spawn_event()),
                metadata_path: String::new(),
            });
        assert_eq!(tagged.replication_mode(), ReplicationMode::Mirrored);

        // Without a spawn event there is nothing to replay.
        let orphan = Actor::new(Vector2f::ZERO).with_spawn(SpawnDescriptor {
            tag: ReplicationTag::Mirrored,
            ..SpawnDescriptor::default()
        });
        assert_eq!(orphan.replication_mode(), ReplicationMode::Remoted);
    }

    #[test]
    fn test_removed_handles_go_stale() {
        let mut world = World::new();
        let first = world.add_actor(Actor::default());
        assert!(world.mark_destroyed(first));
        assert!(world.contains(first));

        let mut seen = Vec::new();
        assert_eq!(world.remove_destroyed(|handle, _| seen.push(handle)), 1);
        assert_eq!(seen, vec![first]);
        assert!(!world.contains(first));
        assert!(world.get(first).is_none());

        // Slot is reused under a new generation.
        let second = world.add_actor(Actor::default());
        assert_ne!(first, second);
        assert!(world.get(first).is_none());
        assert!(world.get(second).is_some());
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_mark_unknown_handle() {
        let mut world = World::new();
        let handle = world.add_actor(Actor::default());
        world.mark_destroyed(handle);
        world.remove_destroyed(|_, _| {});
        assert!(!world.mark_destroyed(handle));
        assert!(world.is_destroyed(handle));
    }
}

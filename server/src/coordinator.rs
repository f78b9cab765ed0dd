//! Server replication coordinator
//!
//! Owns the authoritative world and drives replication once per tick:
//! - Drains network events handed over by the transport thread
//! - Promotes peers that loaded the level to fully synchronized players
//! - Collects destroyed actors and announces their removal
//! - Sends the compressed actor snapshot to synchronized peers
//! - Ages the remote input double buffers
//!
//! Gameplay code talks to the coordinator to spawn or destroy actors and to
//! push one-off notifications (sounds, alerts, triggers, damage).

use crate::config::ServerConfig;
use crate::peer_registry::{PeerRegistry, PlayerBinding, SyncState};
use crate::replication::{ActorReplicationTable, PlayerSlots};
use log::{debug, error, info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use shared::input::{PlayerAction, PlayerInputState};
use shared::packets::{
    ClientPacket, GameMode, PlayerUpdate, ServerPacket, MAX_TEXT_LENGTH, MIN_TEXT_LENGTH,
};
use shared::session::Session;
use shared::snapshot::{ActorUpdate, Snapshot};
use shared::tilemap::TileMapState;
use shared::transport::{
    Channel, ConnectionResult, NetworkHandler, Outbox, PeerId, Reason, SendTarget, TransportHost,
};
use shared::udp::UdpHost;
use shared::world::{Actor, ActorHandle, ReplicationMode, World};
use shared::{ActorId, Result, Vector2f};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the hand-off queue between transport and game thread
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Events handed from the transport thread to the game thread
#[derive(Debug)]
pub enum NetworkEvent {
    PeerConnected {
        peer: PeerId,
    },
    PeerDisconnected {
        peer: PeerId,
        reason: Reason,
    },
    PacketReceived {
        peer: PeerId,
        channel: Channel,
        packet_type: u8,
        payload: Vec<u8>,
    },
}

/// Transport callbacks of the server
///
/// Runs on the transport thread and only validates the protocol version and
/// enqueues events. Connection lifecycle events wait for room in the queue,
/// packets are dropped when it is full.
pub struct ServerHandler {
    events: mpsc::Sender<NetworkEvent>,
    protocol_version: u32,
}

impl ServerHandler {
    pub fn new(events: mpsc::Sender<NetworkEvent>, protocol_version: u32) -> Self {
        Self {
            events,
            protocol_version,
        }
    }
}

impl NetworkHandler for ServerHandler {
    fn on_peer_connected(&mut self, peer: PeerId, client_data: u32) -> ConnectionResult {
        if client_data != self.protocol_version {
            warn!(
                "{} uses protocol {}, expected {}",
                peer, client_data, self.protocol_version
            );
            return ConnectionResult::Reject(Reason::IncompatibleVersion);
        }
        match self.events.blocking_send(NetworkEvent::PeerConnected { peer }) {
            Ok(()) => ConnectionResult::Accept,
            Err(_) => ConnectionResult::Reject(Reason::ServerStopped),
        }
    }

    fn on_peer_disconnected(&mut self, peer: PeerId, reason: Reason) {
        if self
            .events
            .blocking_send(NetworkEvent::PeerDisconnected { peer, reason })
            .is_err()
        {
            debug!("Game loop gone, dropping disconnect of {}", peer);
        }
    }

    fn on_packet_received(&mut self, peer: PeerId, channel: Channel, packet_type: u8, payload: &[u8]) {
        let event = NetworkEvent::PacketReceived {
            peer,
            channel,
            packet_type,
            payload: payload.to_vec(),
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Event queue full, dropping packet {} from {}", packet_type, peer)
            }
            Err(TrySendError::Closed(_)) => debug!("Game loop gone, dropping packet"),
        }
    }
}

/// Server-side check of client reported player state
///
/// The server trusts its clients by default. A validator can refuse an
/// update, in which case the server keeps its own position and moves the
/// client back.
pub trait PlayerUpdateValidator: Send {
    fn validate(&mut self, current: &Actor, update: &PlayerUpdate) -> bool;
}

/// Accepts every update
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustClient;

impl PlayerUpdateValidator for TrustClient {
    fn validate(&mut self, _current: &Actor, _update: &PlayerUpdate) -> bool {
        true
    }
}

/// Rejects updates that move a player further than `max_distance` per
/// report, unless the client announced a warp
#[derive(Debug, Clone, Copy)]
pub struct MaxDeviation {
    pub max_distance: f32,
}

impl PlayerUpdateValidator for MaxDeviation {
    fn validate(&mut self, current: &Actor, update: &PlayerUpdate) -> bool {
        update.warp_seq.is_some() || current.pos.distance(update.pos) <= self.max_distance
    }
}

/// Authoritative replication driver
pub struct ServerCoordinator<O: Outbox> {
    // Dropped before the outbox so a transport thread blocked on a full
    // queue wakes up before the session joins it
    events: mpsc::Receiver<NetworkEvent>,
    config: ServerConfig,
    outbox: O,
    world: World,
    tile_map: TileMapState,
    registry: PeerRegistry,
    actors: ActorReplicationTable,
    player_slots: PlayerSlots,
    players: BTreeMap<u32, ActorHandle>,
    inputs: HashMap<u32, PlayerInputState>,
    validator: Box<dyn PlayerUpdateValidator>,
    game_mode: GameMode,
    frame: u32,
}

/// Binds a UDP host on the configured address and starts serving
pub fn start(config: ServerConfig) -> Result<ServerCoordinator<Session>> {
    let host = UdpHost::bind(config.bind_addr()?)?;
    start_with_host(config, host)
}

/// Starts serving on an already created transport host
pub fn start_with_host<T: TransportHost>(
    config: ServerConfig,
    host: T,
) -> Result<ServerCoordinator<Session>> {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let handler = ServerHandler::new(tx, config.protocol_version);
    let session = Session::create_server(handler, host, config.max_players as usize)?;
    info!(
        "Serving {}/{} ({:?}) for up to {} players",
        config.episode, config.level, config.game_mode, config.max_players
    );
    Ok(ServerCoordinator::new(config, session, rx))
}

impl<O: Outbox> ServerCoordinator<O> {
    pub fn new(config: ServerConfig, outbox: O, events: mpsc::Receiver<NetworkEvent>) -> Self {
        Self {
            player_slots: PlayerSlots::new(config.max_players),
            game_mode: config.game_mode,
            config,
            outbox,
            events,
            world: World::new(),
            tile_map: TileMapState::new(),
            registry: PeerRegistry::new(),
            actors: ActorReplicationTable::new(),
            players: BTreeMap::new(),
            inputs: HashMap::new(),
            validator: Box::new(TrustClient),
            frame: 0,
        }
    }

    /// Replaces the player update validator
    pub fn with_validator(mut self, validator: Box<dyn PlayerUpdateValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn tile_map(&self) -> &TileMapState {
        &self.tile_map
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn replication(&self) -> &ActorReplicationTable {
        &self.actors
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    pub fn game_mode(&self) -> GameMode {
        self.game_mode
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn player_handle(&self, player_index: u32) -> Option<ActorHandle> {
        self.players.get(&player_index).copied()
    }

    pub fn player(&self, player_index: u32) -> Option<&Actor> {
        self.player_handle(player_index)
            .and_then(|handle| self.world.get(handle))
    }

    /// One full server tick
    pub fn tick(&mut self) {
        self.process_incoming();
        self.end_frame();
    }

    fn send_to_synchronized(&self, packet: &ServerPacket, channel: Channel) {
        let registry = &self.registry;
        self.outbox.send(
            SendTarget::Filter(&|peer| registry.is_synchronized(peer)),
            channel,
            packet.packet_type() as u8,
            &packet.encode(),
        );
    }

    fn send_to_peer(&self, peer: PeerId, packet: &ServerPacket) {
        self.outbox.send(
            SendTarget::Peer(peer),
            Channel::Main,
            packet.packet_type() as u8,
            &packet.encode(),
        );
    }

    fn send_to_player(&self, player_index: u32, packet: &ServerPacket) {
        match self.registry.find_by_player(player_index) {
            Some(peer) => self.send_to_peer(peer, packet),
            None => debug!("No peer controls player {}", player_index),
        }
    }

    // ---- Inbound ----------------------------------------------------------

    /// Applies every event queued by the transport thread since last call
    pub fn process_incoming(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                NetworkEvent::PeerConnected { peer } => {
                    self.registry.add_peer(peer);
                }
                NetworkEvent::PeerDisconnected { peer, reason } => {
                    self.on_peer_disconnected(peer, reason);
                }
                NetworkEvent::PacketReceived {
                    peer,
                    channel,
                    packet_type,
                    payload,
                } => match ClientPacket::decode(packet_type, &payload) {
                    Ok(packet) => self.handle_packet(peer, channel, packet),
                    Err(e) => warn!(
                        "Dropping malformed packet {} from {}: {}",
                        packet_type, peer, e
                    ),
                },
            }
        }
    }

    fn handle_packet(&mut self, peer: PeerId, channel: Channel, packet: ClientPacket) {
        if self.registry.get(peer).is_none() {
            debug!("Packet from unknown {} on {:?}", peer, channel);
            return;
        }

        match packet {
            ClientPacket::Auth { player_name } => {
                info!("{} authenticated as '{}'", peer, player_name);
                if let Some(desc) = self.registry.get_mut(peer) {
                    desc.player_name = Some(player_name);
                }
                let load = ServerPacket::LoadLevel {
                    game_mode: self.game_mode,
                    episode: self.config.episode.clone(),
                    level: self.config.level.clone(),
                };
                self.send_to_peer(peer, &load);
            }
            ClientPacket::LevelReady => {
                if let Some(desc) = self.registry.get_mut(peer) {
                    if desc.advance_to(SyncState::LevelLoaded) {
                        debug!("{} loaded the level", peer);
                    } else {
                        debug!("{} sent LevelReady again in {:?}", peer, desc.sync_state);
                    }
                }
            }
            ClientPacket::ChatMessage { player_index, text } => {
                self.relay_chat(peer, player_index, text);
            }
            ClientPacket::PlayerUpdate(update) => self.apply_player_update(peer, update),
            ClientPacket::PlayerKeyPress {
                player_index,
                pressed,
            } => {
                if self.owned_player(peer, player_index).is_none() {
                    debug!("{} sent input for player {} it does not own", peer, player_index);
                    return;
                }
                self.inputs
                    .entry(player_index)
                    .or_default()
                    .apply(pressed, self.frame);
            }
        }
    }

    /// Returns the player binding if `peer` controls `player_index`
    fn owned_player(&self, peer: PeerId, player_index: u32) -> Option<PlayerBinding> {
        self.registry
            .get(peer)
            .and_then(|desc| desc.player)
            .filter(|binding| binding.player_index == player_index)
    }

    fn relay_chat(&mut self, peer: PeerId, player_index: u32, text: String) {
        if self.owned_player(peer, player_index).is_none() {
            warn!("{} sent chat as player {}", peer, player_index);
            return;
        }
        info!("[chat] player {}: {}", player_index, text);

        let packet = ServerPacket::ChatMessage { player_index, text };
        let registry = &self.registry;
        self.outbox.send(
            SendTarget::Filter(&|other| other != peer && registry.has_loaded_level(other)),
            Channel::Main,
            packet.packet_type() as u8,
            &packet.encode(),
        );
    }

    fn apply_player_update(&mut self, peer: PeerId, update: PlayerUpdate) {
        let Some(binding) = self.owned_player(peer, update.player_index) else {
            // Benign race with a disconnect or a not yet synchronized peer
            debug!("{} sent update for player {}", peer, update.player_index);
            return;
        };
        let Some(desc) = self.registry.get_mut(peer) else {
            return;
        };
        if !desc.accept_timestamp(update.timestamp) {
            debug!(
                "Dropping stale update {} from {} (last {})",
                update.timestamp, peer, desc.last_accepted_timestamp
            );
            return;
        }
        let warp = update.warp_seq.map(|seq| {
            let is_new = seq > desc.last_warp_seq;
            if is_new {
                desc.last_warp_seq = seq;
            }
            (seq, is_new)
        });

        let Some(actor) = self.world.get_mut(binding.handle) else {
            return;
        };
        if !self.validator.validate(actor, &update) {
            warn!("Rejected update of player {}", update.player_index);
            let correction = ServerPacket::PlayerMoveInstantly {
                player_index: update.player_index,
                pos: actor.pos,
                speed: actor.speed,
            };
            self.send_to_peer(peer, &correction);
            return;
        }

        actor.pos = update.pos;
        actor.speed = update.speed;
        actor.facing_left = update.facing_left;
        actor.visible = update.visible;
        actor.special_move = update.special_move;
        actor.actively_pushing = update.actively_pushing;

        if let Some((warp_seq, is_new)) = warp {
            if is_new {
                actor.just_warped = true;
            }
            // Acknowledge every copy; the client repeats it until it hears back
            let ack = ServerPacket::PlayerAckWarped {
                player_index: update.player_index,
                warp_seq,
            };
            self.send_to_peer(peer, &ack);
        }
    }

    fn on_peer_disconnected(&mut self, peer: PeerId, reason: Reason) {
        let Some(desc) = self.registry.remove_peer(peer) else {
            return;
        };
        info!("{} left: {}", peer, reason);

        if let Some(binding) = desc.player {
            self.world.mark_destroyed(binding.handle);
            self.players.remove(&binding.player_index);
            self.inputs.remove(&binding.player_index);
            self.player_slots.release(binding.player_index);
            self.send_to_synchronized(
                &ServerPacket::DestroyRemoteActor {
                    actor_id: binding.player_index,
                },
                Channel::Main,
            );
        }
    }

    // ---- Per-frame maintenance --------------------------------------------

    /// Runs the end-of-frame replication work
    pub fn end_frame(&mut self) {
        self.remove_destroyed_actors();
        self.synchronize_peers();
        self.send_snapshot();

        for handle in self.players.values() {
            if let Some(actor) = self.world.get_mut(*handle) {
                actor.just_warped = false;
            }
        }
        for record in self.actors.records() {
            if let Some(actor) = self.world.get_mut(record.handle) {
                actor.just_warped = false;
            }
        }
        self.frame = self.frame.wrapping_add(1);
        for input in self.inputs.values_mut() {
            input.begin_frame(self.frame);
        }
    }

    fn remove_destroyed_actors(&mut self) {
        let mut destroyed = Vec::new();
        self.world.remove_destroyed(|handle, _| destroyed.push(handle));

        for handle in destroyed {
            if let Some(record) = self.actors.unregister(handle) {
                debug!("Actor {} destroyed", record.actor_id);
                self.send_to_synchronized(
                    &ServerPacket::DestroyRemoteActor {
                        actor_id: record.actor_id,
                    },
                    Channel::Main,
                );
            }
        }
    }

    /// Promotes every peer that finished loading the level
    pub fn synchronize_peers(&mut self) {
        for peer in self.registry.peers_in_state(SyncState::LevelLoaded) {
            self.synchronize_peer(peer);
        }
    }

    fn choose_spawn_point(&self) -> Vector2f {
        self.config
            .spawn_points
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(self.config.default_spawn)
    }

    fn assign_team(&self, player_index: u32) -> u8 {
        match self.game_mode {
            GameMode::Cooperation => 0,
            mode if mode.is_team_mode() => {
                let mut counts = [0usize; 2];
                for actor in self.players.values().filter_map(|h| self.world.get(*h)) {
                    if let Some(count) = counts.get_mut(actor.team as usize) {
                        *count += 1;
                    }
                }
                match counts[0].cmp(&counts[1]) {
                    std::cmp::Ordering::Less => 0,
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Equal => rand::thread_rng().gen_range(0..2),
                }
            }
            _ => player_index as u8,
        }
    }

    fn create_player_packet(player_index: u32, actor: &Actor) -> ServerPacket {
        ServerPacket::CreateRemoteActor {
            actor_id: player_index,
            state_flags: actor.state_flags,
            pos: actor.pos,
            layer: actor.layer,
            metadata_path: actor.spawn.metadata_path.clone(),
            animation: actor.animation.unwrap_or(0),
        }
    }

    fn create_actor_packet(actor_id: ActorId, actor: &Actor, mode: ReplicationMode) -> ServerPacket {
        match (mode, &actor.spawn.event) {
            (ReplicationMode::Mirrored, Some(event)) => ServerPacket::CreateMirroredActor {
                actor_id,
                event_type: event.event_type,
                params: event.params,
                actor_flags: event.actor_flags,
                tile_x: event.tile_x,
                tile_y: event.tile_y,
                layer: actor.layer,
            },
            _ => ServerPacket::CreateRemoteActor {
                actor_id,
                state_flags: actor.state_flags,
                pos: actor.pos,
                layer: actor.layer,
                metadata_path: actor.spawn.metadata_path.clone(),
                animation: actor.animation.unwrap_or(0),
            },
        }
    }

    fn synchronize_peer(&mut self, peer: PeerId) {
        let Some(player_index) = self.player_slots.allocate() else {
            warn!("No free player slot for {}", peer);
            self.outbox.kick(peer, Reason::ServerIsFull);
            return;
        };

        let pos = self.choose_spawn_point();
        let team = self.assign_team(player_index);
        let mut actor = Actor::new(pos).with_animation(0);
        actor.player_index = Some(player_index);
        actor.team = team;
        actor.health = self.config.player_health as i32;
        actor.spawn.metadata_path = self.config.player_metadata.clone();
        let new_player = Self::create_player_packet(player_index, &actor);
        let handle = self.world.add_actor(actor);

        self.players.insert(player_index, handle);
        self.inputs.insert(player_index, PlayerInputState::default());
        if let Some(desc) = self.registry.get_mut(peer) {
            desc.player = Some(PlayerBinding {
                player_index,
                handle,
            });
        }
        info!("{} spawned as player {} (team {})", peer, player_index, team);

        match self.tile_map.encode() {
            Ok(data) => self.send_to_peer(peer, &ServerPacket::SyncTileMap { data }),
            Err(e) => error!("Failed to encode tile map for {}: {}", peer, e),
        }
        self.send_to_peer(
            peer,
            &ServerPacket::CreateControllablePlayer {
                player_index,
                team,
                health: self.config.player_health,
                pos,
            },
        );

        for (&other_index, &other_handle) in &self.players {
            if other_index == player_index {
                continue;
            }
            if let Some(other) = self.world.get(other_handle) {
                self.send_to_peer(peer, &Self::create_player_packet(other_index, other));
            }
        }
        for record in self.actors.records() {
            if let Some(actor) = self.world.get(record.handle) {
                self.send_to_peer(
                    peer,
                    &Self::create_actor_packet(record.actor_id, actor, record.mode),
                );
            }
        }

        if let Some(desc) = self.registry.get_mut(peer) {
            desc.advance_to(SyncState::LevelSynchronized);
        }

        let registry = &self.registry;
        self.outbox.send(
            SendTarget::Filter(&|other| other != peer && registry.is_synchronized(other)),
            Channel::Main,
            new_player.packet_type() as u8,
            &new_player.encode(),
        );
    }

    fn send_snapshot(&self) {
        if self.registry.peers_in_state(SyncState::LevelSynchronized).is_empty() {
            return;
        }

        let to_update = |actor_id: ActorId, actor: &Actor| ActorUpdate {
            actor_id,
            pos: actor.pos,
            animation: actor.animation.unwrap_or(0),
            rotation: actor.rotation,
            facing_left: actor.facing_left,
            visible: actor.visible,
            anim_paused: actor.anim_paused,
            just_warped: actor.just_warped,
            renderer_type: actor.renderer_type,
        };

        let mut updates = Vec::with_capacity(self.players.len() + self.actors.len());
        for (&player_index, &handle) in &self.players {
            if let Some(actor) = self.world.get(handle) {
                updates.push(to_update(player_index, actor));
            }
        }
        for record in self.actors.records() {
            if record.mode != ReplicationMode::Remoted {
                continue;
            }
            if let Some(actor) = self.world.get(record.handle) {
                updates.push(to_update(record.actor_id, actor));
            }
        }

        let packet = ServerPacket::UpdateAllActors(Snapshot::new(updates));
        self.send_to_synchronized(&packet, Channel::UnreliableUpdates);
    }

    // ---- Gameplay operations ----------------------------------------------

    /// Adds an actor to the world and replicates it
    pub fn spawn_actor(&mut self, actor: Actor) -> Option<(ActorHandle, ActorId)> {
        let handle = self.world.add_actor(actor);
        let actor_id = self.register_local_actor(handle)?;
        Some((handle, actor_id))
    }

    /// Assigns a network id to an actor already in the world and sends its
    /// create packet to synchronized peers
    pub fn register_local_actor(&mut self, handle: ActorHandle) -> Option<ActorId> {
        let actor = self.world.get(handle)?;
        if actor.is_player() {
            return None;
        }
        let mode = actor.replication_mode();
        let Some(actor_id) = self.actors.register(handle, mode) else {
            error!("Out of actor ids");
            return None;
        };
        debug!("Actor {} registered as {:?}", actor_id, mode);
        let packet = Self::create_actor_packet(actor_id, actor, mode);
        self.send_to_synchronized(&packet, Channel::Main);
        Some(actor_id)
    }

    /// Schedules an actor for removal at the end of the frame
    pub fn destroy_actor(&mut self, handle: ActorHandle) -> bool {
        self.world.mark_destroyed(handle)
    }

    pub fn set_game_mode(&mut self, game_mode: GameMode) {
        if self.game_mode == game_mode {
            return;
        }
        info!("Game mode changed to {:?}", game_mode);
        self.game_mode = game_mode;

        let packet = ServerPacket::ChangeGameMode { game_mode };
        let registry = &self.registry;
        self.outbox.send(
            SendTarget::Filter(&|peer| registry.has_loaded_level(peer)),
            Channel::Main,
            packet.packet_type() as u8,
            &packet.encode(),
        );
    }

    pub fn set_trigger(&mut self, trigger_id: u8, state: bool) {
        self.tile_map.set_trigger(trigger_id, state);
        self.send_to_synchronized(&ServerPacket::SetTrigger { trigger_id, state }, Channel::Main);
    }

    pub fn advance_tile_animation(&mut self, tile_x: i32, tile_y: i32, amount: i32) {
        self.tile_map.advance_tile_animation(tile_x, tile_y, amount);
        self.send_to_synchronized(
            &ServerPacket::AdvanceTileAnimation {
                tile_x,
                tile_y,
                amount,
            },
            Channel::Main,
        );
    }

    pub fn show_alert(&self, text: &str) {
        if !(MIN_TEXT_LENGTH..=MAX_TEXT_LENGTH).contains(&text.len()) {
            warn!("Alert of {} bytes not sent", text.len());
            return;
        }
        self.send_to_synchronized(
            &ServerPacket::ShowAlert {
                text: text.to_string(),
            },
            Channel::Main,
        );
    }

    /// Plays a sound attached to an actor. The owner of a player actor
    /// plays its own sounds locally and is skipped.
    pub fn play_sfx(&self, handle: ActorHandle, identifier: &str, gain: f32, pitch: f32) {
        let Some(actor) = self.world.get(handle) else {
            return;
        };
        let (actor_id, owner) = match actor.player_index {
            Some(index) => (index, self.registry.find_by_player(index)),
            None => match self.actors.id_of(handle) {
                Some(id) => (id, None),
                None => {
                    debug!("Sound '{}' on unreplicated actor", identifier);
                    return;
                }
            },
        };

        let packet = ServerPacket::PlaySfx {
            actor_id,
            gain,
            pitch,
            identifier: identifier.to_string(),
        };
        let registry = &self.registry;
        self.outbox.send(
            SendTarget::Filter(&|peer| Some(peer) != owner && registry.is_synchronized(peer)),
            Channel::Main,
            packet.packet_type() as u8,
            &packet.encode(),
        );
    }

    pub fn play_common_sfx(&self, pos: Vector2f, identifier: &str, gain: f32, pitch: f32) {
        let packet = ServerPacket::PlayCommonSfx {
            pos,
            gain,
            pitch,
            identifier: identifier.to_string(),
        };
        self.send_to_synchronized(&packet, Channel::Main);
    }

    pub fn respawn_player(&mut self, player_index: u32, pos: Vector2f) -> bool {
        let Some(actor) = self.player_handle(player_index).and_then(|h| self.world.get_mut(h)) else {
            return false;
        };
        actor.warp_to(pos);
        actor.speed = Vector2f::ZERO;
        actor.health = self.config.player_health as i32;
        self.send_to_player(player_index, &ServerPacket::PlayerRespawn { player_index, pos });
        true
    }

    pub fn move_player_instantly(&mut self, player_index: u32, pos: Vector2f, speed: Vector2f) -> bool {
        let Some(actor) = self.player_handle(player_index).and_then(|h| self.world.get_mut(h)) else {
            return false;
        };
        actor.warp_to(pos);
        actor.speed = speed;
        self.send_to_player(
            player_index,
            &ServerPacket::PlayerMoveInstantly {
                player_index,
                pos,
                speed,
            },
        );
        true
    }

    pub fn player_take_damage(&mut self, player_index: u32, amount: i32, push_force: f32) -> bool {
        let Some(actor) = self.player_handle(player_index).and_then(|h| self.world.get_mut(h)) else {
            return false;
        };
        actor.health = (actor.health - amount).max(0);
        let health = actor.health;
        self.send_to_player(
            player_index,
            &ServerPacket::PlayerTakeDamage {
                player_index,
                health,
                push_force,
            },
        );
        true
    }

    /// Sends a per-player state packet to the peer owning its player.
    /// Returns false when that player does not exist.
    fn notify_player(&self, packet: ServerPacket) -> bool {
        let Some(player_index) = packet.target_player() else {
            return false;
        };
        if self.player_handle(player_index).is_none() {
            return false;
        }
        self.send_to_player(player_index, &packet);
        true
    }

    pub fn emit_weapon_flare(&self, player_index: u32) -> bool {
        self.notify_player(ServerPacket::PlayerEmitWeaponFlare { player_index })
    }

    pub fn change_weapon(&self, player_index: u32, weapon_type: u8) -> bool {
        self.notify_player(ServerPacket::PlayerChangeWeapon {
            player_index,
            weapon_type,
        })
    }

    pub fn refresh_ammo(&self, player_index: u32, weapon_type: u8, ammo: u16) -> bool {
        self.notify_player(ServerPacket::PlayerRefreshAmmo {
            player_index,
            weapon_type,
            ammo,
        })
    }

    pub fn refresh_weapon_upgrades(&self, player_index: u32, weapon_type: u8, upgrades: u8) -> bool {
        self.notify_player(ServerPacket::PlayerRefreshWeaponUpgrades {
            player_index,
            weapon_type,
            upgrades,
        })
    }

    pub fn refresh_coins(&self, player_index: u32, count: i32) -> bool {
        self.notify_player(ServerPacket::PlayerRefreshCoins {
            player_index,
            count,
        })
    }

    pub fn refresh_gems(&self, player_index: u32, gem_type: u8, count: i32) -> bool {
        self.notify_player(ServerPacket::PlayerRefreshGems {
            player_index,
            gem_type,
            count,
        })
    }

    /// Tells the owning client its player touched a spring at `pos`.
    pub fn activate_spring(
        &self,
        player_index: u32,
        pos: Vector2f,
        force: Vector2f,
        keep_speed_x: bool,
        keep_speed_y: bool,
    ) -> bool {
        self.notify_player(ServerPacket::PlayerActivateSpring {
            player_index,
            pos,
            force,
            keep_speed_x,
            keep_speed_y,
        })
    }

    /// `exit_type` of `EXIT_TYPE_TEMPORARY_WARP` keeps the current level.
    pub fn warp_in(&self, player_index: u32, exit_type: u8) -> bool {
        self.notify_player(ServerPacket::PlayerWarpIn {
            player_index,
            exit_type,
        })
    }

    pub fn is_action_pressed(&self, player_index: u32, action: PlayerAction) -> bool {
        self.inputs
            .get(&player_index)
            .map_or(false, |input| input.is_pressed(action))
    }

    /// Pressed this frame but not in the previous one
    pub fn is_action_hit(&self, player_index: u32, action: PlayerAction) -> bool {
        self.inputs
            .get(&player_index)
            .map_or(false, |input| input.is_hit(action))
    }

    pub fn kick(&self, peer: PeerId, reason: Reason) {
        self.outbox.kick(peer, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::packets::{ClientPacketType, ServerPacketType, EXIT_TYPE_TEMPORARY_WARP};
    use tokio_test::assert_ok;
    use shared::world::{SpawnDescriptor, SpawnEvent, SPAWN_PARAMS_SIZE};
    use std::cell::RefCell;

    /// Records every packet instead of sending it
    #[derive(Default)]
    struct RecordingOutbox {
        peers: RefCell<Vec<PeerId>>,
        sent: RefCell<Vec<(PeerId, Channel, ServerPacket)>>,
        kicked: RefCell<Vec<(PeerId, Reason)>>,
    }

    impl Outbox for RecordingOutbox {
        fn send(&self, target: SendTarget<'_>, channel: Channel, packet_type: u8, payload: &[u8]) {
            let packet = ServerPacket::decode(packet_type, payload).unwrap();
            let recipients: Vec<PeerId> = match target {
                SendTarget::Peer(peer) => vec![peer],
                SendTarget::Filter(predicate) => {
                    self.peers.borrow().iter().copied().filter(|p| predicate(*p)).collect()
                }
                SendTarget::All => self.peers.borrow().clone(),
            };
            for peer in recipients {
                self.sent.borrow_mut().push((peer, channel, packet.clone()));
            }
        }

        fn kick(&self, peer: PeerId, reason: Reason) {
            self.kicked.borrow_mut().push((peer, reason));
        }
    }

    struct Harness {
        server: ServerCoordinator<RecordingOutbox>,
        tx: mpsc::Sender<NetworkEvent>,
    }

    impl Harness {
        fn new(config: ServerConfig) -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                server: ServerCoordinator::new(config, RecordingOutbox::default(), rx),
                tx,
            }
        }

        fn connect(&mut self, peer: PeerId) {
            self.server.outbox.peers.borrow_mut().push(peer);
            self.tx.try_send(NetworkEvent::PeerConnected { peer }).unwrap();
        }

        fn disconnect(&mut self, peer: PeerId) {
            self.server.outbox.peers.borrow_mut().retain(|p| *p != peer);
            self.tx
                .try_send(NetworkEvent::PeerDisconnected {
                    peer,
                    reason: Reason::ConnectionLost,
                })
                .unwrap();
        }

        fn receive(&mut self, peer: PeerId, packet: ClientPacket) {
            let channel = match packet {
                ClientPacket::PlayerUpdate(_) | ClientPacket::PlayerKeyPress { .. } => {
                    Channel::UnreliableUpdates
                }
                _ => Channel::Main,
            };
            self.receive_raw(peer, channel, packet.packet_type() as u8, packet.encode());
        }

        fn receive_raw(&mut self, peer: PeerId, channel: Channel, packet_type: u8, payload: Vec<u8>) {
            self.tx
                .try_send(NetworkEvent::PacketReceived {
                    peer,
                    channel,
                    packet_type,
                    payload,
                })
                .unwrap();
        }

        /// Connects a peer and drives it to LevelSynchronized
        fn join(&mut self, peer: PeerId) -> u32 {
            self.connect(peer);
            self.receive(
                peer,
                ClientPacket::Auth {
                    player_name: format!("player{}", peer.0),
                },
            );
            self.receive(peer, ClientPacket::LevelReady);
            self.server.tick();
            self.server
                .registry()
                .get(peer)
                .and_then(|desc| desc.player_index())
                .unwrap()
        }

        fn sent_to(&self, peer: PeerId) -> Vec<ServerPacket> {
            self.server
                .outbox
                .sent
                .borrow()
                .iter()
                .filter(|(p, _, _)| *p == peer)
                .map(|(_, _, packet)| packet.clone())
                .collect()
        }

        fn channels_of(&self, packet_type: ServerPacketType) -> Vec<(PeerId, Channel)> {
            self.server
                .outbox
                .sent
                .borrow()
                .iter()
                .filter(|(_, _, packet)| packet.packet_type() == packet_type)
                .map(|(peer, channel, _)| (*peer, *channel))
                .collect()
        }

        fn clear_sent(&self) {
            self.server.outbox.sent.borrow_mut().clear();
        }
    }

    fn update(player_index: u32, timestamp: u64, x: f32, y: f32) -> ClientPacket {
        ClientPacket::PlayerUpdate(PlayerUpdate {
            player_index,
            timestamp,
            pos: Vector2f::new(x, y),
            speed: Vector2f::ZERO,
            special_move: 0,
            facing_left: false,
            visible: true,
            actively_pushing: false,
            warp_seq: None,
        })
    }

    fn mirrored_actor() -> Actor {
        Actor::new(Vector2f::new(32.0, 32.0)).with_spawn(SpawnDescriptor {
            event: Some(SpawnEvent {
                event_type: 60,
                params: [7; SPAWN_PARAMS_SIZE],
                actor_flags: 1,
                tile_x: 1,
                tile_y: 1,
            }),
            ..SpawnDescriptor::default()
        })
    }

    #[test]
    fn test_handshake_sends_load_level() {
        let mut h = Harness::new(ServerConfig {
            episode: "castle".into(),
            level: "01".into(),
            ..ServerConfig::default()
        });
        h.connect(PeerId(1));
        h.receive(
            PeerId(1),
            ClientPacket::Auth {
                player_name: "Jazz".into(),
            },
        );
        h.server.process_incoming();

        assert_eq!(
            h.sent_to(PeerId(1)),
            vec![ServerPacket::LoadLevel {
                game_mode: GameMode::Battle,
                episode: "castle".into(),
                level: "01".into(),
            }]
        );
        assert_eq!(
            h.server.registry().get(PeerId(1)).unwrap().player_name.as_deref(),
            Some("Jazz")
        );
    }

    #[test]
    fn test_sync_sequence_for_late_joiner() {
        let mut h = Harness::new(ServerConfig::default());
        let first = h.join(PeerId(1));
        let (_, remoted_id) = h
            .server
            .spawn_actor(Actor::new(Vector2f::new(100.0, 200.0)).with_animation(7))
            .unwrap();
        let (_, mirrored_id) = h.server.spawn_actor(mirrored_actor()).unwrap();
        h.clear_sent();

        let second = h.join(PeerId(2));
        assert_ne!(first, second);

        let to_new: Vec<ServerPacketType> = h
            .sent_to(PeerId(2))
            .iter()
            .map(|p| p.packet_type())
            .filter(|t| *t != ServerPacketType::UpdateAllActors)
            .collect();
        assert_eq!(
            to_new,
            vec![
                ServerPacketType::LoadLevel,
                ServerPacketType::SyncTileMap,
                ServerPacketType::CreateControllablePlayer,
                ServerPacketType::CreateRemoteActor,
                ServerPacketType::CreateRemoteActor,
                ServerPacketType::CreateMirroredActor,
            ]
        );
        let packets = h.sent_to(PeerId(2));
        assert!(packets.iter().any(|p| matches!(
            p,
            ServerPacket::CreateRemoteActor { actor_id, pos, animation: 7, .. }
                if *actor_id == remoted_id && *pos == Vector2f::new(100.0, 200.0)
        )));
        assert!(packets.iter().any(|p| matches!(
            p,
            ServerPacket::CreateMirroredActor { actor_id, event_type: 60, .. } if *actor_id == mirrored_id
        )));

        // The existing peer hears about the new player only
        assert!(h.sent_to(PeerId(1)).iter().any(|p| matches!(
            p,
            ServerPacket::CreateRemoteActor { actor_id, .. } if *actor_id == second
        )));
        assert_eq!(
            h.server.registry().sync_state(PeerId(2)),
            Some(SyncState::LevelSynchronized)
        );
    }

    #[test]
    fn test_repeated_level_ready_is_noop() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));
        h.clear_sent();

        h.receive(PeerId(1), ClientPacket::LevelReady);
        h.server.tick();

        let desc = h.server.registry().get(PeerId(1)).unwrap();
        assert_eq!(desc.sync_state, SyncState::LevelSynchronized);
        assert_eq!(desc.player_index(), Some(index));
        assert!(!h
            .sent_to(PeerId(1))
            .iter()
            .any(|p| p.packet_type() == ServerPacketType::CreateControllablePlayer));
    }

    #[test]
    fn test_no_free_player_slot_kicks_peer() {
        let mut h = Harness::new(ServerConfig {
            max_players: 1,
            ..ServerConfig::default()
        });
        h.join(PeerId(1));
        h.connect(PeerId(2));
        h.receive(PeerId(2), ClientPacket::LevelReady);
        h.server.tick();

        assert_eq!(
            h.server.outbox.kicked.borrow().as_slice(),
            &[(PeerId(2), Reason::ServerIsFull)]
        );
        assert_eq!(h.server.registry().sync_state(PeerId(2)), Some(SyncState::LevelLoaded));
    }

    #[test]
    fn test_stale_updates_are_dropped() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));

        h.receive(PeerId(1), update(index, 1000, 50.0, 50.0));
        h.receive(PeerId(1), update(index, 900, 10.0, 10.0));
        h.server.tick();

        let player = h.server.player(index).unwrap();
        assert_eq!(player.pos, Vector2f::new(50.0, 50.0));
        assert_eq!(
            h.server.registry().get(PeerId(1)).unwrap().last_accepted_timestamp,
            1000
        );
    }

    #[test]
    fn test_in_order_updates_apply_newest() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));

        h.receive(PeerId(1), update(index, 900, 10.0, 10.0));
        h.receive(PeerId(1), update(index, 1000, 50.0, 50.0));
        h.server.tick();
        assert_eq!(h.server.player(index).unwrap().pos, Vector2f::new(50.0, 50.0));
    }

    #[test]
    fn test_update_keeps_special_move_apart_from_state_flags() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));

        h.receive(
            PeerId(1),
            ClientPacket::PlayerUpdate(PlayerUpdate {
                player_index: index,
                timestamp: 10,
                pos: Vector2f::new(40.0, 40.0),
                speed: Vector2f::ZERO,
                special_move: 3,
                facing_left: true,
                visible: true,
                actively_pushing: true,
                warp_seq: None,
            }),
        );
        h.server.tick();

        let player = h.server.player(index).unwrap();
        assert_eq!(player.special_move, 3);
        assert!(player.actively_pushing);
        assert_eq!(player.state_flags, 0);

        h.clear_sent();
        h.join(PeerId(2));
        assert!(h.sent_to(PeerId(2)).iter().any(|p| matches!(
            p,
            ServerPacket::CreateRemoteActor { actor_id, state_flags: 0, .. } if *actor_id == index
        )));
    }

    #[test]
    fn test_update_for_foreign_player_is_ignored() {
        let mut h = Harness::new(ServerConfig::default());
        let first = h.join(PeerId(1));
        let second = h.join(PeerId(2));
        let before = h.server.player(second).unwrap().pos;

        h.receive(PeerId(1), update(second, 5000, 1.0, 1.0));
        h.server.tick();
        assert_eq!(h.server.player(second).unwrap().pos, before);
        assert_ne!(first, second);
    }

    #[test]
    fn test_validator_rejection_moves_player_back() {
        let (tx, rx) = mpsc::channel(64);
        let server = ServerCoordinator::new(ServerConfig::default(), RecordingOutbox::default(), rx)
            .with_validator(Box::new(MaxDeviation { max_distance: 256.0 }));
        let mut h = Harness { server, tx };
        let index = h.join(PeerId(1));
        let spawn = h.server.player(index).unwrap().pos;
        h.clear_sent();

        h.receive(PeerId(1), update(index, 10, spawn.x + 1000.0, spawn.y));
        h.server.tick();

        assert_eq!(h.server.player(index).unwrap().pos, spawn);
        assert!(h.sent_to(PeerId(1)).iter().any(|p| matches!(
            p,
            ServerPacket::PlayerMoveInstantly { pos, .. } if *pos == spawn
        )));
    }

    #[test]
    fn test_warp_is_acknowledged_and_forwarded_once() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));
        h.join(PeerId(2));
        h.clear_sent();

        let warped = |timestamp| {
            ClientPacket::PlayerUpdate(PlayerUpdate {
                player_index: index,
                timestamp,
                pos: Vector2f::new(900.0, 40.0),
                speed: Vector2f::ZERO,
                special_move: 0,
                facing_left: false,
                visible: true,
                actively_pushing: false,
                warp_seq: Some(1),
            })
        };
        h.receive(PeerId(1), warped(10));
        h.server.process_incoming();
        assert!(h.server.player(index).unwrap().just_warped);
        h.server.end_frame();

        let snapshot_flag = h.sent_to(PeerId(2)).iter().find_map(|p| match p {
            ServerPacket::UpdateAllActors(snapshot) => snapshot
                .actors
                .iter()
                .find(|a| a.actor_id == index)
                .map(|a| a.just_warped),
            _ => None,
        });
        assert_eq!(snapshot_flag, Some(true));
        assert!(!h.server.player(index).unwrap().just_warped);

        // A repeated report is acknowledged again but not treated as a new warp
        h.receive(PeerId(1), warped(11));
        h.server.process_incoming();
        assert!(!h.server.player(index).unwrap().just_warped);
        let acks = h
            .sent_to(PeerId(1))
            .iter()
            .filter(|p| matches!(p, ServerPacket::PlayerAckWarped { warp_seq: 1, .. }))
            .count();
        assert_eq!(acks, 2);
    }

    #[test]
    fn test_snapshot_goes_to_synchronized_peers_only() {
        let mut h = Harness::new(ServerConfig::default());
        h.join(PeerId(1));
        let (_, remoted) = h
            .server
            .spawn_actor(Actor::new(Vector2f::new(5.0, 6.0)).with_animation(2))
            .unwrap();
        h.server.spawn_actor(mirrored_actor()).unwrap();
        h.connect(PeerId(2));
        h.clear_sent();

        h.server.tick();

        let snapshots: Vec<(PeerId, Channel, Snapshot)> = h
            .server
            .outbox
            .sent
            .borrow()
            .iter()
            .filter_map(|(peer, channel, packet)| match packet {
                ServerPacket::UpdateAllActors(s) => Some((*peer, *channel, s.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 1);
        let (peer, channel, snapshot) = &snapshots[0];
        assert_eq!(*peer, PeerId(1));
        assert_eq!(*channel, Channel::UnreliableUpdates);
        // The player and the remoted actor, not the mirrored one
        let ids: Vec<ActorId> = snapshot.actors.iter().map(|a| a.actor_id).collect();
        assert_eq!(ids, vec![0, remoted]);
    }

    #[test]
    fn test_destroyed_actor_is_announced_and_id_freed() {
        let mut h = Harness::new(ServerConfig::default());
        h.join(PeerId(1));
        let (handle, actor_id) = h
            .server
            .spawn_actor(Actor::new(Vector2f::ZERO).with_animation(1))
            .unwrap();
        h.clear_sent();

        assert!(h.server.destroy_actor(handle));
        h.server.tick();

        assert!(h
            .sent_to(PeerId(1))
            .contains(&ServerPacket::DestroyRemoteActor { actor_id }));
        assert_eq!(h.server.replication().id_of(handle), None);
        let (_, reused) = h
            .server
            .spawn_actor(Actor::new(Vector2f::ZERO).with_animation(1))
            .unwrap();
        assert_eq!(reused, actor_id);
    }

    #[test]
    fn test_disconnect_cleans_up_player() {
        let mut h = Harness::new(ServerConfig::default());
        h.join(PeerId(1));
        let leaving = h.join(PeerId(2));
        let handle = h.server.player_handle(leaving).unwrap();
        h.receive(
            PeerId(2),
            ClientPacket::PlayerKeyPress {
                player_index: leaving,
                pressed: PlayerAction::Fire.mask(),
            },
        );
        h.server.tick();
        h.clear_sent();

        h.disconnect(PeerId(2));
        h.server.tick();

        assert!(h.server.registry().get(PeerId(2)).is_none());
        assert!(h.server.player_handle(leaving).is_none());
        assert!(!h.server.world().contains(handle));
        assert!(!h.server.is_action_pressed(leaving, PlayerAction::Fire));
        assert!(h.sent_to(PeerId(1)).contains(&ServerPacket::DestroyRemoteActor {
            actor_id: leaving
        }));

        // The slot is handed out again
        assert_eq!(h.join(PeerId(3)), leaving);
    }

    #[test]
    fn test_key_press_edges() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));

        h.receive(
            PeerId(1),
            ClientPacket::PlayerKeyPress {
                player_index: index,
                pressed: PlayerAction::Jump.mask(),
            },
        );
        h.server.process_incoming();
        assert!(h.server.is_action_pressed(index, PlayerAction::Jump));
        assert!(h.server.is_action_hit(index, PlayerAction::Jump));

        h.server.end_frame();
        assert!(h.server.is_action_pressed(index, PlayerAction::Jump));
        assert!(!h.server.is_action_hit(index, PlayerAction::Jump));
    }

    #[test]
    fn test_second_report_in_a_frame_keeps_the_edge() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));
        let press = |pressed| ClientPacket::PlayerKeyPress {
            player_index: index,
            pressed,
        };

        h.receive(PeerId(1), press(PlayerAction::Fire.mask()));
        h.receive(PeerId(1), press(PlayerAction::Fire.mask() | PlayerAction::Left.mask()));
        h.server.process_incoming();
        assert!(h.server.is_action_hit(index, PlayerAction::Fire));
        assert!(h.server.is_action_hit(index, PlayerAction::Left));

        h.server.end_frame();
        h.receive(PeerId(1), press(PlayerAction::Left.mask()));
        h.server.process_incoming();
        assert!(!h.server.is_action_hit(index, PlayerAction::Left));
        assert!(!h.server.is_action_pressed(index, PlayerAction::Fire));
    }

    #[test]
    fn test_malformed_chat_does_not_disturb_next_packet() {
        let mut h = Harness::new(ServerConfig::default());
        let sender = h.join(PeerId(1));
        h.join(PeerId(2));
        h.clear_sent();

        let mut payload = Vec::new();
        payload.push(sender as u8);
        payload.extend_from_slice(&[0xd0, 0x0f]); // varint 2000
        payload.extend_from_slice(&[b'a'; 32]);
        h.receive_raw(PeerId(1), Channel::Main, ClientPacketType::ChatMessage as u8, payload);
        h.receive(
            PeerId(1),
            ClientPacket::ChatMessage {
                player_index: sender,
                text: "hello".into(),
            },
        );
        h.server.tick();

        let chats: Vec<ServerPacket> = h
            .sent_to(PeerId(2))
            .into_iter()
            .filter(|p| p.packet_type() == ServerPacketType::ChatMessage)
            .collect();
        assert_eq!(
            chats,
            vec![ServerPacket::ChatMessage {
                player_index: sender,
                text: "hello".into()
            }]
        );
        assert!(h.server.registry().get(PeerId(1)).is_some());
        assert!(h.server.outbox.kicked.borrow().is_empty());
    }

    #[test]
    fn test_team_assignment_balances_teams() {
        let mut h = Harness::new(ServerConfig {
            game_mode: GameMode::TeamBattle,
            ..ServerConfig::default()
        });
        let teams: Vec<u8> = (1..=4)
            .map(|id| {
                let index = h.join(PeerId(id));
                h.server.player(index).unwrap().team
            })
            .collect();
        assert_eq!(teams.iter().filter(|t| **t == 0).count(), 2);
        assert_eq!(teams.iter().filter(|t| **t == 1).count(), 2);
    }

    #[test]
    fn test_cooperation_puts_everyone_in_one_team() {
        let mut h = Harness::new(ServerConfig {
            game_mode: GameMode::Cooperation,
            ..ServerConfig::default()
        });
        for id in 1..=3 {
            let index = h.join(PeerId(id));
            assert_eq!(h.server.player(index).unwrap().team, 0);
        }
    }

    #[test]
    fn test_game_mode_change_reaches_loaded_peers() {
        let mut h = Harness::new(ServerConfig::default());
        h.join(PeerId(1));
        h.connect(PeerId(2));
        h.server.process_incoming();
        h.clear_sent();

        h.server.set_game_mode(GameMode::Race);
        assert_eq!(
            h.sent_to(PeerId(1)),
            vec![ServerPacket::ChangeGameMode {
                game_mode: GameMode::Race
            }]
        );
        assert!(h.sent_to(PeerId(2)).is_empty());
    }

    #[test]
    fn test_tile_state_changes() {
        let mut h = Harness::new(ServerConfig::default());
        h.join(PeerId(1));
        h.clear_sent();

        h.server.set_trigger(3, true);
        h.server.advance_tile_animation(10, 20, 1);
        assert!(h.server.tile_map().trigger(3));
        assert_eq!(h.server.tile_map().tile_animation(10, 20), 1);
        assert_eq!(
            h.sent_to(PeerId(1)),
            vec![
                ServerPacket::SetTrigger {
                    trigger_id: 3,
                    state: true
                },
                ServerPacket::AdvanceTileAnimation {
                    tile_x: 10,
                    tile_y: 20,
                    amount: 1
                },
            ]
        );

        // A late joiner receives the current state with its tile map
        h.connect(PeerId(2));
        h.receive(PeerId(2), ClientPacket::LevelReady);
        h.server.tick();
        let data = h.sent_to(PeerId(2)).into_iter().find_map(|p| match p {
            ServerPacket::SyncTileMap { data } => Some(data),
            _ => None,
        });
        let state = assert_ok!(TileMapState::decode(&data.unwrap()));
        assert!(state.trigger(3));
    }

    #[test]
    fn test_player_sound_skips_owner() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));
        h.join(PeerId(2));
        h.clear_sent();

        let handle = h.server.player_handle(index).unwrap();
        h.server.play_sfx(handle, "Weapon/Fire", 1.0, 1.0);
        assert!(h.sent_to(PeerId(1)).is_empty());
        assert_eq!(
            h.sent_to(PeerId(2)),
            vec![ServerPacket::PlaySfx {
                actor_id: index,
                gain: 1.0,
                pitch: 1.0,
                identifier: "Weapon/Fire".into()
            }]
        );

        h.server.play_common_sfx(Vector2f::new(8.0, 8.0), "Common/Bell", 0.5, 1.0);
        assert_eq!(
            h.channels_of(ServerPacketType::PlaySfx),
            vec![(PeerId(2), Channel::Main)]
        );
        assert_eq!(
            h.channels_of(ServerPacketType::PlayCommonSfx),
            vec![(PeerId(1), Channel::Main), (PeerId(2), Channel::Main)]
        );
    }

    #[test]
    fn test_player_notifications() {
        let mut h = Harness::new(ServerConfig::default());
        let index = h.join(PeerId(1));
        h.clear_sent();

        assert!(h.server.player_take_damage(index, 2, 4.0));
        assert!(h.server.respawn_player(index, Vector2f::new(1.0, 2.0)));
        assert!(!h.server.move_player_instantly(99, Vector2f::ZERO, Vector2f::ZERO));

        let sent = h.sent_to(PeerId(1));
        assert_eq!(
            sent[0],
            ServerPacket::PlayerTakeDamage {
                player_index: index,
                health: 3,
                push_force: 4.0
            }
        );
        assert_eq!(
            sent[1],
            ServerPacket::PlayerRespawn {
                player_index: index,
                pos: Vector2f::new(1.0, 2.0)
            }
        );
        assert!(h.server.player(index).unwrap().just_warped);
        assert_eq!(h.server.player(index).unwrap().health, 5);
    }

    #[test]
    fn test_player_state_goes_to_owner_on_main() {
        let mut h = Harness::new(ServerConfig::default());
        let first = h.join(PeerId(1));
        let second = h.join(PeerId(2));
        h.clear_sent();

        assert!(h.server.emit_weapon_flare(first));
        assert!(h.server.change_weapon(first, 3));
        assert!(h.server.refresh_ammo(first, 3, 40));
        assert!(h.server.refresh_weapon_upgrades(second, 1, 0x01));
        assert!(h.server.refresh_coins(second, 12));
        assert!(h.server.refresh_gems(second, 2, 7));
        assert!(h.server.activate_spring(first, Vector2f::new(64.0, 32.0), Vector2f::new(0.0, -6.0), false, true));
        assert!(h.server.warp_in(first, EXIT_TYPE_TEMPORARY_WARP));
        assert!(!h.server.refresh_coins(99, 1));

        let to_first = h.sent_to(PeerId(1));
        assert_eq!(to_first.len(), 5);
        assert_eq!(to_first[0], ServerPacket::PlayerEmitWeaponFlare { player_index: first });
        match &to_first[3] {
            ServerPacket::PlayerActivateSpring {
                pos,
                force,
                keep_speed_x,
                keep_speed_y,
                ..
            } => {
                assert_eq!(*pos, Vector2f::new(64.0, 32.0));
                assert_approx_eq!(force.x, 0.0);
                assert_approx_eq!(force.y, -6.0);
                assert!(!keep_speed_x && *keep_speed_y);
            }
            other => panic!("Expected spring packet, got {:?}", other),
        }
        assert!(to_first.iter().all(|p| p.target_player() == Some(first)));

        let to_second = h.sent_to(PeerId(2));
        assert_eq!(
            to_second,
            vec![
                ServerPacket::PlayerRefreshWeaponUpgrades {
                    player_index: second,
                    weapon_type: 1,
                    upgrades: 0x01
                },
                ServerPacket::PlayerRefreshCoins {
                    player_index: second,
                    count: 12
                },
                ServerPacket::PlayerRefreshGems {
                    player_index: second,
                    gem_type: 2,
                    count: 7
                },
            ]
        );
        assert_eq!(
            h.channels_of(ServerPacketType::PlayerWarpIn),
            vec![(PeerId(1), Channel::Main)]
        );
    }

    #[test]
    fn test_protocol_version_check() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut handler = ServerHandler::new(tx, 3);
        assert_eq!(
            handler.on_peer_connected(PeerId(1), 2),
            ConnectionResult::Reject(Reason::IncompatibleVersion)
        );
        assert_eq!(handler.on_peer_connected(PeerId(2), 3), ConnectionResult::Accept);
        assert!(matches!(
            rx.try_recv(),
            Ok(NetworkEvent::PeerConnected { peer: PeerId(2) })
        ));
    }
}

//! Client replication coordinator
//!
//! Mirrors the server's world on the client side. Each tick it
//! 1. reports the local player's state and input to the server,
//! 2. applies everything the server sent since the last tick,
//! 3. moves every remoted actor to its interpolated position.
//!
//! Remoted actors render `render_delay_ms` in the past so there are always
//! two snapshots to interpolate between. Mirrored actors are spawned from
//! their level event and left to the local simulation.

use crate::config::ClientConfig;
use crate::inventory::PlayerInventory;
use crate::remote::{RemoteActorTable, RemoteProxy};
use log::{debug, info, warn};
use shared::input::PlayerAction;
use shared::interpolation::InterpolationBuffer;
use shared::packets::{
    ClientPacket, GameMode, PlayerUpdate, ServerPacket, MAX_TEXT_LENGTH, MIN_TEXT_LENGTH,
};
use shared::session::Session;
use shared::snapshot::Snapshot;
use shared::tilemap::TileMapState;
use shared::transport::{
    Channel, ConnectionResult, NetworkHandler, Outbox, PeerId, Reason, SendTarget, TransportHost,
};
use shared::udp::UdpHost;
use shared::world::{
    Actor, ActorHandle, ReplicationMode, ReplicationTag, SpawnDescriptor, SpawnEvent, World,
};
use shared::{ActorId, Result, Vector2f};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the hand-off queue between transport and game thread
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Size of a level tile in world units
pub const TILE_SIZE: f32 = 32.0;

/// Events handed from the transport thread to the game thread
#[derive(Debug)]
pub enum NetworkEvent {
    Connected,
    Disconnected {
        reason: Reason,
    },
    PacketReceived {
        channel: Channel,
        packet_type: u8,
        payload: Vec<u8>,
    },
}

/// Transport callbacks of the client
pub struct ClientHandler {
    events: mpsc::Sender<NetworkEvent>,
}

impl ClientHandler {
    pub fn new(events: mpsc::Sender<NetworkEvent>) -> Self {
        Self { events }
    }
}

impl NetworkHandler for ClientHandler {
    fn on_peer_connected(&mut self, peer: PeerId, _client_data: u32) -> ConnectionResult {
        debug!("Connected to {}", peer);
        match self.events.blocking_send(NetworkEvent::Connected) {
            Ok(()) => ConnectionResult::Accept,
            Err(_) => ConnectionResult::Reject(Reason::Disconnected),
        }
    }

    fn on_peer_disconnected(&mut self, _peer: PeerId, reason: Reason) {
        if self
            .events
            .blocking_send(NetworkEvent::Disconnected { reason })
            .is_err()
        {
            debug!("Game loop gone, dropping disconnect");
        }
    }

    fn on_packet_received(&mut self, _peer: PeerId, channel: Channel, packet_type: u8, payload: &[u8]) {
        let event = NetworkEvent::PacketReceived {
            channel,
            packet_type,
            payload: payload.to_vec(),
        };
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Event queue full, dropping packet {}", packet_type),
            Err(TrySendError::Closed(_)) => debug!("Game loop gone, dropping packet"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(Reason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelInfo {
    pub episode: String,
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalPlayer {
    pub player_index: u32,
    pub handle: ActorHandle,
    pub team: u8,
    pub initial_health: u8,
}

/// Notifications that have no world state of their own
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    Chat {
        player_index: u32,
        text: String,
    },
    Alert(String),
    ActorSound {
        actor_id: ActorId,
        identifier: String,
        gain: f32,
        pitch: f32,
    },
    CommonSound {
        pos: Vector2f,
        identifier: String,
        gain: f32,
        pitch: f32,
    },
    GameModeChanged(GameMode),
    WeaponFlare,
    WeaponChanged(u8),
    CoinsChanged(i32),
    GemsChanged {
        gem_type: u8,
        count: i32,
    },
    /// Spring physics are left to the local simulation
    SpringActivated {
        pos: Vector2f,
        force: Vector2f,
        keep_speed_x: bool,
        keep_speed_y: bool,
    },
    /// `exit_type` is `EXIT_TYPE_TEMPORARY_WARP` for a warp inside the level
    WarpIn {
        exit_type: u8,
    },
    Disconnected(Reason),
}

pub struct ClientCoordinator<O: Outbox> {
    // Dropped before the outbox, see the server coordinator
    events: mpsc::Receiver<NetworkEvent>,
    config: ClientConfig,
    outbox: O,
    connection: ConnectionState,
    level: Option<LevelInfo>,
    level_ready_sent: bool,
    game_mode: GameMode,
    world: World,
    tile_map: TileMapState,
    remotes: RemoteActorTable,
    local_player: Option<LocalPlayer>,
    inventory: PlayerInventory,
    pressed: u64,
    last_sent_pressed: u64,
    actively_pushing: bool,
    last_update_timestamp: u64,
    warp_seq: u64,
    pending_warp: Option<u64>,
    game_events: VecDeque<GameEvent>,
}

/// Connects to the configured endpoints over UDP
pub fn connect(config: ClientConfig) -> Result<ClientCoordinator<Session>> {
    let host = UdpHost::connect(&config.server, config.default_port, config.protocol_version)?;
    connect_with_host(config, host)
}

/// Starts a client session on an already created transport host
pub fn connect_with_host<T: TransportHost>(
    config: ClientConfig,
    host: T,
) -> Result<ClientCoordinator<Session>> {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let session = Session::create_client(ClientHandler::new(tx), host)?;
    info!("Connecting to {} as '{}'", config.server, config.player_name);
    Ok(ClientCoordinator::new(config, session, rx))
}

impl<O: Outbox> ClientCoordinator<O> {
    pub fn new(config: ClientConfig, outbox: O, events: mpsc::Receiver<NetworkEvent>) -> Self {
        Self {
            events,
            config,
            outbox,
            connection: ConnectionState::Connecting,
            level: None,
            level_ready_sent: false,
            game_mode: GameMode::default(),
            world: World::new(),
            tile_map: TileMapState::new(),
            remotes: RemoteActorTable::new(),
            local_player: None,
            inventory: PlayerInventory::new(),
            pressed: 0,
            last_sent_pressed: 0,
            actively_pushing: false,
            last_update_timestamp: 0,
            warp_seq: 0,
            pending_warp: None,
            game_events: VecDeque::new(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }

    pub fn level(&self) -> Option<&LevelInfo> {
        self.level.as_ref()
    }

    pub fn game_mode(&self) -> GameMode {
        self.game_mode
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

    pub fn remotes(&self) -> &RemoteActorTable {
        &self.remotes
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    pub fn local_player(&self) -> Option<LocalPlayer> {
        self.local_player
    }

    pub fn inventory(&self) -> &PlayerInventory {
        &self.inventory
    }

    /// Resolves a server actor id to the local world actor
    pub fn remote_actor(&self, actor_id: ActorId) -> Option<&Actor> {
        self.remotes
            .resolve_remote(actor_id)
            .and_then(|proxy| self.world.get(proxy.handle))
    }

    pub fn local_player_actor(&self) -> Option<&Actor> {
        self.local_player.and_then(|p| self.world.get(p.handle))
    }

    pub fn local_player_actor_mut(&mut self) -> Option<&mut Actor> {
        let handle = self.local_player?.handle;
        self.world.get_mut(handle)
    }

    /// Warp sequence number still waiting for the server's acknowledgement
    pub fn pending_warp(&self) -> Option<u64> {
        self.pending_warp
    }

    pub fn poll_event(&mut self) -> Option<GameEvent> {
        self.game_events.pop_front()
    }

    pub fn set_pressed(&mut self, pressed: u64) {
        self.pressed = pressed;
    }

    pub fn set_action(&mut self, action: PlayerAction, pressed: bool) {
        if pressed {
            self.pressed |= action.mask();
        } else {
            self.pressed &= !action.mask();
        }
    }

    pub fn set_actively_pushing(&mut self, pushing: bool) {
        self.actively_pushing = pushing;
    }

    fn send(&self, packet: &ClientPacket) {
        let channel = match packet {
            ClientPacket::PlayerUpdate(_) | ClientPacket::PlayerKeyPress { .. } => {
                Channel::UnreliableUpdates
            }
            _ => Channel::Main,
        };
        self.outbox.send(
            SendTarget::All,
            channel,
            packet.packet_type() as u8,
            &packet.encode(),
        );
    }

    /// Sends a chat line as the local player
    pub fn send_chat(&self, text: &str) -> bool {
        let Some(player) = self.local_player else {
            return false;
        };
        if !(MIN_TEXT_LENGTH..=MAX_TEXT_LENGTH).contains(&text.len()) {
            warn!("Chat message of {} bytes not sent", text.len());
            return false;
        }
        self.send(&ClientPacket::ChatMessage {
            player_index: player.player_index,
            text: text.to_string(),
        });
        true
    }

    /// Moves the local player without interpolation on other peers
    ///
    /// The warp is reported with every player update until the server
    /// acknowledges it.
    pub fn warp_local_player(&mut self, pos: Vector2f) {
        let Some(actor) = self.local_player_actor_mut() else {
            return;
        };
        actor.warp_to(pos);
        self.warp_seq += 1;
        self.pending_warp = Some(self.warp_seq);
    }

    /// One full client tick at local time `now_ms`
    pub fn tick(&mut self, now_ms: i64) {
        self.send_local_state(now_ms);
        self.process_incoming(now_ms);
        self.apply_interpolation(now_ms);
        self.world.remove_destroyed(|_, _| {});
    }

    fn send_local_state(&mut self, now_ms: i64) {
        if self.level.is_some() && !self.level_ready_sent {
            self.send(&ClientPacket::LevelReady);
            self.level_ready_sent = true;
        }

        let Some(player) = self.local_player else {
            return;
        };

        if self.pressed != self.last_sent_pressed || self.pressed != 0 {
            self.send(&ClientPacket::PlayerKeyPress {
                player_index: player.player_index,
                pressed: self.pressed,
            });
            self.last_sent_pressed = self.pressed;
        }

        let Some(actor) = self.world.get(player.handle) else {
            return;
        };
        let timestamp = (now_ms.max(0) as u64).max(self.last_update_timestamp + 1);
        let update = PlayerUpdate {
            player_index: player.player_index,
            timestamp,
            pos: actor.pos,
            speed: actor.speed,
            special_move: actor.special_move,
            facing_left: actor.facing_left,
            visible: actor.visible,
            actively_pushing: self.actively_pushing,
            warp_seq: self.pending_warp,
        };
        self.last_update_timestamp = timestamp;
        self.send(&ClientPacket::PlayerUpdate(update));
    }

    /// Applies every event queued by the transport thread since last call
    pub fn process_incoming(&mut self, now_ms: i64) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                NetworkEvent::Connected => {
                    info!("Connected, authenticating as '{}'", self.config.player_name);
                    self.connection = ConnectionState::Connected;
                    self.send(&ClientPacket::Auth {
                        player_name: self.config.player_name.clone(),
                    });
                }
                NetworkEvent::Disconnected { reason } => {
                    info!("Disconnected: {}", reason);
                    self.connection = ConnectionState::Disconnected(reason);
                    self.game_events.push_back(GameEvent::Disconnected(reason));
                }
                NetworkEvent::PacketReceived {
                    channel,
                    packet_type,
                    payload,
                } => match ServerPacket::decode(packet_type, &payload) {
                    Ok(packet) => self.handle_packet(packet, now_ms),
                    Err(e) => warn!(
                        "Dropping malformed packet {} on {:?}: {}",
                        packet_type, channel, e
                    ),
                },
            }
        }
    }

    fn is_local_player(&self, player_index: u32) -> bool {
        self.local_player
            .map_or(false, |p| p.player_index == player_index)
    }

    fn handle_packet(&mut self, packet: ServerPacket, now_ms: i64) {
        match packet {
            ServerPacket::LoadLevel {
                game_mode,
                episode,
                level,
            } => {
                info!("Loading {}/{} ({:?})", episode, level, game_mode);
                self.world = World::new();
                self.tile_map = TileMapState::new();
                self.remotes.clear();
                self.local_player = None;
                self.pending_warp = None;
                self.game_mode = game_mode;
                self.level = Some(LevelInfo { episode, level });
                self.level_ready_sent = false;
            }
            ServerPacket::ChangeGameMode { game_mode } => {
                self.game_mode = game_mode;
                self.game_events
                    .push_back(GameEvent::GameModeChanged(game_mode));
            }
            ServerPacket::PlaySfx {
                actor_id,
                gain,
                pitch,
                identifier,
            } => {
                if self.remotes.resolve_remote(actor_id).is_none() {
                    debug!("Sound '{}' for unknown actor {}", identifier, actor_id);
                    return;
                }
                self.game_events.push_back(GameEvent::ActorSound {
                    actor_id,
                    identifier,
                    gain,
                    pitch,
                });
            }
            ServerPacket::PlayCommonSfx {
                pos,
                gain,
                pitch,
                identifier,
            } => self.game_events.push_back(GameEvent::CommonSound {
                pos,
                identifier,
                gain,
                pitch,
            }),
            ServerPacket::ShowAlert { text } => {
                info!("[alert] {}", text);
                self.game_events.push_back(GameEvent::Alert(text));
            }
            ServerPacket::ChatMessage { player_index, text } => {
                info!("[chat] player {}: {}", player_index, text);
                self.game_events
                    .push_back(GameEvent::Chat { player_index, text });
            }
            ServerPacket::CreateControllablePlayer {
                player_index,
                team,
                health,
                pos,
            } => {
                if let Some(previous) = self.local_player.take() {
                    self.world.mark_destroyed(previous.handle);
                }
                let mut actor = Actor::new(pos).with_animation(0);
                actor.player_index = Some(player_index);
                actor.team = team;
                actor.health = health as i32;
                let handle = self.world.add_actor(actor);
                self.inventory = PlayerInventory::new();
                info!("Controlling player {} (team {})", player_index, team);
                self.local_player = Some(LocalPlayer {
                    player_index,
                    handle,
                    team,
                    initial_health: health,
                });
            }
            ServerPacket::CreateRemoteActor {
                actor_id,
                state_flags,
                pos,
                layer,
                metadata_path,
                animation,
            } => {
                let mut actor = Actor::new(pos).with_animation(animation);
                actor.state_flags = state_flags;
                actor.layer = layer;
                actor.spawn.metadata_path = metadata_path;
                let interpolation = InterpolationBuffer::new(now_ms, pos)
                    .with_render_delay(self.config.render_delay_ms);
                self.insert_proxy(actor_id, actor, ReplicationMode::Remoted, Some(interpolation));
            }
            ServerPacket::CreateMirroredActor {
                actor_id,
                event_type,
                params,
                actor_flags,
                tile_x,
                tile_y,
                layer,
            } => {
                let pos = Vector2f::new(
                    tile_x as f32 * TILE_SIZE + TILE_SIZE / 2.0,
                    tile_y as f32 * TILE_SIZE + TILE_SIZE / 2.0,
                );
                let mut actor = Actor::new(pos).with_spawn(SpawnDescriptor {
                    tag: ReplicationTag::Mirrored,
                    event: Some(SpawnEvent {
                        event_type,
                        params,
                        actor_flags,
                        tile_x,
                        tile_y,
                    }),
                    ..SpawnDescriptor::default()
                });
                actor.layer = layer;
                self.insert_proxy(actor_id, actor, ReplicationMode::Mirrored, None);
            }
            ServerPacket::DestroyRemoteActor { actor_id } => match self.remotes.remove(actor_id) {
                Some(proxy) => {
                    self.world.mark_destroyed(proxy.handle);
                }
                None => debug!("Destroy for unknown actor {}", actor_id),
            },
            ServerPacket::UpdateAllActors(snapshot) => self.apply_snapshot(&snapshot, now_ms),
            ServerPacket::SyncTileMap { data } => match TileMapState::decode(&data) {
                Ok(tile_map) => self.tile_map = tile_map,
                Err(e) => warn!("Failed to decode tile map: {}", e),
            },
            ServerPacket::SetTrigger { trigger_id, state } => {
                self.tile_map.set_trigger(trigger_id, state);
            }
            ServerPacket::AdvanceTileAnimation {
                tile_x,
                tile_y,
                amount,
            } => self.tile_map.advance_tile_animation(tile_x, tile_y, amount),
            ServerPacket::PlayerRespawn { player_index, pos } => {
                if !self.is_local_player(player_index) {
                    debug!("Respawn for player {} ignored", player_index);
                    return;
                }
                let health = self.local_player.map_or(0, |p| p.initial_health as i32);
                self.warp_local_player(pos);
                if let Some(actor) = self.local_player_actor_mut() {
                    actor.speed = Vector2f::ZERO;
                    actor.health = health;
                }
            }
            ServerPacket::PlayerMoveInstantly {
                player_index,
                pos,
                speed,
            } => {
                if !self.is_local_player(player_index) {
                    debug!("Move for player {} ignored", player_index);
                    return;
                }
                self.warp_local_player(pos);
                if let Some(actor) = self.local_player_actor_mut() {
                    actor.speed = speed;
                }
            }
            ServerPacket::PlayerTakeDamage {
                player_index,
                health,
                push_force,
            } => {
                if !self.is_local_player(player_index) {
                    return;
                }
                if let Some(actor) = self.local_player_actor_mut() {
                    actor.health = health;
                    actor.speed.x += push_force;
                }
            }
            ServerPacket::PlayerAckWarped {
                player_index,
                warp_seq,
            } => {
                if self.is_local_player(player_index) && self.pending_warp == Some(warp_seq) {
                    debug!("Warp {} acknowledged", warp_seq);
                    self.pending_warp = None;
                }
            }
            packet @ (ServerPacket::PlayerEmitWeaponFlare { .. }
            | ServerPacket::PlayerChangeWeapon { .. }
            | ServerPacket::PlayerRefreshAmmo { .. }
            | ServerPacket::PlayerRefreshWeaponUpgrades { .. }
            | ServerPacket::PlayerRefreshCoins { .. }
            | ServerPacket::PlayerRefreshGems { .. }
            | ServerPacket::PlayerActivateSpring { .. }
            | ServerPacket::PlayerWarpIn { .. }) => self.apply_player_state(packet),
        }
    }

    /// Per-player packets the server sends only to the owning client
    fn apply_player_state(&mut self, packet: ServerPacket) {
        let Some(player_index) = packet.target_player() else {
            return;
        };
        if !self.is_local_player(player_index) {
            debug!("{:?} for player {} ignored", packet.packet_type(), player_index);
            return;
        }
        match packet {
            ServerPacket::PlayerEmitWeaponFlare { .. } => {
                self.game_events.push_back(GameEvent::WeaponFlare);
            }
            ServerPacket::PlayerChangeWeapon { weapon_type, .. } => {
                if self.inventory.set_current_weapon(weapon_type) {
                    self.game_events
                        .push_back(GameEvent::WeaponChanged(weapon_type));
                }
            }
            ServerPacket::PlayerRefreshAmmo {
                weapon_type, ammo, ..
            } => {
                self.inventory.set_ammo(weapon_type, ammo);
            }
            ServerPacket::PlayerRefreshWeaponUpgrades {
                weapon_type,
                upgrades,
                ..
            } => {
                self.inventory.set_weapon_upgrades(weapon_type, upgrades);
            }
            ServerPacket::PlayerRefreshCoins { count, .. } => {
                self.inventory.coins = count;
                self.game_events.push_back(GameEvent::CoinsChanged(count));
            }
            ServerPacket::PlayerRefreshGems {
                gem_type, count, ..
            } => {
                if self.inventory.set_gems(gem_type, count) {
                    self.game_events
                        .push_back(GameEvent::GemsChanged { gem_type, count });
                }
            }
            ServerPacket::PlayerActivateSpring {
                pos,
                force,
                keep_speed_x,
                keep_speed_y,
                ..
            } => self.game_events.push_back(GameEvent::SpringActivated {
                pos,
                force,
                keep_speed_x,
                keep_speed_y,
            }),
            ServerPacket::PlayerWarpIn { exit_type, .. } => {
                self.game_events.push_back(GameEvent::WarpIn { exit_type });
            }
            _ => {}
        }
    }

    fn insert_proxy(
        &mut self,
        actor_id: ActorId,
        actor: Actor,
        mode: ReplicationMode,
        interpolation: Option<InterpolationBuffer>,
    ) {
        let handle = self.world.add_actor(actor);
        let proxy = RemoteProxy {
            handle,
            mode,
            interpolation,
        };
        if let Some(previous) = self.remotes.insert(actor_id, proxy) {
            self.world.mark_destroyed(previous.handle);
        }
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot, now_ms: i64) {
        for update in &snapshot.actors {
            if self.is_local_player(update.actor_id) {
                continue;
            }
            let Some(proxy) = self.remotes.get_mut(update.actor_id) else {
                debug!("Snapshot entry for unknown actor {}", update.actor_id);
                continue;
            };
            let Some(actor) = self.world.get_mut(proxy.handle) else {
                continue;
            };

            let became_visible = !actor.visible && update.visible;
            actor.animation = Some(update.animation);
            actor.rotation = update.rotation;
            actor.facing_left = update.facing_left;
            actor.visible = update.visible;
            actor.anim_paused = update.anim_paused;
            actor.renderer_type = update.renderer_type;

            if let Some(buffer) = proxy.interpolation.as_mut() {
                if update.just_warped || became_visible {
                    buffer.reset(now_ms, update.pos);
                    actor.pos = update.pos;
                } else {
                    buffer.record(now_ms, update.pos);
                }
            }
        }
    }

    fn apply_interpolation(&mut self, now_ms: i64) {
        for (_, proxy) in self.remotes.iter() {
            let Some(buffer) = proxy.interpolation.as_ref() else {
                continue;
            };
            if let Some(actor) = self.world.get_mut(proxy.handle) {
                actor.pos = buffer.sample(now_ms);
            }
        }
    }
}

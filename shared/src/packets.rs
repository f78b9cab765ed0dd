//! Byte-tagged control and update packets.
//!
//! The first byte of every transport message selects the packet kind, the
//! payload after it is encoded with [`PacketWriter`]. Client and server use
//! separate tag spaces.

use crate::codec::{PacketReader, PacketWriter};
use crate::error::DecodeError;
use crate::math::Vector2f;
use crate::snapshot::Snapshot;
use crate::world::SPAWN_PARAMS_SIZE;
use crate::ActorId;
use serde::{Deserialize, Serialize};

/// Accepted chat/alert text length in bytes.
pub const MIN_TEXT_LENGTH: usize = 1;
pub const MAX_TEXT_LENGTH: usize = 1024;

pub const MAX_NAME_LENGTH: usize = 64;
pub const MAX_PATH_LENGTH: usize = 256;

/// Upper bound of an encoded tile map.
pub const MAX_TILE_MAP_SIZE: usize = 256 * 1024;

macro_rules! packet_type_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = DecodeError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(DecodeError::UnknownPacketType(other)),
                }
            }
        }
    };
}

packet_type_enum!(
    /// Tags of packets sent by clients.
    ClientPacketType {
        Auth = 1,
        LevelReady = 2,
        ChatMessage = 3,
        PlayerUpdate = 4,
        PlayerKeyPress = 5,
    }
);

packet_type_enum!(
    /// Tags of packets sent by the server.
    ServerPacketType {
        LoadLevel = 1,
        ChangeGameMode = 2,
        PlaySfx = 3,
        PlayCommonSfx = 4,
        ShowAlert = 5,
        ChatMessage = 6,
        CreateControllablePlayer = 7,
        CreateRemoteActor = 8,
        CreateMirroredActor = 9,
        DestroyRemoteActor = 10,
        UpdateAllActors = 11,
        SyncTileMap = 12,
        SetTrigger = 13,
        AdvanceTileAnimation = 14,
        PlayerRespawn = 15,
        PlayerMoveInstantly = 16,
        PlayerTakeDamage = 17,
        PlayerAckWarped = 18,
        PlayerEmitWeaponFlare = 19,
        PlayerChangeWeapon = 20,
        PlayerRefreshAmmo = 21,
        PlayerRefreshWeaponUpgrades = 22,
        PlayerRefreshCoins = 23,
        PlayerRefreshGems = 24,
        PlayerActivateSpring = 25,
        PlayerWarpIn = 26,
    }
);

/// `PlayerWarpIn` exit type of a warp that stays in the current level.
pub const EXIT_TYPE_TEMPORARY_WARP: u8 = 0xff;

const SPRING_KEEP_SPEED_X: u8 = 0x01;
const SPRING_KEEP_SPEED_Y: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum GameMode {
    #[default]
    Battle = 0,
    TeamBattle = 1,
    CaptureTheFlag = 2,
    Race = 3,
    TeamRace = 4,
    TreasureHunt = 5,
    Cooperation = 6,
}

impl GameMode {
    pub fn is_team_mode(self) -> bool {
        matches!(
            self,
            GameMode::TeamBattle | GameMode::CaptureTheFlag | GameMode::TeamRace
        )
    }
}

impl TryFrom<u8> for GameMode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => GameMode::Battle,
            1 => GameMode::TeamBattle,
            2 => GameMode::CaptureTheFlag,
            3 => GameMode::Race,
            4 => GameMode::TeamRace,
            5 => GameMode::TreasureHunt,
            6 => GameMode::Cooperation,
            other => {
                return Err(DecodeError::InvalidValue {
                    field: "game mode",
                    value: other as u64,
                })
            }
        })
    }
}

impl std::str::FromStr for GameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
            "battle" => Ok(GameMode::Battle),
            "teambattle" => Ok(GameMode::TeamBattle),
            "capturetheflag" | "ctf" => Ok(GameMode::CaptureTheFlag),
            "race" => Ok(GameMode::Race),
            "teamrace" => Ok(GameMode::TeamRace),
            "treasurehunt" => Ok(GameMode::TreasureHunt),
            "cooperation" | "coop" => Ok(GameMode::Cooperation),
            _ => Err(format!("unknown game mode '{}'", s)),
        }
    }
}

const UPDATE_SPECIAL_MOVE_MASK: u32 = 0x07;
const UPDATE_FACING_LEFT: u32 = 0x10;
const UPDATE_VISIBLE: u32 = 0x20;
const UPDATE_ACTIVELY_PUSHING: u32 = 0x40;
const UPDATE_JUST_WARPED: u32 = 0x80;

/// Periodic state report of the client's own player.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerUpdate {
    pub player_index: u32,
    /// Client clock in milliseconds; the server drops anything not newer
    /// than the last accepted report.
    pub timestamp: u64,
    pub pos: Vector2f,
    pub speed: Vector2f,
    /// 0..=7
    pub special_move: u8,
    pub facing_left: bool,
    pub visible: bool,
    pub actively_pushing: bool,
    /// Present while the player has warped and the server has not yet
    /// acknowledged this sequence number.
    pub warp_seq: Option<u64>,
}

impl PlayerUpdate {
    fn write(&self, w: &mut PacketWriter) {
        let mut flags = self.special_move as u32 & UPDATE_SPECIAL_MOVE_MASK;
        if self.facing_left {
            flags |= UPDATE_FACING_LEFT;
        }
        if self.visible {
            flags |= UPDATE_VISIBLE;
        }
        if self.actively_pushing {
            flags |= UPDATE_ACTIVELY_PUSHING;
        }
        if self.warp_seq.is_some() {
            flags |= UPDATE_JUST_WARPED;
        }

        w.write_var_u32(self.player_index);
        w.write_var_u64(self.timestamp);
        w.write_position(self.pos);
        w.write_speed(self.speed);
        w.write_var_u32(flags);
        if let Some(seq) = self.warp_seq {
            w.write_var_u64(seq);
        }
    }

    fn read(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let player_index = r.read_var_u32()?;
        let timestamp = r.read_var_u64()?;
        let pos = r.read_position()?;
        let speed = r.read_speed()?;
        let flags = r.read_var_u32()?;
        let warp_seq = if flags & UPDATE_JUST_WARPED != 0 {
            Some(r.read_var_u64()?)
        } else {
            None
        };
        Ok(Self {
            player_index,
            timestamp,
            pos,
            speed,
            special_move: (flags & UPDATE_SPECIAL_MOVE_MASK) as u8,
            facing_left: flags & UPDATE_FACING_LEFT != 0,
            visible: flags & UPDATE_VISIBLE != 0,
            actively_pushing: flags & UPDATE_ACTIVELY_PUSHING != 0,
            warp_seq,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientPacket {
    Auth {
        player_name: String,
    },
    LevelReady,
    ChatMessage {
        player_index: u32,
        text: String,
    },
    PlayerUpdate(PlayerUpdate),
    PlayerKeyPress {
        player_index: u32,
        pressed: u64,
    },
}

impl ClientPacket {
    pub fn packet_type(&self) -> ClientPacketType {
        match self {
            ClientPacket::Auth { .. } => ClientPacketType::Auth,
            ClientPacket::LevelReady => ClientPacketType::LevelReady,
            ClientPacket::ChatMessage { .. } => ClientPacketType::ChatMessage,
            ClientPacket::PlayerUpdate(_) => ClientPacketType::PlayerUpdate,
            ClientPacket::PlayerKeyPress { .. } => ClientPacketType::PlayerKeyPress,
        }
    }

    /// Encodes the payload, without the leading type byte.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        match self {
            ClientPacket::Auth { player_name } => w.write_str(player_name),
            ClientPacket::LevelReady => {}
            ClientPacket::ChatMessage { player_index, text } => {
                w.write_var_u32(*player_index);
                w.write_str(text);
            }
            ClientPacket::PlayerUpdate(update) => update.write(&mut w),
            ClientPacket::PlayerKeyPress {
                player_index,
                pressed,
            } => {
                w.write_var_u32(*player_index);
                w.write_var_u64(*pressed);
            }
        }
        w.into_inner()
    }

    pub fn decode(packet_type: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = PacketReader::new(payload);
        Ok(match ClientPacketType::try_from(packet_type)? {
            ClientPacketType::Auth => ClientPacket::Auth {
                player_name: r.read_string(1, MAX_NAME_LENGTH)?,
            },
            ClientPacketType::LevelReady => ClientPacket::LevelReady,
            ClientPacketType::ChatMessage => ClientPacket::ChatMessage {
                player_index: r.read_var_u32()?,
                text: r.read_string(MIN_TEXT_LENGTH, MAX_TEXT_LENGTH)?,
            },
            ClientPacketType::PlayerUpdate => ClientPacket::PlayerUpdate(PlayerUpdate::read(&mut r)?),
            ClientPacketType::PlayerKeyPress => ClientPacket::PlayerKeyPress {
                player_index: r.read_var_u32()?,
                pressed: r.read_var_u64()?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerPacket {
    LoadLevel {
        game_mode: GameMode,
        episode: String,
        level: String,
    },
    ChangeGameMode {
        game_mode: GameMode,
    },
    PlaySfx {
        actor_id: ActorId,
        gain: f32,
        pitch: f32,
        identifier: String,
    },
    PlayCommonSfx {
        pos: Vector2f,
        gain: f32,
        pitch: f32,
        identifier: String,
    },
    ShowAlert {
        text: String,
    },
    ChatMessage {
        player_index: u32,
        text: String,
    },
    CreateControllablePlayer {
        player_index: u32,
        team: u8,
        health: u8,
        pos: Vector2f,
    },
    CreateRemoteActor {
        actor_id: ActorId,
        state_flags: u32,
        pos: Vector2f,
        layer: u16,
        metadata_path: String,
        animation: u32,
    },
    CreateMirroredActor {
        actor_id: ActorId,
        event_type: u32,
        params: [u8; SPAWN_PARAMS_SIZE],
        actor_flags: u32,
        tile_x: i32,
        tile_y: i32,
        layer: u16,
    },
    DestroyRemoteActor {
        actor_id: ActorId,
    },
    UpdateAllActors(Snapshot),
    /// Bincode-encoded [`crate::tilemap::TileMapState`].
    SyncTileMap {
        data: Vec<u8>,
    },
    SetTrigger {
        trigger_id: u8,
        state: bool,
    },
    AdvanceTileAnimation {
        tile_x: i32,
        tile_y: i32,
        amount: i32,
    },
    PlayerRespawn {
        player_index: u32,
        pos: Vector2f,
    },
    PlayerMoveInstantly {
        player_index: u32,
        pos: Vector2f,
        speed: Vector2f,
    },
    PlayerTakeDamage {
        player_index: u32,
        health: i32,
        push_force: f32,
    },
    PlayerAckWarped {
        player_index: u32,
        warp_seq: u64,
    },
    PlayerEmitWeaponFlare {
        player_index: u32,
    },
    PlayerChangeWeapon {
        player_index: u32,
        weapon_type: u8,
    },
    PlayerRefreshAmmo {
        player_index: u32,
        weapon_type: u8,
        ammo: u16,
    },
    PlayerRefreshWeaponUpgrades {
        player_index: u32,
        weapon_type: u8,
        upgrades: u8,
    },
    PlayerRefreshCoins {
        player_index: u32,
        count: i32,
    },
    PlayerRefreshGems {
        player_index: u32,
        gem_type: u8,
        count: i32,
    },
    PlayerActivateSpring {
        player_index: u32,
        pos: Vector2f,
        force: Vector2f,
        keep_speed_x: bool,
        keep_speed_y: bool,
    },
    PlayerWarpIn {
        player_index: u32,
        exit_type: u8,
    },
}

impl ServerPacket {
    pub fn packet_type(&self) -> ServerPacketType {
        match self {
            ServerPacket::LoadLevel { .. } => ServerPacketType::LoadLevel,
            ServerPacket::ChangeGameMode { .. } => ServerPacketType::ChangeGameMode,
            ServerPacket::PlaySfx { .. } => ServerPacketType::PlaySfx,
            ServerPacket::PlayCommonSfx { .. } => ServerPacketType::PlayCommonSfx,
            ServerPacket::ShowAlert { .. } => ServerPacketType::ShowAlert,
            ServerPacket::ChatMessage { .. } => ServerPacketType::ChatMessage,
            ServerPacket::CreateControllablePlayer { .. } => {
                ServerPacketType::CreateControllablePlayer
            }
            ServerPacket::CreateRemoteActor { .. } => ServerPacketType::CreateRemoteActor,
            ServerPacket::CreateMirroredActor { .. } => ServerPacketType::CreateMirroredActor,
            ServerPacket::DestroyRemoteActor { .. } => ServerPacketType::DestroyRemoteActor,
            ServerPacket::UpdateAllActors(_) => ServerPacketType::UpdateAllActors,
            ServerPacket::SyncTileMap { .. } => ServerPacketType::SyncTileMap,
            ServerPacket::SetTrigger { .. } => ServerPacketType::SetTrigger,
            ServerPacket::AdvanceTileAnimation { .. } => ServerPacketType::AdvanceTileAnimation,
            ServerPacket::PlayerRespawn { .. } => ServerPacketType::PlayerRespawn,
            ServerPacket::PlayerMoveInstantly { .. } => ServerPacketType::PlayerMoveInstantly,
            ServerPacket::PlayerTakeDamage { .. } => ServerPacketType::PlayerTakeDamage,
            ServerPacket::PlayerAckWarped { .. } => ServerPacketType::PlayerAckWarped,
            ServerPacket::PlayerEmitWeaponFlare { .. } => ServerPacketType::PlayerEmitWeaponFlare,
            ServerPacket::PlayerChangeWeapon { .. } => ServerPacketType::PlayerChangeWeapon,
            ServerPacket::PlayerRefreshAmmo { .. } => ServerPacketType::PlayerRefreshAmmo,
            ServerPacket::PlayerRefreshWeaponUpgrades { .. } => {
                ServerPacketType::PlayerRefreshWeaponUpgrades
            }
            ServerPacket::PlayerRefreshCoins { .. } => ServerPacketType::PlayerRefreshCoins,
            ServerPacket::PlayerRefreshGems { .. } => ServerPacketType::PlayerRefreshGems,
            ServerPacket::PlayerActivateSpring { .. } => ServerPacketType::PlayerActivateSpring,
            ServerPacket::PlayerWarpIn { .. } => ServerPacketType::PlayerWarpIn,
        }
    }

    /// Player addressed by a per-player state packet.
    pub fn target_player(&self) -> Option<u32> {
        match self {
            ServerPacket::PlayerRespawn { player_index, .. }
            | ServerPacket::PlayerMoveInstantly { player_index, .. }
            | ServerPacket::PlayerTakeDamage { player_index, .. }
            | ServerPacket::PlayerAckWarped { player_index, .. }
            | ServerPacket::PlayerEmitWeaponFlare { player_index }
            | ServerPacket::PlayerChangeWeapon { player_index, .. }
            | ServerPacket::PlayerRefreshAmmo { player_index, .. }
            | ServerPacket::PlayerRefreshWeaponUpgrades { player_index, .. }
            | ServerPacket::PlayerRefreshCoins { player_index, .. }
            | ServerPacket::PlayerRefreshGems { player_index, .. }
            | ServerPacket::PlayerActivateSpring { player_index, .. }
            | ServerPacket::PlayerWarpIn { player_index, .. } => Some(*player_index),
            _ => None,
        }
    }

    /// Encodes the payload, without the leading type byte.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = PacketWriter::new();
        match self {
            ServerPacket::LoadLevel {
                game_mode,
                episode,
                level,
            } => {
                w.write_u8(*game_mode as u8);
                w.write_str(episode);
                w.write_str(level);
            }
            ServerPacket::ChangeGameMode { game_mode } => w.write_u8(*game_mode as u8),
            ServerPacket::PlaySfx {
                actor_id,
                gain,
                pitch,
                identifier,
            } => {
                w.write_var_u32(*actor_id);
                w.write_f32(*gain);
                w.write_f32(*pitch);
                w.write_str(identifier);
            }
            ServerPacket::PlayCommonSfx {
                pos,
                gain,
                pitch,
                identifier,
            } => {
                w.write_position(*pos);
                w.write_f32(*gain);
                w.write_f32(*pitch);
                w.write_str(identifier);
            }
            ServerPacket::ShowAlert { text } => w.write_str(text),
            ServerPacket::ChatMessage { player_index, text } => {
                w.write_var_u32(*player_index);
                w.write_str(text);
            }
            ServerPacket::CreateControllablePlayer {
                player_index,
                team,
                health,
                pos,
            } => {
                w.write_var_u32(*player_index);
                w.write_u8(*team);
                w.write_u8(*health);
                w.write_position(*pos);
            }
            ServerPacket::CreateRemoteActor {
                actor_id,
                state_flags,
                pos,
                layer,
                metadata_path,
                animation,
            } => {
                w.write_var_u32(*actor_id);
                w.write_var_u32(*state_flags);
                w.write_position(*pos);
                w.write_u16(*layer);
                w.write_str(metadata_path);
                w.write_var_u32(*animation);
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
                w.write_var_u32(*actor_id);
                w.write_var_u32(*event_type);
                w.write_bytes(params);
                w.write_var_u32(*actor_flags);
                w.write_var_i32(*tile_x);
                w.write_var_i32(*tile_y);
                w.write_u16(*layer);
            }
            ServerPacket::DestroyRemoteActor { actor_id } => w.write_var_u32(*actor_id),
            ServerPacket::UpdateAllActors(snapshot) => w.write_bytes(&snapshot.encode()),
            ServerPacket::SyncTileMap { data } => w.write_len_prefixed(data),
            ServerPacket::SetTrigger { trigger_id, state } => {
                w.write_u8(*trigger_id);
                w.write_bool(*state);
            }
            ServerPacket::AdvanceTileAnimation {
                tile_x,
                tile_y,
                amount,
            } => {
                w.write_var_i32(*tile_x);
                w.write_var_i32(*tile_y);
                w.write_var_i32(*amount);
            }
            ServerPacket::PlayerRespawn { player_index, pos } => {
                w.write_var_u32(*player_index);
                w.write_position(*pos);
            }
            ServerPacket::PlayerMoveInstantly {
                player_index,
                pos,
                speed,
            } => {
                w.write_var_u32(*player_index);
                w.write_position(*pos);
                w.write_speed(*speed);
            }
            ServerPacket::PlayerTakeDamage {
                player_index,
                health,
                push_force,
            } => {
                w.write_var_u32(*player_index);
                w.write_var_i32(*health);
                w.write_i16(crate::codec::to_fixed_i16(*push_force));
            }
            ServerPacket::PlayerAckWarped {
                player_index,
                warp_seq,
            } => {
                w.write_var_u32(*player_index);
                w.write_var_u64(*warp_seq);
            }
            ServerPacket::PlayerEmitWeaponFlare { player_index } => w.write_var_u32(*player_index),
            ServerPacket::PlayerChangeWeapon {
                player_index,
                weapon_type,
            } => {
                w.write_var_u32(*player_index);
                w.write_u8(*weapon_type);
            }
            ServerPacket::PlayerRefreshAmmo {
                player_index,
                weapon_type,
                ammo,
            } => {
                w.write_var_u32(*player_index);
                w.write_u8(*weapon_type);
                w.write_u16(*ammo);
            }
            ServerPacket::PlayerRefreshWeaponUpgrades {
                player_index,
                weapon_type,
                upgrades,
            } => {
                w.write_var_u32(*player_index);
                w.write_u8(*weapon_type);
                w.write_u8(*upgrades);
            }
            ServerPacket::PlayerRefreshCoins {
                player_index,
                count,
            } => {
                w.write_var_u32(*player_index);
                w.write_var_i32(*count);
            }
            ServerPacket::PlayerRefreshGems {
                player_index,
                gem_type,
                count,
            } => {
                w.write_var_u32(*player_index);
                w.write_u8(*gem_type);
                w.write_var_i32(*count);
            }
            ServerPacket::PlayerActivateSpring {
                player_index,
                pos,
                force,
                keep_speed_x,
                keep_speed_y,
            } => {
                let mut flags = 0;
                if *keep_speed_x {
                    flags |= SPRING_KEEP_SPEED_X;
                }
                if *keep_speed_y {
                    flags |= SPRING_KEEP_SPEED_Y;
                }
                w.write_var_u32(*player_index);
                w.write_position(*pos);
                w.write_speed(*force);
                w.write_u8(flags);
            }
            ServerPacket::PlayerWarpIn {
                player_index,
                exit_type,
            } => {
                w.write_var_u32(*player_index);
                w.write_u8(*exit_type);
            }
        }
        w.into_inner()
    }

    pub fn decode(packet_type: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = PacketReader::new(payload);
        Ok(match ServerPacketType::try_from(packet_type)? {
            ServerPacketType::LoadLevel => ServerPacket::LoadLevel {
                game_mode: GameMode::try_from(r.read_u8()?)?,
                episode: r.read_string(1, MAX_PATH_LENGTH)?,
                level: r.read_string(1, MAX_PATH_LENGTH)?,
            },
            ServerPacketType::ChangeGameMode => ServerPacket::ChangeGameMode {
                game_mode: GameMode::try_from(r.read_u8()?)?,
            },
            ServerPacketType::PlaySfx => ServerPacket::PlaySfx {
                actor_id: r.read_var_u32()?,
                gain: r.read_f32()?,
                pitch: r.read_f32()?,
                identifier: r.read_string(1, MAX_PATH_LENGTH)?,
            },
            ServerPacketType::PlayCommonSfx => ServerPacket::PlayCommonSfx {
                pos: r.read_position()?,
                gain: r.read_f32()?,
                pitch: r.read_f32()?,
                identifier: r.read_string(1, MAX_PATH_LENGTH)?,
            },
            ServerPacketType::ShowAlert => ServerPacket::ShowAlert {
                text: r.read_string(MIN_TEXT_LENGTH, MAX_TEXT_LENGTH)?,
            },
            ServerPacketType::ChatMessage => ServerPacket::ChatMessage {
                player_index: r.read_var_u32()?,
                text: r.read_string(MIN_TEXT_LENGTH, MAX_TEXT_LENGTH)?,
            },
            ServerPacketType::CreateControllablePlayer => ServerPacket::CreateControllablePlayer {
                player_index: r.read_var_u32()?,
                team: r.read_u8()?,
                health: r.read_u8()?,
                pos: r.read_position()?,
            },
            ServerPacketType::CreateRemoteActor => ServerPacket::CreateRemoteActor {
                actor_id: r.read_var_u32()?,
                state_flags: r.read_var_u32()?,
                pos: r.read_position()?,
                layer: r.read_u16()?,
                metadata_path: r.read_string(0, MAX_PATH_LENGTH)?,
                animation: r.read_var_u32()?,
            },
            ServerPacketType::CreateMirroredActor => {
                let actor_id = r.read_var_u32()?;
                let event_type = r.read_var_u32()?;
                let mut params = [0u8; SPAWN_PARAMS_SIZE];
                params.copy_from_slice(r.read_bytes(SPAWN_PARAMS_SIZE)?);
                ServerPacket::CreateMirroredActor {
                    actor_id,
                    event_type,
                    params,
                    actor_flags: r.read_var_u32()?,
                    tile_x: r.read_var_i32()?,
                    tile_y: r.read_var_i32()?,
                    layer: r.read_u16()?,
                }
            }
            ServerPacketType::DestroyRemoteActor => ServerPacket::DestroyRemoteActor {
                actor_id: r.read_var_u32()?,
            },
            ServerPacketType::UpdateAllActors => {
                ServerPacket::UpdateAllActors(Snapshot::decode(r.rest())?)
            }
            ServerPacketType::SyncTileMap => ServerPacket::SyncTileMap {
                data: r.read_len_prefixed(0, MAX_TILE_MAP_SIZE)?.to_vec(),
            },
            ServerPacketType::SetTrigger => ServerPacket::SetTrigger {
                trigger_id: r.read_u8()?,
                state: r.read_bool()?,
            },
            ServerPacketType::AdvanceTileAnimation => ServerPacket::AdvanceTileAnimation {
                tile_x: r.read_var_i32()?,
                tile_y: r.read_var_i32()?,
                amount: r.read_var_i32()?,
            },
            ServerPacketType::PlayerRespawn => ServerPacket::PlayerRespawn {
                player_index: r.read_var_u32()?,
                pos: r.read_position()?,
            },
            ServerPacketType::PlayerMoveInstantly => ServerPacket::PlayerMoveInstantly {
                player_index: r.read_var_u32()?,
                pos: r.read_position()?,
                speed: r.read_speed()?,
            },
            ServerPacketType::PlayerTakeDamage => ServerPacket::PlayerTakeDamage {
                player_index: r.read_var_u32()?,
                health: r.read_var_i32()?,
                push_force: crate::codec::from_fixed_i16(r.read_i16()?),
            },
            ServerPacketType::PlayerAckWarped => ServerPacket::PlayerAckWarped {
                player_index: r.read_var_u32()?,
                warp_seq: r.read_var_u64()?,
            },
            ServerPacketType::PlayerEmitWeaponFlare => ServerPacket::PlayerEmitWeaponFlare {
                player_index: r.read_var_u32()?,
            },
            ServerPacketType::PlayerChangeWeapon => ServerPacket::PlayerChangeWeapon {
                player_index: r.read_var_u32()?,
                weapon_type: r.read_u8()?,
            },
            ServerPacketType::PlayerRefreshAmmo => ServerPacket::PlayerRefreshAmmo {
                player_index: r.read_var_u32()?,
                weapon_type: r.read_u8()?,
                ammo: r.read_u16()?,
            },
            ServerPacketType::PlayerRefreshWeaponUpgrades => {
                ServerPacket::PlayerRefreshWeaponUpgrades {
                    player_index: r.read_var_u32()?,
                    weapon_type: r.read_u8()?,
                    upgrades: r.read_u8()?,
                }
            }
            ServerPacketType::PlayerRefreshCoins => ServerPacket::PlayerRefreshCoins {
                player_index: r.read_var_u32()?,
                count: r.read_var_i32()?,
            },
            ServerPacketType::PlayerRefreshGems => ServerPacket::PlayerRefreshGems {
                player_index: r.read_var_u32()?,
                gem_type: r.read_u8()?,
                count: r.read_var_i32()?,
            },
            ServerPacketType::PlayerActivateSpring => {
                let player_index = r.read_var_u32()?;
                let pos = r.read_position()?;
                let force = r.read_speed()?;
                let flags = r.read_u8()?;
                ServerPacket::PlayerActivateSpring {
                    player_index,
                    pos,
                    force,
                    keep_speed_x: flags & SPRING_KEEP_SPEED_X != 0,
                    keep_speed_y: flags & SPRING_KEEP_SPEED_Y != 0,
                }
            }
            ServerPacketType::PlayerWarpIn => ServerPacket::PlayerWarpIn {
                player_index: r.read_var_u32()?,
                exit_type: r.read_u8()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn reencode_client(packet: &ClientPacket) -> ClientPacket {
        ClientPacket::decode(packet.packet_type() as u8, &packet.encode()).unwrap()
    }

    fn reencode_server(packet: &ServerPacket) -> ServerPacket {
        ServerPacket::decode(packet.packet_type() as u8, &packet.encode()).unwrap()
    }

    #[test]
    fn test_unknown_packet_type() {
        assert_eq!(
            ClientPacket::decode(0xee, &[]),
            Err(DecodeError::UnknownPacketType(0xee))
        );
        assert_eq!(
            ServerPacket::decode(0, &[]),
            Err(DecodeError::UnknownPacketType(0))
        );
    }

    #[test]
    fn test_player_update_flags_layout() {
        let update = PlayerUpdate {
            player_index: 3,
            timestamp: 1000,
            pos: Vector2f::new(50.0, 50.0),
            speed: Vector2f::new(-2.5, 4.0),
            special_move: 2,
            facing_left: true,
            visible: true,
            actively_pushing: false,
            warp_seq: Some(9),
        };
        let payload = ClientPacket::PlayerUpdate(update.clone()).encode();
        // index(1) + timestamp(2) + pos(8) + speed(4), then flags
        assert_eq!(payload[15], 0x80 | 0x02 | 0x10 | 0x20);
        // flags >= 0x80 take two varint bytes, then the warp sequence
        assert_eq!(payload.len(), 15 + 2 + 1);

        match reencode_client(&ClientPacket::PlayerUpdate(update.clone())) {
            ClientPacket::PlayerUpdate(decoded) => {
                assert_eq!(decoded.warp_seq, Some(9));
                assert_eq!(decoded.special_move, 2);
                assert!(decoded.facing_left);
                assert!(!decoded.actively_pushing);
                assert_approx_eq!(decoded.speed.x, -2.5);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_player_update_without_warp() {
        let update = PlayerUpdate {
            player_index: 0,
            timestamp: 5,
            pos: Vector2f::ZERO,
            speed: Vector2f::ZERO,
            special_move: 0,
            facing_left: false,
            visible: true,
            actively_pushing: true,
            warp_seq: None,
        };
        let packet = ClientPacket::PlayerUpdate(update);
        assert_eq!(reencode_client(&packet), packet);
    }

    #[test]
    fn test_chat_length_bounds() {
        let mut w = PacketWriter::new();
        w.write_var_u32(0);
        w.write_var_u32(2000);
        w.write_bytes(&vec![b'x'; 2000]);
        assert_eq!(
            ClientPacket::decode(ClientPacketType::ChatMessage as u8, &w.into_inner()),
            Err(DecodeError::LengthOutOfRange {
                len: 2000,
                min: MIN_TEXT_LENGTH,
                max: MAX_TEXT_LENGTH
            })
        );

        let empty = ClientPacket::ChatMessage {
            player_index: 0,
            text: String::new(),
        };
        assert!(ClientPacket::decode(ClientPacketType::ChatMessage as u8, &empty.encode()).is_err());

        let max = ClientPacket::ChatMessage {
            player_index: 1,
            text: "y".repeat(MAX_TEXT_LENGTH),
        };
        assert_eq!(reencode_client(&max), max);
    }

    #[test]
    fn test_truncated_control_packet() {
        let packet = ServerPacket::CreateRemoteActor {
            actor_id: 256,
            state_flags: 0,
            pos: Vector2f::new(1.0, 2.0),
            layer: 500,
            metadata_path: "Enemy/Bat".into(),
            animation: 7,
        };
        let mut payload = packet.encode();
        payload.truncate(payload.len() - 3);
        assert!(ServerPacket::decode(ServerPacketType::CreateRemoteActor as u8, &payload).is_err());
    }

    #[test]
    fn test_server_control_packets_survive_encoding() {
        let packets = vec![
            ServerPacket::LoadLevel {
                game_mode: GameMode::TeamRace,
                episode: "prince".into(),
                level: "01_castle1".into(),
            },
            ServerPacket::CreateMirroredActor {
                actor_id: 260,
                event_type: 44,
                params: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
                actor_flags: 0x20,
                tile_x: -3,
                tile_y: 40,
                layer: 1,
            },
            ServerPacket::AdvanceTileAnimation {
                tile_x: 12,
                tile_y: -1,
                amount: -2,
            },
            ServerPacket::SetTrigger {
                trigger_id: 200,
                state: true,
            },
            ServerPacket::PlayerAckWarped {
                player_index: 4,
                warp_seq: u64::MAX,
            },
        ];
        for packet in packets {
            assert_eq!(reencode_server(&packet), packet);
        }
    }

    #[test]
    fn test_take_damage_push_force_is_fixed_point() {
        let packet = ServerPacket::PlayerTakeDamage {
            player_index: 1,
            health: -1,
            push_force: 3.25,
        };
        match reencode_server(&packet) {
            ServerPacket::PlayerTakeDamage {
                health, push_force, ..
            } => {
                assert_eq!(health, -1);
                assert_approx_eq!(push_force, 3.25);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_player_state_packets_survive_encoding() {
        let packets = vec![
            ServerPacket::PlayerEmitWeaponFlare { player_index: 2 },
            ServerPacket::PlayerChangeWeapon {
                player_index: 2,
                weapon_type: 5,
            },
            ServerPacket::PlayerRefreshAmmo {
                player_index: 2,
                weapon_type: 1,
                ammo: 65_000,
            },
            ServerPacket::PlayerRefreshWeaponUpgrades {
                player_index: 3,
                weapon_type: 1,
                upgrades: 0x81,
            },
            ServerPacket::PlayerRefreshCoins {
                player_index: 200,
                count: -4,
            },
            ServerPacket::PlayerRefreshGems {
                player_index: 0,
                gem_type: 3,
                count: 120,
            },
            ServerPacket::PlayerActivateSpring {
                player_index: 7,
                pos: Vector2f::new(320.5, -16.0),
                force: Vector2f::new(0.0, -8.25),
                keep_speed_x: true,
                keep_speed_y: false,
            },
            ServerPacket::PlayerWarpIn {
                player_index: 7,
                exit_type: EXIT_TYPE_TEMPORARY_WARP,
            },
        ];
        for packet in packets {
            assert_eq!(reencode_server(&packet), packet);
            assert!(packet.target_player().is_some());
        }
    }

    #[test]
    fn test_spring_flags_byte() {
        let packet = ServerPacket::PlayerActivateSpring {
            player_index: 1,
            pos: Vector2f::ZERO,
            force: Vector2f::ZERO,
            keep_speed_x: false,
            keep_speed_y: true,
        };
        let payload = packet.encode();
        // index(1) + pos(8) + force(4), then flags
        assert_eq!(payload.len(), 14);
        assert_eq!(payload[13], SPRING_KEEP_SPEED_Y);
        assert_eq!(ServerPacket::ShowAlert { text: "x".into() }.target_player(), None);
    }

    #[test]
    fn test_game_mode_parsing() {
        assert_eq!("ctf".parse::<GameMode>(), Ok(GameMode::CaptureTheFlag));
        assert_eq!("Team-Battle".parse::<GameMode>(), Ok(GameMode::TeamBattle));
        assert!("soccer".parse::<GameMode>().is_err());
        assert!(GameMode::TeamRace.is_team_mode());
        assert!(!GameMode::Cooperation.is_team_mode());
        assert!(GameMode::try_from(7).is_err());
    }
}

//! # Replication Core
//!
//! Building blocks shared by the authoritative server and the clients of the
//! actor replication engine.
//!
//! ## Wire Protocol
//! - [`codec`]: varint, zig-zag and ×512 fixed-point primitives
//! - [`packets`]: byte-tagged control packets in both directions
//! - [`snapshot`]: the compressed per-tick actor batch
//!
//! ## Transport
//! - [`transport`]: peers, channels, disconnect reasons and the host/handler traits
//! - [`session`]: the background thread that services a host and exposes
//!   thread-safe unicast, filtered multicast and broadcast sends
//! - [`memory`] and [`udp`]: an in-process loopback host and a small
//!   reliable-UDP host
//!
//! ## Simulation Contract
//! - [`world`]: arena of actors addressed by stable handles
//! - [`interpolation`]: ring buffer of timestamped samples and render-time
//!   reconstruction for remotely driven actors
//! - [`input`]: double-buffered input bitmask of remote players
//! - [`tilemap`]: trigger and destructible-tile state synchronized on join

pub mod codec;
pub mod error;
pub mod input;
pub mod interpolation;
pub mod math;
pub mod memory;
pub mod packets;
pub mod session;
pub mod snapshot;
pub mod tilemap;
pub mod transport;
pub mod udp;
pub mod world;

pub use error::{DecodeError, Error, Result};
pub use math::Vector2f;

/// Network-visible actor identity.
pub type ActorId = u32;

/// Ids below this value are reserved for players.
pub const FIRST_ACTOR_ID: ActorId = 256;
pub const MAX_PLAYER_COUNT: u32 = FIRST_ACTOR_ID;

/// Sent as connect data; peers with a different value are refused.
pub const PROTOCOL_VERSION: u32 = 3;

pub const DEFAULT_PORT: u16 = 7438;

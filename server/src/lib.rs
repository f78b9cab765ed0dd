//! # Replication Server Library
//!
//! This library provides the authoritative side of the actor replication
//! engine. The server owns the canonical world, decides which actors exist,
//! and streams their state to every peer that finished loading the level.
//!
//! ## Core Responsibilities
//!
//! ### Peer Synchronization
//! Every connected peer walks through three states: connected, level loaded
//! and synchronized. Once a peer reports the level as loaded, the next
//! maintenance pass assigns it a player slot, spawns its player, sends the
//! tile map state and one create packet for every replicated actor.
//!
//! ### Actor Replication
//! Actors are replicated in one of two modes:
//! - **Mirrored** actors are recreated on each client from their spawn
//!   event and then simulated locally
//! - **Remoted** actors are created once and then follow the compressed
//!   per-tick snapshot
//!
//! ### Player Updates
//! Clients report their own player state over the unreliable channel. The
//! server keeps the newest report per peer, drops stale ones, and can veto
//! updates through a pluggable validator.
//!
//! ## Architecture Design
//!
//! ### Transport Thread and Game Thread
//! The transport runs on its own background thread and hands every event to
//! the game thread through a bounded channel. All world and registry state
//! lives on the game thread and is only touched from [`coordinator::ServerCoordinator::tick`].
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Server settings and their defaults.
//!
//! ### Coordinator Module (`coordinator`)
//! The per-tick replication driver and the gameplay-facing operations.
//!
//! ### Peer Registry Module (`peer_registry`)
//! Per-peer synchronization state, player binding and update timestamps.
//!
//! ### Replication Module (`replication`)
//! Network id allocation for actors and player slots.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::coordinator;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = coordinator::start(ServerConfig::default())?;
//!     loop {
//!         server.tick();
//!         std::thread::sleep(Duration::from_millis(33));
//!     }
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod peer_registry;
pub mod replication;

//! # Replication Client Library
//!
//! This library provides the client side of the actor replication engine.
//! A client connects to one authoritative server, controls a single local
//! player and displays every other actor the way the server describes it.
//!
//! ## Architecture Overview
//!
//! ### Local Player Authority
//! The client simulates its own player and reports position, speed and
//! input every tick. Reports carry a strictly increasing timestamp so the
//! server can discard stale ones. Teleports are flagged with a warp sequence
//! number and repeated until the server acknowledges them.
//!
//! ### Remote Actors
//! Every actor the server creates gets a local proxy. Remoted proxies keep a
//! short history of snapshot samples and are drawn slightly in the past,
//! interpolated between the two samples around the render time. Mirrored
//! proxies are spawned from their level event and simulated locally.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Endpoint list, player name, tick rate and render delay.
//!
//! ### Coordinator Module (`coordinator`)
//! The per-tick driver: outgoing reports, packet application and
//! interpolation.
//!
//! ### Inventory Module (`inventory`)
//! Weapon, ammo and collectible counters of the local player.
//!
//! ### Remote Module (`remote`)
//! Server actor id to local proxy mapping.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::config::ClientConfig;
//! use client::coordinator;
//! use std::time::{Duration, Instant};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig {
//!         server: "127.0.0.1:7438|[::1]:7438".to_string(),
//!         ..ClientConfig::default()
//!     };
//!     let mut client = coordinator::connect(config)?;
//!     let start = Instant::now();
//!     loop {
//!         client.tick(start.elapsed().as_millis() as i64);
//!         while let Some(event) = client.poll_event() {
//!             println!("{:?}", event);
//!         }
//!         std::thread::sleep(Duration::from_millis(16));
//!     }
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod inventory;
pub mod remote;

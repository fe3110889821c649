//! Room Registry Service Library
//!
//! Authoritative server-side state for an SFU signaling service:
//!
//! - Maps room keys to live rooms, creating each room's routing context once
//! - Tracks participants with their transports, producers and consumers
//! - Keeps the per-room publication list new subscribers are bootstrapped from
//! - Fans join, leave and publish events out to room members
//! - Tears media down in cascade when transports are superseded or members leave
//!
//! # Architecture
//!
//! ```text
//! RegistryActor (singleton per process)
//! ├── supervises N RoomActors
//! │   └── RoomActor (one per live room)
//! └── spawns N ConnectionActors
//!     └── ConnectionActor (one per WebSocket signaling link)
//! ```
//!
//! The media engine sits behind the [`media::MediaEngine`] trait; the
//! bundled [`media::loopback`] engine performs all bookkeeping without
//! forwarding RTP.
//!
//! # Modules
//!
//! - [`actors`] - Actor model implementation
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types mapped onto wire error kinds
//! - [`media`] - Media engine seam and loopback engine
//! - [`network`] - Announced address resolution
//! - [`observability`] - Metrics and health endpoints
//! - [`signaling`] - WebSocket signaling endpoint

pub mod actors;
pub mod config;
pub mod errors;
pub mod media;
pub mod network;
pub mod observability;
pub mod signaling;

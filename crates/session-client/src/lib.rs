//! Relay Session Client
//!
//! Client half of the relay's signaling layer. A session joins one room
//! through the room registry and brings up:
//!
//! - A send transport carrying the participant's local tracks
//! - A receive transport consuming every other participant's tracks
//!
//! Spectators only bring up the receive side.
//!
//! # Architecture
//!
//! ```text
//! SessionHandle ──► SessionActor ──► ClientLink ──► room registry
//!                    ├── RecoveryController (per-role retry timers)
//!                    ├── PendingTracks (tracks announced before receive is ready)
//!                    └── MediaDevice / ClientTransport (media seam)
//! ```
//!
//! # Modules
//!
//! - [`config`] - Client configuration from environment
//! - [`errors`] - Session, device, capture and link errors
//! - [`link`] - WebSocket signaling link
//! - [`media`] - Client media seams and the loopback device
//! - [`negotiator`] - Session actor and handle
//! - [`pending`] - Pending remote-track queue
//! - [`recovery`] - Transport failure recovery

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod link;
pub mod media;
pub mod negotiator;
pub mod pending;
pub mod recovery;

pub use config::ClientConfig;
pub use errors::SessionError;
pub use negotiator::{
    JoinMode, SessionActor, SessionEvent, SessionHandle, SessionSettings, SessionSnapshot,
    SessionState,
};

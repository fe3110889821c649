//! Actor model implementation for the Room Registry.
//!
//! ```text
//! RegistryActor (singleton per process)
//! ├── supervises N RoomActors
//! │   └── RoomActor (one per live room)
//! │       ├── owns the routing context
//! │       └── owns participants, transports, producers, consumers
//! └── spawns N ConnectionActors
//!     └── ConnectionActor (one per signaling link)
//! ```
//!
//! # Key Design Decisions
//!
//! - **One actor per room**: all mutations of a room are serialized through its mailbox
//! - **Connections are not room children**: one link may join several rooms
//! - **CancellationToken propagation**: the registry token is the root of every actor token
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 100/500, Connection: 50/200)
//!
//! # Modules
//!
//! - [`registry`] - `RegistryActor` singleton that supervises rooms
//! - [`room`] - `RoomActor` per live room
//! - [`connection`] - `ConnectionActor` per signaling link
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod room;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use registry::{RegistryActor, RegistryActorHandle, RegistrySettings};
pub use room::{RoomActor, RoomActorHandle, RoomSettings};

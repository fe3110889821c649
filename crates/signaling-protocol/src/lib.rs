//! Signaling contracts for the relay.
//!
//! Defines the event vocabulary exchanged between a session client and the
//! room registry, the JSON text-frame codec, and an in-memory link pair that
//! both sides use when they share a process.
//!
//! Media-engine payloads (capabilities, RTP parameters, DTLS parameters)
//! are carried as opaque JSON so that neither side depends on a specific
//! engine's type definitions.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod error;
pub mod link;
pub mod messages;
pub mod types;

pub use error::{ErrorKind, WireError};
pub use messages::{AckBody, AckResult, ClientEnvelope, ClientEvent, ServerEvent, ServerMessage};
pub use types::{
    ConsumerDescriptor, IceTransportPolicy, MediaCapabilities, MediaKind, MediaParams,
    NegotiationParams, PublicationInfo, SecurityParams, TransportDescriptor, TransportRole,
};

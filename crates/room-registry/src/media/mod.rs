//! Media engine seam.
//!
//! The registry never touches RTP. It drives an external engine through
//! these traits: one routing context per room, transports created inside a
//! routing context, producers and consumers created on transports. The
//! engine owns the actual media objects; the registry owns their lifecycle
//! and the fan-out of changes to room members.
//!
//! [`loopback::LoopbackEngine`] is a signaling-only implementation used by
//! the default binary and by tests.

pub mod loopback;

use common::types::{ConsumerId, ProducerId, TransportId};
use signaling_protocol::{
    MediaCapabilities, MediaKind, MediaParams, NegotiationParams, SecurityParams, TransportRole,
};
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::watch;

/// Errors reported by a media engine.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Engine has not finished initializing.
    #[error("Media engine not ready")]
    NotReady,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Produce failed: {0}")]
    Produce(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    /// Object was already closed.
    #[error("Media object closed")]
    Closed,

    #[error("Engine failure: {0}")]
    Engine(String),
}

/// Network options for a new transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkOptions {
    /// Local address the engine binds to.
    pub listen_ip: IpAddr,
    /// Externally reachable address placed in ICE candidates.
    pub announced_ip: IpAddr,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl NetworkOptions {
    /// Options for a transport; `force_tcp` disables UDP entirely.
    #[must_use]
    pub fn new(listen_ip: IpAddr, announced_ip: IpAddr, force_tcp: bool) -> Self {
        Self {
            listen_ip,
            announced_ip,
            enable_udp: !force_tcp,
            enable_tcp: true,
            prefer_udp: !force_tcp,
        }
    }
}

/// Process-wide media engine.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    /// Whether the engine finished initializing its workers.
    fn is_ready(&self) -> bool;

    /// Create the routing context for a new room.
    async fn create_routing_context(&self) -> Result<Box<dyn RoutingContext>, MediaError>;
}

/// Per-room forwarding context.
#[async_trait::async_trait]
pub trait RoutingContext: Send + Sync {
    fn id(&self) -> &str;

    /// Capability descriptor handed to joining clients.
    fn capabilities(&self) -> MediaCapabilities;

    /// Whether a client with `capabilities` can decode `producer_id`.
    fn can_consume(&self, producer_id: &ProducerId, capabilities: &MediaCapabilities) -> bool;

    async fn create_transport(
        &self,
        role: TransportRole,
        options: &NetworkOptions,
    ) -> Result<Box<dyn MediaTransport>, MediaError>;

    /// Release the context and everything created inside it.
    fn close(&self);
}

/// One ICE/DTLS path between a participant and the engine.
#[async_trait::async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn negotiation_params(&self) -> NegotiationParams;

    /// Apply the client's DTLS parameters.
    async fn connect(&self, security: &SecurityParams) -> Result<(), MediaError>;

    async fn produce(
        &self,
        kind: MediaKind,
        params: &MediaParams,
    ) -> Result<Box<dyn MediaProducer>, MediaError>;

    /// Create a paused consumer for `producer_id`.
    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &MediaCapabilities,
    ) -> Result<Box<dyn MediaConsumer>, MediaError>;

    /// Flips to `true` once the transport is closed.
    ///
    /// The engine may close a transport on its own (DTLS closed, ICE gave
    /// up); the room watches this to run the same teardown cascade as an
    /// explicit close.
    fn closed(&self) -> watch::Receiver<bool>;

    fn close(&self);
}

pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn close(&self);
}

#[async_trait::async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn media_params(&self) -> MediaParams;
    fn is_paused(&self) -> bool;
    async fn resume(&self) -> Result<(), MediaError>;
    fn close(&self);
}

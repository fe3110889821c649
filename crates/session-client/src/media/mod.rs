//! Client media seams.
//!
//! The session negotiator drives three collaborators it does not implement:
//!
//! - [`LocalMedia`] captures local tracks (camera and microphone)
//! - [`MediaDevice`] is the local device model, loaded from the router's
//!   capabilities and used to build client-side transports
//! - [`ClientTransport`] is one client-side ICE/DTLS path
//!
//! `loopback` implements all three without touching real devices.

pub mod loopback;

use crate::config::IceServer;
use crate::errors::{DeviceError, MediaAcquisitionError};

use common::types::{ConsumerId, ParticipantId, ProducerId, TransportId};
use serde_json::{json, Value};
use signaling_protocol::{
    ConsumerDescriptor, IceTransportPolicy, MediaCapabilities, MediaKind, MediaParams,
    SecurityParams, TransportDescriptor, TransportRole,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Connection state of a client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured local track.
///
/// Clones share the enabled and live flags, so toggling through any clone
/// mutes every holder without touching producers.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the capture device. Irreversible.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// A remote track delivered by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub owner: ParticipantId,
    pub kind: MediaKind,
}

/// Encoding settings applied when publishing a track.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishPreset {
    /// One simulcast layer per entry; empty publishes a single layer.
    pub max_bitrates: Vec<u32>,
    pub codec_options: Value,
}

impl PublishPreset {
    /// Stereo DTX opus for audio; three simulcast layers for video.
    #[must_use]
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self {
                max_bitrates: Vec::new(),
                codec_options: json!({"opusStereo": true, "opusDtx": true}),
            },
            MediaKind::Video => Self {
                max_bitrates: vec![100_000, 300_000, 900_000],
                codec_options: json!({"videoGoogleStartBitrate": 1000}),
            },
        }
    }
}

/// Network policy for a locally created transport.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
}

/// Local capture of camera and microphone.
#[async_trait::async_trait]
pub trait LocalMedia: Send + Sync {
    /// Capture one track per available kind.
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MediaAcquisitionError>;
}

/// Local device model.
#[async_trait::async_trait]
pub trait MediaDevice: Send + Sync {
    /// Load the router's capabilities.
    ///
    /// Returns the receive capabilities this device presents when consuming.
    async fn load(&self, router: &MediaCapabilities) -> Result<MediaCapabilities, DeviceError>;

    /// Build the client side of a transport the registry created.
    fn create_transport(
        &self,
        descriptor: &TransportDescriptor,
        policy: &TransportPolicy,
    ) -> Result<Arc<dyn ClientTransport>, DeviceError>;
}

/// Client side of one transport.
#[async_trait::async_trait]
pub trait ClientTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn role(&self) -> TransportRole;

    /// DTLS parameters to hand to the registry's connect step.
    fn security_params(&self) -> SecurityParams;

    /// Called once the registry acknowledged the connect step.
    fn handshake_complete(&self);

    /// Connection-state stream.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// RTP parameters for publishing `track` with `preset`.
    fn producer_params(
        &self,
        track: &LocalTrack,
        preset: &PublishPreset,
    ) -> Result<MediaParams, DeviceError>;

    /// Bind a registry consumer to this transport.
    ///
    /// `Ok(None)` means the consumer produced no media track.
    async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
        owner: &ParticipantId,
    ) -> Result<Option<RemoteTrack>, DeviceError>;

    fn close_consumer(&self, consumer_id: &ConsumerId);

    fn close_producer(&self, producer_id: &ProducerId);

    fn close(&self);
}

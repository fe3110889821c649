//! Loopback capture and device.
//!
//! Produces synthetic local tracks and a device model that negotiates
//! codecs against the router's capabilities without any real media. The
//! relay peer binary runs on it, and tests use its hooks to drive transport
//! connection states.

use super::{
    ClientTransport, ConnectionState, LocalMedia, LocalTrack, MediaDevice, PublishPreset,
    RemoteTrack, TransportPolicy,
};
use crate::errors::{DeviceError, MediaAcquisitionError};

use common::types::{ConsumerId, ParticipantId, ProducerId, TransportId};
use serde_json::{json, Value};
use signaling_protocol::{
    ConsumerDescriptor, IceTransportPolicy, MediaCapabilities, MediaKind, MediaParams,
    SecurityParams, TransportDescriptor, TransportRole,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// Codecs the loopback device can encode and decode.
const SUPPORTED_MIME_TYPES: [&str; 2] = ["audio/opus", "video/vp8"];

/// Synthetic camera and microphone.
#[derive(Debug, Clone)]
pub struct LoopbackMedia {
    kinds: Vec<MediaKind>,
    failure: Option<MediaAcquisitionError>,
}

impl LoopbackMedia {
    /// Capture one audio and one video track.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kinds: vec![MediaKind::Audio, MediaKind::Video],
            failure: None,
        }
    }

    /// Capture only the given kinds.
    #[must_use]
    pub fn with_kinds(kinds: &[MediaKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            failure: None,
        }
    }

    /// Fail every capture with `error`.
    #[must_use]
    pub fn failing(error: MediaAcquisitionError) -> Self {
        Self {
            kinds: Vec::new(),
            failure: Some(error),
        }
    }
}

impl Default for LoopbackMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LocalMedia for LoopbackMedia {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, MediaAcquisitionError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        if self.kinds.is_empty() {
            return Err(MediaAcquisitionError::DeviceNotFound);
        }

        Ok(self
            .kinds
            .iter()
            .map(|kind| {
                LocalTrack::new(
                    format!("loopback-{kind}-{}", Uuid::new_v4().simple()),
                    *kind,
                )
            })
            .collect())
    }
}

/// Loopback device model.
///
/// Every transport it creates is kept so tests can reach it through
/// [`LoopbackDevice::transports`].
#[derive(Default)]
pub struct LoopbackDevice {
    reject_capabilities: bool,
    drop_tracks: bool,
    hold_connection: bool,
    router: Mutex<Option<MediaCapabilities>>,
    transports: Mutex<Vec<Arc<LoopbackClientTransport>>>,
}

impl LoopbackDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to load any router capabilities.
    #[must_use]
    pub fn rejecting_capabilities(mut self) -> Self {
        self.reject_capabilities = true;
        self
    }

    /// Consumers come back without a media track.
    #[must_use]
    pub fn dropping_tracks(mut self) -> Self {
        self.drop_tracks = true;
        self
    }

    /// Transports stay `connecting` after the handshake until a test
    /// moves them on.
    #[must_use]
    pub fn holding_connection(mut self) -> Self {
        self.hold_connection = true;
        self
    }

    /// Every transport created so far, oldest first.
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<LoopbackClientTransport>> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Most recent transport with `role`.
    #[must_use]
    pub fn latest_transport(&self, role: TransportRole) -> Option<Arc<LoopbackClientTransport>> {
        self.transports()
            .into_iter()
            .rev()
            .find(|t| t.role == role)
    }

    fn router_codec(&self, kind: MediaKind) -> Option<Value> {
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        router
            .as_value()
            .get("codecs")
            .and_then(Value::as_array)?
            .iter()
            .find(|c| c.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl MediaDevice for LoopbackDevice {
    async fn load(&self, router: &MediaCapabilities) -> Result<MediaCapabilities, DeviceError> {
        if self.reject_capabilities {
            return Err(DeviceError::UnsupportedCapabilities(
                "device refused router capabilities".to_string(),
            ));
        }

        let codecs: Vec<Value> = router
            .as_value()
            .get("codecs")
            .and_then(Value::as_array)
            .map(|codecs| {
                codecs
                    .iter()
                    .filter(|c| {
                        c.get("mimeType")
                            .and_then(Value::as_str)
                            .is_some_and(|m| {
                                SUPPORTED_MIME_TYPES.contains(&m.to_ascii_lowercase().as_str())
                            })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if codecs.is_empty() {
            return Err(DeviceError::UnsupportedCapabilities(
                "no codec in common with the router".to_string(),
            ));
        }

        *self.router.lock().unwrap_or_else(PoisonError::into_inner) = Some(router.clone());

        Ok(MediaCapabilities(json!({
            "codecs": codecs,
            "headerExtensions": []
        })))
    }

    fn create_transport(
        &self,
        descriptor: &TransportDescriptor,
        policy: &TransportPolicy,
    ) -> Result<Arc<dyn ClientTransport>, DeviceError> {
        if self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(DeviceError::NotLoaded);
        }

        let transport = Arc::new(LoopbackClientTransport::new(
            descriptor,
            policy.ice_transport_policy,
            self.drop_tracks,
            self.hold_connection,
            self.router_codec(MediaKind::Audio),
            self.router_codec(MediaKind::Video),
        ));
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&transport));

        debug!(
            target: "session.media",
            transport_id = %transport.id,
            role = %transport.role,
            policy = ?policy.ice_transport_policy,
            ice_servers = policy.ice_servers.len(),
            "Loopback client transport created"
        );

        Ok(transport)
    }
}

/// Client side of a loopback transport.
pub struct LoopbackClientTransport {
    id: TransportId,
    role: TransportRole,
    ice_transport_policy: IceTransportPolicy,
    drop_tracks: bool,
    hold_connection: bool,
    audio_codec: Option<Value>,
    video_codec: Option<Value>,
    next_ssrc: AtomicU32,
    state: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    consumers: Mutex<HashSet<ConsumerId>>,
    producers: Mutex<HashSet<ProducerId>>,
}

impl LoopbackClientTransport {
    fn new(
        descriptor: &TransportDescriptor,
        ice_transport_policy: IceTransportPolicy,
        drop_tracks: bool,
        hold_connection: bool,
        audio_codec: Option<Value>,
        video_codec: Option<Value>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            id: descriptor.id.clone(),
            role: descriptor.role,
            ice_transport_policy,
            drop_tracks,
            hold_connection,
            audio_codec,
            video_codec,
            next_ssrc: AtomicU32::new(1000),
            state,
            closed: AtomicBool::new(false),
            consumers: Mutex::new(HashSet::new()),
            producers: Mutex::new(HashSet::new()),
        }
    }

    /// ICE policy the transport was created with.
    #[must_use]
    pub fn ice_transport_policy(&self) -> IceTransportPolicy {
        self.ice_transport_policy
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Force a connection-state transition.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Simulate an ICE failure.
    pub fn fail(&self) {
        self.set_state(ConnectionState::Failed);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Consumers currently bound to this transport.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Transport("transport closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClientTransport for LoopbackClientTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn role(&self) -> TransportRole {
        self.role
    }

    fn security_params(&self) -> SecurityParams {
        SecurityParams(json!({
            "role": "client",
            "fingerprints": [
                {"algorithm": "sha-256", "value": Uuid::new_v4().simple().to_string()}
            ]
        }))
    }

    fn handshake_complete(&self) {
        if self.is_closed() {
            return;
        }
        self.set_state(ConnectionState::Connecting);
        if !self.hold_connection {
            self.set_state(ConnectionState::Connected);
        }
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn producer_params(
        &self,
        track: &LocalTrack,
        preset: &PublishPreset,
    ) -> Result<MediaParams, DeviceError> {
        self.ensure_open()?;
        if self.role != TransportRole::Send {
            return Err(DeviceError::Transport(
                "cannot publish on a receive transport".to_string(),
            ));
        }

        let codec = match track.kind() {
            MediaKind::Audio => self.audio_codec.clone(),
            MediaKind::Video => self.video_codec.clone(),
        }
        .ok_or_else(|| {
            DeviceError::UnsupportedCapabilities(format!("router has no {} codec", track.kind()))
        })?;

        let encodings: Vec<Value> = if preset.max_bitrates.is_empty() {
            vec![json!({"ssrc": self.next_ssrc.fetch_add(1, Ordering::Relaxed)})]
        } else {
            preset
                .max_bitrates
                .iter()
                .enumerate()
                .map(|(layer, bitrate)| json!({"rid": format!("r{layer}"), "maxBitrate": bitrate}))
                .collect()
        };

        Ok(MediaParams(json!({
            "codecs": [codec],
            "encodings": encodings,
            "codecOptions": preset.codec_options,
            "mid": track.id()
        })))
    }

    async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
        owner: &ParticipantId,
    ) -> Result<Option<RemoteTrack>, DeviceError> {
        self.ensure_open()?;
        if self.drop_tracks {
            return Ok(None);
        }

        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(descriptor.id.clone());

        Ok(Some(RemoteTrack {
            consumer_id: descriptor.id.clone(),
            producer_id: descriptor.producer_id.clone(),
            owner: owner.clone(),
            kind: descriptor.kind,
        }))
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(consumer_id);
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(producer_id);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_state(ConnectionState::Closed);
    }
}

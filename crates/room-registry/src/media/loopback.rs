//! Signaling-only media engine.
//!
//! Implements the full object lifecycle (routing contexts, transports,
//! producers, consumers) and codec negotiation without moving any RTP.
//! The advertised codec set is Opus 48 kHz stereo and VP8 90 kHz.

use super::{
    MediaConsumer, MediaEngine, MediaError, MediaProducer, MediaTransport, NetworkOptions,
    RoutingContext,
};
use common::types::{ConsumerId, ProducerId, TransportId};
use serde_json::{json, Value};
use signaling_protocol::{
    MediaCapabilities, MediaKind, MediaParams, NegotiationParams, SecurityParams, TransportRole,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

pub const OPUS_MIME_TYPE: &str = "audio/opus";
pub const VP8_MIME_TYPE: &str = "video/VP8";

/// Router capability descriptor advertised to joining clients.
#[must_use]
pub fn router_capabilities() -> MediaCapabilities {
    MediaCapabilities(json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": OPUS_MIME_TYPE,
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": VP8_MIME_TYPE,
                "preferredPayloadType": 101,
                "clockRate": 90000,
                "parameters": {}
            }
        ],
        "headerExtensions": []
    }))
}

/// Port range used for ICE candidates.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

/// Round-robin candidate port allocator.
#[derive(Debug)]
struct PortAllocator {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortAllocator {
    fn new(config: LoopbackConfig) -> Self {
        let min = config.rtc_min_port.min(config.rtc_max_port);
        let max = config.rtc_min_port.max(config.rtc_max_port);
        Self {
            min,
            span: u32::from(max - min) + 1,
            next: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span;
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.min)
    }
}

/// Close signals of every open transport, so the engine can close one on
/// its own.
#[derive(Default)]
struct TransportDirectory {
    open: Mutex<HashMap<TransportId, Arc<watch::Sender<bool>>>>,
}

impl TransportDirectory {
    fn insert(&self, transport_id: TransportId, closed: Arc<watch::Sender<bool>>) {
        self.open
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(transport_id, closed);
    }

    fn remove(&self, transport_id: &TransportId) -> Option<Arc<watch::Sender<bool>>> {
        self.open
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(transport_id)
    }
}

pub struct LoopbackEngine {
    ports: Arc<PortAllocator>,
    transports: Arc<TransportDirectory>,
    contexts_created: AtomicUsize,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            ports: Arc::new(PortAllocator::new(config)),
            transports: Arc::new(TransportDirectory::default()),
            contexts_created: AtomicUsize::new(0),
        }
    }

    /// Close a transport from the engine side, as a DTLS close would.
    ///
    /// Returns `false` if the transport is unknown or already closed.
    pub fn force_close(&self, transport_id: &TransportId) -> bool {
        let Some(closed) = self.transports.remove(transport_id) else {
            return false;
        };
        debug!(
            target: "rr.media",
            transport_id = %transport_id,
            "Loopback transport closed by the engine"
        );
        closed.send_replace(true);
        true
    }

    /// Number of routing contexts created so far.
    #[must_use]
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

#[async_trait::async_trait]
impl MediaEngine for LoopbackEngine {
    fn is_ready(&self) -> bool {
        true
    }

    async fn create_routing_context(&self) -> Result<Box<dyn RoutingContext>, MediaError> {
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackRoutingContext::new(
            Arc::clone(&self.ports),
            Arc::clone(&self.transports),
        )))
    }
}

/// Producer registry shared by a routing context and its transports.
#[derive(Default)]
struct ContextShared {
    producers: Mutex<HashMap<ProducerId, String>>,
    closed: AtomicBool,
}

impl ContextShared {
    fn producer_mime(&self, producer_id: &ProducerId) -> Option<String> {
        self.producers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(producer_id)
            .cloned()
    }

    fn register(&self, producer_id: ProducerId, mime: String) {
        self.producers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(producer_id, mime);
    }

    fn unregister(&self, producer_id: &ProducerId) {
        self.producers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(producer_id);
    }
}

pub struct LoopbackRoutingContext {
    id: String,
    shared: Arc<ContextShared>,
    ports: Arc<PortAllocator>,
    transports: Arc<TransportDirectory>,
}

impl LoopbackRoutingContext {
    fn new(ports: Arc<PortAllocator>, transports: Arc<TransportDirectory>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            shared: Arc::new(ContextShared::default()),
            ports,
            transports,
        }
    }
}

#[async_trait::async_trait]
impl RoutingContext for LoopbackRoutingContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> MediaCapabilities {
        router_capabilities()
    }

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &MediaCapabilities) -> bool {
        match self.shared.producer_mime(producer_id) {
            Some(mime) => capabilities.codec_mime_types().contains(&mime),
            None => false,
        }
    }

    async fn create_transport(
        &self,
        role: TransportRole,
        options: &NetworkOptions,
    ) -> Result<Box<dyn MediaTransport>, MediaError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }

        let port = self.ports.allocate();
        let transport = LoopbackTransport::new(
            role,
            options,
            port,
            Arc::clone(&self.shared),
            Arc::clone(&self.transports),
        );

        debug!(
            target: "rr.media",
            routing_context = %self.id,
            transport_id = %transport.id,
            role = %role,
            port,
            "Loopback transport created"
        );

        Ok(Box::new(transport))
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared
            .producers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

fn ice_candidates(options: &NetworkOptions, port: u16) -> Vec<Value> {
    let mut candidates = Vec::new();
    if options.enable_udp {
        candidates.push(json!({
            "foundation": "udpcandidate",
            "ip": options.announced_ip.to_string(),
            "port": port,
            "priority": 1_076_302_079_u32,
            "protocol": "udp",
            "type": "host"
        }));
    }
    if options.enable_tcp {
        candidates.push(json!({
            "foundation": "tcpcandidate",
            "ip": options.announced_ip.to_string(),
            "port": port,
            "priority": 1_076_276_479_u32,
            "protocol": "tcp",
            "tcpType": "passive",
            "type": "host"
        }));
    }
    candidates
}

pub struct LoopbackTransport {
    id: TransportId,
    role: TransportRole,
    params: NegotiationParams,
    shared: Arc<ContextShared>,
    directory: Arc<TransportDirectory>,
    connected: AtomicBool,
    closed: Arc<watch::Sender<bool>>,
}

impl LoopbackTransport {
    fn new(
        role: TransportRole,
        options: &NetworkOptions,
        port: u16,
        shared: Arc<ContextShared>,
        directory: Arc<TransportDirectory>,
    ) -> Self {
        let params = NegotiationParams(json!({
            "iceParameters": {
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            },
            "iceCandidates": ice_candidates(options, port),
            "dtlsParameters": {
                "role": "auto",
                "fingerprints": [
                    {"algorithm": "sha-256", "value": Uuid::new_v4().simple().to_string()}
                ]
            }
        }));

        let id = TransportId::generate();
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        directory.insert(id.clone(), Arc::clone(&closed));

        Self {
            id,
            role,
            params,
            shared,
            directory,
            connected: AtomicBool::new(false),
            closed,
        }
    }

    fn ensure_open(&self) -> Result<(), MediaError> {
        if *self.closed.borrow() || self.shared.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        Ok(())
    }

    /// Whether the DTLS handshake parameters were applied.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn negotiation_params(&self) -> NegotiationParams {
        self.params.clone()
    }

    async fn connect(&self, security: &SecurityParams) -> Result<(), MediaError> {
        self.ensure_open()?;

        let has_fingerprint = security
            .as_value()
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|f| !f.is_empty());
        if !has_fingerprint {
            return Err(MediaError::Transport(
                "DTLS parameters carry no fingerprints".to_string(),
            ));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        params: &MediaParams,
    ) -> Result<Box<dyn MediaProducer>, MediaError> {
        self.ensure_open()?;
        if self.role != TransportRole::Send {
            return Err(MediaError::Produce(
                "transport is not a send transport".to_string(),
            ));
        }

        let mime = params
            .codec_mime_types()
            .into_iter()
            .next()
            .ok_or_else(|| MediaError::Produce("RTP parameters carry no codecs".to_string()))?;
        if !mime.starts_with(&format!("{}/", kind.as_str())) {
            return Err(MediaError::Produce(format!(
                "codec {mime} does not match kind {kind}"
            )));
        }
        if !router_capabilities().codec_mime_types().contains(&mime) {
            return Err(MediaError::Produce(format!("unsupported codec {mime}")));
        }

        let id = ProducerId::generate();
        self.shared.register(id.clone(), mime);

        Ok(Box::new(LoopbackProducer {
            id,
            kind,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _capabilities: &MediaCapabilities,
    ) -> Result<Box<dyn MediaConsumer>, MediaError> {
        self.ensure_open()?;
        if self.role != TransportRole::Recv {
            return Err(MediaError::Consume(
                "transport is not a receive transport".to_string(),
            ));
        }

        let mime = self
            .shared
            .producer_mime(producer_id)
            .ok_or_else(|| MediaError::Consume(format!("unknown producer {producer_id}")))?;
        let kind = if mime.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Video
        };
        let ssrc = u32::try_from(Uuid::new_v4().as_u128() & 0xFFFF_FFFF).unwrap_or(1);

        Ok(Box::new(LoopbackConsumer {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            kind,
            params: MediaParams(json!({
                "codecs": [{"mimeType": mime}],
                "encodings": [{"ssrc": ssrc}]
            })),
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn close(&self) {
        self.directory.remove(&self.id);
        self.closed.send_replace(true);
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    shared: Arc<ContextShared>,
}

impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.shared.unregister(&self.id);
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    params: MediaParams,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn media_params(&self) -> MediaParams {
        self.params.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::Closed);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

//! Mock media engine for registry testing.
//!
//! Wraps the loopback engine and adds switchable readiness, injected
//! failures and counters for every routing context and transport the
//! registry creates or releases.
//!
//! # Example
//!
//! ```rust,ignore
//! use registry_test_utils::MockMediaEngine;
//!
//! let engine = MockMediaEngine::builder()
//!     .not_ready()
//!     .build();
//!
//! // Registry rejects joins with serverNotReady until:
//! engine.set_ready(true);
//!
//! // Simulate the engine dropping a transport (DTLS closed):
//! engine.force_close(&transport_id);
//! ```

use common::types::{ProducerId, TransportId};
use room_registry::media::loopback::LoopbackEngine;
use room_registry::media::{
    MediaConsumer, MediaEngine, MediaError, MediaProducer, MediaTransport, NetworkOptions,
    RoutingContext,
};
use signaling_protocol::{
    MediaCapabilities, MediaKind, MediaParams, NegotiationParams, SecurityParams, TransportRole,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Counters shared by a mock engine and everything it creates.
#[derive(Debug, Default)]
pub struct MockEngineStats {
    pub contexts_created: AtomicUsize,
    pub contexts_closed: AtomicUsize,
    pub transports_created: AtomicUsize,
    pub transports_closed: AtomicUsize,
    /// Options passed to every transport creation, in order.
    pub transport_options: Mutex<Vec<NetworkOptions>>,
}

/// Mock media engine.
pub struct MockMediaEngine {
    inner: LoopbackEngine,
    ready: AtomicBool,
    reject_consume: bool,
    fail_transports: bool,
    stats: Arc<MockEngineStats>,
}

impl MockMediaEngine {
    /// Create a new `MockMediaEngine` builder.
    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    #[must_use]
    pub fn stats(&self) -> &MockEngineStats {
        &self.stats
    }

    #[must_use]
    pub fn contexts_created(&self) -> usize {
        self.stats.contexts_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn contexts_closed(&self) -> usize {
        self.stats.contexts_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transports_created(&self) -> usize {
        self.stats.transports_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transports_closed(&self) -> usize {
        self.stats.transports_closed.load(Ordering::SeqCst)
    }

    /// Close a transport from the engine side, as a DTLS close would.
    pub fn force_close(&self, transport_id: &TransportId) -> bool {
        self.inner.force_close(transport_id)
    }

    /// Transport options seen so far.
    #[must_use]
    pub fn transport_options(&self) -> Vec<NetworkOptions> {
        self.stats.transport_options.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockMediaEngine {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn create_routing_context(&self) -> Result<Box<dyn RoutingContext>, MediaError> {
        if !self.is_ready() {
            return Err(MediaError::NotReady);
        }
        let inner = self.inner.create_routing_context().await?;
        self.stats.contexts_created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockRoutingContext {
            inner,
            reject_consume: self.reject_consume,
            fail_transports: self.fail_transports,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Builder for `MockMediaEngine` configuration.
#[derive(Debug)]
pub struct MockMediaEngineBuilder {
    ready: bool,
    reject_consume: bool,
    fail_transports: bool,
}

impl Default for MockMediaEngineBuilder {
    fn default() -> Self {
        Self {
            ready: true,
            reject_consume: false,
            fail_transports: false,
        }
    }
}

impl MockMediaEngineBuilder {
    /// Start with an engine that has not finished initializing.
    #[must_use]
    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Report every consumer as incompatible with every producer.
    #[must_use]
    pub fn reject_consume(mut self) -> Self {
        self.reject_consume = true;
        self
    }

    /// Fail every transport creation with a transport error.
    #[must_use]
    pub fn fail_transports(mut self) -> Self {
        self.fail_transports = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<MockMediaEngine> {
        Arc::new(MockMediaEngine {
            inner: LoopbackEngine::default(),
            ready: AtomicBool::new(self.ready),
            reject_consume: self.reject_consume,
            fail_transports: self.fail_transports,
            stats: Arc::new(MockEngineStats::default()),
        })
    }
}

struct MockRoutingContext {
    inner: Box<dyn RoutingContext>,
    reject_consume: bool,
    fail_transports: bool,
    stats: Arc<MockEngineStats>,
}

#[async_trait::async_trait]
impl RoutingContext for MockRoutingContext {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn capabilities(&self) -> MediaCapabilities {
        self.inner.capabilities()
    }

    fn can_consume(&self, producer_id: &ProducerId, capabilities: &MediaCapabilities) -> bool {
        !self.reject_consume && self.inner.can_consume(producer_id, capabilities)
    }

    async fn create_transport(
        &self,
        role: TransportRole,
        options: &NetworkOptions,
    ) -> Result<Box<dyn MediaTransport>, MediaError> {
        self.stats
            .transport_options
            .lock()
            .unwrap()
            .push(options.clone());

        if self.fail_transports {
            return Err(MediaError::Transport("injected failure".to_string()));
        }

        let inner = self.inner.create_transport(role, options).await?;
        self.stats.transports_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            inner,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn close(&self) {
        self.stats.contexts_closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }
}

struct MockTransport {
    inner: Box<dyn MediaTransport>,
    stats: Arc<MockEngineStats>,
}

#[async_trait::async_trait]
impl MediaTransport for MockTransport {
    fn id(&self) -> &TransportId {
        self.inner.id()
    }

    fn negotiation_params(&self) -> NegotiationParams {
        self.inner.negotiation_params()
    }

    async fn connect(&self, security: &SecurityParams) -> Result<(), MediaError> {
        self.inner.connect(security).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        params: &MediaParams,
    ) -> Result<Box<dyn MediaProducer>, MediaError> {
        self.inner.produce(kind, params).await
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &MediaCapabilities,
    ) -> Result<Box<dyn MediaConsumer>, MediaError> {
        self.inner.consume(producer_id, capabilities).await
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.inner.closed()
    }

    fn close(&self) {
        self.stats.transports_closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }
}

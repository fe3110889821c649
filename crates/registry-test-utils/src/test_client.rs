//! Raw signaling client for registry tests.
//!
//! Drives a registry connection over an in-memory link. Requests are sent
//! with fresh request ids and resolved by their ack; every event that
//! arrives meanwhile is buffered so tests can assert on it afterwards.

use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use room_registry::actors::{
    ActorMetrics, ConnectionActorHandle, RegistryActorHandle, RegistrySettings,
};
use room_registry::media::MediaEngine;
use room_registry::network::AddressResolver;
use signaling_protocol::link::{link_pair, ClientLink};
use signaling_protocol::{
    AckBody, ClientEnvelope, ClientEvent, ConsumerDescriptor, MediaCapabilities, MediaKind,
    PublicationInfo, ServerEvent, ServerMessage, TransportDescriptor, TransportRole, WireError,
};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::fixtures::{client_capabilities, dtls_params, media_params};

/// How long to wait for a frame before failing the test.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Address announced by registries spawned with [`spawn_registry`].
pub const TEST_ANNOUNCED_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

/// Spawn a registry on `engine` with default settings.
#[must_use]
pub fn spawn_registry(engine: Arc<dyn MediaEngine>) -> RegistryActorHandle {
    spawn_registry_with(engine, RegistrySettings::default())
}

#[must_use]
pub fn spawn_registry_with(
    engine: Arc<dyn MediaEngine>,
    settings: RegistrySettings,
) -> RegistryActorHandle {
    RegistryActorHandle::new(
        format!("rr-test-{}", uuid::Uuid::new_v4()),
        engine,
        Arc::new(AddressResolver::fixed(TEST_ANNOUNCED_IP)),
        settings,
        ActorMetrics::new(),
    )
}

/// Signaling client bound to one registry connection.
pub struct TestClient {
    user_id: ParticipantId,
    link: ClientLink,
    connection: ConnectionActorHandle,
    task: JoinHandle<()>,
    next_request_id: u64,
    events: VecDeque<ServerEvent>,
}

impl TestClient {
    /// Open a new connection to `registry` for `user_id`.
    #[must_use]
    pub fn connect(registry: &RegistryActorHandle, user_id: &str) -> Self {
        let (link, server) = link_pair();
        let (connection, task) = registry.accept(server);

        Self {
            user_id: ParticipantId::new(user_id),
            link,
            connection,
            task,
            next_request_id: 1,
            events: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &ParticipantId {
        &self.user_id
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionActorHandle {
        &self.connection
    }

    /// Send `event` with a request id and wait for its ack.
    pub async fn request(&mut self, event: ClientEvent) -> Result<AckBody, WireError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        self.link
            .outbound
            .send(ClientEnvelope::request(request_id, event))
            .await
            .expect("registry connection closed");

        loop {
            match self.recv_frame().await {
                ServerMessage::Ack {
                    request_id: id,
                    result,
                } if id == request_id => return result.into(),
                ServerMessage::Ack { request_id: id, .. } => {
                    panic!("unexpected ack for request {id} while waiting for {request_id}")
                }
                ServerMessage::Event(event) => self.events.push_back(event),
            }
        }
    }

    /// Send `event` without a request id.
    pub async fn notify(&mut self, event: ClientEvent) {
        self.link
            .outbound
            .send(ClientEnvelope::notify(event))
            .await
            .expect("registry connection closed");
    }

    /// Next event, buffered or incoming.
    pub async fn next_event(&mut self) -> ServerEvent {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            match self.recv_frame().await {
                ServerMessage::Event(event) => return event,
                ServerMessage::Ack { request_id, .. } => {
                    panic!("unexpected ack for request {request_id}")
                }
            }
        }
    }

    /// First event matching `predicate`; other events stay buffered in order.
    pub async fn expect_event(&mut self, predicate: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
        if let Some(pos) = self.events.iter().position(&predicate) {
            return self.events.remove(pos).expect("position is in range");
        }
        loop {
            match self.recv_frame().await {
                ServerMessage::Event(event) if predicate(&event) => return event,
                ServerMessage::Event(event) => self.events.push_back(event),
                ServerMessage::Ack { request_id, .. } => {
                    panic!("unexpected ack for request {request_id}")
                }
            }
        }
    }

    /// Assert that no event arrives within `within`.
    pub async fn expect_no_event(&mut self, within: Duration) {
        assert!(
            self.events.is_empty(),
            "buffered events present: {:?}",
            self.events
        );
        if let Ok(Some(frame)) = tokio::time::timeout(within, self.link.inbound.recv()).await {
            panic!("unexpected frame: {frame:?}");
        }
    }

    /// Remove and return every buffered event.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        self.events.drain(..).collect()
    }

    async fn recv_frame(&mut self) -> ServerMessage {
        tokio::time::timeout(FRAME_TIMEOUT, self.link.inbound.recv())
            .await
            .expect("timed out waiting for a server frame")
            .expect("registry closed the link")
    }

    fn take_event<T>(&mut self, extract: impl Fn(&ServerEvent) -> Option<T>) -> Option<T> {
        let pos = self.events.iter().rposition(|e| extract(e).is_some())?;
        self.events.remove(pos).and_then(|e| extract(&e))
    }

    // ------------------------------------------------------------------
    // Convenience wrappers
    // ------------------------------------------------------------------

    pub async fn join(&mut self, room_id: &RoomId) -> Result<MediaCapabilities, WireError> {
        self.join_with(room_id, false).await
    }

    pub async fn join_as_spectator(
        &mut self,
        room_id: &RoomId,
    ) -> Result<MediaCapabilities, WireError> {
        self.join_with(room_id, true).await
    }

    async fn join_with(
        &mut self,
        room_id: &RoomId,
        is_spectator: bool,
    ) -> Result<MediaCapabilities, WireError> {
        self.request(ClientEvent::GetRouterRtpCapabilities {
            room_id: room_id.clone(),
            user_id: self.user_id.clone(),
            is_spectator,
        })
        .await?;

        Ok(self
            .take_event(|e| match e {
                ServerEvent::RouterRtpCapabilities { rtp_capabilities } => {
                    Some(rtp_capabilities.clone())
                }
                _ => None,
            })
            .expect("capabilities event precedes the ack"))
    }

    pub async fn create_transport(
        &mut self,
        room_id: &RoomId,
        role: TransportRole,
    ) -> Result<TransportDescriptor, WireError> {
        self.create_transport_with(room_id, role, false).await
    }

    pub async fn create_transport_with(
        &mut self,
        room_id: &RoomId,
        role: TransportRole,
        force_tcp: bool,
    ) -> Result<TransportDescriptor, WireError> {
        self.request(ClientEvent::CreateWebRtcTransport {
            role,
            room_id: room_id.clone(),
            user_id: self.user_id.clone(),
            force_tcp,
            ice_transport_policy: None,
        })
        .await?;

        Ok(self
            .take_event(|e| match e {
                ServerEvent::TransportCreated(d) if d.role == role => Some(d.clone()),
                _ => None,
            })
            .expect("transportCreated event precedes the ack"))
    }

    pub async fn connect_transport(
        &mut self,
        room_id: &RoomId,
        transport_id: &TransportId,
    ) -> Result<(), WireError> {
        self.request(ClientEvent::ConnectWebRtcTransport {
            transport_id: transport_id.clone(),
            security_params: dtls_params(),
            room_id: room_id.clone(),
        })
        .await
        .map(|_| ())
    }

    pub async fn produce(
        &mut self,
        room_id: &RoomId,
        transport_id: &TransportId,
        kind: MediaKind,
    ) -> Result<ProducerId, WireError> {
        match self
            .request(ClientEvent::Produce {
                transport_id: transport_id.clone(),
                kind,
                media_params: media_params(kind),
                room_id: room_id.clone(),
                user_id: self.user_id.clone(),
            })
            .await?
        {
            AckBody::Producer { id } => Ok(id),
            other => panic!("unexpected produce ack: {other:?}"),
        }
    }

    pub async fn get_producers(
        &mut self,
        room_id: &RoomId,
    ) -> Result<Vec<PublicationInfo>, WireError> {
        self.request(ClientEvent::GetProducers {
            room_id: room_id.clone(),
            user_id: self.user_id.clone(),
        })
        .await?;

        Ok(self
            .take_event(|e| match e {
                ServerEvent::ExistingProducers { producers } => Some(producers.clone()),
                _ => None,
            })
            .expect("existingProducers event precedes the ack"))
    }

    pub async fn consume(
        &mut self,
        room_id: &RoomId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
    ) -> Result<ConsumerDescriptor, WireError> {
        self.consume_with(room_id, transport_id, producer_id, client_capabilities())
            .await
    }

    pub async fn consume_with(
        &mut self,
        room_id: &RoomId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: MediaCapabilities,
    ) -> Result<ConsumerDescriptor, WireError> {
        match self
            .request(ClientEvent::Consume {
                capabilities,
                remote_producer_id: producer_id.clone(),
                transport_id: transport_id.clone(),
                room_id: room_id.clone(),
            })
            .await?
        {
            AckBody::Consumer(descriptor) => Ok(descriptor),
            other => panic!("unexpected consume ack: {other:?}"),
        }
    }

    pub async fn resume(
        &mut self,
        room_id: &RoomId,
        consumer_id: &ConsumerId,
    ) -> Result<(), WireError> {
        self.request(ClientEvent::ResumeConsumer {
            consumer_id: consumer_id.clone(),
            room_id: room_id.clone(),
        })
        .await
        .map(|_| ())
    }

    pub async fn leave(&mut self, room_id: &RoomId) -> Result<(), WireError> {
        self.request(ClientEvent::LeaveRoom {
            room_id: room_id.clone(),
            user_id: self.user_id.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Drop the link and wait until the registry has released the connection.
    pub async fn disconnect(self) {
        let Self { link, task, .. } = self;
        drop(link);
        tokio::time::timeout(FRAME_TIMEOUT, task)
            .await
            .expect("connection actor did not stop")
            .expect("connection actor panicked");
    }
}

//! `RoomActor` - per-room actor that owns room state.
//!
//! Each `RoomActor`:
//! - Owns the room's routing context, created lazily on the first join
//! - Owns every participant and their transports, producers and consumers
//! - Keeps the append-only publication list answering "what can I subscribe to"
//! - Fans join, leave and publish events out to the other members
//!
//! All requests for a room are serialized through the mailbox, so every
//! member observes broadcasts in the order the room processed them.
//!
//! # Teardown cascade
//!
//! Closing a transport closes the producers and consumers created on it.
//! The same cascade runs when the media engine closes a transport on its
//! own; each transport's close signal is watched and reported back to the
//! actor loop.
//! Closing a producer removes its publication, closes every downstream
//! consumer (notifying each consumer's owner with `consumerClosed`) and
//! broadcasts `producerClosed` to the other members.
//!
//! # Room lifecycle
//!
//! When a membership change leaves the room empty, the actor releases the
//! routing context, reports `RoomClosed` to the registry and exits. A room
//! that never gains a member is reaped after a grace period.

use crate::errors::RegistryError;
use crate::media::{MediaConsumer, MediaEngine, MediaProducer, MediaTransport, RoutingContext};
use crate::observability::metrics as prom;

use super::messages::{
    JoinRequest, LeaveOutcome, ParticipantSnapshot, RegistryMessage, RoomMessage, RoomState,
    TransportRequest,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::{ConnectionId, ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::link::OutboundSender;
use signaling_protocol::{
    ConsumerDescriptor, MediaCapabilities, MediaKind, MediaParams, PublicationInfo,
    SecurityParams, ServerEvent, TransportDescriptor, TransportRole,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How often an empty room checks whether its grace period ran out.
const EMPTY_ROOM_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period for a room that was created but never joined.
pub const DEFAULT_EMPTY_ROOM_GRACE: Duration = Duration::from_secs(30);

/// Per-room limits.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    pub max_participants: usize,
    pub empty_room_grace: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: 100,
            empty_room_grace: DEFAULT_EMPTY_ROOM_GRACE,
        }
    }
}

/// Handle to a `RoomActor`.
///
/// Every method fails with [`RegistryError::RoomClosing`] if the actor exited
/// before answering; callers retry through the registry.
#[derive(Debug, Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    instance_id: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Distinguishes successive rooms that reused the same key.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Whether the actor stopped receiving messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::RoomClosing)?;

        rx.await.map_err(|_| RegistryError::RoomClosing)
    }

    /// Register a participant; returns the routing capabilities.
    pub async fn join(&self, request: JoinRequest) -> Result<MediaCapabilities, RegistryError> {
        self.call(|respond_to| RoomMessage::Join {
            request,
            respond_to,
        })
        .await?
    }

    pub async fn create_transport(
        &self,
        request: TransportRequest,
    ) -> Result<TransportDescriptor, RegistryError> {
        self.call(|respond_to| RoomMessage::CreateTransport {
            request,
            respond_to,
        })
        .await?
    }

    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        security: SecurityParams,
    ) -> Result<(), RegistryError> {
        self.call(|respond_to| RoomMessage::ConnectTransport {
            transport_id,
            security,
            respond_to,
        })
        .await?
    }

    pub async fn produce(
        &self,
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        params: MediaParams,
    ) -> Result<ProducerId, RegistryError> {
        self.call(|respond_to| RoomMessage::Produce {
            participant_id,
            transport_id,
            kind,
            params,
            respond_to,
        })
        .await?
    }

    pub async fn list_producers(
        &self,
        participant_id: ParticipantId,
    ) -> Result<Vec<PublicationInfo>, RegistryError> {
        self.call(|respond_to| RoomMessage::ListProducers {
            participant_id,
            respond_to,
        })
        .await
    }

    pub async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: MediaCapabilities,
    ) -> Result<ConsumerDescriptor, RegistryError> {
        self.call(|respond_to| RoomMessage::Consume {
            transport_id,
            producer_id,
            capabilities,
            respond_to,
        })
        .await?
    }

    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), RegistryError> {
        self.call(|respond_to| RoomMessage::ResumeConsumer {
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn leave(
        &self,
        participant_id: ParticipantId,
        connection_id: Option<ConnectionId>,
    ) -> Result<LeaveOutcome, RegistryError> {
        self.call(|respond_to| RoomMessage::Leave {
            participant_id,
            connection_id,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<RoomState, RegistryError> {
        self.call(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct ManagedTransport {
    role: TransportRole,
    transport: Box<dyn MediaTransport>,
}

struct ManagedProducer {
    transport_id: TransportId,
    producer: Box<dyn MediaProducer>,
}

struct ManagedConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    consumer: Box<dyn MediaConsumer>,
}

struct Participant {
    connection_id: ConnectionId,
    outbound: OutboundSender,
    is_spectator: bool,
    transports: HashMap<TransportId, ManagedTransport>,
    producers: HashMap<ProducerId, ManagedProducer>,
    consumers: HashMap<ConsumerId, ManagedConsumer>,
}

impl Participant {
    fn new(connection_id: ConnectionId, outbound: OutboundSender, is_spectator: bool) -> Self {
        Self {
            connection_id,
            outbound,
            is_spectator,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn snapshot(&self, participant_id: &ParticipantId) -> ParticipantSnapshot {
        ParticipantSnapshot {
            participant_id: participant_id.clone(),
            connection_id: self.connection_id.clone(),
            is_spectator: self.is_spectator,
            transports: self
                .transports
                .iter()
                .map(|(id, t)| (id.clone(), t.role))
                .collect(),
            producers: self.producers.keys().cloned().collect(),
            consumers: self.consumers.keys().cloned().collect(),
        }
    }
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    instance_id: u64,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Child of the registry's token.
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    /// Used to report `RoomClosed`. Weak so rooms never keep the registry alive.
    registry: mpsc::WeakSender<RegistryMessage>,
    routing: Option<Box<dyn RoutingContext>>,
    participants: HashMap<ParticipantId, Participant>,
    publications: Vec<PublicationInfo>,
    /// Transport id to owning participant.
    transport_index: HashMap<TransportId, ParticipantId>,
    /// Consumer id to owning participant.
    consumer_index: HashMap<ConsumerId, ParticipantId>,
    /// Transports the engine reported closed.
    transport_closed_tx: mpsc::UnboundedSender<TransportId>,
    transport_closed: mpsc::UnboundedReceiver<TransportId>,
    settings: RoomSettings,
    created_at: Instant,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: RoomId,
        instance_id: u64,
        engine: Arc<dyn MediaEngine>,
        registry: mpsc::WeakSender<RegistryMessage>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        settings: RoomSettings,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let (transport_closed_tx, transport_closed) = mpsc::unbounded_channel();

        let actor = Self {
            room_id: room_id.clone(),
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            engine,
            registry,
            routing: None,
            participants: HashMap::new(),
            publications: Vec::new(),
            transport_index: HashMap::new(),
            consumer_index: HashMap::new(),
            transport_closed_tx,
            transport_closed,
            settings,
            created_at: Instant::now(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
            instance_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rr.actor.room", fields(room_id = %self.room_id, instance_id = self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            "RoomActor started"
        );

        let mut idle_check = tokio::time::interval(EMPTY_ROOM_CHECK_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rr.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.release_all();
                    break;
                }

                _ = idle_check.tick() => {
                    if self.participants.is_empty()
                        && self.created_at.elapsed() >= self.settings.empty_room_grace
                    {
                        debug!(
                            target: "rr.actor.room",
                            room_id = %self.room_id,
                            "Room never gained a member, closing"
                        );
                        self.close_room().await;
                        break;
                    }
                }

                Some(transport_id) = self.transport_closed.recv() => {
                    self.handle_transport_closed(&transport_id);
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let membership_change = matches!(
                                message,
                                RoomMessage::Join { .. }
                                    | RoomMessage::CreateTransport { .. }
                                    | RoomMessage::Leave { .. }
                            );
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if membership_change && self.participants.is_empty() {
                                self.close_room().await;
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "rr.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.release_all();
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.handle_join(request).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CreateTransport {
                request,
                respond_to,
            } => {
                let result = self.handle_create_transport(request).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                transport_id,
                security,
                respond_to,
            } => {
                let result = self.handle_connect(&transport_id, &security).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                participant_id,
                transport_id,
                kind,
                params,
                respond_to,
            } => {
                let result = self
                    .handle_produce(&participant_id, &transport_id, kind, &params)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ListProducers {
                participant_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.list_producers(&participant_id));
            }

            RoomMessage::Consume {
                transport_id,
                producer_id,
                capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(&transport_id, &producer_id, &capabilities)
                    .await;
                let outcome = match &result {
                    Ok(_) => "created",
                    Err(RegistryError::CannotConsume(_)) => "incompatible",
                    Err(RegistryError::ProducerNotFound(_)) => "producer_not_found",
                    Err(_) => "error",
                };
                prom::record_consumer(outcome);
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeConsumer {
                consumer_id,
                respond_to,
            } => {
                self.handle_resume(&consumer_id).await;
                let _ = respond_to.send(Ok(()));
            }

            RoomMessage::Leave {
                participant_id,
                connection_id,
                respond_to,
            } => {
                let outcome = self.handle_leave(&participant_id, connection_id.as_ref());
                let _ = respond_to.send(outcome);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    async fn ensure_routing_context(&mut self) -> Result<(), RegistryError> {
        if self.routing.is_some() {
            return Ok(());
        }
        if !self.engine.is_ready() {
            return Err(RegistryError::ServerNotReady);
        }

        let routing = self.engine.create_routing_context().await?;
        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            routing_context = routing.id(),
            "Routing context created"
        );
        self.routing = Some(routing);
        Ok(())
    }

    fn routing(&self) -> Result<&dyn RoutingContext, RegistryError> {
        self.routing
            .as_deref()
            .ok_or_else(|| RegistryError::Internal("routing context missing".to_string()))
    }

    /// Bind `participant_id` to a connection, registering it if new.
    ///
    /// A participant already bound to a different connection has its stale
    /// media torn down before it is rebound. `is_spectator` of `None` keeps
    /// the existing flag (or registers a regular participant).
    fn bind_participant(
        &mut self,
        participant_id: &ParticipantId,
        connection_id: &ConnectionId,
        outbound: OutboundSender,
        is_spectator: Option<bool>,
    ) -> Result<(), RegistryError> {
        if let Some(existing) = self.participants.get(participant_id) {
            if existing.connection_id == *connection_id {
                return Ok(());
            }

            let stale: Vec<TransportId> = existing.transports.keys().cloned().collect();
            for transport_id in stale {
                self.close_transport(participant_id, &transport_id, false);
            }
            if let Some(participant) = self.participants.get_mut(participant_id) {
                participant.connection_id = connection_id.clone();
                participant.outbound = outbound;
                if let Some(is_spectator) = is_spectator {
                    participant.is_spectator = is_spectator;
                }
            }

            info!(
                target: "rr.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                connection_id = %connection_id,
                "Participant rebound to a new connection"
            );
            return Ok(());
        }

        if self.participants.len() >= self.settings.max_participants {
            return Err(RegistryError::CapacityExceeded(
                "room participant limit reached".to_string(),
            ));
        }

        self.participants.insert(
            participant_id.clone(),
            Participant::new(
                connection_id.clone(),
                outbound,
                is_spectator.unwrap_or(false),
            ),
        );
        self.metrics.participant_joined();

        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            spectator = is_spectator.unwrap_or(false),
            participants = self.participants.len(),
            "Participant joined"
        );

        self.broadcast(
            &ServerEvent::ParticipantJoined {
                user_id: participant_id.clone(),
            },
            Some(participant_id),
        );
        Ok(())
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<MediaCapabilities, RegistryError> {
        let JoinRequest {
            participant_id,
            connection_id,
            outbound,
            is_spectator,
        } = request;

        if participant_id.is_empty() {
            return Err(RegistryError::MissingIdentity);
        }

        self.ensure_routing_context().await?;
        self.bind_participant(&participant_id, &connection_id, outbound, Some(is_spectator))?;

        Ok(self.routing()?.capabilities())
    }

    async fn handle_create_transport(
        &mut self,
        request: TransportRequest,
    ) -> Result<TransportDescriptor, RegistryError> {
        let TransportRequest {
            participant_id,
            connection_id,
            outbound,
            role,
            options,
        } = request;

        if participant_id.is_empty() {
            return Err(RegistryError::MissingIdentity);
        }

        self.ensure_routing_context().await?;
        self.bind_participant(&participant_id, &connection_id, outbound, None)?;

        let is_spectator = self
            .participants
            .get(&participant_id)
            .is_some_and(|p| p.is_spectator);
        if is_spectator && role == TransportRole::Send {
            return Err(RegistryError::PermissionDenied(
                "spectators cannot publish".to_string(),
            ));
        }

        let transport = self.routing()?.create_transport(role, &options).await?;
        let transport_id = transport.id().clone();
        let params = transport.negotiation_params();
        let closed = transport.closed();

        let superseded: Vec<TransportId> = self
            .participants
            .get(&participant_id)
            .map(|p| {
                p.transports
                    .iter()
                    .filter(|(_, t)| t.role == role)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for old_id in superseded {
            self.close_transport(&participant_id, &old_id, true);
            prom::record_transport_superseded(role.as_str());
            info!(
                target: "rr.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                old_transport_id = %old_id,
                new_transport_id = %transport_id,
                role = %role,
                "Transport superseded"
            );
        }

        let Some(participant) = self.participants.get_mut(&participant_id) else {
            transport.close();
            return Err(RegistryError::ParticipantNotFound(participant_id));
        };
        participant
            .transports
            .insert(transport_id.clone(), ManagedTransport { role, transport });
        self.transport_index
            .insert(transport_id.clone(), participant_id.clone());
        self.watch_transport(transport_id.clone(), closed);

        debug!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            transport_id = %transport_id,
            role = %role,
            force_tcp = !options.enable_udp,
            "Transport created"
        );

        Ok(TransportDescriptor {
            role,
            id: transport_id,
            params,
        })
    }

    async fn handle_connect(
        &mut self,
        transport_id: &TransportId,
        security: &SecurityParams,
    ) -> Result<(), RegistryError> {
        let transport = self
            .transport_index
            .get(transport_id)
            .and_then(|owner| self.participants.get(owner))
            .and_then(|p| p.transports.get(transport_id));

        match transport {
            Some(managed) => {
                managed.transport.connect(security).await?;
                debug!(
                    target: "rr.actor.room",
                    room_id = %self.room_id,
                    transport_id = %transport_id,
                    "Transport connected"
                );
                Ok(())
            }
            None => {
                debug!(
                    target: "rr.actor.room",
                    room_id = %self.room_id,
                    transport_id = %transport_id,
                    "Connect for unknown transport ignored"
                );
                Ok(())
            }
        }
    }

    async fn handle_produce(
        &mut self,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        kind: MediaKind,
        params: &MediaParams,
    ) -> Result<ProducerId, RegistryError> {
        let participant = self
            .participants
            .get(participant_id)
            .ok_or_else(|| RegistryError::ParticipantNotFound(participant_id.clone()))?;
        if participant.is_spectator {
            return Err(RegistryError::PermissionDenied(
                "spectators cannot publish".to_string(),
            ));
        }
        let managed = participant
            .transports
            .get(transport_id)
            .ok_or_else(|| RegistryError::TransportNotFound(transport_id.clone()))?;
        if managed.role != TransportRole::Send {
            return Err(RegistryError::InvalidRequest(
                "produce requires a send transport".to_string(),
            ));
        }

        let producer = managed.transport.produce(kind, params).await?;
        let producer_id = producer.id().clone();

        if let Some(participant) = self.participants.get_mut(participant_id) {
            participant.producers.insert(
                producer_id.clone(),
                ManagedProducer {
                    transport_id: transport_id.clone(),
                    producer,
                },
            );
        }

        let publication = PublicationInfo {
            producer_id: producer_id.clone(),
            producer_owner_identity: participant_id.clone(),
            kind,
        };
        self.publications.push(publication.clone());
        prom::record_producer_created();

        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );

        self.broadcast(&ServerEvent::NewProducer(publication), Some(participant_id));
        Ok(producer_id)
    }

    fn list_producers(&self, participant_id: &ParticipantId) -> Vec<PublicationInfo> {
        self.publications
            .iter()
            .filter(|p| &p.producer_owner_identity != participant_id)
            .cloned()
            .collect()
    }

    async fn handle_consume(
        &mut self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: &MediaCapabilities,
    ) -> Result<ConsumerDescriptor, RegistryError> {
        if !self
            .publications
            .iter()
            .any(|p| &p.producer_id == producer_id)
        {
            return Err(RegistryError::ProducerNotFound(producer_id.clone()));
        }

        let owner = self
            .transport_index
            .get(transport_id)
            .cloned()
            .ok_or_else(|| RegistryError::TransportNotFound(transport_id.clone()))?;
        let managed = self
            .participants
            .get(&owner)
            .and_then(|p| p.transports.get(transport_id))
            .ok_or_else(|| RegistryError::TransportNotFound(transport_id.clone()))?;
        if managed.role != TransportRole::Recv {
            return Err(RegistryError::InvalidRequest(
                "consume requires a receive transport".to_string(),
            ));
        }
        if !self.routing()?.can_consume(producer_id, capabilities) {
            return Err(RegistryError::CannotConsume(producer_id.clone()));
        }

        let consumer = managed.transport.consume(producer_id, capabilities).await?;
        let descriptor = ConsumerDescriptor {
            id: consumer.id().clone(),
            producer_id: consumer.producer_id().clone(),
            kind: consumer.kind(),
            media_params: consumer.media_params(),
        };

        if let Some(participant) = self.participants.get_mut(&owner) {
            participant.consumers.insert(
                descriptor.id.clone(),
                ManagedConsumer {
                    transport_id: transport_id.clone(),
                    producer_id: producer_id.clone(),
                    consumer,
                },
            );
        }
        self.consumer_index
            .insert(descriptor.id.clone(), owner.clone());

        debug!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            participant_id = %owner,
            consumer_id = %descriptor.id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );

        Ok(descriptor)
    }

    async fn handle_resume(&mut self, consumer_id: &ConsumerId) {
        let consumer = self
            .consumer_index
            .get(consumer_id)
            .and_then(|owner| self.participants.get(owner))
            .and_then(|p| p.consumers.get(consumer_id));

        match consumer {
            Some(managed) => {
                if let Err(e) = managed.consumer.resume().await {
                    debug!(
                        target: "rr.actor.room",
                        room_id = %self.room_id,
                        consumer_id = %consumer_id,
                        error = %e,
                        "Consumer resume failed"
                    );
                }
            }
            None => {
                debug!(
                    target: "rr.actor.room",
                    room_id = %self.room_id,
                    consumer_id = %consumer_id,
                    "Resume for unknown consumer ignored"
                );
            }
        }
    }

    fn handle_leave(
        &mut self,
        participant_id: &ParticipantId,
        connection_id: Option<&ConnectionId>,
    ) -> LeaveOutcome {
        let Some(participant) = self.participants.get(participant_id) else {
            debug!(
                target: "rr.actor.room",
                room_id = %self.room_id,
                participant_id = %participant_id,
                "Leave for absent participant ignored"
            );
            return LeaveOutcome::NotPresent;
        };

        if let Some(connection_id) = connection_id {
            if participant.connection_id != *connection_id {
                debug!(
                    target: "rr.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    "Stale connection close ignored, participant rebound"
                );
                return LeaveOutcome::NotPresent;
            }
        }

        let transports: Vec<TransportId> = participant.transports.keys().cloned().collect();
        for transport_id in transports {
            self.close_transport(participant_id, &transport_id, false);
        }

        if let Some(participant) = self.participants.remove(participant_id) {
            for (_, managed) in participant.producers {
                managed.producer.close();
            }
            for (consumer_id, managed) in participant.consumers {
                self.consumer_index.remove(&consumer_id);
                managed.consumer.close();
            }
        }
        self.metrics.participant_left();

        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            participant_id = %participant_id,
            remaining = self.participants.len(),
            "Participant left"
        );

        self.broadcast(
            &ServerEvent::ParticipantLeft {
                user_id: participant_id.clone(),
            },
            None,
        );
        LeaveOutcome::Left
    }

    /// Report `transport_id` to the actor loop once its close signal flips.
    fn watch_transport(&self, transport_id: TransportId, mut closed: watch::Receiver<bool>) {
        let notify = self.transport_closed_tx.clone();
        let cancel_token = self.cancel_token.child_token();

        tokio::spawn(async move {
            loop {
                if *closed.borrow_and_update() {
                    let _ = notify.send(transport_id);
                    break;
                }
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    changed = closed.changed() => {
                        // Sender dropped without closing: nothing to report.
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// The engine closed a transport: run the same cascade as an explicit
    /// close. Transports the room already released are ignored.
    fn handle_transport_closed(&mut self, transport_id: &TransportId) {
        let Some(owner) = self.transport_index.get(transport_id).cloned() else {
            return;
        };

        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            participant_id = %owner,
            transport_id = %transport_id,
            "Media engine closed transport"
        );
        self.close_transport(&owner, transport_id, true);
    }

    /// Close a transport and everything created on it.
    fn close_transport(
        &mut self,
        owner: &ParticipantId,
        transport_id: &TransportId,
        notify_owner: bool,
    ) {
        let Some(participant) = self.participants.get_mut(owner) else {
            return;
        };
        let Some(managed) = participant.transports.remove(transport_id) else {
            return;
        };
        let consumers: Vec<ConsumerId> = participant
            .consumers
            .iter()
            .filter(|(_, c)| &c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        let producers: Vec<ProducerId> = participant
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        self.transport_index.remove(transport_id);

        for consumer_id in consumers {
            self.close_consumer(owner, &consumer_id, notify_owner);
        }
        for producer_id in producers {
            self.close_producer(&producer_id);
        }
        managed.transport.close();
    }

    fn close_consumer(&mut self, owner: &ParticipantId, consumer_id: &ConsumerId, notify: bool) {
        self.consumer_index.remove(consumer_id);
        let Some(participant) = self.participants.get_mut(owner) else {
            return;
        };
        let Some(managed) = participant.consumers.remove(consumer_id) else {
            return;
        };
        managed.consumer.close();

        if notify {
            let event = ServerEvent::ConsumerClosed {
                consumer_id: consumer_id.clone(),
                producer_id: managed.producer_id,
            };
            prom::record_broadcast(event.name());
            participant.outbound.send_event(event);
        }
    }

    /// Close a producer, its publication and every downstream consumer.
    fn close_producer(&mut self, producer_id: &ProducerId) {
        let Some(position) = self
            .publications
            .iter()
            .position(|p| &p.producer_id == producer_id)
        else {
            return;
        };
        let publication = self.publications.remove(position);
        let owner = publication.producer_owner_identity;

        if let Some(managed) = self
            .participants
            .get_mut(&owner)
            .and_then(|p| p.producers.remove(producer_id))
        {
            managed.producer.close();
        }

        let downstream: Vec<(ParticipantId, ConsumerId)> = self
            .participants
            .iter()
            .flat_map(|(participant_id, p)| {
                p.consumers
                    .iter()
                    .filter(|(_, c)| &c.producer_id == producer_id)
                    .map(move |(consumer_id, _)| (participant_id.clone(), consumer_id.clone()))
            })
            .collect();
        for (participant_id, consumer_id) in downstream {
            self.close_consumer(&participant_id, &consumer_id, true);
        }

        debug!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            producer_id = %producer_id,
            owner = %owner,
            "Producer closed"
        );

        self.broadcast(
            &ServerEvent::ProducerClosed {
                producer_id: producer_id.clone(),
            },
            Some(&owner),
        );
    }

    /// Push `event` to every member except `except`.
    fn broadcast(&self, event: &ServerEvent, except: Option<&ParticipantId>) {
        for (participant_id, participant) in &self.participants {
            if Some(participant_id) == except {
                continue;
            }
            if !participant.outbound.send_event(event.clone()) {
                debug!(
                    target: "rr.actor.room",
                    room_id = %self.room_id,
                    participant_id = %participant_id,
                    event = event.name(),
                    "Dropped event for disconnected participant"
                );
            }
        }
        prom::record_broadcast(event.name());
    }

    fn get_state(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            instance_id: self.instance_id,
            routing_context_id: self.routing.as_ref().map(|r| r.id().to_string()),
            participants: self
                .participants
                .iter()
                .map(|(id, p)| p.snapshot(id))
                .collect(),
            publications: self.publications.clone(),
        }
    }

    /// Close every media object without notifying members (shutdown path).
    fn release_all(&mut self) {
        for (_, participant) in self.participants.drain() {
            for (_, managed) in participant.consumers {
                managed.consumer.close();
            }
            for (_, managed) in participant.producers {
                managed.producer.close();
            }
            for (_, managed) in participant.transports {
                managed.transport.close();
            }
            self.metrics.participant_left();
        }
        self.publications.clear();
        self.transport_index.clear();
        self.consumer_index.clear();
        if let Some(routing) = self.routing.take() {
            routing.close();
        }
    }

    async fn close_room(&mut self) {
        self.release_all();

        let reported = match self.registry.upgrade() {
            Some(registry) => registry
                .send(RegistryMessage::RoomClosed {
                    room_id: self.room_id.clone(),
                    instance_id: self.instance_id,
                })
                .await
                .is_ok(),
            None => false,
        };
        if !reported {
            warn!(
                target: "rr.actor.room",
                room_id = %self.room_id,
                "Registry gone, room close not reported"
            );
        }

        info!(
            target: "rr.actor.room",
            room_id = %self.room_id,
            "Room empty, closed"
        );
    }
}

//! `SessionActor` - one participant session.
//!
//! The actor owns every piece of client-side negotiation state: local
//! tracks, the current transport of each role, published producers,
//! consumed remote tracks, the pending-track queue and the table of
//! requests still waiting for an ack. Registry responses may come back in
//! any order relative to local steps; every handler checks that the object
//! it refers to is still current and drops the response otherwise.
//!
//! Leaving clears the request table, so acks that arrive afterwards find
//! no entry and are ignored.

use super::{
    JoinMode, LocalTrackInfo, SessionEvent, SessionHandle, SessionMessage, SessionSettings,
    SessionSnapshot, SessionState, SESSION_CHANNEL_BUFFER, SESSION_EVENT_BUFFER,
};
use crate::errors::{LinkError, SessionError};
use crate::media::{
    ClientTransport, ConnectionState, LocalMedia, LocalTrack, MediaDevice, PublishPreset,
    RemoteTrack, TransportPolicy,
};
use crate::pending::{PendingTrack, PendingTracks};
use crate::recovery::{RecoveryController, RecoveryDecision, RecoveryTrigger};

use common::types::{ConsumerId, ParticipantId, ProducerId, TransportId};
use signaling_protocol::link::ClientLink;
use signaling_protocol::{
    AckBody, ClientEnvelope, ClientEvent, IceTransportPolicy, MediaCapabilities, MediaKind,
    ServerEvent, ServerMessage, TransportDescriptor, TransportRole, WireError,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const NO_ROLES: &[TransportRole] = &[];

/// A request waiting for its ack.
#[derive(Debug)]
enum Pending {
    Join,
    CreateTransport {
        role: TransportRole,
        /// Issued by a fired recovery retry.
        retry: bool,
    },
    Connect {
        role: TransportRole,
        transport_id: TransportId,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
    },
    GetProducers,
    Consume {
        producer_id: ProducerId,
        owner: ParticipantId,
        transport_id: TransportId,
    },
    Resume {
        consumer_id: ConsumerId,
    },
    Leave,
}

/// Connection-state change reported by a transport watcher.
#[derive(Debug)]
struct TransportStateUpdate {
    transport_id: TransportId,
    role: TransportRole,
    state: ConnectionState,
}

/// The session's transport of one role.
struct SessionTransport {
    transport: Arc<dyn ClientTransport>,
    /// Registry acked the connect step.
    connected: bool,
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    settings: SessionSettings,
    receiver: mpsc::Receiver<SessionMessage>,
    events: broadcast::Sender<SessionEvent>,
    outbound: mpsc::Sender<ClientEnvelope>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    media: Arc<dyn LocalMedia>,
    device: Arc<dyn MediaDevice>,
    cancel_token: CancellationToken,

    state: SessionState,
    mode: Option<JoinMode>,
    join_waiter: Option<oneshot::Sender<Result<(), SessionError>>>,
    link_closed: bool,

    next_request_id: u64,
    pending: HashMap<u64, Pending>,
    /// Transport roles requested but not yet created, with their ICE policy.
    requested: HashMap<TransportRole, IceTransportPolicy>,

    recv_capabilities: Option<MediaCapabilities>,
    send_transport: Option<SessionTransport>,
    recv_transport: Option<SessionTransport>,
    local_tracks: Vec<LocalTrack>,
    producers: HashMap<ProducerId, MediaKind>,
    consumers: HashMap<ConsumerId, RemoteTrack>,
    /// Producers with a consume request in flight.
    consuming: HashSet<ProducerId>,
    pending_tracks: PendingTracks,

    recovery: RecoveryController,
    recovery_triggers: mpsc::UnboundedReceiver<RecoveryTrigger>,
    state_updates_tx: mpsc::UnboundedSender<TransportStateUpdate>,
    state_updates: mpsc::UnboundedReceiver<TransportStateUpdate>,
}

impl SessionActor {
    /// Spawn a session over `link`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        settings: SessionSettings,
        link: ClientLink,
        media: Arc<dyn LocalMedia>,
        device: Arc<dyn MediaDevice>,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (events, _) = broadcast::channel(SESSION_EVENT_BUFFER);
        let (trigger_tx, recovery_triggers) = mpsc::unbounded_channel();
        let (state_updates_tx, state_updates) = mpsc::unbounded_channel();

        let recovery = RecoveryController::new(settings.recovery, trigger_tx, &cancel_token);

        let actor = Self {
            settings,
            receiver,
            events: events.clone(),
            outbound: link.outbound,
            inbound: link.inbound,
            media,
            device,
            cancel_token: cancel_token.clone(),
            state: SessionState::Idle,
            mode: None,
            join_waiter: None,
            link_closed: false,
            next_request_id: 1,
            pending: HashMap::new(),
            requested: HashMap::new(),
            recv_capabilities: None,
            send_transport: None,
            recv_transport: None,
            local_tracks: Vec::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            consuming: HashSet::new(),
            pending_tracks: PendingTracks::new(),
            recovery,
            recovery_triggers,
            state_updates_tx,
            state_updates,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            events,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "session.actor",
        fields(room_id = %self.settings.room_id, user_id = %self.settings.user_id)
    )]
    async fn run(mut self) {
        debug!(target: "session.negotiator", "SessionActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "session.negotiator",
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            debug!(target: "session.negotiator", "All session handles dropped");
                            break;
                        }
                    }
                }

                frame = self.inbound.recv() => {
                    match frame {
                        Some(message) => self.handle_server_message(message).await,
                        None => self.link_closed = true,
                    }
                }

                Some(update) = self.state_updates.recv() => {
                    self.handle_transport_state(update);
                }

                Some(trigger) = self.recovery_triggers.recv() => {
                    self.handle_recovery_trigger(trigger).await;
                }
            }

            if self.link_closed {
                self.handle_link_closed().await;
                break;
            }
        }

        if self.state != SessionState::Idle {
            self.teardown(true).await;
        }
        if let Some(waiter) = self.join_waiter.take() {
            let _ = waiter.send(Err(SessionError::Cancelled));
        }

        info!(target: "session.negotiator", "SessionActor stopped");
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join { mode, respond_to } => {
                self.start_join(mode, respond_to).await;
            }
            SessionMessage::Leave { respond_to } => {
                self.leave().await;
                let _ = respond_to.send(Ok(()));
            }
            SessionMessage::ToggleTrack { kind, respond_to } => {
                let _ = respond_to.send(self.toggle_track(kind));
            }
            SessionMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    async fn start_join(
        &mut self,
        mode: JoinMode,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    ) {
        if self.state != SessionState::Idle {
            let _ = respond_to.send(Err(SessionError::InvalidState {
                operation: "join",
                state: self.state.as_str(),
            }));
            return;
        }
        if self.link_closed {
            let _ = respond_to.send(Err(LinkError::Closed.into()));
            return;
        }

        info!(
            target: "session.negotiator",
            room_id = %self.settings.room_id,
            user_id = %self.settings.user_id,
            mode = %mode,
            "Joining room"
        );

        self.mode = Some(mode);
        self.join_waiter = Some(respond_to);

        if mode == JoinMode::Publisher {
            self.set_state(SessionState::AcquiringMedia);
            match self.media.acquire().await {
                Ok(tracks) => {
                    debug!(
                        target: "session.negotiator",
                        tracks = tracks.len(),
                        "Local media acquired"
                    );
                    self.local_tracks = tracks;
                }
                Err(e) => {
                    self.fail_join(e.into(), false).await;
                    return;
                }
            }
        }

        self.set_state(SessionState::Connecting);
        let event = ClientEvent::GetRouterRtpCapabilities {
            room_id: self.settings.room_id.clone(),
            user_id: self.settings.user_id.clone(),
            is_spectator: mode == JoinMode::Spectator,
        };
        self.send_request(event, Pending::Join).await;
    }

    async fn leave(&mut self) {
        if self.state == SessionState::Idle {
            return;
        }

        info!(
            target: "session.negotiator",
            room_id = %self.settings.room_id,
            user_id = %self.settings.user_id,
            "Leaving room"
        );

        self.set_state(SessionState::Leaving);
        self.teardown(true).await;

        if let Some(waiter) = self.join_waiter.take() {
            let _ = waiter.send(Err(SessionError::Cancelled));
        }
    }

    /// Abort the join in progress and return to `Idle`.
    async fn fail_join(&mut self, error: SessionError, notify_registry: bool) {
        warn!(
            target: "session.negotiator",
            state = %self.state,
            error = %error,
            "Join failed"
        );

        self.emit(SessionEvent::Error(error.clone()));
        self.teardown(notify_registry).await;

        if let Some(waiter) = self.join_waiter.take() {
            let _ = waiter.send(Err(error));
        }
    }

    /// Surface a failed step; during a join the join is aborted.
    async fn fail_step(&mut self, error: SessionError) {
        if self.join_waiter.is_some() {
            self.fail_join(error, true).await;
        } else {
            warn!(target: "session.negotiator", error = %error, "Session step failed");
            self.emit(SessionEvent::Error(error));
        }
    }

    /// Release everything in order: consumers, producers, transports,
    /// local tracks. Then tell the registry and go back to `Idle`.
    async fn teardown(&mut self, notify_registry: bool) {
        self.recovery.reset();
        self.pending.clear();
        self.requested.clear();
        self.consuming.clear();
        self.pending_tracks.clear();

        let consumers: Vec<RemoteTrack> = self.consumers.drain().map(|(_, t)| t).collect();
        for track in consumers {
            if let Some(recv) = &self.recv_transport {
                recv.transport.close_consumer(&track.consumer_id);
            }
            self.emit(SessionEvent::TrackRemoved(track));
        }

        let producers: Vec<ProducerId> = self.producers.drain().map(|(id, _)| id).collect();
        if let Some(send) = &self.send_transport {
            for producer_id in &producers {
                send.transport.close_producer(producer_id);
            }
        }

        for slot in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            slot.transport.close();
        }

        for track in self.local_tracks.drain(..) {
            track.stop();
        }
        self.recv_capabilities = None;

        if notify_registry && !self.link_closed {
            let event = ClientEvent::LeaveRoom {
                room_id: self.settings.room_id.clone(),
                user_id: self.settings.user_id.clone(),
            };
            self.send_request(event, Pending::Leave).await;
        }

        self.mode = None;
        self.set_state(SessionState::Idle);
    }

    async fn handle_link_closed(&mut self) {
        warn!(target: "session.link", "Signaling link closed");

        if self.state != SessionState::Idle {
            self.teardown(false).await;
        }

        let error = SessionError::Link(LinkError::Closed);
        self.emit(SessionEvent::Error(error.clone()));
        if let Some(waiter) = self.join_waiter.take() {
            let _ = waiter.send(Err(error));
        }
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    async fn send_request(&mut self, event: ClientEvent, pending: Pending) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let event_name = event.name();

        self.pending.insert(request_id, pending);
        if self
            .outbound
            .send(ClientEnvelope::request(request_id, event))
            .await
            .is_err()
        {
            self.pending.remove(&request_id);
            warn!(
                target: "session.link",
                event = event_name,
                "Signaling link closed while sending"
            );
            self.link_closed = true;
            return;
        }

        debug!(
            target: "session.negotiator",
            event = event_name,
            request_id,
            "Request sent"
        );
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Event(event) => self.handle_event(event).await,
            ServerMessage::Ack { request_id, result } => {
                self.handle_ack(request_id, result.into()).await;
            }
        }
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        debug!(target: "session.negotiator", event = event.name(), "Server event");

        match event {
            ServerEvent::RouterRtpCapabilities { rtp_capabilities } => {
                self.handle_capabilities(rtp_capabilities).await;
            }
            ServerEvent::TransportCreated(descriptor) => {
                self.handle_transport_created(descriptor).await;
            }
            ServerEvent::ExistingProducers { producers } => {
                for info in producers {
                    self.consume_or_queue(info.into()).await;
                }
            }
            ServerEvent::NewProducer(info) => {
                self.consume_or_queue(info.into()).await;
            }
            ServerEvent::ProducerClosed { producer_id } => {
                self.handle_producer_closed(&producer_id);
            }
            ServerEvent::ConsumerClosed {
                consumer_id,
                producer_id,
            } => {
                self.pending_tracks.remove_producer(&producer_id);
                self.close_consumer(&consumer_id);
            }
            ServerEvent::ParticipantJoined { user_id } => {
                if self.state != SessionState::Idle {
                    self.emit(SessionEvent::ParticipantJoined { user_id });
                }
            }
            ServerEvent::ParticipantLeft { user_id } => {
                self.handle_participant_left(user_id);
            }
            ServerEvent::Error {
                message,
                kind,
                role,
            } => {
                warn!(
                    target: "session.negotiator",
                    kind = %kind,
                    role = ?role,
                    message = %message,
                    "Registry reported an error"
                );
                self.emit(SessionEvent::Error(SessionError::Registry {
                    operation: "signaling",
                    error: WireError::new(kind, message),
                }));
            }
        }
    }

    async fn handle_ack(&mut self, request_id: u64, result: Result<AckBody, WireError>) {
        let Some(pending) = self.pending.remove(&request_id) else {
            debug!(
                target: "session.negotiator",
                request_id,
                "Ignoring ack for unknown request"
            );
            return;
        };

        match (pending, result) {
            (Pending::Join, Ok(_)) | (Pending::GetProducers, Ok(_)) | (Pending::Resume { .. }, Ok(_)) => {}
            (Pending::Join, Err(error)) => {
                self.fail_join(registry_error("getRouterRtpCapabilities", error), false)
                    .await;
            }
            (Pending::CreateTransport { .. }, Ok(_)) => {}
            (Pending::CreateTransport { role, retry }, Err(error)) => {
                self.requested.remove(&role);
                let error = registry_error("createWebRtcTransport", error);
                if retry {
                    self.handle_retry_rejected(role, error);
                } else {
                    self.fail_step(error).await;
                }
            }
            (Pending::Connect { role, transport_id }, result) => {
                self.handle_connect_ack(role, &transport_id, result).await;
            }
            (Pending::Produce { transport_id, kind }, result) => {
                self.handle_produce_ack(&transport_id, kind, result);
            }
            (Pending::GetProducers, Err(error)) => {
                self.fail_step(registry_error("getProducers", error)).await;
            }
            (
                Pending::Consume {
                    producer_id,
                    owner,
                    transport_id,
                },
                result,
            ) => {
                self.handle_consume_ack(producer_id, &owner, &transport_id, result)
                    .await;
            }
            (Pending::Resume { consumer_id }, Err(error)) => {
                debug!(
                    target: "session.negotiator",
                    consumer_id = %consumer_id,
                    error = %error,
                    "Resume rejected"
                );
            }
            (Pending::Leave, result) => {
                debug!(
                    target: "session.negotiator",
                    ok = result.is_ok(),
                    "Leave acknowledged"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Capabilities and transports
    // ------------------------------------------------------------------

    async fn handle_capabilities(&mut self, capabilities: MediaCapabilities) {
        if self.state != SessionState::Connecting {
            debug!(
                target: "session.negotiator",
                state = %self.state,
                "Ignoring capabilities outside of a join"
            );
            return;
        }

        match self.device.load(&capabilities).await {
            Ok(recv_capabilities) => self.recv_capabilities = Some(recv_capabilities),
            Err(e) => {
                self.fail_join(e.into(), true).await;
                return;
            }
        }
        self.set_state(SessionState::DeviceReady);

        let roles = self.mode.map_or(NO_ROLES, JoinMode::roles);
        self.set_state(SessionState::TransportsPending);
        for role in roles {
            self.request_transport(*role, false).await;
        }
    }

    /// Retries force TCP and relay-only candidates.
    async fn request_transport(&mut self, role: TransportRole, retry: bool) {
        let policy = if retry {
            IceTransportPolicy::Relay
        } else {
            IceTransportPolicy::All
        };
        self.requested.insert(role, policy);
        let event = ClientEvent::CreateWebRtcTransport {
            role,
            room_id: self.settings.room_id.clone(),
            user_id: self.settings.user_id.clone(),
            force_tcp: retry,
            ice_transport_policy: Some(policy),
        };
        self.send_request(event, Pending::CreateTransport { role, retry })
            .await;
    }

    async fn handle_transport_created(&mut self, descriptor: TransportDescriptor) {
        let role = descriptor.role;
        let Some(ice_transport_policy) = self.requested.remove(&role) else {
            debug!(
                target: "session.negotiator",
                role = %role,
                transport_id = %descriptor.id,
                "Ignoring transport that was not requested"
            );
            return;
        };

        let policy = TransportPolicy {
            ice_servers: self.settings.ice_servers.clone(),
            ice_transport_policy,
        };
        let transport = match self.device.create_transport(&descriptor, &policy) {
            Ok(transport) => transport,
            Err(e) => {
                self.fail_step(e.into()).await;
                return;
            }
        };

        let previous = self.transport_slot_mut(role).replace(SessionTransport {
            transport: Arc::clone(&transport),
            connected: false,
        });
        if let Some(previous) = previous {
            self.retire_transport(previous);
        }
        self.watch_transport(&transport);

        info!(
            target: "session.negotiator",
            role = %role,
            transport_id = %descriptor.id,
            "Transport created"
        );

        let event = ClientEvent::ConnectWebRtcTransport {
            transport_id: descriptor.id.clone(),
            security_params: transport.security_params(),
            room_id: self.settings.room_id.clone(),
        };
        self.send_request(
            event,
            Pending::Connect {
                role,
                transport_id: descriptor.id,
            },
        )
        .await;
    }

    /// Drop a superseded transport and everything bound to it.
    ///
    /// The registry closed the server side when it created the replacement.
    fn retire_transport(&mut self, previous: SessionTransport) {
        let transport = previous.transport;
        info!(
            target: "session.negotiator",
            role = %transport.role(),
            transport_id = %transport.id(),
            "Superseding transport"
        );

        match transport.role() {
            TransportRole::Send => {
                let producers: Vec<ProducerId> =
                    self.producers.drain().map(|(id, _)| id).collect();
                for producer_id in &producers {
                    transport.close_producer(producer_id);
                }
            }
            TransportRole::Recv => {
                self.consuming.clear();
                let consumers: Vec<RemoteTrack> =
                    self.consumers.drain().map(|(_, t)| t).collect();
                for track in consumers {
                    transport.close_consumer(&track.consumer_id);
                    self.emit(SessionEvent::TrackRemoved(track));
                }
            }
        }

        transport.close();
    }

    /// Forward the transport's connection-state changes to the actor.
    fn watch_transport(&self, transport: &Arc<dyn ClientTransport>) {
        let mut states = transport.connection_state();
        let transport_id = transport.id().clone();
        let role = transport.role();
        let updates = self.state_updates_tx.clone();
        let cancel_token = self.cancel_token.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        let update = TransportStateUpdate {
                            transport_id: transport_id.clone(),
                            role,
                            state,
                        };
                        if updates.send(update).is_err() || state == ConnectionState::Closed {
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn handle_connect_ack(
        &mut self,
        role: TransportRole,
        transport_id: &TransportId,
        result: Result<AckBody, WireError>,
    ) {
        if !self.is_current(role, transport_id) {
            debug!(
                target: "session.negotiator",
                role = %role,
                transport_id = %transport_id,
                "Ignoring connect ack for a retired transport"
            );
            return;
        }

        if let Err(error) = result {
            self.fail_step(registry_error("connectWebRtcTransport", error))
                .await;
            return;
        }

        if let Some(current) = self.transport_slot_mut(role).as_mut() {
            current.connected = true;
            current.transport.handshake_complete();
        }
        info!(
            target: "session.negotiator",
            role = %role,
            transport_id = %transport_id,
            "Transport connected"
        );

        match role {
            TransportRole::Send => self.publish_local_tracks().await,
            TransportRole::Recv => self.receive_ready().await,
        }

        self.check_active();
    }

    fn check_active(&mut self) {
        if self.state != SessionState::TransportsPending {
            return;
        }
        let roles = self.mode.map_or(NO_ROLES, JoinMode::roles);
        let ready = roles
            .iter()
            .all(|role| self.transport_slot(*role).is_some_and(|t| t.connected));
        if !ready {
            return;
        }

        self.set_state(SessionState::Active);
        info!(
            target: "session.negotiator",
            room_id = %self.settings.room_id,
            user_id = %self.settings.user_id,
            "Session active"
        );
        if let Some(waiter) = self.join_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    async fn publish_local_tracks(&mut self) {
        let Some(transport) = self
            .send_transport
            .as_ref()
            .map(|t| Arc::clone(&t.transport))
        else {
            return;
        };

        let tracks: Vec<LocalTrack> = self
            .local_tracks
            .iter()
            .filter(|t| t.is_live())
            .cloned()
            .collect();

        for track in tracks {
            let kind = track.kind();
            let media_params =
                match transport.producer_params(&track, &PublishPreset::for_kind(kind)) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!(
                            target: "session.negotiator",
                            kind = %kind,
                            error = %e,
                            "Cannot publish local track"
                        );
                        self.emit(SessionEvent::Error(e.into()));
                        continue;
                    }
                };

            let event = ClientEvent::Produce {
                transport_id: transport.id().clone(),
                kind,
                media_params,
                room_id: self.settings.room_id.clone(),
                user_id: self.settings.user_id.clone(),
            };
            self.send_request(
                event,
                Pending::Produce {
                    transport_id: transport.id().clone(),
                    kind,
                },
            )
            .await;
        }
    }

    fn handle_produce_ack(
        &mut self,
        transport_id: &TransportId,
        kind: MediaKind,
        result: Result<AckBody, WireError>,
    ) {
        if !self.is_current(TransportRole::Send, transport_id) {
            debug!(
                target: "session.negotiator",
                transport_id = %transport_id,
                "Ignoring produce ack for a retired transport"
            );
            return;
        }

        match result {
            Ok(AckBody::Producer { id }) => {
                info!(
                    target: "session.negotiator",
                    producer_id = %id,
                    kind = %kind,
                    "Track published"
                );
                self.producers.insert(id.clone(), kind);
                self.emit(SessionEvent::Published {
                    producer_id: id,
                    kind,
                });
            }
            Ok(body) => {
                warn!(
                    target: "session.negotiator",
                    body = ?body,
                    "Unexpected produce ack"
                );
            }
            Err(error) => {
                let error = registry_error("produce", error);
                warn!(target: "session.negotiator", kind = %kind, error = %error, "Publish rejected");
                self.emit(SessionEvent::Error(error));
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscribing
    // ------------------------------------------------------------------

    /// The receive transport just connected: drain the queue, then list.
    async fn receive_ready(&mut self) {
        let queued = self.pending_tracks.drain();
        if !queued.is_empty() {
            debug!(
                target: "session.negotiator",
                count = queued.len(),
                "Draining pending tracks"
            );
        }
        for track in queued {
            self.consume(track).await;
        }

        let event = ClientEvent::GetProducers {
            room_id: self.settings.room_id.clone(),
            user_id: self.settings.user_id.clone(),
        };
        self.send_request(event, Pending::GetProducers).await;
    }

    async fn consume_or_queue(&mut self, track: PendingTrack) {
        if !matches!(
            self.state,
            SessionState::Connecting
                | SessionState::DeviceReady
                | SessionState::TransportsPending
                | SessionState::Active
        ) {
            return;
        }
        if track.producer_owner_identity == self.settings.user_id {
            return;
        }

        if self.receive_path_ready() {
            self.consume(track).await;
        } else {
            debug!(
                target: "session.negotiator",
                producer_id = %track.producer_id,
                owner = %track.producer_owner_identity,
                "Receive transport not ready, queueing track"
            );
            self.pending_tracks.push(track);
        }
    }

    fn receive_path_ready(&self) -> bool {
        self.recv_capabilities.is_some() && self.recv_transport.as_ref().is_some_and(|t| t.connected)
    }

    async fn consume(&mut self, track: PendingTrack) {
        let already_tracked = self.consuming.contains(&track.producer_id)
            || self
                .consumers
                .values()
                .any(|c| c.producer_id == track.producer_id);
        if already_tracked {
            debug!(
                target: "session.negotiator",
                producer_id = %track.producer_id,
                "Producer already consumed"
            );
            return;
        }

        let (Some(transport_id), Some(capabilities)) = (
            self.recv_transport
                .as_ref()
                .filter(|t| t.connected)
                .map(|t| t.transport.id().clone()),
            self.recv_capabilities.clone(),
        ) else {
            self.pending_tracks.push(track);
            return;
        };

        self.consuming.insert(track.producer_id.clone());
        let event = ClientEvent::Consume {
            capabilities,
            remote_producer_id: track.producer_id.clone(),
            transport_id: transport_id.clone(),
            room_id: self.settings.room_id.clone(),
        };
        self.send_request(
            event,
            Pending::Consume {
                producer_id: track.producer_id,
                owner: track.producer_owner_identity,
                transport_id,
            },
        )
        .await;
    }

    async fn handle_consume_ack(
        &mut self,
        producer_id: ProducerId,
        owner: &ParticipantId,
        transport_id: &TransportId,
        result: Result<AckBody, WireError>,
    ) {
        self.consuming.remove(&producer_id);
        let Some(transport) = self.current_transport(TransportRole::Recv, transport_id) else {
            debug!(
                target: "session.negotiator",
                producer_id = %producer_id,
                "Ignoring consume ack for a retired transport"
            );
            return;
        };

        let descriptor = match result {
            Ok(AckBody::Consumer(descriptor)) => descriptor,
            Ok(body) => {
                warn!(target: "session.negotiator", body = ?body, "Unexpected consume ack");
                return;
            }
            Err(error) if error.kind.is_stale_reference() => {
                debug!(
                    target: "session.negotiator",
                    producer_id = %producer_id,
                    kind = %error.kind,
                    "Producer gone before it was consumed"
                );
                return;
            }
            Err(error) => {
                let error = registry_error("consume", error);
                warn!(
                    target: "session.negotiator",
                    producer_id = %producer_id,
                    error = %error,
                    "Consume rejected"
                );
                self.emit(SessionEvent::Error(error));
                return;
            }
        };

        match transport.consume(&descriptor, owner).await {
            Ok(Some(track)) => {
                self.consumers
                    .insert(descriptor.id.clone(), track.clone());
                let event = ClientEvent::ResumeConsumer {
                    consumer_id: descriptor.id.clone(),
                    room_id: self.settings.room_id.clone(),
                };
                self.send_request(
                    event,
                    Pending::Resume {
                        consumer_id: descriptor.id.clone(),
                    },
                )
                .await;

                info!(
                    target: "session.negotiator",
                    consumer_id = %descriptor.id,
                    producer_id = %descriptor.producer_id,
                    owner = %owner,
                    kind = %descriptor.kind,
                    "Remote track added"
                );
                self.emit(SessionEvent::TrackAdded(track));
            }
            Ok(None) => {
                warn!(
                    target: "session.negotiator",
                    consumer_id = %descriptor.id,
                    producer_id = %descriptor.producer_id,
                    "Consumer delivered no media track, closing it"
                );
                // Only the local side can be released here. The registry
                // consumer stays paused until its transport closes.
                transport.close_consumer(&descriptor.id);
            }
            Err(e) => {
                warn!(
                    target: "session.negotiator",
                    consumer_id = %descriptor.id,
                    error = %e,
                    "Consumer setup failed"
                );
                transport.close_consumer(&descriptor.id);
                self.emit(SessionEvent::Error(e.into()));
            }
        }
    }

    fn close_consumer(&mut self, consumer_id: &ConsumerId) {
        let Some(track) = self.consumers.remove(consumer_id) else {
            return;
        };
        if let Some(recv) = &self.recv_transport {
            recv.transport.close_consumer(consumer_id);
        }
        debug!(
            target: "session.negotiator",
            consumer_id = %consumer_id,
            producer_id = %track.producer_id,
            "Remote track removed"
        );
        self.emit(SessionEvent::TrackRemoved(track));
    }

    fn handle_producer_closed(&mut self, producer_id: &ProducerId) {
        self.pending_tracks.remove_producer(producer_id);
        self.producers.remove(producer_id);

        let closed: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, t)| &t.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in closed {
            self.close_consumer(&consumer_id);
        }
    }

    fn handle_participant_left(&mut self, user_id: ParticipantId) {
        if self.state == SessionState::Idle {
            return;
        }

        self.pending_tracks.remove_owner(&user_id);
        let closed: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, t)| t.owner == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in closed {
            self.close_consumer(&consumer_id);
        }

        self.emit(SessionEvent::ParticipantLeft { user_id });
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn is_session_active(&self) -> bool {
        matches!(
            self.state,
            SessionState::TransportsPending | SessionState::Active
        )
    }

    fn handle_transport_state(&mut self, update: TransportStateUpdate) {
        if !self.is_current(update.role, &update.transport_id) {
            return;
        }

        debug!(
            target: "session.negotiator",
            role = %update.role,
            transport_id = %update.transport_id,
            state = %update.state,
            "Transport connection state changed"
        );

        let active = self.is_session_active();
        let decision = self.recovery.observe(update.role, update.state, active);
        self.apply_recovery_decision(update.role, decision);
    }

    /// A retry's transport request was rejected, so no state change will
    /// ever arrive for it. Surface the error and schedule the next attempt.
    fn handle_retry_rejected(&mut self, role: TransportRole, error: SessionError) {
        warn!(
            target: "session.recovery",
            role = %role,
            error = %error,
            "Transport retry rejected"
        );
        self.emit(SessionEvent::Error(error));

        let active = self.is_session_active();
        let decision = self.recovery.retry_rejected(role, active);
        self.apply_recovery_decision(role, decision);
    }

    fn apply_recovery_decision(&mut self, role: TransportRole, decision: RecoveryDecision) {
        match decision {
            RecoveryDecision::Scheduled { attempt, delay } => {
                self.emit(SessionEvent::RecoveryScheduled {
                    role,
                    attempt,
                    delay,
                });
            }
            RecoveryDecision::GaveUp { attempts } => {
                self.emit(SessionEvent::RecoveryExhausted { role, attempts });
                self.emit(SessionEvent::Error(SessionError::RecoveryExhausted {
                    role,
                    attempts,
                }));
            }
            RecoveryDecision::Reset | RecoveryDecision::Ignored => {}
        }
    }

    async fn handle_recovery_trigger(&mut self, trigger: RecoveryTrigger) {
        if !self.recovery.accept(trigger) || !self.is_session_active() {
            return;
        }

        info!(
            target: "session.recovery",
            role = %trigger.role,
            attempt = trigger.attempt,
            "Recreating transport over relay"
        );
        self.request_transport(trigger.role, true).await;
    }

    // ------------------------------------------------------------------
    // Local controls
    // ------------------------------------------------------------------

    fn toggle_track(&self, kind: MediaKind) -> Result<bool, SessionError> {
        let tracks: Vec<&LocalTrack> = self
            .local_tracks
            .iter()
            .filter(|t| t.kind() == kind)
            .collect();
        let Some(first) = tracks.first() else {
            return Err(SessionError::NoLocalTrack(kind));
        };

        let enabled = !first.is_enabled();
        for track in tracks {
            track.set_enabled(enabled);
        }
        debug!(target: "session.negotiator", kind = %kind, enabled, "Local track toggled");
        Ok(enabled)
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            mode: self.mode,
            room_id: self.settings.room_id.clone(),
            user_id: self.settings.user_id.clone(),
            send_transport: self
                .send_transport
                .as_ref()
                .map(|t| t.transport.id().clone()),
            recv_transport: self
                .recv_transport
                .as_ref()
                .map(|t| t.transport.id().clone()),
            local_tracks: self
                .local_tracks
                .iter()
                .map(|t| LocalTrackInfo {
                    id: t.id().to_string(),
                    kind: t.kind(),
                    enabled: t.is_enabled(),
                })
                .collect(),
            published: self
                .producers
                .iter()
                .map(|(id, kind)| (id.clone(), *kind))
                .collect(),
            remote_tracks: self.consumers.values().cloned().collect(),
            pending_tracks: self.pending_tracks.len(),
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn set_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to);
        debug!(
            target: "session.negotiator",
            from = %from,
            to = %to,
            "Session state changed"
        );
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn transport_slot(&self, role: TransportRole) -> Option<&SessionTransport> {
        match role {
            TransportRole::Send => self.send_transport.as_ref(),
            TransportRole::Recv => self.recv_transport.as_ref(),
        }
    }

    fn transport_slot_mut(&mut self, role: TransportRole) -> &mut Option<SessionTransport> {
        match role {
            TransportRole::Send => &mut self.send_transport,
            TransportRole::Recv => &mut self.recv_transport,
        }
    }

    fn current_transport(
        &self,
        role: TransportRole,
        transport_id: &TransportId,
    ) -> Option<Arc<dyn ClientTransport>> {
        self.transport_slot(role)
            .filter(|t| t.transport.id() == transport_id)
            .map(|t| Arc::clone(&t.transport))
    }

    fn is_current(&self, role: TransportRole, transport_id: &TransportId) -> bool {
        self.transport_slot(role)
            .is_some_and(|t| t.transport.id() == transport_id)
    }
}

fn registry_error(operation: &'static str, error: WireError) -> SessionError {
    SessionError::Registry { operation, error }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RecoverySettings;
    use crate::errors::{DeviceError, MediaAcquisitionError};
    use crate::media::loopback::{LoopbackDevice, LoopbackMedia};
    use common::types::RoomId;
    use serde_json::json;
    use signaling_protocol::link::{link_pair, ServerLink};
    use signaling_protocol::{
        AckResult, ConsumerDescriptor, ErrorKind, MediaParams, NegotiationParams,
        PublicationInfo,
    };
    use std::time::Duration;

    const STEP: Duration = Duration::from_secs(2);

    /// Plays the registry side of a link by hand.
    struct ScriptedServer {
        link: ServerLink,
    }

    impl ScriptedServer {
        async fn expect(&mut self, event_name: &str) -> ClientEnvelope {
            let envelope = tokio::time::timeout(STEP, self.link.inbound.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("client link closed");
            assert_eq!(envelope.event.name(), event_name, "got {envelope:?}");
            envelope
        }

        fn push(&self, event: ServerEvent) {
            assert!(self.link.outbound.send_event(event));
        }

        fn ack(&self, envelope: &ClientEnvelope, result: Result<AckBody, WireError>) {
            let request_id = envelope.request_id.expect("request without id");
            assert!(self.link.outbound.send_ack(request_id, AckResult::from(result)));
        }

        fn ack_done(&self, envelope: &ClientEnvelope) {
            self.ack(envelope, Ok(AckBody::Done));
        }

        async fn answer_join(&mut self) {
            let join = self.expect("getRouterRtpCapabilities").await;
            self.push(ServerEvent::RouterRtpCapabilities {
                rtp_capabilities: router_capabilities(),
            });
            self.ack_done(&join);
        }

        /// Answer one transport request; returns the new transport id.
        async fn answer_transport(&mut self) -> (TransportRole, TransportId) {
            let request = self.expect("createWebRtcTransport").await;
            let ClientEvent::CreateWebRtcTransport { role, .. } = request.event else {
                unreachable!();
            };
            let id = TransportId::generate();
            self.push(ServerEvent::TransportCreated(TransportDescriptor {
                role,
                id: id.clone(),
                params: NegotiationParams(json!({"iceCandidates": []})),
            }));
            self.ack_done(&request);
            (role, id)
        }

        async fn answer_connect(&mut self) -> TransportId {
            let connect = self.expect("connectWebRtcTransport").await;
            let ClientEvent::ConnectWebRtcTransport { transport_id, .. } = connect.event.clone()
            else {
                unreachable!();
            };
            self.ack_done(&connect);
            transport_id
        }
    }

    fn router_capabilities() -> MediaCapabilities {
        MediaCapabilities(json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
            ]
        }))
    }

    fn spawn_session(
        media: LoopbackMedia,
        device: Arc<LoopbackDevice>,
    ) -> (SessionHandle, ScriptedServer, broadcast::Receiver<SessionEvent>) {
        let (client, server) = link_pair();
        let settings = SessionSettings::new(RoomId::new("r1"), ParticipantId::new("alice"))
            .with_recovery(RecoverySettings {
                send_backoff: Duration::from_millis(20),
                recv_backoff: Duration::from_millis(30),
                max_attempts: 2,
            });
        let (handle, _task) = SessionActor::spawn(
            settings,
            client,
            Arc::new(media),
            device,
            CancellationToken::new(),
        );
        let events = handle.subscribe();
        (handle, ScriptedServer { link: server }, events)
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<SessionEvent>,
        predicate: impl Fn(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(STEP, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    async fn wait_for_snapshot(
        handle: &SessionHandle,
        predicate: impl Fn(&SessionSnapshot) -> bool,
    ) -> SessionSnapshot {
        tokio::time::timeout(STEP, async {
            loop {
                let snapshot = handle.snapshot().await.unwrap();
                if predicate(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never reached the expected snapshot")
    }

    /// Drive a spectator session to `Active`; returns the recv transport id.
    async fn join_spectator(
        handle: &SessionHandle,
        server: &mut ScriptedServer,
    ) -> TransportId {
        let join = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join(JoinMode::Spectator).await })
        };
        server.answer_join().await;
        let (role, id) = server.answer_transport().await;
        assert_eq!(role, TransportRole::Recv);
        server.answer_connect().await;
        let list = server.expect("getProducers").await;
        server.push(ServerEvent::ExistingProducers {
            producers: Vec::new(),
        });
        server.ack_done(&list);
        join.await.unwrap().unwrap();
        id
    }

    fn publication(producer: &ProducerId, owner: &str, kind: MediaKind) -> PublicationInfo {
        PublicationInfo {
            producer_id: producer.clone(),
            producer_owner_identity: ParticipantId::new(owner),
            kind,
        }
    }

    fn consumer_for(envelope: &ClientEnvelope) -> ConsumerDescriptor {
        let ClientEvent::Consume {
            remote_producer_id, ..
        } = &envelope.event
        else {
            unreachable!();
        };
        ConsumerDescriptor {
            id: ConsumerId::generate(),
            producer_id: remote_producer_id.clone(),
            kind: MediaKind::Audio,
            media_params: MediaParams(json!({"codecs": [{"mimeType": "audio/opus"}]})),
        }
    }

    #[tokio::test]
    async fn test_publisher_join_sequence() {
        let device = Arc::new(LoopbackDevice::new());
        let (handle, mut server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::clone(&device));

        let join = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join(JoinMode::Publisher).await })
        };

        let request = server.expect("getRouterRtpCapabilities").await;
        assert!(matches!(
            request.event,
            ClientEvent::GetRouterRtpCapabilities { is_spectator: false, .. }
        ));
        server.push(ServerEvent::RouterRtpCapabilities {
            rtp_capabilities: router_capabilities(),
        });
        server.ack_done(&request);

        let (first, _) = server.answer_transport().await;
        let (second, _) = server.answer_transport().await;
        assert_eq!(first, TransportRole::Send);
        assert_eq!(second, TransportRole::Recv);

        // Both connect steps go out before either is acked
        let connect_send = server.expect("connectWebRtcTransport").await;
        let connect_recv = server.expect("connectWebRtcTransport").await;
        server.ack_done(&connect_send);
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let produce = server.expect("produce").await;
            let ClientEvent::Produce {
                kind: produced, ..
            } = &produce.event
            else {
                unreachable!();
            };
            assert_eq!(*produced, kind);
            server.ack(
                &produce,
                Ok(AckBody::Producer {
                    id: ProducerId::generate(),
                }),
            );
        }

        server.ack_done(&connect_recv);
        let list = server.expect("getProducers").await;
        server.ack_done(&list);

        join.await.unwrap().unwrap();
        assert_eq!(handle.state().await.unwrap(), SessionState::Active);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::StateChanged { to, .. } = event {
                states.push(to);
            }
        }
        assert_eq!(
            states,
            vec![
                SessionState::AcquiringMedia,
                SessionState::Connecting,
                SessionState::DeviceReady,
                SessionState::TransportsPending,
                SessionState::Active,
            ]
        );

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.published.len(), 2);
        assert_eq!(snapshot.local_tracks.len(), 2);
        assert_eq!(device.transports().len(), 2);
    }

    #[tokio::test]
    async fn test_media_failure_returns_to_idle() {
        let (handle, mut server, _events) = spawn_session(
            LoopbackMedia::failing(MediaAcquisitionError::PermissionDenied),
            Arc::new(LoopbackDevice::new()),
        );

        let err = handle.join(JoinMode::Publisher).await.unwrap_err();
        assert_eq!(err, MediaAcquisitionError::PermissionDenied.into());
        assert_eq!(handle.state().await.unwrap(), SessionState::Idle);

        // Nothing reached the registry
        assert!(server.link.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_device_load_failure_aborts_join() {
        let (handle, mut server, _events) = spawn_session(
            LoopbackMedia::new(),
            Arc::new(LoopbackDevice::new().rejecting_capabilities()),
        );

        let join = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join(JoinMode::Publisher).await })
        };
        server.answer_join().await;
        server.expect("leaveRoom").await;

        let err = join.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Device(DeviceError::UnsupportedCapabilities(_))
        ));
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(snapshot.local_tracks.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejection_fails_join() {
        let (handle, mut server, _events) =
            spawn_session(LoopbackMedia::new(), Arc::new(LoopbackDevice::new()));

        let join = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join(JoinMode::Spectator).await })
        };
        server.answer_join().await;
        server.answer_transport().await;
        let connect = server.expect("connectWebRtcTransport").await;
        server.ack(
            &connect,
            Err(WireError::new(ErrorKind::TransportNotFound, "Transport not found")),
        );

        let err = join.await.unwrap().unwrap_err();
        assert_eq!(err.wire_kind(), Some(ErrorKind::TransportNotFound));
        assert_eq!(handle.state().await.unwrap(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_tracks_announced_early_are_queued_then_drained_in_order() {
        let (handle, mut server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::new(LoopbackDevice::new()));

        let join = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join(JoinMode::Spectator).await })
        };
        server.answer_join().await;
        server.answer_transport().await;

        let p1 = ProducerId::generate();
        let p2 = ProducerId::generate();
        server.push(ServerEvent::NewProducer(publication(&p1, "bob", MediaKind::Audio)));
        server.push(ServerEvent::NewProducer(publication(&p2, "carol", MediaKind::Audio)));
        // Own tracks are never queued
        server.push(ServerEvent::NewProducer(publication(
            &ProducerId::generate(),
            "alice",
            MediaKind::Video,
        )));

        let connect = server.expect("connectWebRtcTransport").await;
        wait_for_snapshot(&handle, |s| s.pending_tracks == 2).await;
        server.ack_done(&connect);

        let first = server.expect("consume").await;
        let second = server.expect("consume").await;
        assert!(matches!(&first.event, ClientEvent::Consume { remote_producer_id, .. } if remote_producer_id == &p1));
        assert!(matches!(&second.event, ClientEvent::Consume { remote_producer_id, .. } if remote_producer_id == &p2));

        // The listing repeats p1; it must not be consumed twice
        let list = server.expect("getProducers").await;
        server.push(ServerEvent::ExistingProducers {
            producers: vec![publication(&p1, "bob", MediaKind::Audio)],
        });
        server.ack_done(&list);
        join.await.unwrap().unwrap();

        server.ack(&first, Ok(AckBody::Consumer(consumer_for(&first))));
        server.expect("resumeConsumer").await;
        server.ack(&second, Ok(AckBody::Consumer(consumer_for(&second))));
        server.expect("resumeConsumer").await;

        let added = next_matching(&mut events, |e| matches!(e, SessionEvent::TrackAdded(_))).await;
        assert!(matches!(added, SessionEvent::TrackAdded(t) if t.producer_id == p1));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.remote_tracks.len(), 2);
        assert_eq!(snapshot.pending_tracks, 0);
        assert!(server.link.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_producer_removes_track_idempotently() {
        let (handle, mut server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::new(LoopbackDevice::new()));
        join_spectator(&handle, &mut server).await;

        let producer = ProducerId::generate();
        server.push(ServerEvent::NewProducer(publication(&producer, "bob", MediaKind::Audio)));
        let consume = server.expect("consume").await;
        let descriptor = consumer_for(&consume);
        server.ack(&consume, Ok(AckBody::Consumer(descriptor.clone())));
        server.expect("resumeConsumer").await;
        next_matching(&mut events, |e| matches!(e, SessionEvent::TrackAdded(_))).await;

        server.push(ServerEvent::ConsumerClosed {
            consumer_id: descriptor.id.clone(),
            producer_id: producer.clone(),
        });
        server.push(ServerEvent::ProducerClosed {
            producer_id: producer.clone(),
        });
        server.push(ServerEvent::ParticipantLeft {
            user_id: ParticipantId::new("bob"),
        });

        let removed =
            next_matching(&mut events, |e| matches!(e, SessionEvent::TrackRemoved(_))).await;
        assert!(matches!(removed, SessionEvent::TrackRemoved(t) if t.consumer_id == descriptor.id));
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::ParticipantLeft { user_id } if user_id.as_str() == "bob")
        })
        .await;

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.remote_tracks.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_without_track_is_closed() {
        let device = Arc::new(LoopbackDevice::new().dropping_tracks());
        let (handle, mut server, _events) = spawn_session(LoopbackMedia::new(), Arc::clone(&device));
        join_spectator(&handle, &mut server).await;

        server.push(ServerEvent::NewProducer(publication(
            &ProducerId::generate(),
            "bob",
            MediaKind::Audio,
        )));
        let consume = server.expect("consume").await;
        server.ack(&consume, Ok(AckBody::Consumer(consumer_for(&consume))));

        let snapshot = handle.snapshot().await.unwrap();
        assert!(snapshot.remote_tracks.is_empty());
        // Not resumed, not retried
        assert!(server.link.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_consume_error_is_ignored() {
        let (handle, mut server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::new(LoopbackDevice::new()));
        join_spectator(&handle, &mut server).await;

        server.push(ServerEvent::NewProducer(publication(
            &ProducerId::generate(),
            "bob",
            MediaKind::Audio,
        )));
        let consume = server.expect("consume").await;
        server.ack(
            &consume,
            Err(WireError::new(ErrorKind::ProducerNotFound, "Producer not found")),
        );

        assert_eq!(handle.state().await.unwrap(), SessionState::Active);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Error(_)), "{event:?}");
        }
    }

    #[tokio::test]
    async fn test_leave_tears_down_and_ignores_late_acks() {
        let device = Arc::new(LoopbackDevice::new());
        let (handle, mut server, _events) = spawn_session(LoopbackMedia::new(), Arc::clone(&device));
        join_spectator(&handle, &mut server).await;

        server.push(ServerEvent::NewProducer(publication(
            &ProducerId::generate(),
            "bob",
            MediaKind::Audio,
        )));
        let consume = server.expect("consume").await;

        handle.leave().await.unwrap();
        let leave = server.expect("leaveRoom").await;
        server.ack_done(&leave);

        // The consume ack lands after the session left
        server.ack(&consume, Ok(AckBody::Consumer(consumer_for(&consume))));

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert!(snapshot.remote_tracks.is_empty());
        assert!(snapshot.recv_transport.is_none());
        assert!(device.transports().iter().all(|t| t.is_closed()));
        assert!(server.link.inbound.try_recv().is_err());

        // Leaving again is a no-op
        handle.leave().await.unwrap();
        assert!(server.link.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_twice_is_rejected() {
        let (handle, mut server, _events) =
            spawn_session(LoopbackMedia::new(), Arc::new(LoopbackDevice::new()));
        join_spectator(&handle, &mut server).await;

        let err = handle.join(JoinMode::Spectator).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidState {
                operation: "join",
                state: "active"
            }
        );
    }

    #[tokio::test]
    async fn test_toggle_flips_enabled_flag_only() {
        let (handle, mut server, _events) =
            spawn_session(LoopbackMedia::with_kinds(&[MediaKind::Audio]), Arc::new(LoopbackDevice::new()));

        let join = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.join(JoinMode::Publisher).await })
        };
        server.answer_join().await;
        server.answer_transport().await;
        server.answer_transport().await;
        let connect_send = server.expect("connectWebRtcTransport").await;
        let connect_recv = server.expect("connectWebRtcTransport").await;
        server.ack_done(&connect_send);
        let produce = server.expect("produce").await;
        server.ack(&produce, Ok(AckBody::Producer { id: ProducerId::generate() }));
        server.ack_done(&connect_recv);
        let list = server.expect("getProducers").await;
        server.ack_done(&list);
        join.await.unwrap().unwrap();

        assert!(!handle.toggle_audio().await.unwrap());
        assert!(handle.toggle_audio().await.unwrap());
        assert_eq!(
            handle.toggle_video().await.unwrap_err(),
            SessionError::NoLocalTrack(MediaKind::Video)
        );
        // No renegotiation
        assert!(server.link.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_recv_transport_is_recreated_over_relay() {
        let device = Arc::new(LoopbackDevice::new());
        let (handle, mut server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::clone(&device));
        let first = join_spectator(&handle, &mut server).await;

        device
            .latest_transport(TransportRole::Recv)
            .unwrap()
            .fail();
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::RecoveryScheduled { role: TransportRole::Recv, attempt: 1, .. })
        })
        .await;

        let retry = server.expect("createWebRtcTransport").await;
        assert!(matches!(
            retry.event,
            ClientEvent::CreateWebRtcTransport {
                role: TransportRole::Recv,
                force_tcp: true,
                ice_transport_policy: Some(IceTransportPolicy::Relay),
                ..
            }
        ));
        let second = TransportId::generate();
        server.push(ServerEvent::TransportCreated(TransportDescriptor {
            role: TransportRole::Recv,
            id: second.clone(),
            params: NegotiationParams(json!({})),
        }));
        server.ack_done(&retry);
        assert_eq!(server.answer_connect().await, second);
        server.expect("getProducers").await;

        let old = device.transports().into_iter().find(|t| t.id() == &first).unwrap();
        assert!(old.is_closed());
        let latest = device.latest_transport(TransportRole::Recv).unwrap();
        assert_eq!(latest.ice_transport_policy(), IceTransportPolicy::Relay);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.recv_transport, Some(second));
    }

    #[tokio::test]
    async fn test_rejected_retry_schedules_next_attempt_until_exhausted() {
        let device = Arc::new(LoopbackDevice::new());
        let (handle, mut server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::clone(&device));
        join_spectator(&handle, &mut server).await;

        device
            .latest_transport(TransportRole::Recv)
            .unwrap()
            .fail();
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::RecoveryScheduled { role: TransportRole::Recv, attempt: 1, .. })
        })
        .await;

        let retry = server.expect("createWebRtcTransport").await;
        server.ack(
            &retry,
            Err(WireError::new(ErrorKind::MediaEngine, "router busy")),
        );
        next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
        next_matching(&mut events, |e| {
            matches!(e, SessionEvent::RecoveryScheduled { role: TransportRole::Recv, attempt: 2, .. })
        })
        .await;

        let retry = server.expect("createWebRtcTransport").await;
        assert!(matches!(
            retry.event,
            ClientEvent::CreateWebRtcTransport {
                force_tcp: true,
                ice_transport_policy: Some(IceTransportPolicy::Relay),
                ..
            }
        ));
        server.ack(
            &retry,
            Err(WireError::new(ErrorKind::MediaEngine, "router busy")),
        );
        let exhausted = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::RecoveryExhausted { .. })
        })
        .await;
        assert_eq!(
            exhausted,
            SessionEvent::RecoveryExhausted {
                role: TransportRole::Recv,
                attempts: 2,
            }
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.link.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_link_close_returns_to_idle_with_error() {
        let (handle, server, mut events) =
            spawn_session(LoopbackMedia::new(), Arc::new(LoopbackDevice::new()));
        drop(server);

        let err = next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
        assert_eq!(err, SessionEvent::Error(SessionError::Link(LinkError::Closed)));
        assert!(handle.join(JoinMode::Spectator).await.is_err());
    }
}

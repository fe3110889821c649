//! `ConnectionActor` - per-signaling-connection actor.
//!
//! Each `ConnectionActor`:
//! - Serves exactly one signaling link
//! - Decodes client events into room actor calls
//! - Acks every request that carries a request id
//! - Tracks which rooms the connection joined, under which identity
//!
//! # Lifecycle
//!
//! 1. Created by [`RegistryActorHandle::accept`](super::RegistryActorHandle::accept)
//! 2. Runs until the client side of the link closes or the registry is cancelled
//! 3. On exit, leaves every room it joined, guarded by its connection id so a
//!    participant that already rebound to a newer connection is left alone

use crate::errors::RegistryError;
use crate::observability::metrics as prom;

use super::messages::{JoinRequest, LeaveOutcome, TransportRequest};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::registry::RegistryActorHandle;
use super::room::RoomActorHandle;

use common::types::{ConnectionId, ParticipantId, RoomId};
use signaling_protocol::link::{OutboundSender, ServerLink};
use signaling_protocol::{
    AckBody, AckResult, ClientEnvelope, ClientEvent, ServerEvent, TransportRole,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Attempts at joining a room that is closing underneath us.
const JOIN_ATTEMPTS: usize = 3;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    cancel_token: CancellationToken,
    connection_id: ConnectionId,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Close the connection; rooms are left as on a client disconnect.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// One room this connection participates in.
struct Membership {
    participant_id: ParticipantId,
    room: RoomActorHandle,
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: ConnectionId,
    inbound: mpsc::Receiver<ClientEnvelope>,
    outbound: OutboundSender,
    registry: RegistryActorHandle,
    memberships: HashMap<RoomId, Membership>,
    /// Cancellation token (child of the registry's token).
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: ConnectionId,
        link: ServerLink,
        registry: RegistryActorHandle,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        metrics.connection_created();

        let actor = Self {
            connection_id: connection_id.clone(),
            inbound: link.inbound,
            outbound: link.outbound,
            registry,
            memberships: HashMap::new(),
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, connection_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "rr.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "rr.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "rr.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.inbound.recv() => {
                    match msg {
                        Some(envelope) => {
                            self.mailbox.record_enqueue();
                            self.handle_envelope(envelope).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            debug!(
                                target: "rr.actor.connection",
                                connection_id = %self.connection_id,
                                "Client link closed"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.leave_all().await;
        self.metrics.connection_closed();

        info!(
            target: "rr.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    async fn handle_envelope(&mut self, envelope: ClientEnvelope) {
        let ClientEnvelope { request_id, event } = envelope;
        let event_name = event.name();
        let role = match &event {
            ClientEvent::CreateWebRtcTransport { role, .. } => Some(*role),
            _ => None,
        };

        let start = Instant::now();
        let result = self.dispatch(event).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind().as_str(),
        };
        prom::record_request(event_name, outcome, start.elapsed());

        match (request_id, result) {
            (Some(request_id), result) => {
                let result = result.map_err(|e| {
                    self.log_failure(event_name, &e);
                    e.to_wire()
                });
                self.outbound
                    .send_ack(request_id, AckResult::from(result));
            }
            (None, Ok(_)) => {}
            (None, Err(e)) => {
                self.log_failure(event_name, &e);
                self.outbound.send_event(ServerEvent::Error {
                    message: e.client_message(),
                    kind: e.kind(),
                    role,
                });
            }
        }
    }

    fn log_failure(&self, event_name: &str, error: &RegistryError) {
        if error.kind().is_stale_reference() {
            debug!(
                target: "rr.actor.connection",
                connection_id = %self.connection_id,
                event = event_name,
                error = %error,
                "Request referenced a missing object"
            );
        } else {
            warn!(
                target: "rr.actor.connection",
                connection_id = %self.connection_id,
                event = event_name,
                error = %error,
                error_code = error.error_code(),
                "Request failed"
            );
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<AckBody, RegistryError> {
        match event {
            ClientEvent::GetRouterRtpCapabilities {
                room_id,
                user_id,
                is_spectator,
            } => {
                let rtp_capabilities = self.join(room_id, user_id, is_spectator).await?;
                self.outbound
                    .send_event(ServerEvent::RouterRtpCapabilities { rtp_capabilities });
                Ok(AckBody::Done)
            }

            ClientEvent::CreateWebRtcTransport {
                role,
                room_id,
                user_id,
                force_tcp,
                ice_transport_policy,
            } => {
                debug!(
                    target: "rr.actor.connection",
                    room_id = %room_id,
                    user_id = %user_id,
                    role = %role,
                    force_tcp,
                    ice_transport_policy = ?ice_transport_policy,
                    "Creating transport"
                );
                let descriptor = self
                    .create_transport(room_id, user_id, role, force_tcp)
                    .await?;
                self.outbound
                    .send_event(ServerEvent::TransportCreated(descriptor));
                Ok(AckBody::Done)
            }

            ClientEvent::ConnectWebRtcTransport {
                transport_id,
                security_params,
                room_id,
            } => {
                let room = self.room(&room_id).await?;
                room.connect_transport(transport_id, security_params)
                    .await
                    .map_err(|e| closing_as_not_found(e, &room_id))?;
                Ok(AckBody::Done)
            }

            ClientEvent::Produce {
                transport_id,
                kind,
                media_params,
                room_id,
                user_id,
            } => {
                if user_id.is_empty() {
                    return Err(RegistryError::MissingIdentity);
                }
                let room = self.room(&room_id).await?;
                let id = room
                    .produce(user_id, transport_id, kind, media_params)
                    .await
                    .map_err(|e| closing_as_not_found(e, &room_id))?;
                Ok(AckBody::Producer { id })
            }

            ClientEvent::GetProducers { room_id, user_id } => {
                let room = self.room(&room_id).await?;
                let producers = room
                    .list_producers(user_id)
                    .await
                    .map_err(|e| closing_as_not_found(e, &room_id))?;
                self.outbound
                    .send_event(ServerEvent::ExistingProducers { producers });
                Ok(AckBody::Done)
            }

            ClientEvent::Consume {
                capabilities,
                remote_producer_id,
                transport_id,
                room_id,
            } => {
                let room = self.room(&room_id).await?;
                let descriptor = room
                    .consume(transport_id, remote_producer_id, capabilities)
                    .await
                    .map_err(|e| closing_as_not_found(e, &room_id))?;
                Ok(AckBody::Consumer(descriptor))
            }

            ClientEvent::ResumeConsumer {
                consumer_id,
                room_id,
            } => {
                let room = self.room(&room_id).await?;
                room.resume_consumer(consumer_id)
                    .await
                    .map_err(|e| closing_as_not_found(e, &room_id))?;
                Ok(AckBody::Done)
            }

            ClientEvent::LeaveRoom { room_id, user_id } => {
                self.leave(room_id, user_id).await;
                Ok(AckBody::Done)
            }
        }
    }

    /// Join `room_id`, creating the room if needed.
    ///
    /// A room that drained its last member between lookup and join is
    /// replaced by the registry, so the join is retried.
    async fn join(
        &mut self,
        room_id: RoomId,
        participant_id: ParticipantId,
        is_spectator: bool,
    ) -> Result<signaling_protocol::MediaCapabilities, RegistryError> {
        if participant_id.is_empty() {
            return Err(RegistryError::MissingIdentity);
        }

        let mut last_error = RegistryError::RoomClosing;
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.registry.get_or_create_room(room_id.clone()).await?;
            let request = JoinRequest {
                participant_id: participant_id.clone(),
                connection_id: self.connection_id.clone(),
                outbound: self.outbound.clone(),
                is_spectator,
            };

            match room.join(request).await {
                Ok(capabilities) => {
                    self.remember(room_id, participant_id, room);
                    return Ok(capabilities);
                }
                Err(RegistryError::RoomClosing) => {
                    debug!(
                        target: "rr.actor.connection",
                        room_id = %room_id,
                        "Room closed during join, retrying"
                    );
                    last_error = RegistryError::RoomClosing;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn create_transport(
        &mut self,
        room_id: RoomId,
        participant_id: ParticipantId,
        role: TransportRole,
        force_tcp: bool,
    ) -> Result<signaling_protocol::TransportDescriptor, RegistryError> {
        if participant_id.is_empty() {
            return Err(RegistryError::MissingIdentity);
        }

        let room = self.room(&room_id).await?;
        let options = self.registry.network_options(force_tcp).await;
        let request = TransportRequest {
            participant_id: participant_id.clone(),
            connection_id: self.connection_id.clone(),
            outbound: self.outbound.clone(),
            role,
            options,
        };

        let descriptor = room
            .create_transport(request)
            .await
            .map_err(|e| closing_as_not_found(e, &room_id))?;
        self.remember(room_id, participant_id, room);
        Ok(descriptor)
    }

    async fn leave(&mut self, room_id: RoomId, participant_id: ParticipantId) {
        if self
            .memberships
            .get(&room_id)
            .is_some_and(|m| m.participant_id == participant_id)
        {
            self.memberships.remove(&room_id);
        }

        let room = match self.registry.lookup_room(room_id.clone()).await {
            Ok(Some(room)) => room,
            Ok(None) | Err(_) => return,
        };

        match room.leave(participant_id.clone(), None).await {
            Ok(LeaveOutcome::Left) => {
                info!(
                    target: "rr.actor.connection",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    "Participant left room"
                );
            }
            Ok(LeaveOutcome::NotPresent) | Err(_) => {
                debug!(
                    target: "rr.actor.connection",
                    room_id = %room_id,
                    participant_id = %participant_id,
                    "Leave for absent participant"
                );
            }
        }
    }

    /// Leave every joined room on connection loss.
    async fn leave_all(&mut self) {
        for (room_id, membership) in self.memberships.drain() {
            match membership
                .room
                .leave(
                    membership.participant_id.clone(),
                    Some(self.connection_id.clone()),
                )
                .await
            {
                Ok(LeaveOutcome::Left) => {
                    info!(
                        target: "rr.actor.connection",
                        connection_id = %self.connection_id,
                        room_id = %room_id,
                        participant_id = %membership.participant_id,
                        "Participant removed after connection loss"
                    );
                }
                Ok(LeaveOutcome::NotPresent) => {
                    debug!(
                        target: "rr.actor.connection",
                        room_id = %room_id,
                        participant_id = %membership.participant_id,
                        "Participant already rebound or gone"
                    );
                }
                Err(_) => {}
            }
        }
    }

    async fn room(&self, room_id: &RoomId) -> Result<RoomActorHandle, RegistryError> {
        self.registry
            .lookup_room(room_id.clone())
            .await?
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.clone()))
    }

    fn remember(&mut self, room_id: RoomId, participant_id: ParticipantId, room: RoomActorHandle) {
        self.memberships.insert(
            room_id,
            Membership {
                participant_id,
                room,
            },
        );
    }
}

/// A room that shut down mid-request no longer exists for the client.
fn closing_as_not_found(error: RegistryError, room_id: &RoomId) -> RegistryError {
    match error {
        RegistryError::RoomClosing => RegistryError::RoomNotFound(room_id.clone()),
        other => other,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::registry::RegistrySettings;
    use crate::media::loopback::{router_capabilities, LoopbackEngine};
    use crate::network::AddressResolver;
    use signaling_protocol::link::{link_pair, ClientLink};
    use signaling_protocol::{ErrorKind, ServerMessage};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn registry() -> RegistryActorHandle {
        RegistryActorHandle::new(
            "rr-test".to_string(),
            Arc::new(LoopbackEngine::default()),
            Arc::new(AddressResolver::fixed(IpAddr::V4(Ipv4Addr::LOCALHOST))),
            RegistrySettings::default(),
            ActorMetrics::new(),
        )
    }

    async fn next(link: &mut ClientLink) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), link.inbound.recv())
            .await
            .expect("timed out waiting for server frame")
            .expect("link closed")
    }

    async fn join(link: &mut ClientLink, request_id: u64, room: &str, user: &str) {
        link.outbound
            .send(ClientEnvelope::request(
                request_id,
                ClientEvent::GetRouterRtpCapabilities {
                    room_id: RoomId::new(room),
                    user_id: ParticipantId::new(user),
                    is_spectator: false,
                },
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_join_pushes_capabilities_then_acks() {
        let registry = registry();
        let (mut client, server) = link_pair();
        let (_handle, _task) = registry.accept(server);

        join(&mut client, 1, "r1", "alice").await;

        assert_eq!(
            next(&mut client).await,
            ServerMessage::Event(ServerEvent::RouterRtpCapabilities {
                rtp_capabilities: router_capabilities(),
            })
        );
        assert_eq!(
            next(&mut client).await,
            ServerMessage::Ack {
                request_id: 1,
                result: AckResult::Ok(AckBody::Done),
            }
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_missing_identity_is_acked_as_error() {
        let registry = registry();
        let (mut client, server) = link_pair();
        let (_handle, _task) = registry.accept(server);

        join(&mut client, 3, "r1", "").await;

        let reply = next(&mut client).await;
        assert!(matches!(
            reply,
            ServerMessage::Ack { request_id: 3, result: AckResult::Error(ref e) }
                if e.kind == ErrorKind::MissingIdentity
        ));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_transport_failure_without_request_id_reports_role() {
        let registry = registry();
        let (mut client, server) = link_pair();
        let (_handle, _task) = registry.accept(server);

        client
            .outbound
            .send(ClientEnvelope::notify(ClientEvent::CreateWebRtcTransport {
                role: TransportRole::Recv,
                room_id: RoomId::new("missing"),
                user_id: ParticipantId::new("alice"),
                force_tcp: false,
                ice_transport_policy: None,
            }))
            .await
            .unwrap();

        assert_eq!(
            next(&mut client).await,
            ServerMessage::Event(ServerEvent::Error {
                message: "Room not found".to_string(),
                kind: ErrorKind::RoomNotFound,
                role: Some(TransportRole::Recv),
            })
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_transport_created_event_precedes_ack() {
        let registry = registry();
        let (mut client, server) = link_pair();
        let (_handle, _task) = registry.accept(server);

        join(&mut client, 1, "r1", "alice").await;
        next(&mut client).await;
        next(&mut client).await;

        client
            .outbound
            .send(ClientEnvelope::request(
                2,
                ClientEvent::CreateWebRtcTransport {
                    role: TransportRole::Send,
                    room_id: RoomId::new("r1"),
                    user_id: ParticipantId::new("alice"),
                    force_tcp: true,
                    ice_transport_policy: None,
                },
            ))
            .await
            .unwrap();

        let created = next(&mut client).await;
        assert!(matches!(
            created,
            ServerMessage::Event(ServerEvent::TransportCreated(ref d)) if d.role == TransportRole::Send
        ));
        assert!(matches!(
            next(&mut client).await,
            ServerMessage::Ack { request_id: 2, result: AckResult::Ok(AckBody::Done) }
        ));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_leaves_rooms() {
        let registry = registry();
        let (mut alice, alice_server) = link_pair();
        let (mut bob, bob_server) = link_pair();
        let (_a, alice_task) = registry.accept(alice_server);
        let (_b, _bob_task) = registry.accept(bob_server);

        join(&mut alice, 1, "r1", "alice").await;
        next(&mut alice).await;
        next(&mut alice).await;

        join(&mut bob, 1, "r1", "bob").await;
        next(&mut bob).await;
        next(&mut bob).await;
        // alice sees bob arrive
        assert_eq!(
            next(&mut alice).await,
            ServerMessage::Event(ServerEvent::ParticipantJoined {
                user_id: ParticipantId::new("bob"),
            })
        );

        drop(alice);
        alice_task.await.unwrap();

        assert_eq!(
            next(&mut bob).await,
            ServerMessage::Event(ServerEvent::ParticipantLeft {
                user_id: ParticipantId::new("alice"),
            })
        );

        let room = registry
            .lookup_room(RoomId::new("r1"))
            .await
            .unwrap()
            .unwrap();
        let state = room.get_state().await.unwrap();
        assert_eq!(state.participants.len(), 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_leave_is_acked_when_absent() {
        let registry = registry();
        let (mut client, server) = link_pair();
        let (_handle, _task) = registry.accept(server);

        client
            .outbound
            .send(ClientEnvelope::request(
                5,
                ClientEvent::LeaveRoom {
                    room_id: RoomId::new("nowhere"),
                    user_id: ParticipantId::new("ghost"),
                },
            ))
            .await
            .unwrap();

        assert_eq!(
            next(&mut client).await,
            ServerMessage::Ack {
                request_id: 5,
                result: AckResult::Ok(AckBody::Done),
            }
        );

        registry.cancel();
    }
}

//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::errors::RegistryError;
use crate::media::NetworkOptions;

use super::room::RoomActorHandle;

use common::types::{ConnectionId, ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use signaling_protocol::link::OutboundSender;
use signaling_protocol::{
    ConsumerDescriptor, MediaCapabilities, MediaKind, MediaParams, PublicationInfo,
    SecurityParams, TransportDescriptor, TransportRole,
};
use tokio::sync::oneshot;

/// Messages sent to `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room actor for `room_id`, spawning it if absent.
    GetOrCreateRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Result<RoomActorHandle, RegistryError>>,
    },

    /// Return the room actor for `room_id` without creating it.
    LookupRoom {
        room_id: RoomId,
        respond_to: oneshot::Sender<Option<RoomActorHandle>>,
    },

    /// Sent by a room actor after its last participant left.
    ///
    /// `instance_id` guards against removing a newer room that reused the key.
    RoomClosed { room_id: RoomId, instance_id: u64 },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and cancel every room actor.
    Shutdown {
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Register a participant and fetch the routing capabilities.
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<MediaCapabilities, RegistryError>>,
    },

    CreateTransport {
        request: TransportRequest,
        respond_to: oneshot::Sender<Result<TransportDescriptor, RegistryError>>,
    },

    /// Apply DTLS parameters. Stale transport ids succeed as a no-op.
    ConnectTransport {
        transport_id: TransportId,
        security: SecurityParams,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    Produce {
        participant_id: ParticipantId,
        transport_id: TransportId,
        kind: MediaKind,
        params: MediaParams,
        respond_to: oneshot::Sender<Result<ProducerId, RegistryError>>,
    },

    /// Publications not owned by `participant_id`.
    ListProducers {
        participant_id: ParticipantId,
        respond_to: oneshot::Sender<Vec<PublicationInfo>>,
    },

    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        capabilities: MediaCapabilities,
        respond_to: oneshot::Sender<Result<ConsumerDescriptor, RegistryError>>,
    },

    /// Unpause a consumer. Stale consumer ids succeed as a no-op.
    ResumeConsumer {
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Remove a participant.
    ///
    /// With `connection_id` set, the participant is only removed while it is
    /// still bound to that connection (connection-loss path).
    Leave {
        participant_id: ParticipantId,
        connection_id: Option<ConnectionId>,
        respond_to: oneshot::Sender<LeaveOutcome>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Participant registration carried by [`RoomMessage::Join`].
#[derive(Debug)]
pub struct JoinRequest {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    /// Queue events for this participant are pushed to.
    pub outbound: OutboundSender,
    pub is_spectator: bool,
}

/// Transport creation carried by [`RoomMessage::CreateTransport`].
#[derive(Debug)]
pub struct TransportRequest {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub outbound: OutboundSender,
    pub role: TransportRole,
    pub options: NetworkOptions,
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Participant was removed and the room was notified.
    Left,
    /// Participant was already gone or bound to another connection.
    NotPresent,
}

/// Snapshot of one participant.
#[derive(Debug, Clone)]
pub struct ParticipantSnapshot {
    pub participant_id: ParticipantId,
    pub connection_id: ConnectionId,
    pub is_spectator: bool,
    pub transports: Vec<(TransportId, TransportRole)>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
}

impl ParticipantSnapshot {
    /// Live transports with the given role.
    #[must_use]
    pub fn transports_with_role(&self, role: TransportRole) -> Vec<&TransportId> {
        self.transports
            .iter()
            .filter(|(_, r)| *r == role)
            .map(|(id, _)| id)
            .collect()
    }
}

/// Room state snapshot (debugging and tests).
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub instance_id: u64,
    /// Present once the first participant joined.
    pub routing_context_id: Option<String>,
    pub participants: Vec<ParticipantSnapshot>,
    pub publications: Vec<PublicationInfo>,
}

impl RoomState {
    #[must_use]
    pub fn participant(&self, participant_id: &ParticipantId) -> Option<&ParticipantSnapshot> {
        self.participants
            .iter()
            .find(|p| &p.participant_id == participant_id)
    }
}

/// Registry status (health checks).
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub connection_count: usize,
    pub participant_count: usize,
    pub mailbox_depth: usize,
    pub engine_ready: bool,
    pub is_draining: bool,
}

//! Client and server message enums.
//!
//! Client frames carry an optional `requestId`; when present the registry
//! answers with exactly one [`ServerMessage::Ack`] for it. Replies that the
//! event vocabulary defines as pushed events (`routerRtpCapabilities`,
//! `transportCreated`, `existingProducers`) are sent before the ack.

use crate::error::{ErrorKind, WireError};
use crate::types::{
    ConsumerDescriptor, IceTransportPolicy, MediaCapabilities, MediaKind, MediaParams,
    PublicationInfo, SecurityParams, TransportDescriptor, TransportRole,
};
use common::types::{ConsumerId, ParticipantId, ProducerId, RoomId, TransportId};
use serde::{Deserialize, Serialize};

/// Client-to-server events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Join or create a room and fetch its routing capabilities.
    #[serde(rename_all = "camelCase")]
    GetRouterRtpCapabilities {
        room_id: RoomId,
        user_id: ParticipantId,
        #[serde(default)]
        is_spectator: bool,
    },
    #[serde(rename_all = "camelCase")]
    CreateWebRtcTransport {
        #[serde(rename = "type")]
        role: TransportRole,
        room_id: RoomId,
        user_id: ParticipantId,
        #[serde(default)]
        force_tcp: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice_transport_policy: Option<IceTransportPolicy>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        transport_id: TransportId,
        security_params: SecurityParams,
        room_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        media_params: MediaParams,
        room_id: RoomId,
        user_id: ParticipantId,
    },
    #[serde(rename_all = "camelCase")]
    GetProducers {
        room_id: RoomId,
        user_id: ParticipantId,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        capabilities: MediaCapabilities,
        remote_producer_id: ProducerId,
        transport_id: TransportId,
        room_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: ConsumerId,
        room_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom {
        room_id: RoomId,
        user_id: ParticipantId,
    },
}

impl ClientEvent {
    /// Wire name, bounded set suitable for metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::GetRouterRtpCapabilities { .. } => "getRouterRtpCapabilities",
            ClientEvent::CreateWebRtcTransport { .. } => "createWebRtcTransport",
            ClientEvent::ConnectWebRtcTransport { .. } => "connectWebRtcTransport",
            ClientEvent::Produce { .. } => "produce",
            ClientEvent::GetProducers { .. } => "getProducers",
            ClientEvent::Consume { .. } => "consume",
            ClientEvent::ResumeConsumer { .. } => "resumeConsumer",
            ClientEvent::LeaveRoom { .. } => "leaveRoom",
        }
    }

    /// Room the event addresses.
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        match self {
            ClientEvent::GetRouterRtpCapabilities { room_id, .. }
            | ClientEvent::CreateWebRtcTransport { room_id, .. }
            | ClientEvent::ConnectWebRtcTransport { room_id, .. }
            | ClientEvent::Produce { room_id, .. }
            | ClientEvent::GetProducers { room_id, .. }
            | ClientEvent::Consume { room_id, .. }
            | ClientEvent::ResumeConsumer { room_id, .. }
            | ClientEvent::LeaveRoom { room_id, .. } => room_id,
        }
    }
}

/// A client frame: an event plus the request id to ack, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientEnvelope {
    /// Envelope that expects an ack.
    #[must_use]
    pub fn request(request_id: u64, event: ClientEvent) -> Self {
        Self {
            request_id: Some(request_id),
            event,
        }
    }

    /// Fire-and-forget envelope.
    #[must_use]
    pub fn notify(event: ClientEvent) -> Self {
        Self {
            request_id: None,
            event,
        }
    }
}

/// Server-to-client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities { rtp_capabilities: MediaCapabilities },
    TransportCreated(TransportDescriptor),
    ExistingProducers { producers: Vec<PublicationInfo> },
    NewProducer(PublicationInfo),
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    /// Sent to a consumer's owner when the upstream producer goes away.
    #[serde(rename_all = "camelCase")]
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { user_id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft { user_id: ParticipantId },
    /// Signaling-level failure of a request that carried no request id.
    Error {
        message: String,
        kind: ErrorKind,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        role: Option<TransportRole>,
    },
}

impl ServerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::RouterRtpCapabilities { .. } => "routerRtpCapabilities",
            ServerEvent::TransportCreated(_) => "transportCreated",
            ServerEvent::ExistingProducers { .. } => "existingProducers",
            ServerEvent::NewProducer(_) => "newProducer",
            ServerEvent::ProducerClosed { .. } => "producerClosed",
            ServerEvent::ConsumerClosed { .. } => "consumerClosed",
            ServerEvent::ParticipantJoined { .. } => "participantJoined",
            ServerEvent::ParticipantLeft { .. } => "participantLeft",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Successful ack payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AckBody {
    /// Request applied; any data was pushed as an event.
    Done,
    Producer { id: ProducerId },
    Consumer(ConsumerDescriptor),
}

/// Ack outcome: `{"ok": ...}` or `{"error": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckResult {
    Ok(AckBody),
    Error(WireError),
}

impl From<Result<AckBody, WireError>> for AckResult {
    fn from(result: Result<AckBody, WireError>) -> Self {
        match result {
            Ok(body) => AckResult::Ok(body),
            Err(err) => AckResult::Error(err),
        }
    }
}

impl From<AckResult> for Result<AckBody, WireError> {
    fn from(result: AckResult) -> Self {
        match result {
            AckResult::Ok(body) => Ok(body),
            AckResult::Error(err) => Err(err),
        }
    }
}

/// A server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    Event(ServerEvent),
    #[serde(rename_all = "camelCase")]
    Ack { request_id: u64, result: AckResult },
}

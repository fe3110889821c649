//! Tagged error kinds carried in acks and `error` events.
//!
//! Clients branch on [`ErrorKind`]; the accompanying message is for humans
//! and never contains internal detail.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Media engine has not finished initializing.
    ServerNotReady,
    RoomNotFound,
    ParticipantNotFound,
    TransportNotFound,
    ProducerNotFound,
    ConsumerNotFound,
    /// Capability mismatch between a consumer and a producer.
    CannotConsume,
    MissingIdentity,
    PermissionDenied,
    CapacityExceeded,
    InvalidRequest,
    /// The media engine rejected an operation.
    MediaEngine,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ServerNotReady => "serverNotReady",
            ErrorKind::RoomNotFound => "roomNotFound",
            ErrorKind::ParticipantNotFound => "participantNotFound",
            ErrorKind::TransportNotFound => "transportNotFound",
            ErrorKind::ProducerNotFound => "producerNotFound",
            ErrorKind::ConsumerNotFound => "consumerNotFound",
            ErrorKind::CannotConsume => "cannotConsume",
            ErrorKind::MissingIdentity => "missingIdentity",
            ErrorKind::PermissionDenied => "permissionDenied",
            ErrorKind::CapacityExceeded => "capacityExceeded",
            ErrorKind::InvalidRequest => "invalidRequest",
            ErrorKind::MediaEngine => "mediaEngine",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether the error only means the referenced object is already gone.
    #[must_use]
    pub const fn is_stale_reference(&self) -> bool {
        matches!(
            self,
            ErrorKind::RoomNotFound
                | ErrorKind::ParticipantNotFound
                | ErrorKind::TransportNotFound
                | ErrorKind::ProducerNotFound
                | ErrorKind::ConsumerNotFound
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload of a failed ack.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_serializes_to_as_str() {
        for kind in [
            ErrorKind::ServerNotReady,
            ErrorKind::ProducerNotFound,
            ErrorKind::CannotConsume,
            ErrorKind::MediaEngine,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn test_stale_reference_classification() {
        assert!(ErrorKind::ProducerNotFound.is_stale_reference());
        assert!(ErrorKind::TransportNotFound.is_stale_reference());
        assert!(!ErrorKind::CannotConsume.is_stale_reference());
        assert!(!ErrorKind::ServerNotReady.is_stale_reference());
    }

    #[test]
    fn test_wire_error_display() {
        let err = WireError::new(ErrorKind::RoomNotFound, "Room not found");
        assert_eq!(err.to_string(), "roomNotFound: Room not found");
    }
}

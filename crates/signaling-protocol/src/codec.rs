//! JSON text-frame codec.
//!
//! Both ends exchange UTF-8 JSON text frames. Decoding failures are
//! reported with the frame kind so a bad frame can be logged and skipped
//! without tearing down the link.

use crate::messages::{ClientEnvelope, ServerMessage};

/// Error type for codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Frame is not valid JSON or does not match the message schema
    #[error("Malformed {frame} frame: {reason}")]
    Malformed { frame: &'static str, reason: String },

    /// Message could not be serialized
    #[error("Failed to encode {frame} frame: {reason}")]
    Encode { frame: &'static str, reason: String },
}

/// Encode a client envelope as a text frame
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn encode_client(envelope: &ClientEnvelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Encode {
        frame: "client",
        reason: e.to_string(),
    })
}

/// Decode a client text frame
///
/// # Errors
///
/// Returns an error if the frame is not a known client event
pub fn decode_client(text: &str) -> Result<ClientEnvelope, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed {
        frame: "client",
        reason: e.to_string(),
    })
}

/// Encode a server message as a text frame
///
/// # Errors
///
/// Returns an error if serialization fails
pub fn encode_server(message: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Encode {
        frame: "server",
        reason: e.to_string(),
    })
}

/// Decode a server text frame
///
/// # Errors
///
/// Returns an error if the frame is not a known server message
pub fn decode_server(text: &str) -> Result<ServerMessage, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed {
        frame: "server",
        reason: e.to_string(),
    })
}

//! Payload types carried by signaling events.

use common::types::{ConsumerId, ParticipantId, ProducerId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Directional role of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportRole {
    Send,
    Recv,
}

impl TransportRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportRole::Send => "send",
            TransportRole::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE candidate gathering policy requested for a transport.
///
/// `Relay` restricts the path to TURN relays and is what the recovery
/// path asks for after a transport failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

macro_rules! opaque_params {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Value);

        impl $name {
            /// Borrow the raw JSON payload.
            #[must_use]
            pub fn as_value(&self) -> &Value {
                &self.0
            }

            /// Lower-cased `mimeType` of every entry in the `codecs` array.
            #[must_use]
            pub fn codec_mime_types(&self) -> Vec<String> {
                self.0
                    .get("codecs")
                    .and_then(Value::as_array)
                    .map(|codecs| {
                        codecs
                            .iter()
                            .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                            .map(str::to_ascii_lowercase)
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }

        impl From<Value> for $name {
            fn from(value: Value) -> Self {
                Self(value)
            }
        }
    };
}

opaque_params!(
    /// RTP capability descriptor of a routing context or a client device.
    MediaCapabilities
);

opaque_params!(
    /// RTP parameters of a producer or consumer.
    MediaParams
);

opaque_params!(
    /// DTLS parameters exchanged during the transport connect handshake.
    SecurityParams
);

opaque_params!(
    /// ICE/DTLS parameters a client needs to build its side of a transport.
    NegotiationParams
);

/// Room directory entry for one live producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationInfo {
    pub producer_id: ProducerId,
    pub producer_owner_identity: ParticipantId,
    pub kind: MediaKind,
}

/// Reply to a transport creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportDescriptor {
    #[serde(rename = "type")]
    pub role: TransportRole,
    pub id: TransportId,
    pub params: NegotiationParams,
}

/// Reply to a consume request. The consumer starts paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub media_params: MediaParams,
}

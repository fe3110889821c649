//! Identifier newtypes shared by the registry and the session client.
//!
//! Every identifier travels over the wire as a plain string. Room keys and
//! participant identities are chosen by clients; transport, producer and
//! consumer ids are assigned by the media engine; connection ids are
//! assigned by the registry when a signaling link is accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generate a random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is the empty string.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Room key chosen by the joining client.
    RoomId
);

string_id!(
    /// Opaque participant identity, scoped to one room.
    ParticipantId
);

string_id!(
    /// Media-engine transport id.
    TransportId
);

string_id!(
    /// Media-engine producer id.
    ProducerId
);

string_id!(
    /// Media-engine consumer id.
    ConsumerId
);

string_id!(
    /// Registry-assigned id of one signaling connection.
    ConnectionId
);

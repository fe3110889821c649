//! Pre-configured test data fixtures for registry testing.

use common::types::RoomId;
use serde_json::json;
use signaling_protocol::{MediaCapabilities, MediaKind, MediaParams, SecurityParams};
use uuid::Uuid;

/// Capabilities of a client that decodes both opus and VP8.
#[must_use]
pub fn client_capabilities() -> MediaCapabilities {
    MediaCapabilities(json!({
        "codecs": [
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
            {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
        ],
        "headerExtensions": []
    }))
}

/// Capabilities of a client that only decodes audio.
#[must_use]
pub fn audio_only_capabilities() -> MediaCapabilities {
    MediaCapabilities(json!({
        "codecs": [
            {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2}
        ],
        "headerExtensions": []
    }))
}

/// Publishing parameters for a track of `kind`.
#[must_use]
pub fn media_params(kind: MediaKind) -> MediaParams {
    match kind {
        MediaKind::Audio => MediaParams(json!({
            "codecs": [{"mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2}],
            "encodings": [{"ssrc": 1111}],
            "codecOptions": {"opusStereo": true, "opusDtx": true}
        })),
        MediaKind::Video => MediaParams(json!({
            "codecs": [{"mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000}],
            "encodings": [
                {"rid": "r0", "maxBitrate": 100_000},
                {"rid": "r1", "maxBitrate": 300_000},
                {"rid": "r2", "maxBitrate": 900_000}
            ]
        })),
    }
}

/// Client DTLS parameters with one fingerprint.
#[must_use]
pub fn dtls_params() -> SecurityParams {
    SecurityParams(json!({
        "role": "client",
        "fingerprints": [{"algorithm": "sha-256", "value": "AB:CD:EF"}]
    }))
}

/// A room key unique to the calling test.
#[must_use]
pub fn random_room() -> RoomId {
    RoomId::new(format!("room-{}", Uuid::new_v4()))
}

//! Observability module for the Room Registry.
//!
//! # Privacy by Default
//!
//! Actor entry points use `#[instrument(skip_all)]` with explicit fields.
//! Signaling payloads (media parameters, DTLS fingerprints) are never logged.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rr_rooms_active` | Gauge | none | Live rooms |
//! | `rr_participants_active` | Gauge | none | Participants across all rooms |
//! | `rr_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator per actor type |
//! | `rr_requests_total` | Counter | `event`, `status` | Handled client requests |
//! | `rr_request_duration_seconds` | Histogram | `event` | Request handling latency |
//! | `rr_broadcasts_total` | Counter | `event` | Room fan-out events |
//! | `rr_producers_total` | Counter | none | Producers created |
//! | `rr_consumers_total` | Counter | `outcome` | Consume attempts |
//! | `rr_transports_superseded_total` | Counter | `role` | Transports replaced during recovery |
//! | `rr_actor_panics_total` | Counter | `actor_type` | Actor panics (bugs) |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;

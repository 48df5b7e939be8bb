//! Observability for the signaling service.
//!
//! # Privacy by Default
//!
//! Handlers use `#[instrument(skip_all)]` with explicit id fields. Names,
//! chat text and vitals are never logged or used as labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sig_sessions_active` | Gauge | none | Live sessions |
//! | `sig_participants_active` | Gauge | none | Joined participants |
//! | `sig_connections_active` | Gauge | none | Open signaling sockets |
//! | `sig_event_latency_seconds` | Histogram | `event` | Client event handling latency |
//! | `sig_engine_call_duration_seconds` | Histogram | `operation` | Media engine calls |
//! | `sig_storage_latency_seconds` | Histogram | `operation` | Store writes |
//! | `sig_session_duration_seconds` | Histogram | none | Session lifetime |
//! | `sig_sessions_ended_total` | Counter | `reason` | Why sessions ended |
//! | `sig_errors_total` | Counter | `event`, `error_type` | Rejected events |
//! | `sig_worker_deaths_total` | Counter | none | Fatal media worker exits |
//! | `sig_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure per actor type |

pub mod health;
pub mod metrics;
pub mod sessions;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
pub use sessions::sessions_router;

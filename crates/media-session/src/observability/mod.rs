//! Observability for the media session service.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Metric labels are bounded; channel, user and resource ids only appear in
//! logs.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `ms_workers_active` | Gauge | none | Running media workers |
//! | `ms_routers_active` | Gauge | none | Channels with a router |
//! | `ms_transports_active` | Gauge | none | Tracked WebRTC transports |
//! | `ms_producers_active` | Gauge | none | Tracked producers |
//! | `ms_consumers_active` | Gauge | none | Tracked consumers |
//! | `ms_transport_closed_total` | Counter | `reason` | Transport closes by cause |
//! | `ms_ptt_transitions_total` | Counter | `direction` | PTT gate changes |
//! | `ms_worker_deaths_total` | Counter | none | Unexpected worker deaths |
//! | `ms_errors_total` | Counter | `operation`, `error_type`, `status_code` | Failed operations |
//! | `ms_operation_duration_seconds` | Histogram | `operation` | Signaling operation latency |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, StatusResponse};
pub use metrics::init_metrics_recorder;

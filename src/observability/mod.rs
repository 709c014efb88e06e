//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Sockets and workers produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (StatsSink: counters and the active-socket gauge)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape endpoint
//! ```
//!
//! # Design Decisions
//! - The stats sink is optional and set at most once per manager
//! - Counters are plain atomic increments on the hot path

pub mod logging;
pub mod metrics;

pub use metrics::{MetricsSink, StatCounter, StatsSink};

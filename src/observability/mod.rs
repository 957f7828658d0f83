//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor, establisher and relay produce:
//!     → logging.rs (structured events inside conn / pipe spans)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → stdout (pretty or JSON lines)
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```

pub mod logging;
pub mod metrics;

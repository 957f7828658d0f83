//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (connections, tunnels, bytes, failures)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `connect_proxy_connections_total` (counter): accepted client connections
//! - `connect_proxy_active_connections` (gauge): connections currently open
//! - `connect_proxy_tunnels_established_total` (counter): 200 responses sent
//! - `connect_proxy_bytes_forwarded_total` (counter): relayed bytes by direction
//! - `connect_proxy_failures_total` (counter): failed connections by phase
//!
//! # Design Decisions
//! - Updates go through the `metrics` facade and are no-ops until a
//!   recorder is installed, so tests need no setup
//! - Labels are static strings; no per-host cardinality

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::proxy::error::{Direction, Phase};

pub const CONNECTIONS_TOTAL: &str = "connect_proxy_connections_total";
pub const ACTIVE_CONNECTIONS: &str = "connect_proxy_active_connections";
pub const TUNNELS_ESTABLISHED_TOTAL: &str = "connect_proxy_tunnels_established_total";
pub const BYTES_FORWARDED_TOTAL: &str = "connect_proxy_bytes_forwarded_total";
pub const FAILURES_TOTAL: &str = "connect_proxy_failures_total";

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_connection_opened() {
    ::metrics::counter!(CONNECTIONS_TOTAL).increment(1);
    ::metrics::gauge!(ACTIVE_CONNECTIONS).increment(1.0);
}

pub fn record_connection_closed() {
    ::metrics::gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
}

pub fn record_tunnel_established() {
    ::metrics::counter!(TUNNELS_ESTABLISHED_TOTAL).increment(1);
}

pub fn record_forwarded(direction: Direction, bytes: usize) {
    ::metrics::counter!(BYTES_FORWARDED_TOTAL, "direction" => direction.as_str())
        .increment(bytes as u64);
}

pub fn record_failure(phase: Phase) {
    ::metrics::counter!(FAILURES_TOTAL, "phase" => phase.as_str()).increment(1);
}

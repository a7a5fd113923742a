//! Metrics collection and export for the chat hub.
//!
//! Uses the `metrics` crate for instrumentation and exports to
//! Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const ENVELOPES_TOTAL: &str = "courier_envelopes_total";
    pub const ENVELOPES_BYTES: &str = "courier_envelopes_bytes";
    pub const RENDEZVOUS_WAITING: &str = "courier_rendezvous_waiting";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of live sessions"
    );
    metrics::describe_counter!(names::ENVELOPES_TOTAL, "Total number of envelopes processed");
    metrics::describe_counter!(names::ENVELOPES_BYTES, "Total bytes of envelopes processed");
    metrics::describe_gauge!(
        names::RENDEZVOUS_WAITING,
        "Callers currently parked in the rendezvous queue"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new session.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a session ending.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an envelope crossing the wire.
pub fn record_envelope(bytes: usize, direction: &str) {
    counter!(names::ENVELOPES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::ENVELOPES_BYTES, "direction" => direction.to_string())
        .increment(bytes as u64);
}

/// Update the rendezvous waiting gauge.
pub fn set_rendezvous_waiting(count: usize) {
    gauge!(names::RENDEZVOUS_WAITING).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

//! Metrics collection and export for Parley.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use parley_core::{Delivery, RealmStats};
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const DISCONNECTIONS_TOTAL: &str = "parley_disconnections_total";
    pub const MESSAGES_TOTAL: &str = "parley_messages_total";
    pub const EVICTIONS_TOTAL: &str = "parley_evictions_total";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
    pub const CLIENTS: &str = "parley_clients";
    pub const CLIENTS_CONNECTED: &str = "parley_clients_connected";
    pub const PENDING_MESSAGES: &str = "parley_pending_messages";
}

/// Register metric descriptions with the installed recorder.
fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of successful handshakes since server start"
    );
    metrics::describe_counter!(
        names::DISCONNECTIONS_TOTAL,
        "Total number of transport-level disconnects"
    );
    metrics::describe_counter!(
        names::MESSAGES_TOTAL,
        "Total number of routed messages by delivery outcome"
    );
    metrics::describe_counter!(
        names::EVICTIONS_TOTAL,
        "Total number of identities evicted for inactivity"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");
    metrics::describe_gauge!(names::CLIENTS, "Current number of registered identities");
    metrics::describe_gauge!(
        names::CLIENTS_CONNECTED,
        "Current number of identities with a live transport"
    );
    metrics::describe_gauge!(
        names::PENDING_MESSAGES,
        "Current number of messages waiting in pending queues"
    );

    info!("Metrics initialized");
}

/// Install the Prometheus exporter and describe the metrics.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    init_metrics();

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
}

pub fn record_disconnection() {
    counter!(names::DISCONNECTIONS_TOTAL).increment(1);
}

pub fn record_delivery(delivery: Delivery) {
    counter!(names::MESSAGES_TOTAL, "delivery" => delivery.as_str()).increment(1);
}

pub fn record_eviction() {
    counter!(names::EVICTIONS_TOTAL).increment(1);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Publish a registry snapshot.
pub fn set_realm_stats(stats: &RealmStats) {
    gauge!(names::CLIENTS).set(stats.client_count as f64);
    gauge!(names::CLIENTS_CONNECTED).set(stats.connected_count as f64);
    gauge!(names::PENDING_MESSAGES).set(stats.pending_messages as f64);
}

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `asynctcp_events_total` (counter): dispatched events by kind
//! - `asynctcp_dispatch_seconds` (histogram): handler time per event
//! - `asynctcp_queue_depth` (gauge): events waiting after each dequeue
//! - `asynctcp_events_dropped_total` (counter): events for retired bindings, by reason
//! - `asynctcp_slot_exhausted_total` (counter): bindings running without a slot
//! - `asynctcp_tls_handshakes_total` (counter): handshakes by outcome
//! - `asynctcp_connections_closed_total` (counter): closes by reason
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed
//! - Labels are static strings

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_dispatch(kind: &'static str, elapsed: Duration) {
    metrics::counter!("asynctcp_events_total", "kind" => kind).increment(1);
    metrics::histogram!("asynctcp_dispatch_seconds", "kind" => kind).record(elapsed.as_secs_f64());
}

pub fn record_queue_depth(depth: usize) {
    metrics::gauge!("asynctcp_queue_depth").set(depth as f64);
}

pub fn record_dropped(reason: &'static str, count: usize) {
    metrics::counter!("asynctcp_events_dropped_total", "reason" => reason).increment(count as u64);
}

pub fn record_slot_exhausted() {
    metrics::counter!("asynctcp_slot_exhausted_total").increment(1);
}

pub fn record_handshake(outcome: &'static str) {
    metrics::counter!("asynctcp_tls_handshakes_total", "outcome" => outcome).increment(1);
}

pub fn record_close(reason: &'static str) {
    metrics::counter!("asynctcp_connections_closed_total", "reason" => reason).increment(1);
}

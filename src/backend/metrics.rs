use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

/// Metrics for a [`Backend`](super::Backend).
#[derive(Metrics, Clone)]
#[metrics(scope = "proxyd.backend")]
pub struct BackendMetrics {
    /// Number of upstream requests.
    pub requests: Counter,
    /// Number of upstream requests that failed.
    pub errors: Counter,
    /// Latency of successful upstream requests, in milliseconds.
    pub latency: Histogram,
    /// Number of times the backend was taken out of service.
    pub out_of_service: Counter,
    /// Open websocket sessions.
    pub ws_conns: Gauge,
}

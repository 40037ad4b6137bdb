//! Metrics setup and the RPC call metrics recorded by the front door.

use crate::types::RpcResponse;
use eyre::WrapErr;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use std::{net::SocketAddr, time::Duration};

/// Records per-method call outcomes and request latencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcMetrics;

impl RpcMetrics {
    /// Records the response to a call that reached the cache or a backend group.
    pub fn record(&self, method: &str, response: &RpcResponse) {
        let code = response.error.as_ref().map(|error| error.code).unwrap_or_default();
        counter!(
            "proxyd.rpc.call.count",
            "method" => method.to_string(),
            "code" => code.to_string()
        )
        .increment(1);
    }

    /// Records a call the proxy answered itself because it failed a check.
    pub fn record_rejected(&self, method: &str, code: i64) {
        counter!(
            "proxyd.rpc.rejected.count",
            "method" => method.to_string(),
            "code" => code.to_string()
        )
        .increment(1);
    }

    /// Records the latency of an HTTP request, batches included.
    pub fn record_request(&self, elapsed: Duration, status: u16, batch: bool) {
        histogram!(
            "proxyd.http.request.latency",
            "status" => status.to_string(),
            "batch" => batch.to_string()
        )
        .record(elapsed.as_millis() as f64);
    }

    /// Tracks open websocket client sessions.
    pub fn ws_session_opened(&self) {
        gauge!("proxyd.ws.sessions").increment(1.0);
    }

    /// Counterpart of [`RpcMetrics::ws_session_opened`].
    pub fn ws_session_closed(&self) {
        gauge!("proxyd.ws.sessions").decrement(1.0);
    }
}

/// Builds a Prometheus exporter listening on `metrics_addr`, returning a handle.
///
/// The recorder will perform upkeep every 5 seconds. The exporter is installed once per process;
/// later calls return the handle of the first one.
pub fn setup_exporter(metrics_addr: impl Into<SocketAddr>) -> eyre::Result<PrometheusHandle> {
    static HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

    let mut lock = HANDLE.lock();
    if let Some(handle) = &*lock {
        return Ok(handle.clone());
    }

    let addr: SocketAddr = metrics_addr.into();
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .upkeep_timeout(Duration::from_secs(5))
        .build()
        .wrap_err("failed to build metrics recorder")?;

    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| eyre::eyre!("could not set metrics recorder"))?;
    tokio::spawn(exporter);

    tracing::info!(target: "proxyd::spawn", %addr, "Started metrics server");

    *lock = Some(handle.clone());

    Ok(handle)
}

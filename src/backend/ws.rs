use super::Backend;
use crate::{constants::WS_HANDSHAKE_TIMEOUT, error::BackendError};
use http::{HeaderName, HeaderValue};
use metrics::Gauge;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::client::IntoClientRequest,
};
use tracing::debug;

/// A websocket connection to a backend.
pub type BackendWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Holds one of a backend's websocket slots until dropped.
pub struct WsConnGuard {
    conns: Arc<AtomicUsize>,
    gauge: Gauge,
}

impl std::fmt::Debug for WsConnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnGuard").field("conns", &self.conns).finish_non_exhaustive()
    }
}

impl Drop for WsConnGuard {
    fn drop(&mut self) {
        self.conns.fetch_sub(1, Ordering::AcqRel);
        self.gauge.decrement(1.0);
    }
}

impl Backend {
    /// Whether this backend can proxy websocket sessions.
    pub const fn supports_ws(&self) -> bool {
        self.config.ws_url.is_some()
    }

    /// Number of open websocket sessions.
    pub fn ws_conns(&self) -> usize {
        self.ws_conns.load(Ordering::Acquire)
    }

    /// Reserves a websocket slot, unless the backend is at `max_ws_conns`.
    pub fn try_reserve_ws(&self) -> Option<WsConnGuard> {
        let max = self.config.max_ws_conns;
        self.ws_conns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (max == 0 || open < max).then_some(open + 1)
            })
            .ok()?;
        self.metrics.ws_conns.increment(1.0);
        Some(WsConnGuard { conns: self.ws_conns.clone(), gauge: self.metrics.ws_conns.clone() })
    }

    /// Dials the backend's websocket endpoint.
    ///
    /// The returned guard keeps the session counted against `max_ws_conns` and must live as long
    /// as the connection.
    pub async fn dial_ws(&self) -> Result<(BackendWsStream, WsConnGuard), BackendError> {
        let url = self.config.ws_url.as_ref().ok_or(BackendError::WsUnsupported)?;
        if self.is_out_of_service() {
            return Err(BackendError::Offline);
        }
        let guard = self.try_reserve_ws().ok_or(BackendError::OverCapacity)?;

        let mut request = url.as_str().into_client_request()?;
        for (key, value) in &self.config.headers {
            if let (Ok(key), Ok(value)) =
                (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str()))
            {
                request.headers_mut().insert(key, value);
            }
        }

        let (stream, _) = tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| BackendError::Timeout)??;
        debug!(backend = %self.name, "Connected to backend websocket");
        Ok((stream, guard))
    }
}

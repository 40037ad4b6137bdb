//! Websocket listener.
//!
//! Every client session is pinned to one backend of the websocket group for its whole life.
//! Client frames are checked against the websocket whitelist and the rate limits before they are
//! forwarded; backend frames are relayed verbatim.

use super::{Proxy, WsAdmission, http::request_context};
use crate::{
    error::RpcError,
    metrics::RpcMetrics,
    types::{RequestContext, RpcResponse, null_id},
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        ConnectInfo, Path, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::tungstenite::Message as BackendMessage;
use tracing::{debug, info, warn};

/// Frames queued towards a client before the relay waits for the writer.
const OUTBOUND_BUFFER: usize = 64;

/// Builds the router of the websocket listener.
pub fn router(proxy: Proxy) -> Router {
    Router::new()
        .route("/", get(handle_upgrade))
        .route("/{key}", get(handle_upgrade))
        .with_state(proxy)
}

async fn handle_upgrade(
    State(proxy): State<Proxy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    key: Option<Path<String>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let mut ctx = request_context(&proxy, peer, &headers);
    match proxy.authenticate(key.as_ref().map(|Path(key)| key.as_str())) {
        Ok(alias) => ctx.auth = alias,
        Err(err) => {
            return (err.http_status(), Json(err.into_response(null_id()))).into_response();
        }
    }
    upgrade.on_upgrade(move |socket| relay(proxy, ctx, socket))
}

/// Relays one client session until either side closes, the client idles out or the proxy shuts
/// down.
async fn relay(proxy: Proxy, ctx: RequestContext, client: WebSocket) {
    let server = &proxy.config().server;
    let (mut client_tx, mut client_rx) = client.split();

    let dialed = match proxy.ws_group() {
        Some(group) => group.dial_ws(&ctx).await,
        None => Err(RpcError::NoBackends),
    };
    let (backend, upstream, _guard) = match dialed {
        Ok(conn) => conn,
        Err(err) => {
            warn!(req_id = %ctx.req_id, %err, "No websocket backend available");
            let _ = client_tx.send(json_frame(&err.into_response(null_id()))).await;
            let _ = client_tx.send(Message::Close(None)).await;
            return;
        }
    };
    let (mut backend_tx, mut backend_rx) = upstream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    RpcMetrics.ws_session_opened();
    info!(
        req_id = %ctx.req_id,
        auth = ?ctx.auth,
        backend = %backend.name(),
        "Websocket session opened"
    );

    let inbound = async {
        loop {
            let message = match timeout(server.ws_read_timeout, client_rx.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(_) => return None,
                Err(_) => {
                    debug!(req_id = %ctx.req_id, "Websocket client idle");
                    return None;
                }
            };
            let frame = match message {
                Message::Text(text) => text.to_string(),
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return None,
            };
            if frame.len() > server.max_body_size_bytes {
                debug!(req_id = %ctx.req_id, len = frame.len(), "Websocket frame too large");
                return Some(CloseFrame {
                    code: close_code::SIZE,
                    reason: RpcError::BodyTooLarge.to_string().into(),
                });
            }
            match proxy.admit_ws(&ctx, &frame) {
                WsAdmission::Forward => {
                    if backend_tx.send(BackendMessage::text(frame)).await.is_err() {
                        return None;
                    }
                }
                WsAdmission::Reply(response) => {
                    if out_tx.send(json_frame(&response)).await.is_err() {
                        return None;
                    }
                }
            }
        }
    };

    let outbound = async {
        let max = backend.config().max_response_size_bytes;
        while let Some(Ok(message)) = backend_rx.next().await {
            let message = match message {
                BackendMessage::Text(text) if text.len() <= max => {
                    Message::Text(text.as_str().into())
                }
                BackendMessage::Binary(bytes) if bytes.len() <= max => Message::Binary(bytes),
                BackendMessage::Text(_) | BackendMessage::Binary(_) => {
                    warn!(
                        req_id = %ctx.req_id,
                        backend = %backend.name(),
                        "Backend frame too large"
                    );
                    return Some(CloseFrame {
                        code: close_code::ERROR,
                        reason: RpcError::ResponseTooLarge.to_string().into(),
                    });
                }
                BackendMessage::Close(_) => return None,
                _ => continue,
            };
            if out_tx.send(message).await.is_err() {
                break;
            }
        }
        None
    };

    let writer = async {
        let mut ping = tokio::time::interval(server.ws_ping_interval);
        ping.tick().await;
        loop {
            let message = tokio::select! {
                message = out_rx.recv() => match message {
                    Some(message) => message,
                    None => return None::<CloseFrame>,
                },
                _ = ping.tick() => Message::Ping(Bytes::new()),
            };
            match timeout(server.ws_write_timeout, client_tx.send(message)).await {
                Ok(Ok(())) => {}
                _ => return None,
            }
        }
    };

    let close = tokio::select! {
        close = inbound => close,
        close = outbound => close,
        close = writer => close,
        _ = proxy.cancel_token().cancelled() => Some(CloseFrame {
            code: close_code::AWAY,
            reason: "shutting down".into(),
        }),
    };

    let _ = timeout(server.ws_write_timeout, client_tx.send(Message::Close(close))).await;
    let _ = backend_tx.close().await;
    RpcMetrics.ws_session_closed();
    info!(req_id = %ctx.req_id, backend = %backend.name(), "Websocket session closed");
}

fn json_frame(response: &RpcResponse) -> Message {
    Message::Text(serde_json::to_string(response).unwrap_or_default().into())
}

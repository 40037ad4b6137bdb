//! HTTP listener.

use super::{Proxy, ProxyReply};
use crate::{
    constants::{CACHE_STATUS_HEADER, SERVED_BY_HEADER},
    error::RpcError,
    metrics::RpcMetrics,
    types::{RequestContext, is_batch},
};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http_body_util::LengthLimitError;
use std::{error::Error, net::SocketAddr, time::Instant};
use tower::ServiceBuilder;
use tower_http::cors::{AllowMethods, AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

/// Builds the router of the RPC listener.
pub fn router(proxy: Proxy) -> Router {
    let cors = proxy.config().server.allow_all_origins.then(|| {
        CorsLayer::new()
            .allow_methods(AllowMethods::any())
            .allow_origin(AllowOrigin::any())
            .allow_headers([header::CONTENT_TYPE])
    });

    Router::new()
        .route("/", post(handle_rpc))
        .route("/{key}", post(handle_rpc))
        .route("/healthz", get(healthz))
        .layer(ServiceBuilder::new().option_layer(cors))
        .with_state(proxy)
}

async fn healthz() -> &'static str {
    "OK"
}

async fn handle_rpc(
    State(proxy): State<Proxy>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    key: Option<Path<String>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let started = Instant::now();
    let mut ctx = request_context(&proxy, peer, &headers);

    match proxy.authenticate(key.as_ref().map(|Path(key)| key.as_str())) {
        Ok(alias) => ctx.auth = alias,
        Err(err) => {
            debug!(req_id = %ctx.req_id, "Rejected unauthenticated request");
            return reply_response(&proxy, ProxyReply::error(err));
        }
    }

    let Some(_permit) = proxy.try_acquire() else {
        warn!(req_id = %ctx.req_id, "Too many concurrent requests");
        return reply_response(&proxy, ProxyReply::error(RpcError::TooManyConnections));
    };

    let server = &proxy.config().server;
    let body = match to_bytes(body, server.max_body_size_bytes).await {
        Ok(body) => body,
        Err(err) => {
            debug!(req_id = %ctx.req_id, %err, "Failed to read request body");
            return reply_response(&proxy, ProxyReply::error(body_error(err)));
        }
    };

    if server.enable_request_log {
        let logged = &body[..body.len().min(server.max_request_body_log_len)];
        info!(
            req_id = %ctx.req_id,
            auth = ?ctx.auth,
            body = %String::from_utf8_lossy(logged),
            "Raw RPC request"
        );
    }

    let batch = is_batch(&body);
    let reply = match tokio::time::timeout(server.timeout, proxy.serve(&ctx, &body)).await {
        Ok(reply) => reply,
        Err(_) => {
            warn!(req_id = %ctx.req_id, timeout = ?server.timeout, "Request timed out");
            ProxyReply::error(RpcError::GatewayTimeout)
        }
    };

    RpcMetrics.record_request(started.elapsed(), reply.status.as_u16(), batch);
    reply_response(&proxy, reply)
}

/// Collects the request metadata used for rate limiting, routing and logging.
pub(crate) fn request_context(
    proxy: &Proxy,
    peer: SocketAddr,
    headers: &HeaderMap,
) -> RequestContext {
    let value_of = |name: &str| {
        headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
    };

    let mut ctx = RequestContext::new();
    ctx.remote_ip = value_of(proxy.ip_header())
        .and_then(|value| value.split(',').next()?.trim().parse().ok())
        .or(Some(peer.ip()));
    ctx.origin = value_of(header::ORIGIN.as_str());
    ctx.user_agent = value_of(header::USER_AGENT.as_str());
    ctx.session = value_of(&proxy.config().server.sticky_session_header.to_ascii_lowercase());
    ctx
}

/// Only an exceeded size limit is the client sending too much; anything else is a broken request.
fn body_error(err: axum::Error) -> RpcError {
    let err = err.into_inner();
    let too_large = std::iter::successors(Some(&*err as &(dyn Error + 'static)), |&err| err.source())
        .any(|err| err.is::<LengthLimitError>());
    if too_large { RpcError::BodyTooLarge } else { RpcError::Parse }
}

fn reply_response(proxy: &Proxy, reply: ProxyReply) -> Response {
    let body = match serde_json::to_vec(&reply.body) {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "Failed to serialize reply");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let mut response = (
        reply.status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(if reply.cache_hit { "HIT" } else { "MISS" }),
    );
    if proxy.config().server.enable_served_by_header
        && !reply.served_by.is_empty()
        && let Ok(value) = HeaderValue::from_str(&reply.served_by.join(", "))
    {
        headers.insert(SERVED_BY_HEADER, value);
    }
    response
}

//! Upstream backends.
//!
//! A [`Backend`] owns everything needed to talk to one upstream endpoint: the HTTP client, its
//! concurrency and rate ceilings, and the rolling windows that decide whether it is healthy.

use crate::{
    config::BackendConfig,
    constants::{HEALTH_WINDOW_LENGTH, MAX_RETRY_BACKOFF, MIN_ERROR_RATE_REQUESTS},
    error::{BAD_RESPONSE_CODE, BackendError},
    types::{RpcErrorObject, RpcRequest, RpcResponse, is_batch, to_raw},
    window::SlidingWindow,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::{
    HeaderMap, HeaderName, HeaderValue, StatusCode,
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

mod metrics;
pub use self::metrics::BackendMetrics;

mod ws;
pub use ws::{BackendWsStream, WsConnGuard};

/// What to do with a backend response, given its HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The body carries JSON-RPC responses and is parsed.
    Parse,
    /// The exchange failed and the group should try the next backend.
    Retry,
}

impl Disposition {
    /// Looks up the disposition for a status.
    ///
    /// Client errors other than 429 still carry JSON-RPC error objects, so they are parsed and
    /// returned. Rate limiting, server errors and redirects are retried elsewhere.
    pub const fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::Retry,
            200..=299 | 400..=499 => Self::Parse,
            _ => Self::Retry,
        }
    }
}

/// One upstream JSON-RPC endpoint.
#[derive(Debug)]
pub struct Backend {
    name: String,
    config: BackendConfig,
    client: reqwest::Client,
    headers: HeaderMap,
    semaphore: Semaphore,
    rate_limiter: Option<DefaultDirectRateLimiter>,
    /// Unix timestamp in milliseconds until which the backend is out of service.
    unavailable_until: AtomicU64,
    requests: SlidingWindow,
    errors: SlidingWindow,
    latency: SlidingWindow,
    ws_conns: Arc<AtomicUsize>,
    metrics: BackendMetrics,
}

impl Backend {
    /// Creates a backend from its configuration.
    pub fn new(name: impl Into<String>, config: BackendConfig) -> eyre::Result<Self> {
        let name = name.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (key, value) in &config.headers {
            headers.insert(
                HeaderName::try_from(key.as_str())?,
                HeaderValue::try_from(value.as_str())?,
            );
        }

        let client = reqwest::Client::builder().timeout(config.response_timeout).build()?;

        let permits = match config.max_concurrent_rpcs {
            0 => Semaphore::MAX_PERMITS,
            n => n.min(Semaphore::MAX_PERMITS),
        };
        let rate_limiter =
            NonZeroU32::new(config.max_rps).map(|rps| RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            metrics: BackendMetrics::new_with_labels(&[("backend", name.clone())]),
            name,
            client,
            headers,
            semaphore: Semaphore::new(permits),
            rate_limiter,
            unavailable_until: AtomicU64::new(0),
            requests: SlidingWindow::with_length(HEALTH_WINDOW_LENGTH),
            errors: SlidingWindow::with_length(HEALTH_WINDOW_LENGTH),
            latency: SlidingWindow::with_length(HEALTH_WINDOW_LENGTH),
            ws_conns: Arc::new(AtomicUsize::new(0)),
            config,
        })
    }

    /// The backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend configuration.
    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Forwards a minibatch and returns one response per request, in request order.
    ///
    /// A request whose id is missing from the backend answer gets an error response of its own;
    /// the other requests are still answered.
    pub async fn forward(&self, requests: &[RpcRequest]) -> Result<Vec<RpcResponse>, BackendError> {
        if self.is_out_of_service() {
            return Err(BackendError::Offline);
        }
        if self.rate_limiter.as_ref().is_some_and(|limiter| limiter.check().is_err()) {
            return Err(BackendError::RateLimited);
        }
        let _permit = self.semaphore.try_acquire().map_err(|_| BackendError::OverCapacity)?;

        let body = match requests {
            [request] if self.config.unwrap_single_batch => serde_json::to_vec(request)?,
            requests => serde_json::to_vec(requests)?,
        };

        let started = Instant::now();
        let mut attempt = 0;
        let result = loop {
            match self.send(body.clone(), requests).await {
                Err(BackendError::Connect(err)) if attempt < self.config.max_retries => {
                    let backoff = retry_backoff(attempt);
                    warn!(
                        backend = %self.name,
                        %err,
                        attempt,
                        ?backoff,
                        "Retrying backend connection"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => break result,
            }
        };

        self.record(&result, started.elapsed());
        result
    }

    /// Calls a single method and decodes its result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<T, BackendError> {
        let params = to_raw(&params).map_err(|_| bad("unencodable params"))?;
        let request = RpcRequest::new(method, params, 1);
        let response = self
            .forward(std::slice::from_ref(&request))
            .await?
            .pop()
            .ok_or_else(|| bad("no response"))?;
        if let Some(error) = response.error {
            return Err(BackendError::Rpc { code: error.code, message: error.message });
        }
        let result = response.result.ok_or_else(|| bad("missing result"))?;
        serde_json::from_str(result.get()).map_err(|err| bad(&err.to_string()))
    }

    async fn send(
        &self,
        body: Vec<u8>,
        requests: &[RpcRequest],
    ) -> Result<Vec<RpcResponse>, BackendError> {
        let mut request = self
            .client
            .post(self.config.rpc_url.clone())
            .headers(self.headers.clone())
            .timeout(self.config.response_timeout)
            .body(body);
        if let Some(username) = &self.config.username {
            request = request.basic_auth(username, self.config.password.as_ref());
        }

        let mut response = request.send().await?;
        let status = response.status();
        if Disposition::of(status) == Disposition::Retry {
            debug!(backend = %self.name, %status, "Backend returned retriable status");
            return Err(BackendError::Status(status.as_u16()));
        }

        let max = self.config.max_response_size_bytes;
        if response.content_length().is_some_and(|len| len as usize > max) {
            return Err(BackendError::ResponseTooLarge);
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > max {
                return Err(BackendError::ResponseTooLarge);
            }
            body.extend_from_slice(&chunk);
        }

        trace!(backend = %self.name, %status, len = body.len(), "Received backend response");
        parse_responses(requests, &body)
    }

    fn record(&self, result: &Result<Vec<RpcResponse>, BackendError>, elapsed: Duration) {
        self.requests.incr();
        self.metrics.requests.increment(1);
        match result {
            Ok(_) => {
                self.latency.add(elapsed.as_millis() as f64);
                self.metrics.latency.record(elapsed.as_millis() as f64);
            }
            Err(err) if err.counts_as_failure() => {
                self.errors.incr();
                self.metrics.errors.increment(1);
                let error_rate = self.error_rate();
                if error_rate >= self.config.max_error_rate_threshold {
                    warn!(
                        backend = %self.name,
                        error_rate,
                        "Backend error rate exceeded, taking out of service"
                    );
                    self.set_out_of_service();
                }
            }
            Err(_) => {}
        }
    }

    /// Takes the backend out of service for its configured interval.
    pub fn set_out_of_service(&self) {
        let until = now_millis() + self.config.out_of_service.as_millis() as u64;
        self.unavailable_until.fetch_max(until, Ordering::Relaxed);
        self.metrics.out_of_service.increment(1);
    }

    /// Whether the backend is inside its out of service window.
    pub fn is_out_of_service(&self) -> bool {
        now_millis() < self.unavailable_until.load(Ordering::Relaxed)
    }

    /// Fraction of requests that failed over the health window.
    ///
    /// Zero until enough requests were observed to be meaningful.
    pub fn error_rate(&self) -> f64 {
        let requests = self.requests.sum();
        if requests < MIN_ERROR_RATE_REQUESTS {
            return 0.0;
        }
        self.errors.sum() / requests
    }

    /// Average latency of successful requests over the health window.
    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency.avg() / 1000.0)
    }

    /// Whether the backend can take traffic as far as its own history is concerned.
    pub fn is_healthy(&self) -> bool {
        !self.is_out_of_service()
            && self.error_rate() < self.config.max_error_rate_threshold
            && self.latency() < self.config.max_latency_threshold
    }

    /// Whether the backend is slow enough to be tried last.
    pub fn is_degraded(&self) -> bool {
        self.latency() > self.config.max_degraded_latency_threshold
    }
}

/// Matches backend responses to the requests of a minibatch.
pub fn parse_responses(
    requests: &[RpcRequest],
    body: &[u8],
) -> Result<Vec<RpcResponse>, BackendError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(bad("empty response"));
    }

    let mut responses: Vec<RpcResponse> = if is_batch(body) {
        serde_json::from_slice(body).map_err(|err| bad(&err.to_string()))?
    } else if requests.len() == 1 {
        vec![serde_json::from_slice(body).map_err(|err| bad(&err.to_string()))?]
    } else {
        return Err(bad("expected a batch response"));
    };

    if responses.iter().any(|response| !response.is_well_formed()) {
        return Err(bad("response needs exactly one of result and error"));
    }
    for response in responses.iter_mut().filter(|response| response.is_error()) {
        response.result = None;
    }

    // a lone answer to a lone request is accepted whatever id it echoes
    if let ([request], [_]) = (requests, responses.as_slice()) {
        let response = responses.into_iter().next().ok_or_else(|| bad("no response"))?;
        return Ok(vec![response.with_id(request.id())]);
    }

    let mut by_id: HashMap<String, RpcResponse> =
        responses.into_iter().map(|response| (id_key(&response.id), response)).collect();
    Ok(requests
        .iter()
        .map(|request| {
            let id = request.id();
            match by_id.remove(&id_key(&id)) {
                Some(response) => response.with_id(id),
                None => RpcResponse::error(
                    id,
                    RpcErrorObject {
                        code: BAD_RESPONSE_CODE,
                        message: "backend response is missing this id".to_string(),
                        data: None,
                    },
                ),
            }
        })
        .collect())
}

/// Normalized form of a raw id, so that `1` and `1.0` written differently still match.
fn id_key(id: &serde_json::value::RawValue) -> String {
    serde_json::from_str::<serde_json::Value>(id.get())
        .map(|value| value.to_string())
        .unwrap_or_else(|_| id.get().to_string())
}

fn bad(reason: &str) -> BackendError {
    BackendError::BadResponse(reason.to_string())
}

/// Backoff before the `attempt`th connection retry: exponential with jitter, capped.
pub fn retry_backoff(attempt: u32) -> Duration {
    let base = 1000u64.saturating_mul(1 << attempt.min(16));
    let jitter = rand::random_range(0..250);
    Duration::from_millis(base + jitter).min(MAX_RETRY_BACKOFF)
}

/// Current unix time in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or_default()
}

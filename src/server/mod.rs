//! The proxy front door.
//!
//! [`Proxy`] owns everything a request touches: backend groups, the method routing table, rate
//! limiters and the response cache. The HTTP and websocket listeners in [`http`] and [`ws`] are
//! thin adapters that build a [`RequestContext`] and hand the payload to the proxy.

use crate::{
    backend::Backend,
    cache::RpcCache,
    config::ProxydConfig,
    constants::{
        DEFAULT_RATE_LIMIT_HEADER, LIMITER_PRUNE_INTERVAL, MAX_BATCH_SIZE_HARD_LIMIT,
        SEND_RAW_TRANSACTION,
    },
    consensus::ConsensusUpdate,
    error::{NO_BACKENDS_CODE, RpcError},
    group::BackendGroup,
    limiter::{FrontendRateLimiter, SenderRateLimiter, spawn_pruner},
    metrics::RpcMetrics,
    types::{RequestContext, RpcEnvelope, RpcRequest, RpcResponse, null_id, to_raw},
};
use axum::http::StatusCode;
use eyre::WrapErr;
use futures_util::future::join_all;
use itertools::Itertools;
use serde::Serialize;
use serde_json::value::RawValue;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod http;
pub mod ws;

/// The body of a reply to an HTTP payload.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    /// Answer to a single call.
    Single(RpcResponse),
    /// Answers to a batch, in call order.
    Batch(Vec<RpcResponse>),
}

/// The reply to an HTTP payload.
#[derive(Debug)]
pub struct ProxyReply {
    /// HTTP status of the reply.
    pub status: StatusCode,
    /// JSON body.
    pub body: ReplyBody,
    /// Whether any call was answered from the cache.
    pub cache_hit: bool,
    /// `group/backend` of every backend that served a call.
    pub served_by: Vec<String>,
}

impl ProxyReply {
    /// A reply made of a single error answering a call without an id.
    pub fn error(err: RpcError) -> Self {
        Self {
            status: err.http_status(),
            body: ReplyBody::Single(err.into_response(null_id())),
            cache_hit: false,
            served_by: Vec::new(),
        }
    }
}

/// What to do with a websocket frame from a client.
#[derive(Debug)]
pub enum WsAdmission {
    /// Forward the frame to the backend verbatim.
    Forward,
    /// Answer the client directly.
    Reply(RpcResponse),
}

/// A call that passed every check and waits to be forwarded.
#[derive(Debug)]
struct Admitted {
    request: RpcRequest,
    group: Arc<BackendGroup>,
}

/// A response together with the HTTP status it gets when it answers a single call.
#[derive(Debug)]
struct Answer {
    response: RpcResponse,
    status: StatusCode,
}

impl Answer {
    fn ok(response: RpcResponse) -> Self {
        Self { status: single_status(&response), response }
    }

    fn error(err: RpcError, id: Box<RawValue>) -> Self {
        Self { status: err.http_status(), response: err.into_response(id) }
    }
}

/// Outcome of the checks run on a single call.
enum Admission {
    Answer(Answer),
    Forward(Admitted),
}

/// The proxy state shared by all listeners.
#[derive(Debug, Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

#[derive(Debug)]
struct ProxyInner {
    config: ProxydConfig,
    groups: HashMap<String, Arc<BackendGroup>>,
    /// Method name to the group serving it.
    routes: HashMap<String, Arc<BackendGroup>>,
    ws_group: Option<Arc<BackendGroup>>,
    strip: BTreeSet<String>,
    cache: Option<RpcCache>,
    limiter: Arc<FrontendRateLimiter>,
    sender_limiter: Option<Arc<SenderRateLimiter>>,
    gate: Option<Arc<Semaphore>>,
    ip_header: String,
    max_batch_size: usize,
    metrics: RpcMetrics,
    cancel: CancellationToken,
}

impl Proxy {
    /// Builds backends, groups, limiters and the cache described by the configuration.
    ///
    /// Nothing runs in the background until [`Proxy::start`] is called.
    pub async fn new(config: ProxydConfig, cancel: CancellationToken) -> eyre::Result<Self> {
        config.validate()?;

        let backends = config
            .backends
            .iter()
            .map(|(name, backend)| {
                let backend = Backend::new(name.clone(), backend.clone())
                    .wrap_err_with(|| format!("failed to build backend {name}"))?;
                Ok((name.clone(), Arc::new(backend)))
            })
            .collect::<eyre::Result<HashMap<_, _>>>()?;

        let groups: HashMap<_, _> = config
            .backend_groups
            .iter()
            .map(|(name, group)| {
                let pick = |names: &[String]| -> Vec<Arc<Backend>> {
                    names.iter().filter_map(|name| backends.get(name).cloned()).collect()
                };
                let group = BackendGroup::new(
                    name.clone(),
                    group,
                    pick(&group.backends),
                    pick(&group.fallbacks),
                    config.server.max_upstream_batch_size,
                    cancel.child_token(),
                );
                (name.clone(), Arc::new(group))
            })
            .collect();

        let routes = config
            .rpc_method_mappings
            .iter()
            .filter_map(|(method, group)| Some((method.clone(), groups.get(group)?.clone())))
            .collect();
        let ws_group = config.ws_backend_group.as_ref().and_then(|name| groups.get(name).cloned());

        let cache = RpcCache::from_config(&config.cache).await?;
        let limiter = Arc::new(FrontendRateLimiter::new(&config.rate_limit)?);
        let sender_limiter = SenderRateLimiter::new(&config.sender_rate_limit).map(Arc::new);
        let gate = (config.server.max_concurrent_rpcs > 0)
            .then(|| Arc::new(Semaphore::new(config.server.max_concurrent_rpcs)));
        let ip_header = config
            .rate_limit
            .ip_header_override
            .clone()
            .unwrap_or_else(|| DEFAULT_RATE_LIMIT_HEADER.to_string())
            .to_ascii_lowercase();
        let max_batch_size = config.server.batch.max_size.min(MAX_BATCH_SIZE_HARD_LIMIT);

        Ok(Self {
            inner: Arc::new(ProxyInner {
                strip: config.server.strip_methods.iter().cloned().collect(),
                config,
                groups,
                routes,
                ws_group,
                cache,
                limiter,
                sender_limiter,
                gate,
                ip_header,
                max_batch_size,
                metrics: RpcMetrics::default(),
                cancel,
            }),
        })
    }

    /// Starts consensus polling, limiter pruning and cache invalidation on reorgs.
    pub fn start(&self) {
        for group in self.inner.groups.values() {
            group.start();

            let (Some(cache), Some(consensus)) = (&self.inner.cache, group.consensus()) else {
                continue;
            };
            let cache = cache.clone();
            consensus.add_listener(Arc::new(move |update: &ConsensusUpdate| {
                if update.reorg {
                    let cache = cache.clone();
                    let finalized = update.snapshot.finalized;
                    tokio::spawn(async move {
                        cache.flush_shallow(finalized).await;
                    });
                }
            }));
        }

        spawn_pruner(&self.inner.limiter, LIMITER_PRUNE_INTERVAL);
        if let Some(sender_limiter) = &self.inner.sender_limiter {
            spawn_pruner(sender_limiter, LIMITER_PRUNE_INTERVAL);
        }
        info!(groups = self.inner.groups.len(), "Started backend groups");
    }

    /// The proxy configuration.
    pub fn config(&self) -> &ProxydConfig {
        &self.inner.config
    }

    /// The backend group with the given name.
    pub fn group(&self, name: &str) -> Option<&Arc<BackendGroup>> {
        self.inner.groups.get(name)
    }

    /// The group serving websocket clients.
    pub fn ws_group(&self) -> Option<&Arc<BackendGroup>> {
        self.inner.ws_group.as_ref()
    }

    /// Token cancelled when the proxy shuts down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Header carrying the client IP, lowercased.
    pub fn ip_header(&self) -> &str {
        &self.inner.ip_header
    }

    /// Resolves the alias of an authorization key.
    ///
    /// With authentication disabled every request is accepted without an alias.
    pub fn authenticate(&self, key: Option<&str>) -> Result<Option<String>, RpcError> {
        let authentication = &self.inner.config.authentication;
        if authentication.is_empty() {
            return Ok(None);
        }
        key.and_then(|key| authentication.get(key))
            .cloned()
            .map(Some)
            .ok_or(RpcError::Unauthorized)
    }

    /// Takes a slot of the global concurrency gate.
    ///
    /// Returns `None` when the gate is full, and `Some(None)` when there is no gate.
    pub fn try_acquire(&self) -> Option<Option<OwnedSemaphorePermit>> {
        match &self.inner.gate {
            Some(gate) => gate.clone().try_acquire_owned().ok().map(Some),
            None => Some(None),
        }
    }

    /// Serves an HTTP payload, either a single call or a batch.
    pub async fn serve(&self, ctx: &RequestContext, body: &[u8]) -> ProxyReply {
        if let Err(err) = self.inner.limiter.check_request(ctx) {
            return ProxyReply::error(err);
        }

        match RpcEnvelope::parse(body) {
            Err(err) => ProxyReply::error(err),
            Ok(RpcEnvelope::Batch(calls)) if calls.len() > self.inner.max_batch_size => {
                ProxyReply::error(RpcError::BatchTooLarge(
                    self.inner.config.server.batch.error_message.clone(),
                ))
            }
            Ok(RpcEnvelope::Batch(calls)) if calls.is_empty() => {
                ProxyReply::error(RpcError::EmptyBatch)
            }
            Ok(RpcEnvelope::Batch(calls)) => {
                let (answers, cache_hit, served_by) = self.serve_calls(ctx, &calls).await;
                ProxyReply {
                    status: StatusCode::OK,
                    body: ReplyBody::Batch(answers.into_iter().map(|a| a.response).collect()),
                    cache_hit,
                    served_by,
                }
            }
            Ok(RpcEnvelope::Single(call)) => {
                let (mut answers, cache_hit, served_by) =
                    self.serve_calls(ctx, std::slice::from_ref(&call)).await;
                let answer = answers
                    .pop()
                    .unwrap_or_else(|| Answer::error(RpcError::Internal, null_id()));
                ProxyReply {
                    status: answer.status,
                    body: ReplyBody::Single(answer.response),
                    cache_hit,
                    served_by,
                }
            }
        }
    }

    /// Runs every call through the admission checks, the cache and its backend group.
    ///
    /// Returns one response per call in call order, whether any came from the cache, and the
    /// backends that served the rest.
    async fn serve_calls(
        &self,
        ctx: &RequestContext,
        calls: &[Box<RawValue>],
    ) -> (Vec<Answer>, bool, Vec<String>) {
        let mut answers: Vec<Option<Answer>> = calls.iter().map(|_| None).collect();
        let mut admitted = Vec::new();
        for (index, call) in calls.iter().enumerate() {
            match self.admit(ctx, call) {
                Admission::Answer(answer) => answers[index] = Some(answer),
                Admission::Forward(call) => admitted.push((index, call)),
            }
        }

        let mut cache_hit = false;
        let mut pending = Vec::with_capacity(admitted.len());
        for (index, call) in admitted {
            let cached = match &self.inner.cache {
                Some(cache) => cache.lookup(&call.request).await,
                None => None,
            };
            match cached {
                Some(response) => {
                    cache_hit = true;
                    self.inner.metrics.record(&call.request.method, &response);
                    answers[index] = Some(Answer::ok(response));
                }
                None => pending.push((index, call)),
            }
        }

        let batches = split_batches(pending);
        let results = join_all(batches.iter().map(|(group, calls)| async move {
            let requests: Vec<_> = calls.iter().map(|(_, call)| call.request.clone()).collect();
            group.forward(ctx, &requests).await
        }))
        .await;

        let mut served_by = Vec::new();
        for ((group, calls), mut result) in batches.iter().zip(results) {
            let finalized = group
                .consensus()
                .map(|consensus| consensus.snapshot())
                .filter(|snapshot| snapshot.has_head())
                .map(|snapshot| snapshot.finalized);
            for ((index, call), response) in calls.iter().zip(result.responses) {
                if let Some(cache) = &self.inner.cache {
                    cache.store(&call.request, &response, finalized).await;
                }
                self.inner.metrics.record(&call.request.method, &response);
                answers[*index] = Some(Answer::ok(response));
            }
            served_by.append(&mut result.served_by);
        }
        let served_by = served_by.into_iter().unique().collect();

        let answers = answers
            .into_iter()
            .map(|answer| answer.unwrap_or_else(|| Answer::error(RpcError::Internal, null_id())))
            .collect();
        (answers, cache_hit, served_by)
    }

    /// Parses and checks a single call, answering it locally when it must not be forwarded.
    fn admit(&self, ctx: &RequestContext, call: &RawValue) -> Admission {
        let request = match RpcRequest::parse(call).and_then(|request| {
            request.validate()?;
            Ok(request)
        }) {
            Ok(request) => request,
            Err(err) => {
                debug!(req_id = %ctx.req_id, %err, "Rejected malformed call");
                return Admission::Answer(Answer::error(err, null_id()));
            }
        };

        if self.inner.strip.contains(&request.method) {
            return Admission::Answer(Answer::ok(empty_array(&request)));
        }

        let Some(group) = self.inner.routes.get(&request.method) else {
            debug!(req_id = %ctx.req_id, method = %request.method, "Method is not whitelisted");
            self.inner.metrics.record_rejected(&request.method, RpcError::NotWhitelisted.code());
            return Admission::Answer(Answer::error(RpcError::NotWhitelisted, request.id()));
        };

        if let Err(err) = self.check_limits(ctx, &request) {
            self.inner.metrics.record_rejected(&request.method, err.code());
            return Admission::Answer(Answer::error(err, request.id()));
        }

        Admission::Forward(Admitted { request, group: group.clone() })
    }

    /// Applies the per-method and sender rate limits to an admitted call.
    fn check_limits(&self, ctx: &RequestContext, request: &RpcRequest) -> Result<(), RpcError> {
        self.inner.limiter.check_method(ctx, &request.method)?;
        if request.method == SEND_RAW_TRANSACTION
            && let Some(sender_limiter) = &self.inner.sender_limiter
        {
            sender_limiter.check(request).map_err(|err| {
                debug!(req_id = %ctx.req_id, %err, "Rejected raw transaction");
                RpcError::from(err)
            })?;
        }
        Ok(())
    }

    /// Checks a websocket frame from a client.
    ///
    /// Only methods of the websocket whitelist are forwarded, within the client's base and
    /// per-method limits. Rejections are answered with an error frame and leave the session open.
    pub fn admit_ws(&self, ctx: &RequestContext, frame: &str) -> WsAdmission {
        let request = match serde_json::from_str::<RpcRequest>(frame)
            .map_err(|_| RpcError::Parse)
            .and_then(|request| {
                request.validate()?;
                Ok(request)
            }) {
            Ok(request) => request,
            Err(err) => return WsAdmission::Reply(err.into_response(null_id())),
        };

        // every frame counts against the client's base limit, like an HTTP request
        if let Err(err) = self.inner.limiter.check_request(ctx) {
            return WsAdmission::Reply(err.into_response(request.id()));
        }
        if self.inner.strip.contains(&request.method) {
            return WsAdmission::Reply(empty_array(&request));
        }
        if !self.inner.config.ws_method_whitelist.contains(&request.method) {
            debug!(req_id = %ctx.req_id, method = %request.method, "Websocket method rejected");
            return WsAdmission::Reply(RpcError::NotWhitelisted.into_response(request.id()));
        }
        if let Err(err) = self.check_limits(ctx, &request) {
            return WsAdmission::Reply(err.into_response(request.id()));
        }
        WsAdmission::Forward
    }
}

/// Splits calls into upstream batches.
///
/// Calls go to their group's batch, except that a batch never carries the same id twice: the
/// n-th occurrence of an id goes to the n-th batch of its group.
fn split_batches(
    calls: Vec<(usize, Admitted)>,
) -> Vec<(Arc<BackendGroup>, Vec<(usize, Admitted)>)> {
    let mut seen: HashMap<(String, String), usize> = HashMap::new();
    let mut slots: HashMap<(String, usize), usize> = HashMap::new();
    let mut batches: Vec<(Arc<BackendGroup>, Vec<(usize, Admitted)>)> = Vec::new();

    for (index, call) in calls {
        let group = call.group.name().to_string();
        let occurrence =
            seen.entry((group.clone(), call.request.id().get().to_string())).or_default();
        let key = (group, *occurrence);
        *occurrence += 1;

        let slot = *slots.entry(key).or_insert_with(|| {
            batches.push((call.group.clone(), Vec::new()));
            batches.len() - 1
        });
        batches[slot].1.push((index, call));
    }
    batches
}

/// The local answer to a stripped method.
fn empty_array(request: &RpcRequest) -> RpcResponse {
    match to_raw(&[(); 0]) {
        Ok(result) => RpcResponse::success(request.id(), result),
        Err(err) => err.into_response(request.id()),
    }
}

/// HTTP status of a reply to a single call.
///
/// Errors produced by the proxy carry their own status. Errors returned by a backend are relayed
/// with 200, except when no backend could serve the call.
fn single_status(response: &RpcResponse) -> StatusCode {
    match &response.error {
        Some(error) if error.code == NO_BACKENDS_CODE => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

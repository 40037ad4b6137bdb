//! Backend groups.
//!
//! A [`BackendGroup`] is the unit a method is routed to. It picks the order in which its backends
//! are tried, splits calls into upstream minibatches and fails over between backends. Groups that
//! are consensus-aware only route to the elected consensus group and rewrite block tags first.

use crate::{
    backend::{Backend, BackendWsStream, WsConnGuard},
    config::BackendGroupConfig,
    consensus::{ConsensusConfig, ConsensusPoller},
    constants::{STICKY_SESSION_CAPACITY, STICKY_SESSION_IDLE},
    error::{BackendError, RpcError},
    rewriter::{Rewrite, RewriteContext, rewrite_request},
    types::{RequestContext, RpcRequest, RpcResponse},
};
use futures_util::future::join_all;
use itertools::Itertools;
use moka::sync::Cache;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod routing;
use routing::Router;

/// Responses of a group to a list of calls.
#[derive(Debug, Default)]
pub struct GroupResponse {
    /// One response per call, in call order.
    pub responses: Vec<RpcResponse>,
    /// `group/backend` of every backend that answered a minibatch, each listed once.
    pub served_by: Vec<String>,
}

/// A set of backends serving the same methods.
#[derive(Debug)]
pub struct BackendGroup {
    name: String,
    /// Primaries followed by fallbacks.
    backends: Vec<Arc<Backend>>,
    primaries: usize,
    consensus: Option<ConsensusPoller>,
    max_block_range: Option<u64>,
    max_upstream_batch_size: usize,
    router: Router,
    sessions: Cache<String, usize>,
}

impl BackendGroup {
    /// Creates a group over already built backends.
    ///
    /// Consensus-aware groups get a poller that is started with [`BackendGroup::start`].
    pub fn new(
        name: impl Into<String>,
        config: &BackendGroupConfig,
        primaries: Vec<Arc<Backend>>,
        fallbacks: Vec<Arc<Backend>>,
        max_upstream_batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        let name = name.into();
        let primary_count = primaries.len();
        let backends: Vec<_> = primaries.into_iter().chain(fallbacks).collect();
        let consensus = config.consensus_aware.then(|| {
            ConsensusPoller::new(
                name.clone(),
                backends.clone(),
                primary_count,
                ConsensusConfig::from(config),
                cancel,
            )
        });
        Self {
            name,
            backends,
            primaries: primary_count,
            consensus,
            max_block_range: config.consensus_max_block_range,
            max_upstream_batch_size: max_upstream_batch_size.max(1),
            router: Router::new(config.routing_strategy),
            sessions: Cache::builder()
                .max_capacity(STICKY_SESSION_CAPACITY)
                .time_to_idle(STICKY_SESSION_IDLE)
                .build(),
        }
    }

    /// The group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The group backends, primaries first.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// The consensus poller, for consensus-aware groups.
    pub const fn consensus(&self) -> Option<&ConsensusPoller> {
        self.consensus.as_ref()
    }

    /// Starts background work of the group.
    pub fn start(&self) {
        if let Some(consensus) = &self.consensus {
            consensus.start();
        }
    }

    /// Forwards calls and returns one response per call, in call order.
    ///
    /// Calls are sent in minibatches of at most `max_upstream_batch_size`. Each minibatch fails
    /// over independently; a minibatch that no backend could serve is answered with
    /// [`RpcError::NoBackends`].
    pub async fn forward(&self, ctx: &RequestContext, requests: &[RpcRequest]) -> GroupResponse {
        let mut responses: Vec<Option<RpcResponse>> = vec![None; requests.len()];
        let mut upstream = Vec::with_capacity(requests.len());

        match &self.consensus {
            Some(consensus) => {
                let snapshot = consensus.snapshot();
                if !snapshot.has_head() {
                    warn!(group = %self.name, req_id = %ctx.req_id, "No consensus elected yet");
                    return GroupResponse {
                        responses: requests
                            .iter()
                            .map(|request| RpcError::NoBackends.into_response(request.id()))
                            .collect(),
                        served_by: Vec::new(),
                    };
                }
                let rewrite_ctx = RewriteContext::new(&snapshot, self.max_block_range);
                for (index, request) in requests.iter().enumerate() {
                    let mut request = request.clone();
                    match rewrite_request(&rewrite_ctx, &mut request) {
                        Ok(Rewrite::Unchanged | Rewrite::Request) => {
                            upstream.push((index, request))
                        }
                        Ok(rewrite) => responses[index] = rewrite.into_response(&request),
                        Err(err) => responses[index] = Some(err.into_response(request.id())),
                    }
                }
            }
            None => upstream.extend(requests.iter().cloned().enumerate()),
        }

        let candidates = self.candidates(ctx);
        let minibatches: Vec<_> = upstream.chunks(self.max_upstream_batch_size).collect();
        let results = join_all(minibatches.iter().map(|minibatch| {
            let calls: Vec<_> = minibatch.iter().map(|(_, request)| request.clone()).collect();
            let candidates = &candidates;
            async move { self.forward_minibatch(ctx, candidates, calls).await }
        }))
        .await;

        let mut served_by = Vec::new();
        for (minibatch, (answers, backend)) in minibatches.into_iter().zip(results) {
            if let Some(backend) = backend {
                served_by.push(format!("{}/{}", self.name, backend));
            }
            for ((index, _), answer) in minibatch.iter().zip(answers) {
                responses[*index] = Some(answer);
            }
        }
        let served_by = served_by.into_iter().unique().collect();

        GroupResponse {
            responses: responses
                .into_iter()
                .zip(requests)
                .map(|(response, request)| {
                    response.unwrap_or_else(|| RpcError::Internal.into_response(request.id()))
                })
                .collect(),
            served_by,
        }
    }

    /// Tries the candidates in order until one answers the minibatch.
    async fn forward_minibatch(
        &self,
        ctx: &RequestContext,
        candidates: &[usize],
        calls: Vec<RpcRequest>,
    ) -> (Vec<RpcResponse>, Option<String>) {
        let mut too_large = false;
        for &index in candidates {
            let backend = &self.backends[index];
            match backend.forward(&calls).await {
                Ok(responses) => {
                    if let Some(session) = &ctx.session {
                        self.sessions.insert(session.clone(), index);
                    }
                    return (responses, Some(backend.name().to_string()));
                }
                Err(BackendError::ResponseTooLarge) => {
                    warn!(
                        group = %self.name,
                        backend = %backend.name(),
                        req_id = %ctx.req_id,
                        "Backend response too large"
                    );
                    too_large = true;
                }
                Err(err @ (BackendError::Offline | BackendError::OverCapacity)) => {
                    debug!(
                        group = %self.name,
                        backend = %backend.name(),
                        req_id = %ctx.req_id,
                        %err,
                        "Skipping backend"
                    );
                }
                Err(err) => {
                    warn!(
                        group = %self.name,
                        backend = %backend.name(),
                        req_id = %ctx.req_id,
                        auth = ?ctx.auth,
                        %err,
                        "Failed to forward to backend"
                    );
                }
            }
        }

        metrics::counter!("proxyd_unserviceable_requests", "group" => self.name.clone())
            .increment(calls.len() as u64);
        warn!(
            group = %self.name,
            req_id = %ctx.req_id,
            calls = calls.len(),
            "No backend could serve the calls"
        );
        // an answer that no backend could fit under the size limit is reported as such
        let err = if too_large { RpcError::ResponseTooLarge } else { RpcError::NoBackends };
        let responses = calls.iter().map(|call| err.clone().into_response(call.id())).collect();
        (responses, None)
    }

    /// Backend indices in the order they are tried for a request.
    fn candidates(&self, ctx: &RequestContext) -> Vec<usize> {
        let key = ctx.routing_key();
        let mut candidates = match &self.consensus {
            Some(consensus) => {
                let mut members: Vec<_> = consensus
                    .snapshot()
                    .group
                    .iter()
                    .copied()
                    .filter(|index| self.backends[*index].is_healthy())
                    .collect();
                self.router.order(&mut members, &self.backends, &key);
                self.by_health(members)
            }
            None => {
                let mut primaries: Vec<_> = (0..self.primaries).collect();
                let mut fallbacks: Vec<_> = (self.primaries..self.backends.len()).collect();
                self.router.order(&mut primaries, &self.backends, &key);
                self.router.order(&mut fallbacks, &self.backends, &key);
                let mut candidates = self.by_health(primaries);
                candidates.extend(self.by_health(fallbacks));
                candidates
            }
        };

        if let Some(sticky) = ctx.session.as_ref().and_then(|session| self.sessions.get(session))
            && let Some(pos) = candidates.iter().position(|index| *index == sticky)
        {
            let index = candidates.remove(pos);
            candidates.insert(0, index);
        }
        candidates
    }

    /// Moves degraded backends behind healthy ones and unhealthy ones last, keeping the routing
    /// order inside each class.
    fn by_health(&self, candidates: Vec<usize>) -> Vec<usize> {
        let (healthy, rest): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|index| {
            let backend = &self.backends[*index];
            backend.is_healthy() && !backend.is_degraded()
        });
        let (degraded, unhealthy): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|index| self.backends[*index].is_healthy());
        healthy.into_iter().chain(degraded).chain(unhealthy).collect()
    }

    /// Connects to the first backend that can take a websocket session, primaries first.
    pub async fn dial_ws(
        &self,
        ctx: &RequestContext,
    ) -> Result<(Arc<Backend>, BackendWsStream, WsConnGuard), RpcError> {
        let (primaries, fallbacks) = self.backends.split_at(self.primaries);
        for tier in [primaries, fallbacks] {
            for backend in tier.iter().filter(|b| b.supports_ws() && b.is_healthy()) {
                match backend.dial_ws().await {
                    Ok((stream, guard)) => return Ok((backend.clone(), stream, guard)),
                    Err(err) => warn!(
                        group = %self.name,
                        backend = %backend.name(),
                        req_id = %ctx.req_id,
                        %err,
                        "Failed to dial websocket backend"
                    ),
                }
            }
        }
        Err(RpcError::NoBackends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, RoutingStrategy};
    use serde_json::value::RawValue;
    use std::time::Duration;

    fn group(config: BackendGroupConfig, primaries: usize, fallbacks: usize) -> BackendGroup {
        let backend =
            |name: String| Arc::new(Backend::new(name, BackendConfig::default()).unwrap());
        BackendGroup::new(
            "main",
            &config,
            (0..primaries).map(|i| backend(format!("p{i}"))).collect(),
            (0..fallbacks).map(|i| backend(format!("f{i}"))).collect(),
            10,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_primaries_before_fallbacks() {
        let group = group(BackendGroupConfig::default(), 2, 2);
        let candidates = group.candidates(&RequestContext::new());
        assert_eq!(candidates.len(), 4);
        assert!(candidates[..2].iter().all(|index| *index < 2));
    }

    #[test]
    fn test_unhealthy_backends_go_last() {
        let config = BackendGroupConfig::default();
        let group = group(config, 3, 0);
        group.backends[0].set_out_of_service();
        for _ in 0..3 {
            let candidates = group.candidates(&RequestContext::new());
            assert_eq!(candidates.last(), Some(&0));
        }
    }

    #[test]
    fn test_sticky_session_goes_first() {
        let config =
            BackendGroupConfig::default().with_routing_strategy(RoutingStrategy::RoundRobin);
        let group = group(config, 3, 0);
        group.sessions.insert("s1".to_string(), 2);
        let ctx = RequestContext { session: Some("s1".to_string()), ..RequestContext::new() };
        for _ in 0..3 {
            assert_eq!(group.candidates(&ctx)[0], 2);
        }
    }

    #[tokio::test]
    async fn test_consensus_group_without_head_has_no_backends() {
        let config = BackendGroupConfig::default().with_consensus(Duration::from_secs(1));
        let group = group(config, 2, 0);
        let request = RpcRequest::new("eth_chainId", RawValue::NULL.to_owned(), 1);
        let response = group.forward(&RequestContext::new(), &[request]).await;
        assert_eq!(response.responses.len(), 1);
        assert_eq!(response.responses[0].error.as_ref().unwrap().code, -32011);
        assert!(response.served_by.is_empty());
    }
}

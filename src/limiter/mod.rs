//! Client and sender rate limiting.
//!
//! All limiters are token buckets from [`governor`]. Keyed limiters forget idle keys when pruned,
//! so memory stays bounded by the number of recently active clients.

use crate::{
    config::{MethodOverride, RateLimitConfig},
    error::RpcError,
    types::RequestContext,
};
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use regex::Regex;
use std::{
    collections::HashMap,
    hash::Hash,
    net::IpAddr,
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};
use tracing::trace;

mod sender;
pub use sender::SenderRateLimiter;

/// Builds a quota of `limit` cells per `interval`, bursting up to `limit`.
///
/// Returns `None` for a zero limit or interval, which disables the limiter.
pub fn quota(limit: u32, interval: Duration) -> Option<Quota> {
    let burst = NonZeroU32::new(limit)?;
    Quota::with_period(interval / limit).map(|quota| quota.allow_burst(burst))
}

/// Something that holds per-key state which can be pruned.
pub trait Prune {
    /// Drops the state of keys that have not been seen recently.
    fn prune(&self);
}

impl<K: Hash + Eq + Clone> Prune for DefaultKeyedRateLimiter<K> {
    fn prune(&self) {
        self.retain_recent();
        self.shrink_to_fit();
    }
}

/// Periodically prunes `limiter` until it is dropped.
pub fn spawn_pruner<L: Prune + Send + Sync + 'static>(limiter: &Arc<L>, every: Duration) {
    let limiter = Arc::downgrade(limiter);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let Some(limiter) = limiter.upgrade() else { break };
            limiter.prune();
        }
    });
}

#[derive(Debug)]
enum MethodLimiter {
    PerClient(DefaultKeyedRateLimiter<IpAddr>),
    Global(DefaultDirectRateLimiter),
}

impl MethodLimiter {
    fn new(config: &MethodOverride) -> Option<Self> {
        let quota = quota(config.limit, config.interval)?;
        Some(if config.global {
            Self::Global(RateLimiter::direct(quota))
        } else {
            Self::PerClient(RateLimiter::keyed(quota))
        })
    }
}

/// Rate limits clients by IP, with optional per-method buckets.
#[derive(Debug)]
pub struct FrontendRateLimiter {
    base: Option<DefaultKeyedRateLimiter<IpAddr>>,
    methods: HashMap<String, MethodLimiter>,
    exempt_origins: Vec<Regex>,
    exempt_user_agents: Vec<Regex>,
    error_message: String,
}

impl FrontendRateLimiter {
    /// Creates the limiter described by the configuration.
    pub fn new(config: &RateLimitConfig) -> eyre::Result<Self> {
        Ok(Self {
            base: quota(config.base_rate, config.base_interval).map(RateLimiter::keyed),
            methods: config
                .method_overrides
                .iter()
                .filter_map(|(method, limit)| Some((method.clone(), MethodLimiter::new(limit)?)))
                .collect(),
            exempt_origins: config
                .exempt_origins
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            exempt_user_agents: config
                .exempt_user_agents
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<_, _>>()?,
            error_message: config.error_message.clone(),
        })
    }

    /// Whether the client matches an exemption pattern.
    pub fn is_exempt(&self, ctx: &RequestContext) -> bool {
        let matches = |patterns: &[Regex], value: Option<&String>| {
            value.is_some_and(|value| patterns.iter().any(|pattern| pattern.is_match(value)))
        };
        matches(&self.exempt_origins, ctx.origin.as_ref())
            || matches(&self.exempt_user_agents, ctx.user_agent.as_ref())
    }

    /// Takes one token from the client's base bucket.
    pub fn check_request(&self, ctx: &RequestContext) -> Result<(), RpcError> {
        let (Some(base), Some(ip)) = (&self.base, &ctx.remote_ip) else { return Ok(()) };
        if self.is_exempt(ctx) {
            return Ok(());
        }
        base.check_key(ip).map_err(|_| self.limited(ctx, None))
    }

    /// Takes one token from the method's bucket, if the method has one.
    ///
    /// Global buckets apply to exempt clients too.
    pub fn check_method(&self, ctx: &RequestContext, method: &str) -> Result<(), RpcError> {
        match self.methods.get(method) {
            Some(MethodLimiter::Global(limiter)) => {
                limiter.check().map_err(|_| self.limited(ctx, Some(method)))
            }
            Some(MethodLimiter::PerClient(limiter)) => {
                let Some(ip) = &ctx.remote_ip else { return Ok(()) };
                if self.is_exempt(ctx) {
                    return Ok(());
                }
                limiter.check_key(ip).map_err(|_| self.limited(ctx, Some(method)))
            }
            None => Ok(()),
        }
    }

    fn limited(&self, ctx: &RequestContext, method: Option<&str>) -> RpcError {
        trace!(req_id = %ctx.req_id, ip = ?ctx.remote_ip, ?method, "Client over rate limit");
        let scope = method.unwrap_or("base").to_string();
        metrics::counter!("proxyd_rate_limit_taken_total", "scope" => scope).increment(1);
        RpcError::OverRateLimit(self.error_message.clone())
    }
}

impl Prune for FrontendRateLimiter {
    fn prune(&self) {
        if let Some(base) = &self.base {
            base.prune();
        }
        for limiter in self.methods.values() {
            if let MethodLimiter::PerClient(limiter) = limiter {
                limiter.prune();
            }
        }
    }
}

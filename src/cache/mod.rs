//! RPC response cache.
//!
//! Only calls whose answer can never change are cached: calls addressed by hash, chain constants,
//! and calls pinned to a block number at or behind the finalized head. Everything that references
//! a symbolic block tag is left alone.

use crate::{
    config::{CacheConfig, CacheDriverKind},
    types::{RpcRequest, RpcResponse},
};
use alloy::eips::{BlockId, BlockNumberOrTag};
use async_trait::async_trait;
use serde_json::{Value, value::RawValue};
use std::{fmt::Debug, sync::Arc, time::Duration};
use tracing::{debug, trace};

mod key;
pub use key::*;

mod memory;
pub use memory::MemoryCache;

mod metrics;
pub use self::metrics::CacheMetrics;

mod redis;
pub use self::redis::RedisCache;

/// Methods whose result is a chain constant.
const CONSTANT_METHODS: &[&str] =
    &["eth_chainId", "net_version", "web3_clientVersion", "eth_protocolVersion"];

/// Methods addressed by block or transaction hash.
const BY_HASH_METHODS: &[&str] = &[
    "eth_getBlockByHash",
    "eth_getTransactionByHash",
    "eth_getTransactionReceipt",
    "eth_getBlockTransactionCountByHash",
    "eth_getUncleCountByBlockHash",
    "eth_getUncleByBlockHashAndIndex",
];

/// How long, and under which condition, a response may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// The response never changes.
    Immutable,
    /// The response is fixed once `block` is finalized.
    BlockGated {
        /// Highest block the call references.
        block: u64,
    },
    /// The response must not be cached.
    NeverCache,
}

impl CachePolicy {
    /// Looks up the policy of a call.
    pub fn of(method: &str, params: &Value) -> Self {
        if CONSTANT_METHODS.contains(&method) || BY_HASH_METHODS.contains(&method) {
            return Self::Immutable;
        }
        let params = params.as_array().map(Vec::as_slice).unwrap_or_default();
        match method {
            "eth_getLogs" => logs_policy(params.first()),
            "eth_getBlockByNumber" => block_policy(params.first()),
            "eth_call" | "eth_getCode" | "eth_getBalance" | "eth_getTransactionCount" => {
                block_policy(params.get(1))
            }
            "eth_getStorageAt" => block_policy(params.get(2)),
            _ => Self::NeverCache,
        }
    }
}

fn block_policy(param: Option<&Value>) -> CachePolicy {
    match param.and_then(|param| serde_json::from_value::<BlockId>(param.clone()).ok()) {
        Some(BlockId::Hash(_)) => CachePolicy::Immutable,
        Some(BlockId::Number(BlockNumberOrTag::Number(block))) => CachePolicy::BlockGated { block },
        _ => CachePolicy::NeverCache,
    }
}

fn logs_policy(filter: Option<&Value>) -> CachePolicy {
    let Some(filter) = filter.and_then(Value::as_object) else {
        return CachePolicy::NeverCache;
    };
    if filter.contains_key("blockHash") {
        return CachePolicy::Immutable;
    }
    let number = |key| {
        filter
            .get(key)
            .and_then(|value| serde_json::from_value::<BlockNumberOrTag>(value.clone()).ok())
            .and_then(|block| block.as_number())
    };
    match (number("fromBlock"), number("toBlock")) {
        (Some(from), Some(to)) => CachePolicy::BlockGated { block: from.max(to) },
        _ => CachePolicy::NeverCache,
    }
}

/// A cache storage backend.
///
/// Drivers never fail loudly: a broken driver answers misses and drops writes.
#[async_trait]
pub trait CacheDriver: Send + Sync + Debug {
    /// Label used in metrics.
    fn name(&self) -> &'static str;

    /// Returns the value stored under `key`.
    async fn get(&self, key: &str) -> Option<String>;

    /// Stores a value. `block` is set for block-gated entries so that they can be flushed.
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>, block: Option<u64>);

    /// Drops every block-gated entry above `block` and returns how many were dropped.
    async fn flush_above(&self, block: u64) -> u64;
}

/// The response cache, shared by all request handlers.
#[derive(Debug, Clone)]
pub struct RpcCache {
    driver: Arc<dyn CacheDriver>,
    ttl_immutable: Option<Duration>,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl RpcCache {
    /// Creates a cache over the given driver.
    pub fn new(
        driver: Arc<dyn CacheDriver>,
        ttl_immutable: Option<Duration>,
        ttl: Duration,
    ) -> Self {
        let metrics = CacheMetrics::new(driver.name());
        Self { driver, ttl_immutable, ttl, metrics }
    }

    /// Creates the cache described by the configuration, if it is enabled.
    pub async fn from_config(config: &CacheConfig) -> eyre::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let driver: Arc<dyn CacheDriver> = match config.driver {
            CacheDriverKind::Memory => Arc::new(MemoryCache::new(config.max_entries)),
            CacheDriverKind::Redis => {
                let url = config
                    .redis_url
                    .as_ref()
                    .ok_or_else(|| eyre::eyre!("redis cache driver requires redis_url"))?;
                Arc::new(RedisCache::connect(url, config.redis_timeout).await?)
            }
        };
        Ok(Some(Self::new(driver, config.ttl_immutable, config.ttl)))
    }

    /// Returns the value stored under `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.driver.get(key).await
    }

    /// Stores `value` under `key` if `policy` allows it given the current finalized block.
    ///
    /// Returns whether the value was stored. Block-gated values are only stored once their block
    /// is finalized, so without a finalized block they are never stored.
    pub async fn put(
        &self,
        key: &str,
        value: String,
        policy: CachePolicy,
        finalized: Option<u64>,
    ) -> bool {
        match policy {
            CachePolicy::Immutable => {
                self.driver.put(key, value, self.ttl_immutable, None).await;
                true
            }
            CachePolicy::BlockGated { block } if finalized.is_some_and(|f| block <= f) => {
                self.driver.put(key, value, Some(self.ttl), Some(block)).await;
                true
            }
            CachePolicy::BlockGated { .. } | CachePolicy::NeverCache => false,
        }
    }

    /// Drops block-gated entries above the finalized block and returns how many were dropped.
    ///
    /// Entries are only stored once their block is final, so this only finds entries written under
    /// a further finalized block than `finalized`, such as by another group sharing the cache.
    pub async fn flush_shallow(&self, finalized: u64) -> u64 {
        let flushed = self.driver.flush_above(finalized).await;
        if flushed > 0 {
            debug!(finalized, flushed, "Flushed block-gated cache entries");
            self.metrics.record_flush(flushed);
        }
        flushed
    }

    /// Looks up the cached response to a call.
    pub async fn lookup(&self, request: &RpcRequest) -> Option<RpcResponse> {
        let params = request_params(request);
        if CachePolicy::of(&request.method, &params) == CachePolicy::NeverCache {
            return None;
        }

        let started = std::time::Instant::now();
        let cached = self.get(&cache_key(&request.method, &params)).await;
        self.metrics.record_get_duration(started.elapsed());

        let Some(result) = cached.and_then(|value| RawValue::from_string(value).ok()) else {
            self.metrics.record_miss(&request.method);
            return None;
        };
        trace!(method = %request.method, "Cache hit");
        self.metrics.record_hit(&request.method);
        Some(RpcResponse::success(request.id(), result))
    }

    /// Stores the response to a call if it is cacheable.
    ///
    /// Errors and `null` results are never stored.
    pub async fn store(
        &self,
        request: &RpcRequest,
        response: &RpcResponse,
        finalized: Option<u64>,
    ) {
        if response.is_error() || response.is_null_result() {
            return;
        }
        let Some(result) = &response.result else { return };

        let params = request_params(request);
        let policy = CachePolicy::of(&request.method, &params);
        let key = cache_key(&request.method, &params);
        if self.put(&key, result.get().to_string(), policy, finalized).await {
            self.metrics.record_put(&request.method);
        }
    }
}

fn request_params(request: &RpcRequest) -> Value {
    request
        .params
        .as_deref()
        .and_then(|params| serde_json::from_str(params.get()).ok())
        .unwrap_or(Value::Null)
}

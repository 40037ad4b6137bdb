use super::{CacheDriver, CacheMetrics};
use crate::constants::{RECENT_BLOCK_HASHES, REDIS_CONNECT_TIMEOUT};
use ::redis::{
    AsyncCommands, Client, RedisError, RedisResult,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const KEY_PREFIX: &str = "proxyd:cache:";

/// Sorted set indexing block-gated keys by block number.
const GATED_INDEX: &str = "proxyd:cache:gated";

/// Blocks below the newest indexed one that stay flushable.
const GATED_INDEX_DEPTH: u64 = RECENT_BLOCK_HASHES;

/// Redis cache driver, shared between proxy instances.
///
/// Every call is bounded by a timeout. Errors and timeouts are logged and swallowed: a failed read
/// is a miss and a failed write is dropped.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    timeout: Duration,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").field("timeout", &self.timeout).finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connects to the Redis server at `url`, bounding every later call by `timeout`.
    pub async fn connect(url: &Url, timeout: Duration) -> eyre::Result<Self> {
        let client = Client::open(url.as_str())?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(timeout.max(REDIS_CONNECT_TIMEOUT))
            .set_response_timeout(timeout)
            .set_number_of_retries(1);
        let conn = tokio::time::timeout(
            REDIS_CONNECT_TIMEOUT,
            client.get_connection_manager_with_config(config),
        )
        .await
        .map_err(|_| eyre::eyre!("timed out connecting to redis"))??;
        debug!(host = ?url.host_str(), "Connected to redis cache");
        Ok(Self { conn, timeout, metrics: CacheMetrics::new("redis") })
    }

    async fn run<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = RedisResult<T>>,
    ) -> Option<T> {
        bounded(self.timeout, &self.metrics, op, call).await
    }
}

/// Awaits a redis call for at most `timeout`, turning errors and timeouts into `None`.
async fn bounded<T>(
    timeout: Duration,
    metrics: &CacheMetrics,
    op: &'static str,
    call: impl Future<Output = RedisResult<T>>,
) -> Option<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(%err, op, "Redis cache call failed");
            metrics.record_error();
            None
        }
        Err(_) => {
            warn!(op, ?timeout, "Redis cache call timed out");
            metrics.record_error();
            None
        }
    }
}

#[async_trait]
impl CacheDriver for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        let key = format!("{KEY_PREFIX}{key}");
        self.run("get", conn.get::<_, Option<String>>(key)).await.flatten()
    }

    async fn put(&self, key: &str, value: String, ttl: Option<Duration>, block: Option<u64>) {
        let mut conn = self.conn.clone();
        let key = format!("{KEY_PREFIX}{key}");
        let write = async {
            match ttl {
                Some(ttl) => conn.set_ex::<_, _, ()>(&key, value, ttl.as_secs().max(1)).await?,
                None => conn.set::<_, _, ()>(&key, value).await?,
            }
            let Some(block) = block else { return Ok::<_, RedisError>(()) };

            // entries far below the newest gated block are past any reorg the poller follows
            let stale = format!("({}", block.saturating_sub(GATED_INDEX_DEPTH));
            let mut pipe = ::redis::pipe();
            pipe.atomic()
                .zadd(GATED_INDEX, &key, block)
                .ignore()
                .zrembyscore(GATED_INDEX, "-inf", stale)
                .ignore();
            if let Some(ttl) = ttl {
                pipe.expire(GATED_INDEX, ttl.as_secs().max(1) as i64).ignore();
            }
            pipe.query_async::<()>(&mut conn).await
        };
        self.run("put", write).await;
    }

    async fn flush_above(&self, block: u64) -> u64 {
        let mut conn = self.conn.clone();
        let min = format!("({block}");
        let flush = async {
            let keys: Vec<String> = conn.zrangebyscore(GATED_INDEX, &min, "+inf").await?;
            if !keys.is_empty() {
                conn.del::<_, ()>(&keys).await?;
                conn.zrembyscore::<_, _, _, ()>(GATED_INDEX, &min, "+inf").await?;
            }
            Ok::<_, RedisError>(keys.len() as u64)
        };
        self.run("flush", flush).await.unwrap_or_default()
    }
}

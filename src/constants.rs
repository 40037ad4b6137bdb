//! Proxy constants.

use std::time::Duration;

/// The JSON-RPC protocol version every request and response carries.
pub const JSONRPC_VERSION: &str = "2.0";

/// Default deadline for a single inbound request.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(10);

/// Default limit on the size of an inbound request body.
pub const DEFAULT_MAX_BODY_SIZE_BYTES: usize = 256 * 1024;

/// Default number of calls sent to a backend in one upstream batch.
pub const DEFAULT_MAX_UPSTREAM_BATCH_SIZE: usize = 10;

/// Default number of calls accepted in one client batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Client batches are never allowed to exceed this many calls, whatever the configuration says.
pub const MAX_BATCH_SIZE_HARD_LIMIT: usize = 1000;

/// Default limit on the size of a backend response body.
pub const DEFAULT_MAX_RESPONSE_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Default per-request timeout towards a backend.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a backend is skipped after tripping its error rate.
pub const DEFAULT_OUT_OF_SERVICE: Duration = Duration::from_secs(10);

/// Average latency above which a backend is unhealthy.
pub const DEFAULT_MAX_LATENCY_THRESHOLD: Duration = Duration::from_secs(10);

/// Average latency above which a backend is degraded and tried last.
pub const DEFAULT_MAX_DEGRADED_LATENCY_THRESHOLD: Duration = Duration::from_secs(5);

/// Error rate above which a backend is taken out of service.
pub const DEFAULT_MAX_ERROR_RATE_THRESHOLD: f64 = 0.5;

/// Number of requests a backend must have seen before its error rate is trusted.
pub const MIN_ERROR_RATE_REQUESTS: f64 = 10.0;

/// Length of the rolling windows used for backend health.
pub const HEALTH_WINDOW_LENGTH: Duration = Duration::from_secs(60);

/// Upper bound of the backoff between connection retries to the same backend.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(3);

/// Default interval between consensus polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default duration of a consensus ban.
pub const DEFAULT_BAN_PERIOD: Duration = Duration::from_secs(300);

/// Default age after which a backend's polled state is considered stale.
pub const DEFAULT_MAX_UPDATE_THRESHOLD: Duration = Duration::from_secs(30);

/// Default minimum number of peers a backend must report to be a consensus candidate.
pub const DEFAULT_MIN_PEER_COUNT: u64 = 3;

/// Default window in which zero-height observations are counted.
pub const DEFAULT_BLOCK_HEIGHT_ZERO_WINDOW: Duration = Duration::from_secs(60);

/// Default number of zero-height observations tolerated inside the window.
pub const DEFAULT_BLOCK_HEIGHT_ZERO_THRESHOLD: usize = 5;

/// Number of recent block hashes remembered per backend.
pub const RECENT_BLOCK_HASHES: u64 = 128;

/// Default TTL of block-gated cache entries.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default capacity of the in-memory cache.
pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 10_000;

/// Default deadline of a redis cache call.
pub const DEFAULT_REDIS_TIMEOUT: Duration = Duration::from_millis(250);

/// Deadline for the initial redis connection.
pub const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Header reporting whether a response was served from the cache.
pub const CACHE_STATUS_HEADER: &str = "x-proxyd-cache-status";

/// Header naming the backends that served a request.
pub const SERVED_BY_HEADER: &str = "x-served-by";

/// Default header carrying a client session for sticky routing.
pub const DEFAULT_STICKY_SESSION_HEADER: &str = "x-proxyd-session";

/// Default header carrying the client IP used for rate limiting.
pub const DEFAULT_RATE_LIMIT_HEADER: &str = "x-forwarded-for";

/// Number of sticky sessions remembered per backend group.
pub const STICKY_SESSION_CAPACITY: u64 = 10_000;

/// Idle time after which a sticky session is forgotten.
pub const STICKY_SESSION_IDLE: Duration = Duration::from_secs(600);

/// Default idle timeout for client websocket reads.
pub const DEFAULT_WS_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout for websocket writes.
pub const DEFAULT_WS_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between keepalive pings sent to websocket clients.
pub const DEFAULT_WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for the websocket handshake with a backend.
pub const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Methods answered locally with an empty array unless configured otherwise.
pub const DEFAULT_STRIP_METHODS: &[&str] = &["eth_accounts"];

/// The only method subject to the sender rate limit.
pub const SEND_RAW_TRANSACTION: &str = "eth_sendRawTransaction";

/// Interval at which idle rate limiter keys are pruned.
pub const LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

//! Proxy configuration.
use crate::constants::{
    DEFAULT_BAN_PERIOD, DEFAULT_BACKEND_TIMEOUT, DEFAULT_BLOCK_HEIGHT_ZERO_THRESHOLD,
    DEFAULT_BLOCK_HEIGHT_ZERO_WINDOW, DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_CACHE_TTL,
    DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_BODY_SIZE_BYTES, DEFAULT_MAX_DEGRADED_LATENCY_THRESHOLD,
    DEFAULT_MAX_ERROR_RATE_THRESHOLD, DEFAULT_MAX_LATENCY_THRESHOLD,
    DEFAULT_MAX_RESPONSE_SIZE_BYTES, DEFAULT_MAX_UPDATE_THRESHOLD,
    DEFAULT_MAX_UPSTREAM_BATCH_SIZE, DEFAULT_MIN_PEER_COUNT, DEFAULT_OUT_OF_SERVICE,
    DEFAULT_POLL_INTERVAL, DEFAULT_REDIS_TIMEOUT, DEFAULT_SERVER_TIMEOUT,
    DEFAULT_STICKY_SESSION_HEADER,
    DEFAULT_STRIP_METHODS, DEFAULT_WS_PING_INTERVAL, DEFAULT_WS_READ_TIMEOUT,
    DEFAULT_WS_WRITE_TIMEOUT,
};
use eyre::{Context, bail, ensure};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr},
    path::Path,
    time::Duration,
};
use url::Url;

/// Proxy configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProxydConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Response cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Client rate limit configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Transaction sender rate limit configuration.
    #[serde(default)]
    pub sender_rate_limit: SenderRateLimitConfig,
    /// Upstream backends by name.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    /// Backend groups by name.
    #[serde(default)]
    pub backend_groups: BTreeMap<String, BackendGroupConfig>,
    /// Method to backend group routing. Methods absent from this map are not whitelisted.
    #[serde(default)]
    pub rpc_method_mappings: BTreeMap<String, String>,
    /// Backend group serving websocket clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_backend_group: Option<String>,
    /// Methods websocket clients may call.
    #[serde(default)]
    pub ws_method_whitelist: BTreeSet<String>,
    /// Authorization keys mapped to an alias used in logs. Empty disables authentication.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub authentication: BTreeMap<String, String>,
    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl ProxydConfig {
    /// Sets the address to serve the RPC on.
    pub fn with_rpc_host(mut self, host: IpAddr) -> Self {
        self.server.rpc_host = host;
        self
    }

    /// Sets the port to serve the RPC on.
    pub fn with_rpc_port(mut self, port: u16) -> Self {
        self.server.rpc_port = port;
        self
    }

    /// Sets the port to serve websockets on.
    pub fn with_ws_port(mut self, port: Option<u16>) -> Self {
        self.server.ws_port = port;
        self
    }

    /// Sets the port to serve the metrics on.
    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics.enabled = true;
        self.metrics.port = port;
        self
    }

    /// Sets the server configuration.
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Sets the cache configuration.
    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the rate limit configuration.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Sets the sender rate limit configuration.
    pub fn with_sender_rate_limit(mut self, sender_rate_limit: SenderRateLimitConfig) -> Self {
        self.sender_rate_limit = sender_rate_limit;
        self
    }

    /// Adds a backend.
    pub fn with_backend(mut self, name: impl Into<String>, backend: BackendConfig) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Adds a backend group.
    pub fn with_backend_group(
        mut self,
        name: impl Into<String>,
        group: BackendGroupConfig,
    ) -> Self {
        self.backend_groups.insert(name.into(), group);
        self
    }

    /// Routes the given methods to a backend group.
    pub fn with_method_mappings<I, S>(mut self, methods: I, group: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rpc_method_mappings
            .extend(methods.into_iter().map(|method| (method.into(), group.to_string())));
        self
    }

    /// Sets the websocket backend group and method whitelist.
    pub fn with_ws_backend_group<I, S>(mut self, group: &str, whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ws_backend_group = Some(group.to_string());
        self.ws_method_whitelist = whitelist.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an authorization key.
    pub fn with_authentication(
        mut self,
        secret: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.authentication.insert(secret.into(), alias.into());
        self
    }

    /// Load from a YAML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        let config = serde_yaml::from_reader(&file)
            .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save to a YAML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> eyre::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks the configuration for mistakes that would only surface at request time.
    pub fn validate(&self) -> eyre::Result<()> {
        if self.cache.enabled && self.cache.driver == CacheDriverKind::Redis {
            ensure!(self.cache.redis_url.is_some(), "redis cache driver requires redis_url");
        }

        for (name, backend) in &self.backends {
            ensure!(
                matches!(backend.rpc_url.scheme(), "http" | "https"),
                "backend {name} has an invalid rpc_url: {}",
                backend.rpc_url
            );
            if let Some(ws_url) = &backend.ws_url {
                ensure!(
                    matches!(ws_url.scheme(), "ws" | "wss"),
                    "backend {name} has an invalid ws_url: {ws_url}"
                );
            }
            ensure!(
                (0.0..=1.0).contains(&backend.max_error_rate_threshold),
                "backend {name} has an invalid max_error_rate_threshold"
            );
        }

        for (name, group) in &self.backend_groups {
            ensure!(!group.backends.is_empty(), "backend group {name} has no backends");
            for backend in group.backends.iter().chain(&group.fallbacks) {
                ensure!(
                    self.backends.contains_key(backend),
                    "backend group {name} references unknown backend {backend}"
                );
            }
            if group.routing_strategy == RoutingStrategy::Weighted {
                ensure!(
                    group.backends.iter().any(|backend| self.backends[backend].weight > 0),
                    "backend group {name} uses weighted routing but all weights are zero"
                );
            }
        }

        for (method, group) in &self.rpc_method_mappings {
            ensure!(
                self.backend_groups.contains_key(group),
                "method {method} is mapped to unknown backend group {group}"
            );
        }

        if let Some(group) = &self.ws_backend_group {
            let Some(group_config) = self.backend_groups.get(group) else {
                bail!("ws_backend_group references unknown backend group {group}");
            };
            ensure!(
                group_config
                    .backends
                    .iter()
                    .chain(&group_config.fallbacks)
                    .any(|backend| self.backends[backend].ws_url.is_some()),
                "ws_backend_group {group} has no backend with a ws_url"
            );
        }

        let exemptions =
            self.rate_limit.exempt_origins.iter().chain(&self.rate_limit.exempt_user_agents);
        for pattern in exemptions {
            Regex::new(pattern).wrap_err_with(|| format!("invalid exemption pattern: {pattern}"))?;
        }

        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The address to serve the RPC on.
    pub rpc_host: IpAddr,
    /// The port to serve the RPC on.
    pub rpc_port: u16,
    /// The address to serve websockets on.
    pub ws_host: IpAddr,
    /// The port to serve websockets on. Websockets are disabled if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    /// Maximum size of a request body. Also bounds websocket frames from clients.
    pub max_body_size_bytes: usize,
    /// Maximum number of requests served at once. Zero disables the limit.
    pub max_concurrent_rpcs: usize,
    /// Deadline for a single request, in seconds.
    #[serde(rename = "timeout_seconds", with = "crate::serde::duration")]
    pub timeout: Duration,
    /// Maximum number of calls sent to a backend in one upstream batch.
    pub max_upstream_batch_size: usize,
    /// Client batch limits.
    pub batch: BatchConfig,
    /// Whether to log request bodies.
    pub enable_request_log: bool,
    /// Maximum number of bytes of a request body written to the request log.
    pub max_request_body_log_len: usize,
    /// Whether to send permissive CORS headers.
    pub allow_all_origins: bool,
    /// Whether to add a header naming the backends that served a request.
    pub enable_served_by_header: bool,
    /// Methods answered locally with an empty array.
    pub strip_methods: Vec<String>,
    /// Header carrying the client session used for sticky routing.
    pub sticky_session_header: String,
    /// Idle time after which a websocket client is disconnected, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub ws_read_timeout: Duration,
    /// Timeout for websocket writes, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub ws_write_timeout: Duration,
    /// Interval between keepalive pings to websocket clients, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub ws_ping_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rpc_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rpc_port: 8080,
            ws_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ws_port: None,
            max_body_size_bytes: DEFAULT_MAX_BODY_SIZE_BYTES,
            max_concurrent_rpcs: 0,
            timeout: DEFAULT_SERVER_TIMEOUT,
            max_upstream_batch_size: DEFAULT_MAX_UPSTREAM_BATCH_SIZE,
            batch: BatchConfig::default(),
            enable_request_log: false,
            max_request_body_log_len: 10_000,
            allow_all_origins: false,
            enable_served_by_header: false,
            strip_methods: DEFAULT_STRIP_METHODS.iter().map(|m| m.to_string()).collect(),
            sticky_session_header: DEFAULT_STICKY_SESSION_HEADER.to_string(),
            ws_read_timeout: DEFAULT_WS_READ_TIMEOUT,
            ws_write_timeout: DEFAULT_WS_WRITE_TIMEOUT,
            ws_ping_interval: DEFAULT_WS_PING_INTERVAL,
        }
    }
}

/// Client batch limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum number of calls in a client batch.
    pub max_size: usize,
    /// Message returned when a batch is too large.
    pub error_message: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_BATCH_SIZE,
            error_message: "over batch size custom message".to_string(),
        }
    }
}

/// Cache driver kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDriverKind {
    /// Bounded in-process cache.
    #[default]
    Memory,
    /// Shared Redis cache.
    Redis,
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache is enabled.
    pub enabled: bool,
    /// Cache driver.
    pub driver: CacheDriverKind,
    /// Redis URL, required by the redis driver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<Url>,
    /// TTL of immutable entries in seconds. Unset keeps them until evicted.
    #[serde(
        rename = "ttl_seconds_immutable",
        with = "crate::serde::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl_immutable: Option<Duration>,
    /// TTL of block-gated entries in seconds.
    #[serde(rename = "ttl_seconds", with = "crate::serde::duration")]
    pub ttl: Duration,
    /// Capacity of the in-memory driver.
    pub max_entries: u64,
    /// Deadline of each redis call. An expired read is a miss and an expired write is dropped.
    #[serde(rename = "redis_timeout_ms", with = "crate::serde::duration::millis")]
    pub redis_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            driver: CacheDriverKind::Memory,
            redis_url: None,
            ttl_immutable: None,
            ttl: DEFAULT_CACHE_TTL,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            redis_timeout: DEFAULT_REDIS_TIMEOUT,
        }
    }
}

/// Client rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per interval for each client IP. Zero disables the base limit.
    pub base_rate: u32,
    /// Interval of the base limit, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub base_interval: Duration,
    /// Origins exempt from the limits, as regexes.
    pub exempt_origins: Vec<String>,
    /// User agents exempt from the limits, as regexes.
    pub exempt_user_agents: Vec<String>,
    /// Message returned to limited clients.
    pub error_message: String,
    /// Per-method limits.
    pub method_overrides: BTreeMap<String, MethodOverride>,
    /// Header carrying the client IP. Defaults to `X-Forwarded-For`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_header_override: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            base_rate: 0,
            base_interval: Duration::from_secs(1),
            exempt_origins: Vec::new(),
            exempt_user_agents: Vec::new(),
            error_message: "over rate limit".to_string(),
            method_overrides: BTreeMap::new(),
            ip_header_override: None,
        }
    }
}

/// A per-method rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodOverride {
    /// Calls allowed per interval.
    pub limit: u32,
    /// Interval, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub interval: Duration,
    /// Whether all clients share one bucket instead of one bucket per IP.
    #[serde(default, alias = "strict")]
    pub global: bool,
}

/// Transaction sender rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderRateLimitConfig {
    /// Whether the limit is enabled.
    pub enabled: bool,
    /// Transactions allowed per interval for each sender.
    pub limit: u32,
    /// Interval, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub interval: Duration,
    /// Chain ids transactions may target. Empty allows all.
    pub allowed_chain_ids: Vec<u64>,
}

impl Default for SenderRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 1,
            interval: Duration::from_secs(1),
            allowed_chain_ids: Vec::new(),
        }
    }
}

/// Upstream backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// HTTP JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Websocket endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<Url>,
    /// Basic auth username.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic auth password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Extra headers sent with every request.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Requests per second allowed towards this backend. Zero disables the limit.
    pub max_rps: u32,
    /// Websocket sessions allowed at once. Zero disables the limit.
    pub max_ws_conns: usize,
    /// Requests allowed in flight at once.
    pub max_concurrent_rpcs: usize,
    /// Maximum size of a response body.
    pub max_response_size_bytes: usize,
    /// Retries against this backend after a connection failure.
    pub max_retries: u32,
    /// Per-request timeout, in seconds.
    #[serde(rename = "response_timeout_seconds", with = "crate::serde::duration")]
    pub response_timeout: Duration,
    /// Time the backend is skipped after tripping its error rate, in seconds.
    #[serde(rename = "out_of_service_seconds", with = "crate::serde::duration")]
    pub out_of_service: Duration,
    /// Average latency above which the backend is tried last, in milliseconds.
    #[serde(rename = "max_degraded_latency_threshold_ms", with = "crate::serde::duration::millis")]
    pub max_degraded_latency_threshold: Duration,
    /// Average latency above which the backend is unhealthy, in milliseconds.
    #[serde(rename = "max_latency_threshold_ms", with = "crate::serde::duration::millis")]
    pub max_latency_threshold: Duration,
    /// Error rate above which the backend is taken out of service.
    pub max_error_rate_threshold: f64,
    /// Whether a batch of one is sent as a bare object.
    pub unwrap_single_batch: bool,
    /// Weight used by weighted routing.
    pub weight: u32,
    /// Whether consensus ignores the peer count of this backend.
    pub consensus_skip_peer_count: bool,
    /// Whether this backend is always a consensus candidate.
    pub consensus_forced_candidate: bool,
    /// Receipts target, reported as a metric label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_receipts_target: Option<String>,
    /// Window in which zero-height observations are counted, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub block_height_zero_window_length: Duration,
    /// Zero-height observations tolerated inside the window.
    pub block_height_zero_threshold: usize,
}

impl BackendConfig {
    /// Creates a backend with default settings for the given endpoint.
    pub fn new(rpc_url: Url) -> Self {
        Self { rpc_url, ..Default::default() }
    }

    /// Sets the websocket endpoint.
    pub fn with_ws_url(mut self, ws_url: Url) -> Self {
        self.ws_url = Some(ws_url);
        self
    }

    /// Sets the routing weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the number of connection retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the per-request timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Skips the peer count in consensus.
    pub fn with_skip_peer_count(mut self, skip: bool) -> Self {
        self.consensus_skip_peer_count = skip;
        self
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            rpc_url: Url::parse("http://127.0.0.1:8545").expect("valid url"),
            ws_url: None,
            username: None,
            password: None,
            headers: BTreeMap::new(),
            max_rps: 0,
            max_ws_conns: 0,
            max_concurrent_rpcs: 100,
            max_response_size_bytes: DEFAULT_MAX_RESPONSE_SIZE_BYTES,
            max_retries: 0,
            response_timeout: DEFAULT_BACKEND_TIMEOUT,
            out_of_service: DEFAULT_OUT_OF_SERVICE,
            max_degraded_latency_threshold: DEFAULT_MAX_DEGRADED_LATENCY_THRESHOLD,
            max_latency_threshold: DEFAULT_MAX_LATENCY_THRESHOLD,
            max_error_rate_threshold: DEFAULT_MAX_ERROR_RATE_THRESHOLD,
            unwrap_single_batch: true,
            weight: 1,
            consensus_skip_peer_count: false,
            consensus_forced_candidate: false,
            consensus_receipts_target: None,
            block_height_zero_window_length: DEFAULT_BLOCK_HEIGHT_ZERO_WINDOW,
            block_height_zero_threshold: DEFAULT_BLOCK_HEIGHT_ZERO_THRESHOLD,
        }
    }
}

/// Order in which a group tries its backends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Rotate the starting backend on every request.
    #[default]
    RoundRobin,
    /// Pick the starting backend with probability proportional to its weight.
    Weighted,
    /// Order backends by a hash of the request origin.
    ConsistentHash,
}

/// Backend group configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendGroupConfig {
    /// Primary backends.
    pub backends: Vec<String>,
    /// Backends used only when no primary can serve.
    pub fallbacks: Vec<String>,
    /// Whether the group tracks consensus and rewrites block tags.
    pub consensus_aware: bool,
    /// Duration of a consensus ban, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub consensus_ban_period: Duration,
    /// Age after which a backend's polled state is stale, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub consensus_max_update_threshold: Duration,
    /// Blocks a candidate may lag behind the highest before it is dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_max_block_lag: Option<u64>,
    /// Widest block range allowed in log queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus_max_block_range: Option<u64>,
    /// Minimum peer count of a consensus candidate.
    pub consensus_min_peer_count: u64,
    /// Interval between consensus polls, in seconds.
    #[serde(with = "crate::serde::duration")]
    pub consensus_poll_interval: Duration,
    /// Backend ordering.
    pub routing_strategy: RoutingStrategy,
}

impl BackendGroupConfig {
    /// Creates a group over the given primaries.
    pub fn new<I, S>(backends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { backends: backends.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    /// Sets the fallbacks.
    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallbacks = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    /// Enables consensus tracking with the given poll interval.
    pub fn with_consensus(mut self, poll_interval: Duration) -> Self {
        self.consensus_aware = true;
        self.consensus_poll_interval = poll_interval;
        self
    }

    /// Sets the routing strategy.
    pub fn with_routing_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.routing_strategy = strategy;
        self
    }
}

impl Default for BackendGroupConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            fallbacks: Vec::new(),
            consensus_aware: false,
            consensus_ban_period: DEFAULT_BAN_PERIOD,
            consensus_max_update_threshold: DEFAULT_MAX_UPDATE_THRESHOLD,
            consensus_max_block_lag: None,
            consensus_max_block_range: None,
            consensus_min_peer_count: DEFAULT_MIN_PEER_COUNT,
            consensus_poll_interval: DEFAULT_POLL_INTERVAL,
            routing_strategy: RoutingStrategy::RoundRobin,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve Prometheus metrics.
    pub enabled: bool,
    /// The address to serve the metrics on.
    pub host: IpAddr,
    /// The port to serve the metrics on.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false, host: IpAddr::V4(Ipv4Addr::LOCALHOST), port: 9761 }
    }
}

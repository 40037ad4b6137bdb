use alloy::hex;
use std::net::IpAddr;

/// Per-request metadata collected by the front door and threaded through routing.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Random id used to correlate log lines.
    pub req_id: String,
    /// Alias of the authorization key the request was made with.
    pub auth: Option<String>,
    /// Client IP used for rate limiting.
    pub remote_ip: Option<IpAddr>,
    /// Value of the `Origin` header.
    pub origin: Option<String>,
    /// Value of the `User-Agent` header.
    pub user_agent: Option<String>,
    /// Sticky session key, if the client declared one.
    pub session: Option<String>,
}

impl RequestContext {
    /// Creates a context with a fresh request id.
    pub fn new() -> Self {
        Self { req_id: hex::encode(rand::random::<[u8; 10]>()), ..Default::default() }
    }

    /// Key used by origin based routing: the origin if present, else the client IP.
    pub fn routing_key(&self) -> String {
        self.origin
            .clone()
            .or_else(|| self.remote_ip.map(|ip| ip.to_string()))
            .unwrap_or_default()
    }
}

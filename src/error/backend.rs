use super::{
    BACKEND_OFFLINE_CODE, BACKEND_OVER_CAPACITY_CODE, BAD_RESPONSE_CODE, GATEWAY_TIMEOUT_CODE,
    INTERNAL_ERROR_CODE, RESPONSE_TOO_LARGE_CODE,
};
use thiserror::Error;

/// Errors returned while forwarding to a single backend.
///
/// All of them are transient from the point of view of a backend group: the group moves on to the
/// next candidate.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend is out of service.
    #[error("backend is offline")]
    Offline,
    /// The backend has no free request slot.
    #[error("backend is over capacity")]
    OverCapacity,
    /// The backend's own request rate ceiling was hit.
    #[error("backend is rate limited")]
    RateLimited,
    /// The backend did not answer within its timeout.
    #[error("backend request timed out")]
    Timeout,
    /// The backend answered with a status that is retried elsewhere.
    #[error("backend returned HTTP status {0}")]
    Status(u16),
    /// The backend body is not a JSON-RPC response.
    #[error("backend returned an invalid response: {0}")]
    BadResponse(String),
    /// The backend body exceeded the size limit.
    #[error("backend response too large")]
    ResponseTooLarge,
    /// The backend has no websocket endpoint.
    #[error("backend does not support websockets")]
    WsUnsupported,
    /// The connection to the backend could not be established.
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] reqwest::Error),
    /// The HTTP exchange failed.
    #[error(transparent)]
    Http(reqwest::Error),
    /// The backend answered a call with a JSON-RPC error.
    #[error("backend returned error {code}: {message}")]
    Rpc {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
    },
    /// The request could not be encoded.
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    /// The websocket handshake failed.
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

impl BackendError {
    /// Returns the JSON-RPC error code describing this failure.
    pub const fn code(&self) -> i64 {
        match self {
            Self::Offline => BACKEND_OFFLINE_CODE,
            Self::OverCapacity | Self::RateLimited => BACKEND_OVER_CAPACITY_CODE,
            Self::Timeout => GATEWAY_TIMEOUT_CODE,
            Self::Status(_) | Self::BadResponse(_) => BAD_RESPONSE_CODE,
            Self::ResponseTooLarge => RESPONSE_TOO_LARGE_CODE,
            Self::Rpc { code, .. } => *code,
            Self::WsUnsupported
            | Self::Connect(_)
            | Self::Http(_)
            | Self::Encode(_)
            | Self::Ws(_) => INTERNAL_ERROR_CODE,
        }
    }

    /// Whether this failure says something about the backend's health.
    ///
    /// Capacity rejections are local decisions and JSON-RPC errors are application level, neither
    /// counts against the backend.
    pub const fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            Self::Offline
                | Self::OverCapacity
                | Self::RateLimited
                | Self::Rpc { .. }
                | Self::Encode(_)
                | Self::WsUnsupported
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err)
        } else {
            Self::Http(err)
        }
    }
}

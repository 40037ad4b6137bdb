//! Proxy error types.
use crate::types::{RpcErrorObject, RpcResponse};
use http::StatusCode;
use serde_json::value::RawValue;
use thiserror::Error;

mod backend;
pub use backend::BackendError;

mod sender;
pub use sender::SenderError;

/// Generic internal error.
pub const INTERNAL_ERROR_CODE: i64 = -32000;
/// The payload could not be parsed as JSON.
pub const PARSE_ERROR_CODE: i64 = -32700;
/// The envelope is not a valid JSON-RPC request.
pub const INVALID_REQUEST_CODE: i64 = -32600;
/// The method is missing or the envelope is malformed.
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;
/// The request params are invalid.
pub const INVALID_PARAMS_CODE: i64 = -32602;
/// The method is not whitelisted.
pub const NOT_WHITELISTED_CODE: i64 = -32001;
/// The proxy is serving too many requests at once.
pub const TOO_MANY_CONNECTIONS_CODE: i64 = -32005;
/// The selected backend is out of service.
pub const BACKEND_OFFLINE_CODE: i64 = -32010;
/// No backend could serve the request.
pub const NO_BACKENDS_CODE: i64 = -32011;
/// The selected backend is at its concurrency or rate ceiling.
pub const BACKEND_OVER_CAPACITY_CODE: i64 = -32012;
/// The backend returned something that is not a JSON-RPC response.
pub const BAD_RESPONSE_CODE: i64 = -32013;
/// The client batch has too many calls.
pub const BATCH_TOO_LARGE_CODE: i64 = -32014;
/// The request deadline elapsed.
pub const GATEWAY_TIMEOUT_CODE: i64 = -32015;
/// The client is over the global rate limit.
pub const OVER_RATE_LIMIT_CODE: i64 = -32016;
/// The transaction sender is over its rate limit.
pub const SENDER_OVER_RATE_LIMIT_CODE: i64 = -32017;
/// The raw transaction could not be decoded.
pub const INVALID_RAW_TRANSACTION_CODE: i64 = -32019;
/// The backend response exceeded the size limit.
pub const RESPONSE_TOO_LARGE_CODE: i64 = -32020;
/// The request body exceeded the size limit.
pub const BODY_TOO_LARGE_CODE: i64 = -32021;

/// Errors the proxy reports to its clients.
///
/// Every variant maps to a JSON-RPC error code and to the HTTP status used when the error answers
/// a single (non-batch) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The body is not valid JSON or not a JSON-RPC envelope.
    #[error("parse error")]
    Parse,
    /// The `jsonrpc` field is not `2.0`.
    #[error("invalid JSON-RPC version")]
    InvalidVersion,
    /// The `method` field is missing or empty.
    #[error("no method specified")]
    NoMethod,
    /// The `id` field is missing or is an object or array.
    #[error("invalid ID")]
    InvalidId,
    /// The client sent `[]`.
    #[error("must specify at least one batch call")]
    EmptyBatch,
    /// The client batch exceeds the configured maximum.
    #[error("{0}")]
    BatchTooLarge(String),
    /// The request path does not carry a known authorization key.
    #[error("unauthorized")]
    Unauthorized,
    /// The method is not routed to any backend group.
    #[error("rpc method is not whitelisted")]
    NotWhitelisted,
    /// The global concurrency gate is full.
    #[error("too many concurrent connections")]
    TooManyConnections,
    /// The request body exceeds the configured maximum.
    #[error("request body too large")]
    BodyTooLarge,
    /// Every candidate backend failed.
    #[error("no backends available for method")]
    NoBackends,
    /// The request deadline elapsed.
    #[error("gateway timeout")]
    GatewayTimeout,
    /// The client is over the global or a per-method rate limit.
    #[error("{0}")]
    OverRateLimit(String),
    /// The recovered transaction sender is over its rate limit.
    #[error("sender is over rate limit")]
    SenderOverRateLimit,
    /// The raw transaction could not be decoded or its sender recovered.
    #[error("invalid raw transaction")]
    InvalidRawTransaction,
    /// The transaction targets a chain that is not allowed.
    #[error("invalid sender")]
    InvalidSender,
    /// The request references a block beyond the consensus head.
    #[error("block is out of range")]
    BlockOutOfRange,
    /// The requested log range is wider than allowed.
    #[error("block range is too large")]
    BlockRangeTooLarge,
    /// The backend response could not be used.
    #[error("backend returned an invalid response")]
    BadResponse,
    /// The backend response exceeded the size limit.
    #[error("backend response too large")]
    ResponseTooLarge,
    /// An internal error occurred.
    #[error("internal error")]
    Internal,
}

impl RpcError {
    /// Returns the JSON-RPC error code.
    pub const fn code(&self) -> i64 {
        match self {
            Self::Parse => PARSE_ERROR_CODE,
            Self::InvalidVersion => INVALID_REQUEST_CODE,
            Self::NoMethod | Self::InvalidId | Self::EmptyBatch => METHOD_NOT_FOUND_CODE,
            Self::BatchTooLarge(_) => BATCH_TOO_LARGE_CODE,
            Self::Unauthorized | Self::Internal | Self::InvalidSender => INTERNAL_ERROR_CODE,
            Self::NotWhitelisted => NOT_WHITELISTED_CODE,
            Self::TooManyConnections => TOO_MANY_CONNECTIONS_CODE,
            Self::BodyTooLarge => BODY_TOO_LARGE_CODE,
            Self::NoBackends => NO_BACKENDS_CODE,
            Self::GatewayTimeout => GATEWAY_TIMEOUT_CODE,
            Self::OverRateLimit(_) => OVER_RATE_LIMIT_CODE,
            Self::SenderOverRateLimit => SENDER_OVER_RATE_LIMIT_CODE,
            Self::InvalidRawTransaction => INVALID_RAW_TRANSACTION_CODE,
            Self::BlockOutOfRange | Self::BlockRangeTooLarge => INVALID_PARAMS_CODE,
            Self::BadResponse => BAD_RESPONSE_CODE,
            Self::ResponseTooLarge => RESPONSE_TOO_LARGE_CODE,
        }
    }

    /// Returns the HTTP status used when this error answers a single call.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Parse
            | Self::InvalidVersion
            | Self::NoMethod
            | Self::InvalidId
            | Self::EmptyBatch
            | Self::InvalidRawTransaction
            | Self::InvalidSender
            | Self::BlockOutOfRange
            | Self::BlockRangeTooLarge => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotWhitelisted => StatusCode::FORBIDDEN,
            Self::BatchTooLarge(_) | Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::TooManyConnections | Self::OverRateLimit(_) | Self::SenderOverRateLimit => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::BadResponse | Self::ResponseTooLarge | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Wraps the error into a response for the call with the given id.
    pub fn into_response(self, id: Box<RawValue>) -> RpcResponse {
        RpcResponse::error(id, self.into())
    }
}

impl From<RpcError> for RpcErrorObject {
    fn from(err: RpcError) -> Self {
        Self { code: err.code(), message: err.to_string(), data: None }
    }
}

impl From<SenderError> for RpcError {
    fn from(err: SenderError) -> Self {
        match err {
            SenderError::ChainNotAllowed(_) => Self::InvalidSender,
            SenderError::OverRateLimit(_) => Self::SenderOverRateLimit,
            SenderError::InvalidParams
            | SenderError::InvalidHex(_)
            | SenderError::Decode(_)
            | SenderError::Recovery(_) => Self::InvalidRawTransaction,
        }
    }
}

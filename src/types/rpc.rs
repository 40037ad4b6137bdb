//! JSON-RPC envelope types.
//!
//! Requests and responses keep `id`, `params` and `result` as raw JSON so that they reach the
//! client exactly as they were written, including the numeric or string form of ids.

use crate::{constants::JSONRPC_VERSION, error::RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// A single JSON-RPC call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version, must be `2.0`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Method name.
    #[serde(default)]
    pub method: String,
    /// Raw params, usually an array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    /// Raw id. A present `null` is `Some("null")`, a missing id is `None`.
    #[serde(default, deserialize_with = "deserialize_some")]
    pub id: Option<Box<RawValue>>,
}

impl RpcRequest {
    /// Creates a request with the given method, params and numeric id.
    pub fn new(method: impl Into<String>, params: Box<RawValue>, id: u64) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: Some(params),
            id: RawValue::from_string(id.to_string()).ok(),
        }
    }

    /// Parses a single call from raw JSON.
    pub fn parse(raw: &RawValue) -> Result<Self, RpcError> {
        serde_json::from_str(raw.get()).map_err(|_| RpcError::Parse)
    }

    /// Checks the envelope invariants.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(RpcError::InvalidVersion);
        }
        if self.method.is_empty() {
            return Err(RpcError::NoMethod);
        }
        match self.id.as_deref().map(|id| id.get().trim_start().as_bytes().first()) {
            Some(Some(b'{' | b'[')) | None => Err(RpcError::InvalidId),
            _ => Ok(()),
        }
    }

    /// Returns the raw id, or `null` if the request has none.
    pub fn id(&self) -> Box<RawValue> {
        self.id.clone().unwrap_or_else(null_id)
    }

    /// Returns the params as a JSON array, if they are one.
    pub fn params_array(&self) -> Option<Vec<serde_json::Value>> {
        let params = self.params.as_deref()?;
        serde_json::from_str(params.get()).ok()
    }

    /// Replaces the params with the given array.
    pub fn set_params(&mut self, params: &[serde_json::Value]) -> Result<(), RpcError> {
        self.params = Some(to_raw(&params)?);
        Ok(())
    }
}

/// The error member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional data, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version.
    pub jsonrpc: String,
    /// Raw result. A present `null` is `Some("null")`.
    #[serde(
        default,
        deserialize_with = "deserialize_some",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Box<RawValue>>,
    /// Error object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    /// Raw id of the call this response answers.
    pub id: Box<RawValue>,
}

impl RpcResponse {
    /// Creates a successful response.
    pub fn success(id: Box<RawValue>, result: Box<RawValue>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), result: Some(result), error: None, id }
    }

    /// Creates an error response.
    pub fn error(id: Box<RawValue>, error: RpcErrorObject) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.to_string(), result: None, error: Some(error), id }
    }

    /// Whether the response carries an error.
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the response is a success with a `null` result.
    pub fn is_null_result(&self) -> bool {
        self.result.as_deref().is_none_or(|result| result.get() == "null")
    }

    /// Whether the response has exactly one of `result` and `error`.
    ///
    /// Some nodes send `"result": null` next to an error, which counts as an error.
    pub fn is_well_formed(&self) -> bool {
        match (&self.result, &self.error) {
            (Some(_), None) => true,
            (result, Some(_)) => result.as_deref().is_none_or(|result| result.get() == "null"),
            (None, None) => false,
        }
    }

    /// Returns the same response answering a different id.
    pub fn with_id(mut self, id: Box<RawValue>) -> Self {
        self.id = id;
        self
    }
}

/// An inbound HTTP payload, either one call or a batch of calls.
#[derive(Debug)]
pub enum RpcEnvelope {
    /// A single call.
    Single(Box<RawValue>),
    /// A batch of calls, each kept raw so that a malformed element only fails itself.
    Batch(Vec<Box<RawValue>>),
}

impl RpcEnvelope {
    /// Parses a request body.
    pub fn parse(body: &[u8]) -> Result<Self, RpcError> {
        if is_batch(body) {
            serde_json::from_slice(body).map(Self::Batch).map_err(|_| RpcError::Parse)
        } else {
            serde_json::from_slice(body).map(Self::Single).map_err(|_| RpcError::Parse)
        }
    }
}

/// Whether the payload is a JSON array.
pub fn is_batch(body: &[u8]) -> bool {
    body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'[')
}

/// Returns a raw `null`, used as the id of responses to unparseable calls.
pub fn null_id() -> Box<RawValue> {
    RawValue::NULL.to_owned()
}

/// Serializes a value into raw JSON.
pub fn to_raw<T: Serialize + ?Sized>(value: &T) -> Result<Box<RawValue>, RpcError> {
    serde_json::value::to_raw_value(value).map_err(|_| RpcError::Internal)
}

/// Deserializes a present value into `Some`, so that an explicit `null` is not lost.
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Box<RawValue>>, D::Error>
where
    D: Deserializer<'de>,
{
    Box::<RawValue>::deserialize(deserializer).map(Some)
}

//! Block tag rewriting for consensus-aware groups.
//!
//! Symbolic tags (`latest`, `safe`, `finalized`) are replaced by the block numbers the consensus
//! poller elected, so that every backend of the group answers about the same block. `earliest`
//! and `pending` are forwarded as they are.

use crate::{
    consensus::ConsensusSnapshot,
    error::RpcError,
    types::{RpcRequest, RpcResponse, to_raw},
};
use alloy::eips::BlockNumberOrTag;
use serde_json::{Map, Value};

/// The block numbers a request is rewritten against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteContext {
    /// Elected latest block.
    pub latest: u64,
    /// Elected safe block.
    pub safe: u64,
    /// Elected finalized block.
    pub finalized: u64,
    /// Widest block range allowed in log filters.
    pub max_block_range: Option<u64>,
}

impl RewriteContext {
    /// Creates a context from a consensus snapshot.
    pub const fn new(snapshot: &ConsensusSnapshot, max_block_range: Option<u64>) -> Self {
        Self {
            latest: snapshot.latest,
            safe: snapshot.safe,
            finalized: snapshot.finalized,
            max_block_range,
        }
    }
}

/// Outcome of [`rewrite_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// The request is forwarded as it is.
    Unchanged,
    /// The request params were rewritten in place.
    Request,
    /// The request is answered locally with this result.
    Response(Value),
}

impl Rewrite {
    /// Turns a local answer into a response for `request`.
    pub fn into_response(self, request: &RpcRequest) -> Option<RpcResponse> {
        match self {
            Self::Response(result) => {
                let result = to_raw(&result).ok()?;
                Some(RpcResponse::success(request.id(), result))
            }
            _ => None,
        }
    }
}

/// Where a method carries its block parameter.
enum BlockParam {
    /// A log filter object at position 0.
    Range,
    /// A block parameter that must be present at the given position.
    Required(usize),
    /// A block parameter that defaults to `latest` when omitted.
    Default(usize),
}

fn block_param(method: &str) -> Option<BlockParam> {
    let param = match method {
        "eth_getLogs" | "eth_newFilter" => BlockParam::Range,
        "debug_getRawReceipts" => BlockParam::Required(0),
        "eth_getBlockByNumber"
        | "eth_getBlockTransactionCountByNumber"
        | "eth_getUncleCountByBlockNumber"
        | "eth_getTransactionByBlockNumberAndIndex"
        | "eth_getUncleByBlockNumberAndIndex" => BlockParam::Default(0),
        "eth_getCode" | "eth_getBalance" | "eth_getTransactionCount" | "eth_call" => {
            BlockParam::Default(1)
        }
        "eth_getStorageAt" | "eth_getProof" => BlockParam::Default(2),
        _ => return None,
    };
    Some(param)
}

/// Rewrites the block parameters of a request against the elected consensus.
///
/// Block numbers above the elected latest block are rejected, as are log filters spanning more
/// than the configured range.
pub fn rewrite_request(
    ctx: &RewriteContext,
    request: &mut RpcRequest,
) -> Result<Rewrite, RpcError> {
    if request.method == "eth_blockNumber" {
        return Ok(Rewrite::Response(hex(ctx.latest)));
    }
    let Some(param) = block_param(&request.method) else {
        return Ok(Rewrite::Unchanged);
    };
    let Some(mut params) = request.params_array() else {
        return Ok(Rewrite::Unchanged);
    };

    let changed = match param {
        BlockParam::Range => match params.first_mut() {
            Some(Value::Object(filter)) => rewrite_range(ctx, filter)?,
            _ => false,
        },
        BlockParam::Required(pos) => match params.get_mut(pos) {
            Some(value) => rewrite_block(ctx, value)?,
            None => false,
        },
        BlockParam::Default(pos) => {
            if params.len() == pos {
                params.push(hex(ctx.latest));
                true
            } else if let Some(value) = params.get_mut(pos) {
                rewrite_block(ctx, value)?
            } else {
                false
            }
        }
    };

    if !changed {
        return Ok(Rewrite::Unchanged);
    }
    request.set_params(&params)?;
    Ok(Rewrite::Request)
}

fn rewrite_range(ctx: &RewriteContext, filter: &mut Map<String, Value>) -> Result<bool, RpcError> {
    if filter.contains_key("blockHash") {
        return Ok(false);
    }

    let mut changed = false;
    for key in ["fromBlock", "toBlock"] {
        match filter.get_mut(key) {
            Some(value) => changed |= rewrite_block(ctx, value)?,
            None => {
                filter.insert(key.to_string(), hex(ctx.latest));
                changed = true;
            }
        }
    }

    if let Some(max) = ctx.max_block_range {
        let from = range_bound(ctx, &filter["fromBlock"]);
        let to = range_bound(ctx, &filter["toBlock"]);
        if to.saturating_sub(from) > max {
            return Err(RpcError::BlockRangeTooLarge);
        }
    }
    Ok(changed)
}

/// Resolves a range bound to a number for the range size check.
fn range_bound(ctx: &RewriteContext, value: &Value) -> u64 {
    match value.as_str().and_then(|tag| tag.parse::<BlockNumberOrTag>().ok()) {
        Some(BlockNumberOrTag::Number(number)) => number,
        Some(BlockNumberOrTag::Earliest) => 0,
        _ => ctx.latest,
    }
}

/// Rewrites one block parameter, either a plain tag or an EIP-1898 object.
fn rewrite_block(ctx: &RewriteContext, value: &mut Value) -> Result<bool, RpcError> {
    match value {
        Value::String(tag) => {
            // hashes and other strings that are not block numbers are left alone
            let Ok(block) = tag.parse::<BlockNumberOrTag>() else {
                return Ok(false);
            };
            let number = match block {
                BlockNumberOrTag::Latest => ctx.latest,
                BlockNumberOrTag::Safe => ctx.safe,
                BlockNumberOrTag::Finalized => ctx.finalized,
                BlockNumberOrTag::Number(number) if number > ctx.latest => {
                    return Err(RpcError::BlockOutOfRange);
                }
                _ => return Ok(false),
            };
            *value = hex(number);
            Ok(true)
        }
        Value::Object(object) => match object.get_mut("blockNumber") {
            Some(inner) => rewrite_block(ctx, inner),
            None => Ok(false),
        },
        _ => Ok(false),
    }
}

fn hex(number: u64) -> Value {
    Value::String(format!("{number:#x}"))
}

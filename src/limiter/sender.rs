use super::{Prune, quota};
use crate::{config::SenderRateLimitConfig, error::SenderError, types::RpcRequest};
use alloy::{
    consensus::{Transaction, TxEnvelope, transaction::SignerRecoverable},
    eips::Decodable2718,
    hex,
    primitives::Address,
};
use governor::{DefaultKeyedRateLimiter, RateLimiter};
use std::collections::HashSet;
use tracing::debug;

/// Rate limits `eth_sendRawTransaction` by recovered transaction sender.
#[derive(Debug)]
pub struct SenderRateLimiter {
    limiter: DefaultKeyedRateLimiter<Address>,
    allowed_chain_ids: HashSet<u64>,
}

impl SenderRateLimiter {
    /// Creates the limiter described by the configuration, if it is enabled.
    pub fn new(config: &SenderRateLimitConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            limiter: RateLimiter::keyed(quota(config.limit, config.interval)?),
            allowed_chain_ids: config.allowed_chain_ids.iter().copied().collect(),
        })
    }

    /// Recovers the sender of the raw transaction in `request` and takes one of its tokens.
    pub fn check(&self, request: &RpcRequest) -> Result<Address, SenderError> {
        let tx = decode_raw_transaction(request)?;

        let chain_id = tx.chain_id();
        if !self.allowed_chain_ids.is_empty()
            && !chain_id.is_some_and(|id| self.allowed_chain_ids.contains(&id))
        {
            return Err(SenderError::ChainNotAllowed(chain_id));
        }

        let sender = tx.recover_signer()?;
        if self.limiter.check_key(&sender).is_err() {
            debug!(%sender, "Sender over rate limit");
            metrics::counter!("proxyd_sender_rate_limit_taken_total").increment(1);
            return Err(SenderError::OverRateLimit(sender));
        }
        Ok(sender)
    }
}

impl Prune for SenderRateLimiter {
    fn prune(&self) {
        self.limiter.prune();
    }
}

/// Decodes the transaction envelope carried by an `eth_sendRawTransaction` call.
///
/// Legacy, EIP-2930, EIP-1559, EIP-4844 and EIP-7702 envelopes are accepted.
pub fn decode_raw_transaction(request: &RpcRequest) -> Result<TxEnvelope, SenderError> {
    let params = request.params_array().ok_or(SenderError::InvalidParams)?;
    let [raw] = params.as_slice() else { return Err(SenderError::InvalidParams) };
    let raw = raw.as_str().ok_or(SenderError::InvalidParams)?;
    let bytes = hex::decode(raw)?;
    Ok(TxEnvelope::decode_2718(&mut bytes.as_slice())?)
}

use alloy::primitives::Address;
use thiserror::Error;

/// Errors raised by the sender rate limiter.
#[derive(Debug, Error)]
pub enum SenderError {
    /// The params are not a single hex string.
    #[error("missing value for required argument 0")]
    InvalidParams,
    /// The raw transaction is not valid hex.
    #[error(transparent)]
    InvalidHex(#[from] alloy::hex::FromHexError),
    /// The raw transaction is not a valid envelope.
    #[error(transparent)]
    Decode(#[from] alloy::eips::eip2718::Eip2718Error),
    /// The signer could not be recovered.
    #[error(transparent)]
    Recovery(#[from] alloy::consensus::crypto::RecoveryError),
    /// The transaction is for a chain that is not allowed.
    #[error("chain id {0:?} is not allowed")]
    ChainNotAllowed(Option<u64>),
    /// The sender has no tokens left.
    #[error("sender {0} is over rate limit")]
    OverRateLimit(Address),
}

//! Shared primitive types.
mod context;
pub use context::*;

mod rpc;
pub use rpc::*;

//! # proxyd
//!
//! Library for the implementation of proxyd, a JSON-RPC reverse proxy that routes calls across a
//! pool of EVM backends while keeping a consensus view of their chain heads.

pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod consensus;
pub mod constants;
pub mod error;
pub mod group;
pub mod limiter;
pub mod metrics;
pub mod rewriter;
pub mod serde;
pub mod server;
pub mod spawn;
pub mod types;
pub mod window;

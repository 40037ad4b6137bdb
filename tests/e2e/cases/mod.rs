//! Proxyd end-to-end test cases

mod cache;
mod consensus;
mod failover;
mod limits;
mod routing;
mod ws;

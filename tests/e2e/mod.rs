//! Proxyd end-to-end tests
#![allow(unused)]

mod cases;
mod environment;

pub use environment::*;

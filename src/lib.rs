#![forbid(unsafe_code)]

//! HTTP bridge for tools that speak unframed JSON over stdio.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod errors;
pub mod server;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};

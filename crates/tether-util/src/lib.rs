//! Shared utilities for tether.
//!
//! - Logging setup with tracing
//! - RAII timing for request handling

pub mod log;
pub mod timing;

pub use log::{LogConfig, LogLevel};
pub use timing::TimingGuard;

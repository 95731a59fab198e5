//! # tinyffi Utilities
//!
//! Shared utilities and logging for tinyffi.
//!
//! This crate provides the logging setup used by the `tinyffi` binary and by
//! anything embedding the engine, built on `tracing`.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{init_logging, init_logging_to_dir, init_logging_with_level, LogFormat, LogLevel, LoggingError};
pub use tracing::{debug, error, info, trace, warn};

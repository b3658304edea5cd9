//! Shared library for the warehouse loading service.
//!
//! Provides the pieces every workspace member needs:
//!
//! - **Error Handling**: the common error type and result alias
//! - **Logging**: tracing subscriber setup with env-based configuration

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, WhError};

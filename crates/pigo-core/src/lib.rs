//! Shared foundation for the pigo agent: configuration, errors, usage types.

pub mod config;
pub mod error;
pub mod types;

pub use config::PigoConfig;
pub use error::{PigoError, Result};
pub use types::{ApiType, TokenUsage};

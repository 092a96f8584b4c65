//! Infrastructure layer: job queue, scheduling, rate limiting and configuration.

pub mod config;
pub mod jobs;
pub mod rate_limit;

pub use config::{CadenceConfig, ConfigError};

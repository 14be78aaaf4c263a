// packages/relay/src/utils/mod.rs
//! Shared plumbing: errors, configuration, HTTP client

pub mod config;
pub mod errors;
pub mod http;

pub use config::PipelineConfig;
pub use errors::{PipelineError, Result};

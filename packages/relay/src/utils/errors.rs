// packages/relay/src/utils/errors.rs
//! Error types for the relay pipeline
//!
//! Internal operations return [`Result`]; the public recording surface
//! never does, it logs and degrades instead.

use thiserror::Error;

/// Result type alias using the crate's error type
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised inside the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Durable store or archive write failed
    #[error("Storage failed: {0}")]
    StorageFailed(String),

    /// Archive compression or decompression failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    /// Coordination service or lock file failure (not contention)
    #[error("Lock failed: {0}")]
    LockFailed(String),

    /// Transport-level delivery failure
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// Collector answered with a non-2xx status
    #[error("Collector rejected batch with status {status}: {body}")]
    CollectorRejected { status: u16, body: String },

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Request exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Tracing or metrics could not be installed
    #[error("Observability setup failed: {0}")]
    Observability(String),
}

// packages/relay/src/lib.rs
//! Event Relay
//!
//! Durable capture and delivery of operational events such as "provider X
//! rate-limited us". Events survive crashes, reach a remote collector at
//! least once, and local disk use stays bounded even when several processes
//! share one queue directory.
//!
//! # Architecture
//!
//! - **recording**: event model, per-record durable store, audit log, pending queue
//! - **compaction**: cross-process lock, archive segments, compactor, retention
//! - **delivery**: collector client, backoff, background delivery worker
//! - **pipeline**: the facade applications call
//! - **observability**: tracing and Prometheus setup
//! - **utils**: configuration, errors, HTTP client

pub mod compaction;
pub mod delivery;
pub mod observability;
pub mod pipeline;
pub mod recording;
pub mod utils;

// Re-export commonly used types
pub use delivery::{Collector, FlushOutcome, WorkerState};
pub use pipeline::{Pipeline, PipelineStats};
pub use recording::Event;
pub use utils::config::PipelineConfig;
pub use utils::errors::{PipelineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

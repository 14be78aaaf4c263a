// packages/relay/src/delivery/mod.rs
//! Forwarding pending events to the remote collector
//!
//! - **Client**: the `Collector` seam and its HTTP implementation
//! - **Backoff**: retry delay schedule
//! - **Worker**: the single background loop that batches and retries

pub mod backoff;
pub mod client;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use client::{Collector, HttpCollector};
pub use worker::{DeliverySnapshot, DeliveryWorker, FlushOutcome, WorkerSettings, WorkerState};

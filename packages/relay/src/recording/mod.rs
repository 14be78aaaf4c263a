// packages/relay/src/recording/mod.rs
//! Event capture and local persistence
//!
//! This module covers everything on the caller's path:
//!
//! - **Event**: the wire/disk representation of one operational event
//! - **Store**: one file per pending event, crash-durable
//! - **Audit Log**: append-only JSON-lines trail, independent of delivery
//! - **Event Queue**: bounded in-memory pending queue feeding delivery
//! - **Compressor**: archive codecs (gzip, zstd, plain)
//!
//! # Architecture
//!
//! ```text
//! record_event() ──► AuditLog (append line)
//!        │
//!        ├─────────► EventStore (evt-<ulid>.json) ──► compaction signal
//!        │
//!        └─────────► PendingQueue ──► delivery worker
//! ```

pub mod audit_log;
pub mod compressor;
pub mod event;
pub mod event_queue;
pub mod store;

// Re-export commonly used types
pub use audit_log::AuditLog;
pub use compressor::{CompressionCodec, CompressionLevel, Compressor};
pub use event::{Event, QueueRecord, RecordHandle};
pub use event_queue::{InFlightSet, PendingQueue, QueueStats};
pub use store::{EventStore, RecordFile};

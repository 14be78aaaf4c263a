// packages/relay/src/compaction/mod.rs
//! Queue compaction and archive retention
//!
//! - **Trigger**: coalescing, non-blocking compaction requests
//! - **Lock**: cross-process mutual exclusion (coordination service or lock file)
//! - **Compactor**: merges the oldest records into archive segments
//! - **Archive**: segment naming, atomic writes, reading back
//! - **Retention**: age and count limits on archive segments
//!
//! # Architecture
//!
//! ```text
//! EventStore::append ──► CompactionTrigger ──► (channel, capacity 1)
//!                                                     │
//!                                                     ▼
//!                               compaction loop ──► Compactor
//!                                                     │  lock held
//!                                                     ├─► write_segment
//!                                                     ├─► remove records
//!                                                     └─► RetentionManager
//! ```

pub mod archive;
pub mod compactor;
pub mod lock;
pub mod retention;
pub mod trigger;

pub use archive::{read_archive, ArchiveSegment};
pub use compactor::{CompactionOutcome, CompactionReport, CompactionSettings, Compactor};
pub use lock::{build_lock, DistributedLock, FileLock, LockHandle, RemoteLock};
pub use retention::{RetentionManager, RetentionReport};
pub use trigger::{compaction_channel, CompactionSignals, CompactionTrigger};

// packages/relay/src/compaction/compactor.rs
//! Queue compaction
//!
//! When the queue directory holds more than `max_files` records or more
//! than `max_bytes`, the oldest records are merged into one archive segment
//! until the remainder fits under the low-water mark. Order of effects:
//!
//! 1. archive written, fsynced, renamed into place
//! 2. merged records deleted
//! 3. retention applied
//!
//! A crash between 1 and 2 leaves events both archived and queued; it never
//! loses one. The whole cycle runs under the compaction lock, which is
//! released on every exit path.

use crate::compaction::archive::{self, ArchiveSegment};
use crate::compaction::lock::DistributedLock;
use crate::compaction::retention::{RetentionManager, RetentionReport};
use crate::recording::compressor::{CompressionLevel, Compressor};
use crate::recording::event_queue::InFlightSet;
use crate::recording::store::{self, EventStore, CORRUPT_SUFFIX};
use crate::utils::config::PipelineConfig;
use crate::utils::errors::{PipelineError, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Thresholds and codec for compaction
#[derive(Debug, Clone, Copy)]
pub struct CompactionSettings {
    /// Record count above which compaction runs
    pub max_files: usize,

    /// Total record bytes above which compaction runs
    pub max_bytes: u64,

    /// Fraction of the thresholds a pass drains the queue down to
    pub low_water: f64,

    /// Archive codec
    pub compressor: Compressor,
}

impl CompactionSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_files: config.max_queue_files,
            max_bytes: config.max_queue_bytes,
            low_water: config.compaction_low_water,
            compressor: Compressor::new(config.effective_codec(), CompressionLevel::Balanced),
        }
    }

    fn target_files(&self) -> usize {
        ((self.max_files as f64) * self.low_water).floor() as usize
    }

    fn target_bytes(&self) -> u64 {
        ((self.max_bytes as f64) * self.low_water).floor() as u64
    }
}

/// What a compaction attempt did
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// Another owner holds the lock; nothing attempted
    LockBusy,

    /// Queue is within both thresholds
    BelowThreshold { files: usize, bytes: u64 },

    /// Over threshold, but every candidate is in flight
    NothingEligible,

    /// Records merged
    Compacted(CompactionReport),
}

/// Details of a completed compaction
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    /// Records folded into the archive
    pub compacted: usize,

    /// Records quarantined as unreadable
    pub quarantined: usize,

    /// The new segment, if any record was readable
    pub archive: Option<PathBuf>,

    /// Retention run at the end of the cycle
    pub retention: RetentionReport,
}

/// Merges queue records into archive segments
#[derive(Clone)]
pub struct Compactor {
    store: Arc<EventStore>,
    lock: Arc<dyn DistributedLock>,
    retention: RetentionManager,
    in_flight: Arc<InFlightSet>,
    settings: CompactionSettings,
}

impl Compactor {
    pub fn new(
        store: Arc<EventStore>,
        lock: Arc<dyn DistributedLock>,
        retention: RetentionManager,
        in_flight: Arc<InFlightSet>,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            store,
            lock,
            retention,
            in_flight,
            settings,
        }
    }

    /// Compact if a threshold is exceeded. Safe to call concurrently from
    /// any number of processes; losers of the lock return `LockBusy`.
    pub async fn compact_if_needed(&self) -> Result<CompactionOutcome> {
        let handle = match self.lock.acquire().await? {
            Some(handle) => handle,
            None => {
                debug!("Compaction lock held elsewhere; skipping cycle");
                return Ok(CompactionOutcome::LockBusy);
            }
        };

        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || this.compact_locked())
            .await
            .unwrap_or_else(|e| {
                Err(PipelineError::StorageFailed(format!("Compaction task failed: {}", e)))
            });

        if let Err(e) = self.lock.release(handle).await {
            warn!(error = %e, "Failed to release compaction lock");
        }

        result
    }

    /// Apply retention under the compaction lock; `None` when the lock is busy
    pub async fn retention_pass(&self) -> Result<Option<RetentionReport>> {
        let handle = match self.lock.acquire().await? {
            Some(handle) => handle,
            None => return Ok(None),
        };

        let retention = self.retention.clone();
        let result = tokio::task::spawn_blocking(move || retention.cleanup())
            .await
            .unwrap_or_else(|e| {
                Err(PipelineError::StorageFailed(format!("Retention task failed: {}", e)))
            });

        if let Err(e) = self.lock.release(handle).await {
            warn!(error = %e, "Failed to release compaction lock");
        }

        result.map(Some)
    }

    /// The compaction cycle proper; caller must hold the lock
    fn compact_locked(&self) -> Result<CompactionOutcome> {
        let files = self.store.scan()?;
        let total_files = files.len();
        let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();

        if total_files <= self.settings.max_files && total_bytes <= self.settings.max_bytes {
            return Ok(CompactionOutcome::BelowThreshold {
                files: total_files,
                bytes: total_bytes,
            });
        }

        let target_files = self.settings.target_files();
        let target_bytes = self.settings.target_bytes();
        let in_flight = self.in_flight.snapshot();

        let mut remaining_files = total_files;
        let mut remaining_bytes = total_bytes;
        let mut candidates = Vec::new();

        for file in files {
            if remaining_files <= target_files && remaining_bytes <= target_bytes {
                break;
            }
            if in_flight.contains(&file.handle) {
                continue;
            }
            remaining_files -= 1;
            remaining_bytes -= file.size_bytes;
            candidates.push(file);
        }

        if candidates.is_empty() {
            debug!(files = total_files, "All compaction candidates are in flight");
            return Ok(CompactionOutcome::NothingEligible);
        }

        let mut payload = Vec::new();
        let mut merged = Vec::with_capacity(candidates.len());
        let mut quarantined = 0;

        for file in candidates {
            match store::read_record(file.handle.path()) {
                Ok(Some(event)) => {
                    serde_json::to_writer(&mut payload, &event)?;
                    payload.push(b'\n');
                    merged.push(file.handle);
                }
                // Delivered and deleted since the scan
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %file.handle, error = %e, "Quarantining unreadable queue record");
                    quarantine(file.handle.path());
                    quarantined += 1;
                }
            }
        }

        let archive = if merged.is_empty() {
            None
        } else {
            let segment: ArchiveSegment = archive::write_segment(
                self.store.dir(),
                &payload,
                &self.settings.compressor,
                merged.len(),
            )?;

            for handle in &merged {
                if let Err(e) = store::remove_record(handle) {
                    warn!(path = %handle, error = %e, "Failed to remove compacted record");
                }
            }

            Some(segment.path)
        };

        let retention = self.retention.cleanup().unwrap_or_else(|e| {
            warn!(error = %e, "Retention after compaction failed");
            RetentionReport::default()
        });

        info!(
            compacted = merged.len(),
            quarantined,
            remaining = remaining_files,
            "Queue compaction finished"
        );

        Ok(CompactionOutcome::Compacted(CompactionReport {
            compacted: merged.len(),
            quarantined,
            archive,
            retention,
        }))
    }
}

fn quarantine(path: &std::path::Path) {
    let mut target = path.as_os_str().to_owned();
    target.push(CORRUPT_SUFFIX);
    if let Err(e) = fs::rename(path, &target) {
        warn!(path = %path.display(), error = %e, "Failed to quarantine record");
    }
}

// packages/relay/src/delivery/worker.rs
//! Background delivery loop
//!
//! One worker per pipeline. It alternates between flushing the front of the
//! pending queue and sleeping:
//!
//! ```text
//! STOPPED ──start──► RUNNING ──queue empty / cycle done──► SLEEPING
//!    ▲                  ▲                                     │
//!    │                  └────── interval elapsed or kick ─────┘
//!    └──────────────── stop (from either state) ──────────────┘
//! ```
//!
//! A failed batch goes back to the front of the queue and is retried with
//! exponential backoff up to `max_retries` times; after that it waits for
//! the next cycle. Backing files are deleted only after the collector has
//! accepted the batch.

use crate::delivery::backoff::BackoffPolicy;
use crate::delivery::client::Collector;
use crate::recording::event::{Event, QueueRecord};
use crate::recording::event_queue::{InFlightSet, PendingQueue};
use crate::recording::store;
use crate::utils::config::PipelineConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Running,
    Sleeping,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Running,
            2 => WorkerState::Sleeping,
            _ => WorkerState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Stopped => 0,
            WorkerState::Running => 1,
            WorkerState::Sleeping => 2,
        }
    }
}

/// Delivery tuning
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Records per POST
    pub batch_size: usize,

    /// Idle sleep between cycles
    pub flush_interval: Duration,

    /// Retries after the first failed attempt of a cycle
    pub max_retries: u32,

    /// Delay schedule between retries
    pub backoff: BackoffPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            max_retries: config.max_retries,
            backoff: BackoffPolicy::from_config(config),
        }
    }
}

/// Result of one flush cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,

    /// Batch of this many records accepted
    Delivered(usize),

    /// Every attempt failed; batch is back at the front of the queue
    Failed { attempts: u32 },

    /// Stopped during backoff; batch is back at the front of the queue
    Cancelled,
}

/// Cumulative delivery counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    total_sent: AtomicU64,
    total_failed: AtomicU64,
    flush_success_count: AtomicU64,
    flush_failure_count: AtomicU64,
    last_success_at: Mutex<Option<DateTime<Utc>>>,
    last_failure_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

/// Point-in-time copy of [`DeliveryStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliverySnapshot {
    pub total_sent: u64,
    pub total_failed: u64,
    pub flush_success_count: u64,
    pub flush_failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DeliveryStats {
    fn record_success(&self, count: usize) {
        self.total_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.flush_success_count.fetch_add(1, Ordering::Relaxed);
        *self.last_success_at.lock() = Some(Utc::now());

        metrics::counter!("relay_events_sent_total").increment(count as u64);
        metrics::counter!("relay_flush_total", "outcome" => "success").increment(1);
    }

    fn record_failure(&self, count: usize, error: String) {
        self.total_failed.fetch_add(count as u64, Ordering::Relaxed);
        self.flush_failure_count.fetch_add(1, Ordering::Relaxed);
        *self.last_failure_at.lock() = Some(Utc::now());
        *self.last_error.lock() = Some(error);

        metrics::counter!("relay_events_failed_total").increment(count as u64);
        metrics::counter!("relay_flush_total", "outcome" => "failure").increment(1);
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            flush_success_count: self.flush_success_count.load(Ordering::Relaxed),
            flush_failure_count: self.flush_failure_count.load(Ordering::Relaxed),
            last_success_at: *self.last_success_at.lock(),
            last_failure_at: *self.last_failure_at.lock(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Batches pending records to a [`Collector`]
pub struct DeliveryWorker {
    queue: Arc<PendingQueue>,
    collector: Arc<dyn Collector>,
    in_flight: Arc<InFlightSet>,
    settings: WorkerSettings,
    stats: DeliveryStats,
    state: AtomicU8,
    kick: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    control: Mutex<Control>,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<PendingQueue>,
        collector: Arc<dyn Collector>,
        in_flight: Arc<InFlightSet>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            collector,
            in_flight,
            settings,
            stats: DeliveryStats::default(),
            state: AtomicU8::new(WorkerState::Stopped.as_u8()),
            kick: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            control: Mutex::new(Control::default()),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.control
            .lock()
            .cancel
            .as_ref()
            .map_or(false, |cancel| !cancel.is_cancelled())
    }

    pub fn stats(&self) -> DeliverySnapshot {
        self.stats.snapshot()
    }

    pub fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    /// Spawn the loop on `runtime` unless it is already running
    ///
    /// Returns whether a new loop was spawned.
    pub fn start(self: &Arc<Self>, runtime: &Handle) -> bool {
        let mut control = self.control.lock();
        if control.cancel.as_ref().map_or(false, |c| !c.is_cancelled()) {
            return false;
        }

        let cancel = CancellationToken::new();
        control.cancel = Some(cancel.clone());
        self.state.store(WorkerState::Running.as_u8(), Ordering::Release);
        control.task = Some(runtime.spawn(Arc::clone(self).run(cancel)));

        info!(
            batch_size = self.settings.batch_size,
            interval_ms = self.settings.flush_interval.as_millis() as u64,
            "Delivery worker started"
        );
        true
    }

    /// Halt new flush attempts. Idempotent; queued records stay queued.
    ///
    /// A POST already in progress is left to finish.
    pub fn stop(&self) -> bool {
        let cancel = self.control.lock().cancel.take();
        self.state.store(WorkerState::Stopped.as_u8(), Ordering::Release);

        match cancel {
            Some(cancel) if !cancel.is_cancelled() => {
                cancel.cancel();
                info!(pending = self.queue.len(), "Delivery worker stopped");
                true
            }
            _ => false,
        }
    }

    /// Stop and wait for the loop task to exit
    pub async fn shutdown(&self) {
        self.stop();
        let task = self.control.lock().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Delivery worker task ended abnormally");
            }
        }
    }

    /// Wake the loop for an immediate flush
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(&cancel, WorkerState::Running);

            let outcome = if self.queue.is_empty() {
                FlushOutcome::Empty
            } else {
                self.flush(&cancel).await
            };

            match outcome {
                FlushOutcome::Cancelled => break,
                FlushOutcome::Delivered(_) if !self.queue.is_empty() => continue,
                _ => {}
            }

            self.set_state(&cancel, WorkerState::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.flush_interval) => {}
                _ = self.kick.notified() => debug!("Delivery worker woken early"),
            }
        }

        debug!("Delivery loop exited");
    }

    fn set_state(&self, cancel: &CancellationToken, state: WorkerState) {
        if !cancel.is_cancelled() {
            self.state.store(state.as_u8(), Ordering::Release);
        }
    }

    /// Run one flush cycle: take a batch, POST it, retry with backoff
    pub async fn flush(&self, cancel: &CancellationToken) -> FlushOutcome {
        let _guard = self.flush_lock.lock().await;

        let mut batch = self.queue.take_front(self.settings.batch_size);
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let mut attempt: u32 = 0;
        loop {
            match self.send(&batch).await {
                Ok(()) => {
                    let count = batch.len();
                    self.stats.record_success(count);
                    debug!(count, attempt, "Batch delivered");
                    return FlushOutcome::Delivered(count);
                }
                Err(error) => {
                    let count = batch.len();
                    self.stats.record_failure(count, error.clone());
                    self.queue.prepend(batch);

                    if attempt >= self.settings.max_retries {
                        warn!(
                            count,
                            attempts = attempt + 1,
                            error = %error,
                            "Delivery failed; batch left queued for the next cycle"
                        );
                        return FlushOutcome::Failed { attempts: attempt + 1 };
                    }

                    let delay = self.settings.backoff.delay(attempt);
                    attempt += 1;
                    warn!(
                        count,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Delivery failed; retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return FlushOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    batch = self.queue.take_front(count);
                    if batch.is_empty() {
                        return FlushOutcome::Empty;
                    }
                }
            }
        }
    }

    /// POST one batch, holding its handles in the in-flight set meanwhile
    async fn send(&self, batch: &[QueueRecord]) -> std::result::Result<(), String> {
        let events: Vec<Event> = batch.iter().map(|r| r.event.clone()).collect();

        self.in_flight.register(batch);
        let result = self.collector.send(&events).await;

        if result.is_ok() {
            for handle in batch.iter().filter_map(|r| r.handle.as_ref()) {
                // Already gone if compacted or delivered by another process
                if let Err(e) = store::remove_record(handle) {
                    warn!(path = %handle, error = %e, "Failed to delete delivered record");
                }
            }
        }
        self.in_flight.release(batch);

        result.map_err(|e| e.to_string())
    }
}

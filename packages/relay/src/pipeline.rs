// packages/relay/src/pipeline.rs
//! Pipeline facade
//!
//! The only type the rest of an application needs. `record_event` is
//! infallible and touches the disk twice at most (audit line, queue record);
//! recovery, networking and compaction happen on background tasks.
//!
//! ```text
//! record_event ──► AuditLog
//!      │
//!      ├─────────► EventStore ──► compaction signal ──► compaction loop
//!      │
//!      └─────────► PendingQueue ──► DeliveryWorker ──► Collector
//!
//! retention loop (every retention_interval) ──► Compactor::retention_pass
//! ```

use crate::compaction::compactor::{CompactionOutcome, CompactionSettings, Compactor};
use crate::compaction::lock::build_lock;
use crate::compaction::retention::{RetentionManager, RetentionReport};
use crate::compaction::trigger::{compaction_channel, CompactionSignals};
use crate::delivery::client::{Collector, HttpCollector};
use crate::delivery::worker::{DeliveryWorker, FlushOutcome, WorkerSettings, WorkerState};
use crate::recording::audit_log::AuditLog;
use crate::recording::event::{Event, QueueRecord, RecordHandle};
use crate::recording::event_queue::{InFlightSet, PendingQueue};
use crate::recording::store::EventStore;
use crate::utils::config::PipelineConfig;
use crate::utils::errors::Result;
use crate::utils::http;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of pipeline counters; reset only by a restart
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub total_enqueued: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    pub flush_success_count: u64,
    pub flush_failure_count: u64,
    pub compaction_count: u64,
    pub archive_count: u64,

    /// Records refused by the full in-memory queue (still on disk)
    pub dropped: u64,

    /// Records currently queued in memory
    pub pending: usize,

    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub last_flush_success_at: Option<DateTime<Utc>>,
    pub last_flush_failure_at: Option<DateTime<Utc>>,
    pub last_compaction_at: Option<DateTime<Utc>>,
    pub last_delivery_error: Option<String>,

    pub worker_state: WorkerState,
    pub delivery_enabled: bool,
    pub durable: bool,
}

#[derive(Debug, Default)]
struct Counters {
    total_enqueued: AtomicU64,
    dropped: AtomicU64,
    compaction_count: AtomicU64,
    archive_count: AtomicU64,
    last_enqueued_at: Mutex<Option<DateTime<Utc>>>,
    last_compaction_at: Mutex<Option<DateTime<Utc>>>,
}

impl Counters {
    fn record_outcome(&self, outcome: &CompactionOutcome) {
        if let CompactionOutcome::Compacted(report) = outcome {
            self.compaction_count.fetch_add(1, Ordering::Relaxed);
            if report.archive.is_some() {
                self.archive_count.fetch_add(1, Ordering::Relaxed);
            }
            *self.last_compaction_at.lock() = Some(Utc::now());
            metrics::counter!("relay_compactions_total").increment(1);
        }
    }
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

/// Durable event capture and delivery
pub struct Pipeline {
    config: PipelineConfig,
    audit_log: Option<AuditLog>,
    store: Option<Arc<EventStore>>,
    queue: Arc<PendingQueue>,
    compactor: Option<Compactor>,
    worker: Option<Arc<DeliveryWorker>>,
    signals: Arc<tokio::sync::Mutex<CompactionSignals>>,
    counters: Arc<Counters>,
    recent: Mutex<VecDeque<Event>>,
    runtime: Mutex<Option<Handle>>,
    control: Mutex<Control>,
    /// Records older than this predate the instance and are recovered
    recovery_mark: Option<RecordHandle>,
    recovered: AtomicBool,
    /// Background recovery running; the worker waits for it
    recovering: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Pipeline {
    /// Build a pipeline from `config`, delivering over HTTP when a collector
    /// URL is configured
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;

        let client = if config.collector_url().is_some() || config.lock_url().is_some() {
            Some(http::build_client()?)
        } else {
            None
        };

        let collector: Option<Arc<dyn Collector>> = match (config.collector_url(), &client) {
            (Some(url), Some(client)) => Some(Arc::new(HttpCollector::new(
                client.clone(),
                url,
                config.collector_token().map(str::to_string),
                config.request_timeout(),
            ))),
            _ => None,
        };

        Self::build(config, collector, client)
    }

    /// Build a pipeline delivering to `collector` instead of the configured URL
    pub fn with_collector(config: PipelineConfig, collector: Arc<dyn Collector>) -> Result<Self> {
        config.validate()?;

        let client = match config.lock_url() {
            Some(_) => Some(http::build_client()?),
            None => None,
        };

        Self::build(config, Some(collector), client)
    }

    fn build(
        config: PipelineConfig,
        collector: Option<Arc<dyn Collector>>,
        client: Option<http::HttpClient>,
    ) -> Result<Self> {
        let (trigger, signals) = compaction_channel();

        let store = config.queue_dir().and_then(|dir| match EventStore::open(dir) {
            Ok(store) if config.disable_compaction => Some(Arc::new(store)),
            Ok(store) => Some(Arc::new(store.with_compaction_trigger(trigger))),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Queue directory unavailable; events will not be durable");
                None
            }
        });

        let audit_log = config.audit_log_path().map(AuditLog::new);
        let queue = Arc::new(PendingQueue::new(config.max_pending));
        let in_flight = Arc::new(InFlightSet::new());

        let compactor = match &store {
            Some(store) if !config.disable_compaction => Some(Compactor::new(
                Arc::clone(store),
                build_lock(&config, store.dir(), client),
                RetentionManager::new(store.dir(), config.retention_window(), config.max_archives)
                    .with_partial_max_age(config.lock_ttl()),
                Arc::clone(&in_flight),
                CompactionSettings::from_config(&config),
            )),
            _ => None,
        };

        let worker = collector.map(|collector| {
            Arc::new(DeliveryWorker::new(
                Arc::clone(&queue),
                collector,
                in_flight,
                WorkerSettings::from_config(&config),
            ))
        });

        if worker.is_none() {
            info!("No collector configured; events are kept locally only");
        }

        let recovery_mark = store.as_ref().map(|store| store.checkpoint());

        Ok(Self {
            recent: Mutex::new(VecDeque::with_capacity(config.recent_events_capacity)),
            config,
            audit_log,
            store,
            queue,
            compactor,
            worker,
            signals: Arc::new(tokio::sync::Mutex::new(signals)),
            counters: Arc::new(Counters::default()),
            runtime: Mutex::new(None),
            control: Mutex::new(Control::default()),
            recovery_mark,
            recovered: AtomicBool::new(false),
            recovering: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Queue directory in use, `None` when running without durable storage
    pub fn queue_dir(&self) -> Option<&Path> {
        self.store.as_ref().map(|store| store.dir())
    }

    /// Record one event. Never fails and never waits on the network.
    pub fn record_event(&self, provider: impl Into<String>, message: impl Into<String>) {
        let event = Event::now(provider, message);

        if let Some(log) = &self.audit_log {
            log.append(&event);
        }

        let handle = match &self.store {
            Some(store) => store.append(&event),
            None => {
                debug!(provider = %event.provider, message = %event.message, "Event recorded (no durable storage)");
                None
            }
        };

        self.counters.total_enqueued.fetch_add(1, Ordering::Relaxed);
        *self.counters.last_enqueued_at.lock() = Some(Utc::now());
        metrics::counter!("relay_events_enqueued_total").increment(1);

        self.remember(event.clone());

        if self.queue.push(QueueRecord::new(event, handle)).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("relay_events_dropped_total").increment(1);
            debug!(capacity = self.queue.capacity(), "Pending queue full; record left on disk");
        }

        self.ensure_running();

        if let Some(worker) = &self.worker {
            if self.queue.len() >= worker.batch_size() {
                worker.kick();
            }
        }
    }

    fn remember(&self, event: Event) {
        let capacity = self.config.recent_events_capacity;
        if capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        while recent.len() >= capacity {
            recent.pop_front();
        }
        recent.push_back(event);
    }

    /// Up to `limit` most recent events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Recover leftover records and start background work
    ///
    /// Recovery runs synchronously here, once per instance. Must be called
    /// from within a tokio runtime for delivery and compaction to run;
    /// without one only recovery happens. Returns the number of records
    /// recovered into the pending queue.
    pub fn start(&self) -> usize {
        self.stopped.store(false, Ordering::SeqCst);
        let recovered = self.recover();

        match Handle::try_current() {
            Ok(runtime) => {
                *self.runtime.lock() = Some(runtime.clone());
                self.spawn_background(&runtime);
            }
            Err(_) => warn!("No async runtime; background delivery and compaction not started"),
        }

        recovered
    }

    /// Halt background work. Idempotent; queued records stay queued and on disk.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        if let Some(cancel) = self.control.lock().cancel.take() {
            cancel.cancel();
        }
        if let Some(worker) = &self.worker {
            worker.stop();
        }
    }

    /// Stop and wait for background tasks to exit
    pub async fn shutdown(&self) {
        self.stop();

        let tasks = std::mem::take(&mut self.control.lock().tasks);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        if let Some(worker) = &self.worker {
            worker.shutdown().await;
        }
        info!(pending = self.queue.len(), "Pipeline shut down");
    }

    fn ensure_running(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let runtime = self.runtime.lock().clone();
        let runtime = match runtime.or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            // No runtime: local persistence only
            None => return,
        };

        *self.runtime.lock() = Some(runtime.clone());
        if !self.recovered.swap(true, Ordering::SeqCst) {
            self.spawn_recovery(&runtime);
        }
        self.spawn_background(&runtime);
    }

    fn recover(&self) -> usize {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return 0;
        }
        match (&self.store, &self.recovery_mark) {
            (Some(store), Some(mark)) => restore(store, mark, &self.queue),
            _ => 0,
        }
    }

    /// Lazy recovery, off the caller's thread; starts the worker when done
    fn spawn_recovery(&self, runtime: &Handle) {
        let (store, mark) = match (&self.store, &self.recovery_mark) {
            (Some(store), Some(mark)) => (Arc::clone(store), mark.clone()),
            _ => return,
        };

        self.recovering.store(true, Ordering::SeqCst);
        let task = runtime.spawn(recover_in_background(
            store,
            mark,
            Arc::clone(&self.queue),
            self.worker.clone(),
            Arc::clone(&self.recovering),
            Arc::clone(&self.stopped),
        ));
        self.control.lock().tasks.push(task);
    }

    fn spawn_background(&self, runtime: &Handle) {
        {
            let mut control = self.control.lock();
            let active = control.cancel.as_ref().map_or(false, |c| !c.is_cancelled());

            if !active {
                let cancel = CancellationToken::new();
                control.tasks.retain(|task| !task.is_finished());

                if let Some(compactor) = &self.compactor {
                    control.tasks.push(runtime.spawn(compaction_loop(
                        compactor.clone(),
                        Arc::clone(&self.signals),
                        Arc::clone(&self.counters),
                        cancel.clone(),
                    )));
                    control.tasks.push(runtime.spawn(retention_loop(
                        compactor.clone(),
                        self.config.retention_interval(),
                        cancel.clone(),
                    )));
                }

                control.cancel = Some(cancel);
            }
        }

        if let Some(worker) = &self.worker {
            if !self.recovering.load(Ordering::SeqCst) && !worker.is_running() {
                worker.start(runtime);
            }
        }
    }

    /// Counter snapshot; never touches the disk
    pub fn stats(&self) -> PipelineStats {
        let delivery = self
            .worker
            .as_ref()
            .map(|worker| worker.stats())
            .unwrap_or_default();

        PipelineStats {
            total_enqueued: self.counters.total_enqueued.load(Ordering::Relaxed),
            total_sent: delivery.total_sent,
            total_failed: delivery.total_failed,
            flush_success_count: delivery.flush_success_count,
            flush_failure_count: delivery.flush_failure_count,
            compaction_count: self.counters.compaction_count.load(Ordering::Relaxed),
            archive_count: self.counters.archive_count.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pending: self.queue.len(),
            last_enqueued_at: *self.counters.last_enqueued_at.lock(),
            last_flush_success_at: delivery.last_success_at,
            last_flush_failure_at: delivery.last_failure_at,
            last_compaction_at: *self.counters.last_compaction_at.lock(),
            last_delivery_error: delivery.last_error,
            worker_state: self
                .worker
                .as_ref()
                .map_or(WorkerState::Stopped, |worker| worker.state()),
            delivery_enabled: self.worker.is_some(),
            durable: self.store.is_some(),
        }
    }

    /// Run one flush cycle on the caller's task
    pub async fn flush_now(&self) -> FlushOutcome {
        match &self.worker {
            Some(worker) => worker.flush(&CancellationToken::new()).await,
            None => FlushOutcome::Empty,
        }
    }

    /// Run one compaction check; `None` when compaction is disabled or
    /// there is no durable storage
    pub async fn compact_now(&self) -> Result<Option<CompactionOutcome>> {
        let compactor = match &self.compactor {
            Some(compactor) => compactor,
            None => return Ok(None),
        };

        let outcome = compactor.compact_if_needed().await?;
        self.counters.record_outcome(&outcome);
        Ok(Some(outcome))
    }

    /// Run one retention pass; `None` when disabled or the lock is busy
    pub async fn run_retention(&self) -> Result<Option<RetentionReport>> {
        match &self.compactor {
            Some(compactor) => compactor.retention_pass().await,
            None => Ok(None),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Queue the records older than `mark`, returning how many were inserted
fn restore(store: &EventStore, mark: &RecordHandle, queue: &PendingQueue) -> usize {
    match store.list_before(mark) {
        Ok(records) => {
            let found = records.len();
            let inserted = queue.recover(records);
            if found > 0 {
                info!(found, inserted, dir = %store.dir().display(), "Recovered queue records");
            }
            inserted
        }
        Err(e) => {
            warn!(dir = %store.dir().display(), error = %e, "Queue recovery failed");
            0
        }
    }
}

async fn recover_in_background(
    store: Arc<EventStore>,
    mark: RecordHandle,
    queue: Arc<PendingQueue>,
    worker: Option<Arc<DeliveryWorker>>,
    recovering: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
) {
    if let Err(e) = tokio::task::spawn_blocking(move || restore(&store, &mark, &queue)).await {
        warn!(error = %e, "Queue recovery task failed");
    }
    recovering.store(false, Ordering::SeqCst);

    let worker = match worker {
        Some(worker) => worker,
        None => return,
    };
    if stopped.load(Ordering::SeqCst) {
        return;
    }

    worker.start(&Handle::current());
    // stop() may have run between the check and the start
    if stopped.load(Ordering::SeqCst) {
        worker.stop();
    }
}

async fn compaction_loop(
    compactor: Compactor,
    signals: Arc<tokio::sync::Mutex<CompactionSignals>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let mut signals = tokio::select! {
        _ = cancel.cancelled() => return,
        guard = signals.lock() => guard,
    };

    // Startup pass picks up backlog left by earlier runs
    run_compaction(&compactor, &counters).await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.next() => {
                if signal.is_none() {
                    break;
                }
                run_compaction(&compactor, &counters).await;
            }
        }
    }

    debug!("Compaction loop exited");
}

async fn run_compaction(compactor: &Compactor, counters: &Counters) {
    match compactor.compact_if_needed().await {
        Ok(outcome) => counters.record_outcome(&outcome),
        Err(e) => warn!(error = %e, "Compaction failed"),
    }
}

async fn retention_loop(compactor: Compactor, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match compactor.retention_pass().await {
                Ok(Some(report)) => debug!(deleted = report.deleted(), remaining = report.remaining, "Scheduled retention ran"),
                Ok(None) => debug!("Compaction lock busy; scheduled retention skipped"),
                Err(e) => warn!(error = %e, "Scheduled retention failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::archive::{read_archive, ArchiveSegment};
    use crate::utils::errors::PipelineError;
    use async_trait::async_trait;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MemoryCollector {
        received: Mutex<Vec<Event>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Collector for MemoryCollector {
        async fn send(&self, events: &[Event]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PipelineError::DeliveryFailed("down".to_string()));
            }
            self.received.lock().extend_from_slice(events);
            Ok(())
        }
    }

    fn local_config(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            flush_interval_ms: 20,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            max_retries: 0,
            ..PipelineConfig::local(dir)
        }
    }

    #[test]
    fn test_record_without_runtime_is_durable() {
        let dir = tempdir().unwrap();
        let pipeline = Pipeline::new(local_config(dir.path())).unwrap();

        pipeline.record_event("polygon", "429");
        pipeline.record_event("finnhub", "quota");

        let stats = pipeline.stats();
        assert_eq!(stats.total_enqueued, 2);
        assert_eq!(stats.pending, 2);
        assert!(stats.durable);
        assert!(!stats.delivery_enabled);
        assert_eq!(stats.worker_state, WorkerState::Stopped);

        let store = EventStore::open(dir.path().join("queue")).unwrap();
        assert_eq!(store.list_all().unwrap().len(), 2);

        let audit = AuditLog::new(dir.path().join("events.log"));
        assert_eq!(audit.read_recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_no_storage_degrades_to_log_only() {
        let config = PipelineConfig {
            queue_dir: None,
            audit_log_path: None,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config).unwrap();

        pipeline.record_event("polygon", "429");

        let stats = pipeline.stats();
        assert_eq!(stats.total_enqueued, 1);
        assert!(!stats.durable);
        assert!(pipeline.queue_dir().is_none());
    }

    #[test]
    fn test_recent_events_ring_buffer() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            recent_events_capacity: 3,
            ..local_config(dir.path())
        };
        let pipeline = Pipeline::new(config).unwrap();

        for i in 0..5 {
            pipeline.record_event("polygon", format!("e{}", i));
        }

        let messages: Vec<String> = pipeline.recent_events(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["e2", "e3", "e4"]);
        assert_eq!(pipeline.recent_events(1)[0].message, "e4");
    }

    #[test]
    fn test_full_queue_counts_drops() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            max_pending: 2,
            ..local_config(dir.path())
        };
        let pipeline = Pipeline::new(config).unwrap();

        for i in 0..4 {
            pipeline.record_event("polygon", format!("e{}", i));
        }

        let stats = pipeline.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dropped, 2);
        assert_eq!(pipeline.store.as_ref().unwrap().scan().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_delivery_removes_records() {
        let dir = tempdir().unwrap();
        let collector = Arc::new(MemoryCollector::default());
        let pipeline = Pipeline::with_collector(local_config(dir.path()), collector.clone()).unwrap();
        pipeline.start();

        for i in 0..7 {
            pipeline.record_event("polygon", format!("e{}", i));
        }

        for _ in 0..200 {
            if collector.received.lock().len() == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(collector.received.lock().len(), 7);
        assert!(pipeline.store.as_ref().unwrap().scan().unwrap().is_empty());
        assert_eq!(pipeline.stats().total_sent, 7);

        pipeline.shutdown().await;
        assert_eq!(pipeline.stats().worker_state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_keeps_pending_and_does_not_restart() {
        let dir = tempdir().unwrap();
        let collector = Arc::new(MemoryCollector::default());
        collector.fail.store(true, Ordering::SeqCst);
        let pipeline = Pipeline::with_collector(local_config(dir.path()), collector.clone()).unwrap();

        pipeline.start();
        pipeline.record_event("polygon", "kept");
        pipeline.shutdown().await;
        pipeline.stop();

        pipeline.record_event("polygon", "after stop");
        assert_eq!(pipeline.stats().worker_state, WorkerState::Stopped);
        assert_eq!(pipeline.stats().pending, 2);

        collector.fail.store(false, Ordering::SeqCst);
        assert_eq!(pipeline.flush_now().await, FlushOutcome::Delivered(2));
    }

    #[tokio::test]
    async fn test_start_recovers_leftovers_once() {
        let dir = tempdir().unwrap();
        {
            let first = Pipeline::new(local_config(dir.path())).unwrap();
            for i in 0..5 {
                first.record_event("polygon", format!("e{}", i));
            }
        }

        let collector = Arc::new(MemoryCollector::default());
        collector.fail.store(true, Ordering::SeqCst);
        let second = Pipeline::with_collector(local_config(dir.path()), collector).unwrap();
        assert_eq!(second.start(), 5);
        assert_eq!(second.start(), 0);
        assert_eq!(second.stats().pending, 5);
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_compact_now_and_retention() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            max_queue_files: 4,
            max_archives: 1,
            ..local_config(dir.path())
        };
        let pipeline = Pipeline::new(config).unwrap();

        for round in 0..2 {
            for i in 0..6 {
                pipeline.store.as_ref().unwrap().append(&Event::now("polygon", format!("{}-{}", round, i)));
            }
            let outcome = pipeline.compact_now().await.unwrap().unwrap();
            assert!(matches!(outcome, CompactionOutcome::Compacted(_)));
        }

        let stats = pipeline.stats();
        assert_eq!(stats.compaction_count, 2);
        assert_eq!(stats.archive_count, 2);

        let segments = ArchiveSegment::list(pipeline.queue_dir().unwrap()).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(!read_archive(&segments[0].path).unwrap().is_empty());

        let report = pipeline.run_retention().await.unwrap().unwrap();
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_kill_switch_disables_compaction() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            disable_compaction: true,
            max_queue_files: 1,
            ..local_config(dir.path())
        };
        let pipeline = Pipeline::new(config).unwrap();
        pipeline.start();

        for i in 0..5 {
            pipeline.record_event("polygon", format!("e{}", i));
        }

        assert!(pipeline.compact_now().await.unwrap().is_none());
        assert!(pipeline.run_retention().await.unwrap().is_none());
        assert_eq!(pipeline.store.as_ref().unwrap().scan().unwrap().len(), 5);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_append_triggers_background_compaction() {
        let dir = tempdir().unwrap();
        let config = PipelineConfig {
            max_queue_files: 5,
            ..local_config(dir.path())
        };
        let pipeline = Pipeline::new(config).unwrap();
        pipeline.start();

        for i in 0..6 {
            pipeline.record_event("polygon", format!("e{}", i));
        }

        for _ in 0..200 {
            if pipeline.stats().compaction_count > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pipeline.stats().compaction_count, 1);
        assert!(pipeline.store.as_ref().unwrap().scan().unwrap().len() <= 5);
        pipeline.shutdown().await;
    }

    fn leave_records(dir: &Path, count: usize) {
        let store = EventStore::open(dir.join("queue")).unwrap();
        for i in 0..count {
            store.append(&Event::now("polygon", format!("left {}", i))).unwrap();
        }
    }

    #[tokio::test]
    async fn test_lazy_recovery_leaves_caller_thread() {
        let dir = tempdir().unwrap();
        leave_records(dir.path(), 300);

        let pipeline = Pipeline::new(local_config(dir.path())).unwrap();
        pipeline.record_event("polygon", "fresh");

        // Single-threaded runtime: background recovery cannot have run yet
        assert_eq!(pipeline.stats().pending, 1);

        for _ in 0..200 {
            if pipeline.stats().pending == 301 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pipeline.stats().pending, 301);
        assert_eq!(pipeline.start(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_lazy_recovery_delivers_leftovers_first_once() {
        let dir = tempdir().unwrap();
        leave_records(dir.path(), 5);

        let collector = Arc::new(MemoryCollector::default());
        let pipeline = Pipeline::with_collector(local_config(dir.path()), collector.clone()).unwrap();
        pipeline.record_event("polygon", "fresh");

        for _ in 0..200 {
            if collector.received.lock().len() >= 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // A few more cycles to expose duplicates
        tokio::time::sleep(Duration::from_millis(60)).await;
        pipeline.shutdown().await;

        let messages: Vec<String> = collector.received.lock().iter().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["left 0", "left 1", "left 2", "left 3", "left 4", "fresh"]);
        assert!(pipeline.store.as_ref().unwrap().scan().unwrap().is_empty());
    }
}

// packages/relay/src/recording/event_queue.rs
//! Bounded in-memory pending queue
//!
//! Holds records awaiting delivery in approximately FIFO order. Failed
//! batches go back to the front so the oldest events are never starved by
//! newer arrivals.

use crate::recording::event::{QueueRecord, RecordHandle};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Pending delivery queue
pub struct PendingQueue {
    /// Records, oldest at the front
    records: Mutex<VecDeque<QueueRecord>>,

    /// Maximum records admitted by `push`
    capacity: usize,

    /// Push counter
    push_count: AtomicU64,

    /// Records handed out by `take_front`
    pop_count: AtomicU64,

    /// Records put back by `prepend`
    requeue_count: AtomicU64,

    /// Drop counter (queue full)
    drop_count: AtomicU64,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity,
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            requeue_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Append at the back; hands the record back when the queue is full
    pub fn push(&self, record: QueueRecord) -> Result<(), QueueRecord> {
        let mut records = self.records.lock();
        if records.len() >= self.capacity {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
            return Err(record);
        }
        records.push_back(record);
        self.push_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove up to `max` records from the front
    pub fn take_front(&self, max: usize) -> Vec<QueueRecord> {
        let mut records = self.records.lock();
        let n = max.min(records.len());
        let batch: Vec<_> = records.drain(..n).collect();
        self.pop_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Put a batch back at the front, preserving its order
    ///
    /// Capacity is not enforced: these records were already admitted.
    pub fn prepend(&self, batch: Vec<QueueRecord>) {
        let mut records = self.records.lock();
        self.requeue_count.fetch_add(batch.len() as u64, Ordering::Relaxed);
        for record in batch.into_iter().rev() {
            records.push_front(record);
        }
    }

    /// Insert records recovered from disk at the front
    ///
    /// Records whose handle is already queued are skipped, as are records
    /// beyond the free capacity (they stay on disk). Returns how many were
    /// inserted.
    pub fn recover(&self, recovered: Vec<QueueRecord>) -> usize {
        let mut records = self.records.lock();

        let known: HashSet<RecordHandle> = records
            .iter()
            .filter_map(|r| r.handle.clone())
            .collect();

        let room = self.capacity.saturating_sub(records.len());
        let fresh: Vec<QueueRecord> = recovered
            .into_iter()
            .filter(|r| r.handle.as_ref().map_or(true, |h| !known.contains(h)))
            .take(room)
            .collect();

        let inserted = fresh.len();
        for record in fresh.into_iter().rev() {
            records.push_front(record);
        }
        inserted
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            requeue_count: self.requeue_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity,
        }
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Total records pushed
    pub push_count: u64,

    /// Total records taken for delivery
    pub pop_count: u64,

    /// Total records put back after failed delivery
    pub requeue_count: u64,

    /// Total records refused (queue full)
    pub drop_count: u64,

    /// Current queue size
    pub current_size: usize,

    /// Queue capacity
    pub capacity: usize,
}

impl QueueStats {
    /// Calculate fill percentage
    pub fn fill_percentage(&self) -> f64 {
        (self.current_size as f64 / self.capacity as f64) * 100.0
    }
}

/// Handles of the batch currently being POSTed
///
/// The compactor never selects a record listed here, so a batch's backing
/// files stay put until its delivery attempt has resolved.
#[derive(Default)]
pub struct InFlightSet {
    handles: Mutex<HashSet<RecordHandle>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the handles of `batch` as in flight
    pub fn register(&self, batch: &[QueueRecord]) {
        let mut handles = self.handles.lock();
        handles.extend(batch.iter().filter_map(|r| r.handle.clone()));
    }

    /// Clear the handles of `batch`
    pub fn release(&self, batch: &[QueueRecord]) {
        let mut handles = self.handles.lock();
        for handle in batch.iter().filter_map(|r| r.handle.as_ref()) {
            handles.remove(handle);
        }
    }

    pub fn contains(&self, handle: &RecordHandle) -> bool {
        self.handles.lock().contains(handle)
    }

    /// Copy of the current set, for checks outside the lock
    pub fn snapshot(&self) -> HashSet<RecordHandle> {
        self.handles.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::Event;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn record(n: usize) -> QueueRecord {
        QueueRecord::new(
            Event::now("polygon", format!("evt_{}", n)),
            Some(RecordHandle::new(PathBuf::from(format!("/q/evt-{:04}.json", n)))),
        )
    }

    fn messages(records: &[QueueRecord]) -> Vec<String> {
        records.iter().map(|r| r.event.message.clone()).collect()
    }

    #[test]
    fn test_fifo_take() {
        let queue = PendingQueue::new(10);
        for n in 0..5 {
            queue.push(record(n)).unwrap();
        }

        let batch = queue.take_front(3);
        assert_eq!(messages(&batch), vec!["evt_0", "evt_1", "evt_2"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_prepend_restores_front_order() {
        let queue = PendingQueue::new(10);
        for n in 0..4 {
            queue.push(record(n)).unwrap();
        }

        let batch = queue.take_front(2);
        queue.push(record(4)).unwrap();
        queue.prepend(batch);

        let all = queue.take_front(10);
        assert_eq!(messages(&all), vec!["evt_0", "evt_1", "evt_2", "evt_3", "evt_4"]);
        assert_eq!(queue.stats().requeue_count, 2);
    }

    #[test]
    fn test_queue_full() {
        let queue = PendingQueue::new(2);

        queue.push(record(1)).unwrap();
        queue.push(record(2)).unwrap();

        let rejected = queue.push(record(3));
        assert!(rejected.is_err());
        assert_eq!(queue.stats().drop_count, 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_recover_goes_to_front_without_duplicates() {
        let queue = PendingQueue::new(10);
        queue.push(record(2)).unwrap();
        queue.push(record(3)).unwrap();

        // record 2 is already queued (appended before recovery ran)
        let inserted = queue.recover(vec![record(0), record(1), record(2)]);
        assert_eq!(inserted, 2);

        let all = queue.take_front(10);
        assert_eq!(messages(&all), vec!["evt_0", "evt_1", "evt_2", "evt_3"]);
    }

    #[test]
    fn test_recover_respects_capacity() {
        let queue = PendingQueue::new(3);
        queue.push(record(9)).unwrap();

        let inserted = queue.recover((0..5).map(record).collect());
        assert_eq!(inserted, 2);
        assert_eq!(messages(&queue.take_front(10)), vec!["evt_0", "evt_1", "evt_9"]);
    }

    #[test]
    fn test_concurrent_pushes() {
        use std::thread;

        let queue = Arc::new(PendingQueue::new(1000));
        let mut handles = vec![];

        for i in 0..10 {
            let q = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    let _ = q.push(record(i * 100 + j));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.push_count, 1000);
        assert_eq!(stats.drop_count, 0);
        assert!((stats.fill_percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_in_flight_register_release() {
        let set = InFlightSet::new();
        let batch = vec![record(1), record(2)];
        let unrelated = record(3);

        set.register(&batch);
        assert!(set.contains(batch[0].handle.as_ref().unwrap()));
        assert!(!set.contains(unrelated.handle.as_ref().unwrap()));
        assert_eq!(set.snapshot().len(), 2);

        set.release(&batch);
        assert!(set.snapshot().is_empty());
    }
}

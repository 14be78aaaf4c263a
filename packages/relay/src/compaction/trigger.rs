// packages/relay/src/compaction/trigger.rs
//! Non-blocking compaction requests
//!
//! Appends call [`CompactionTrigger::request`], which never waits: the
//! channel holds at most one pending signal, so bursts of appends coalesce
//! into a single compaction check run by the consumer loop.

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::trace;

/// Create a connected trigger/signal pair
pub fn compaction_channel() -> (CompactionTrigger, CompactionSignals) {
    let (tx, rx) = mpsc::channel(1);
    (CompactionTrigger { tx }, CompactionSignals { rx })
}

/// Sending half, held by the event store
#[derive(Debug, Clone)]
pub struct CompactionTrigger {
    tx: mpsc::Sender<()>,
}

impl CompactionTrigger {
    /// Ask for a compaction check; returns immediately
    pub fn request(&self) {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => trace!("Compaction consumer gone; request dropped"),
        }
    }
}

/// Receiving half, drained by the compaction loop
#[derive(Debug)]
pub struct CompactionSignals {
    rx: mpsc::Receiver<()>,
}

impl CompactionSignals {
    /// Wait for the next request; `None` once every trigger is dropped
    pub async fn next(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Consume a pending request without waiting
    pub fn try_next(&mut self) -> bool {
        !matches!(
            self.rx.try_recv(),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_coalesce() {
        let (trigger, mut signals) = compaction_channel();
        for _ in 0..100 {
            trigger.request();
        }
        assert!(signals.try_next());
        assert!(!signals.try_next());
    }

    #[tokio::test]
    async fn test_next_ends_when_triggers_dropped() {
        let (trigger, mut signals) = compaction_channel();
        trigger.request();
        drop(trigger);
        assert_eq!(signals.next().await, Some(()));
        assert_eq!(signals.next().await, None);
    }

    #[test]
    fn test_request_after_consumer_dropped_is_silent() {
        let (trigger, signals) = compaction_channel();
        drop(signals);
        trigger.request();
    }
}

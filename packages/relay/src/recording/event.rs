// packages/relay/src/recording/event.rs
//! Event model shared by the store, compactor, and delivery worker

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One operational observation, e.g. "provider X rate-limited us"
///
/// Serialized identically on disk, in archives, and on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// ISO-8601 UTC timestamp with millisecond precision
    pub timestamp: String,

    /// Upstream provider the event concerns
    pub provider: String,

    /// Free-form description
    pub message: String,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn now(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Locator of a persisted queue record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordHandle(PathBuf);

impl RecordHandle {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// An event plus its storage handle
///
/// `handle` is `None` when the event could not be persisted; such records
/// still flow through delivery but are not crash-durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    pub event: Event,
    pub handle: Option<RecordHandle>,
}

impl QueueRecord {
    pub fn new(event: Event, handle: Option<RecordHandle>) -> Self {
        Self { event, handle }
    }
}

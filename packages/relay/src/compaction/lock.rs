// packages/relay/src/compaction/lock.rs
//! Cross-process compaction lock
//!
//! One interface, two backends, chosen once at construction:
//!
//! - [`RemoteLock`]: a key on a coordination service reached over its REST
//!   command endpoint. Acquire is `SET key token NX PX ttl`; release is a
//!   server-side compare-and-delete script, so a holder whose TTL lapsed can
//!   never delete a lock someone else now owns.
//! - [`FileLock`]: a create-only lock file in the queue directory.
//!
//! Contention is a normal outcome and is reported as `Ok(None)`.

use crate::utils::config::PipelineConfig;
use crate::utils::errors::{PipelineError, Result};
use crate::utils::http::{self, HttpClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Lock file name used by the filesystem backend
pub const LOCK_FILE_NAME: &str = ".compaction.lock";

/// Infix of a lock file moved aside while being broken
pub const STALE_MARKER: &str = ".stale-";

const COMPARE_AND_DELETE: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Proof of lock ownership, required to release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle(Ownership);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ownership {
    /// Value stored under the remote key
    Token(String),

    /// Lock file plus the nonce written into it
    File { path: PathBuf, nonce: String },
}

impl LockHandle {
    /// Backend that issued this handle
    pub fn backend(&self) -> &'static str {
        match self.0 {
            Ownership::Token(_) => "remote",
            Ownership::File { .. } => "file",
        }
    }
}

/// Mutual exclusion for compaction and retention across processes
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock; `Ok(None)` when another owner holds it
    async fn acquire(&self) -> Result<Option<LockHandle>>;

    /// Give the lock back. Only the handle's issuer is affected.
    async fn release(&self, handle: LockHandle) -> Result<()>;
}

/// Pick the backend for `config`
pub fn build_lock(
    config: &PipelineConfig,
    queue_dir: &Path,
    client: Option<HttpClient>,
) -> Arc<dyn DistributedLock> {
    let file_lock = FileLock::new(queue_dir.join(LOCK_FILE_NAME), config.lock_ttl());

    match (config.lock_url(), client) {
        (Some(url), Some(client)) => {
            info!(url, key = %config.lock_key, "Using coordination service for compaction lock");
            Arc::new(RemoteLock {
                client,
                url: url.to_string(),
                token: config.lock_token().map(str::to_string),
                key: config.lock_key.clone(),
                ttl: config.lock_ttl(),
                timeout: config.request_timeout(),
                fallback: file_lock,
            })
        }
        _ => {
            debug!(path = %file_lock.path.display(), "Using lock file for compaction lock");
            Arc::new(file_lock)
        }
    }
}

fn random_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Create-only lock file
///
/// The file holds `<pid> <acquired-at> <nonce>`. A lock acquired more than
/// `stale_after` ago is assumed to belong to a crashed holder and is broken
/// by renaming it aside, so two breakers can never both succeed.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    stale_after: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_create(&self, nonce: &str) -> Result<bool> {
        match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                let line = format!("{} {} {}\n", std::process::id(), Utc::now().to_rfc3339(), nonce);
                if let Err(e) = file.write_all(line.as_bytes()) {
                    let _ = fs::remove_file(&self.path);
                    return Err(e.into());
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PipelineError::LockFailed(format!(
                "Cannot create {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Current lock content, if the lock it describes has outlived `stale_after`
    fn stale_content(&self) -> Result<Option<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let age = match acquired_at(&content) {
            Some(acquired) => Utc::now().signed_duration_since(acquired).to_std().ok(),
            // Torn or foreign content: fall back to the file's age
            None => fs::metadata(&self.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok()),
        };

        Ok(age.filter(|age| *age > self.stale_after).map(|_| content))
    }

    /// Replace a lock judged stale with our own
    ///
    /// The lock is moved aside first. If what was moved is not the content
    /// judged stale, a live owner broke it in the meantime and its lock is
    /// put back.
    fn break_stale(&self, judged: &str, nonce: &str) -> Result<Option<LockHandle>> {
        let aside = stale_path(&self.path, nonce);

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            // Someone else broke it first; compete for the free slot
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(self.try_create(nonce)?.then(|| self.handle(nonce.to_string())));
            }
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved != judged {
            match fs::hard_link(&aside, &self.path) {
                Ok(()) => debug!(path = %self.path.display(), "Lock changed hands while breaking it; restored"),
                Err(e) => warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Could not restore a live compaction lock"
                ),
            }
            let _ = fs::remove_file(&aside);
            return Ok(None);
        }

        let _ = fs::remove_file(&aside);
        warn!(path = %self.path.display(), "Broke stale compaction lock");

        Ok(self.try_create(nonce)?.then(|| self.handle(nonce.to_string())))
    }

    fn acquire_sync(&self) -> Result<Option<LockHandle>> {
        let nonce = random_token();

        if self.try_create(&nonce)? {
            return Ok(Some(self.handle(nonce)));
        }

        match self.stale_content()? {
            Some(judged) => self.break_stale(&judged, &nonce),
            None => Ok(None),
        }
    }

    fn handle(&self, nonce: String) -> LockHandle {
        LockHandle(Ownership::File {
            path: self.path.clone(),
            nonce,
        })
    }

    fn release_sync(path: &Path, nonce: &str) -> Result<()> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if content.split_whitespace().last() != Some(nonce) {
            warn!(path = %path.display(), "Lock file now belongs to another owner; leaving it");
            return Ok(());
        }

        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Acquisition time recorded in a lock file
fn acquired_at(content: &str) -> Option<DateTime<Utc>> {
    let field = content.split_whitespace().nth(1)?;
    DateTime::parse_from_rfc3339(field)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Where a lock being broken is parked; swept by retention if left behind
fn stale_path(lock_path: &Path, nonce: &str) -> PathBuf {
    let mut name = lock_path.as_os_str().to_owned();
    name.push(STALE_MARKER);
    name.push(nonce);
    PathBuf::from(name)
}

fn join_error(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::LockFailed(format!("Lock task failed: {}", e))
}

#[async_trait]
impl DistributedLock for FileLock {
    async fn acquire(&self) -> Result<Option<LockHandle>> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire_sync())
            .await
            .map_err(join_error)?
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        match handle.0 {
            Ownership::File { path, nonce } => {
                tokio::task::spawn_blocking(move || Self::release_sync(&path, &nonce))
                    .await
                    .map_err(join_error)?
            }
            Ownership::Token(_) => Err(PipelineError::LockFailed(
                "Remote lock handle passed to file lock".to_string(),
            )),
        }
    }
}

/// Reply envelope of the coordination service
#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: serde_json::Value,

    #[serde(default)]
    error: Option<String>,
}

/// Coordination-service lock with a file-lock fallback for unreachable periods
pub struct RemoteLock {
    client: HttpClient,
    url: String,
    token: Option<String>,
    key: String,
    ttl: Duration,
    timeout: Duration,
    fallback: FileLock,
}

impl RemoteLock {
    async fn command(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        let body = serde_json::to_vec(&args)?;
        let response =
            http::post_json(&self.client, &self.url, self.token.as_deref(), body, self.timeout)
                .await
                .map_err(|e| PipelineError::LockFailed(e.to_string()))?;

        if !response.status.is_success() {
            return Err(PipelineError::LockFailed(format!(
                "Coordination service returned {}: {}",
                response.status,
                response.body_snippet()
            )));
        }

        let reply: CommandReply = serde_json::from_slice(&response.body)?;
        match reply.error {
            Some(error) => Err(PipelineError::LockFailed(error)),
            None => Ok(reply.result),
        }
    }
}

#[async_trait]
impl DistributedLock for RemoteLock {
    async fn acquire(&self) -> Result<Option<LockHandle>> {
        let token = random_token();
        let ttl_ms = self.ttl.as_millis().to_string();
        let command = serde_json::json!(["SET", self.key, token, "NX", "PX", ttl_ms]);

        match self.command(command).await {
            Ok(serde_json::Value::String(ref ok)) if ok == "OK" => {
                Ok(Some(LockHandle(Ownership::Token(token))))
            }
            Ok(serde_json::Value::Null) => Ok(None),
            Ok(other) => Err(PipelineError::LockFailed(format!(
                "Unexpected SET reply: {}",
                other
            ))),
            Err(e) => {
                warn!(error = %e, "Coordination service unreachable; using lock file");
                self.fallback.acquire().await
            }
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        let token = match handle.0 {
            Ownership::Token(token) => token,
            file @ Ownership::File { .. } => return self.fallback.release(LockHandle(file)).await,
        };

        let command = serde_json::json!(["EVAL", COMPARE_AND_DELETE, "1", self.key, token]);
        let result = self.command(command).await?;
        if result.as_i64() != Some(1) {
            // TTL lapsed; the key is gone or owned by someone else
            warn!(key = %self.key, "Compaction lock expired before release");
        }
        Ok(())
    }
}

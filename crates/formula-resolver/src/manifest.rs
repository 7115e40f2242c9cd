//! Persisted status of bulk preload jobs, one entry per (filter set, period).
//!
//! Entries live behind a [`StatusChannel`] so a job started in one execution
//! context can be observed (and waited on) from another.

use crate::channel::StatusChannel;
use crate::filters::FilterSetHash;
use crate::period::Period;
use chrono::{DateTime, Utc};
use formula_storage::StorageError;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const TOPIC_PREFIX: &str = "manifest:";
const CAS_ATTEMPTS: usize = 8;
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    NotFound,
    Requested,
    Running,
    Completed,
    Failed,
}

impl ManifestStatus {
    /// Forward-only, with skips allowed. `Failed` may go back to `Requested`
    /// (explicit retry); `Completed` is terminal.
    pub fn can_transition_to(self, next: ManifestStatus) -> bool {
        use ManifestStatus::*;
        matches!(
            (self, next),
            (NotFound, Requested | Running | Completed)
                | (Requested, Running | Completed | Failed)
                | (Running, Completed | Failed)
                | (Failed, Requested)
        )
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, ManifestStatus::Requested | ManifestStatus::Running)
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ManifestStatus::NotFound => "not_found",
            ManifestStatus::Requested => "requested",
            ManifestStatus::Running => "running",
            ManifestStatus::Completed => "completed",
            ManifestStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filter_hash: FilterSetHash,
    pub period: Period,
    pub status: ManifestStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution context that last moved the entry forward.
    pub owner: Option<Uuid>,
    pub error: Option<String>,
}

impl ManifestEntry {
    /// Whether a requested or running entry has gone longer than `limit`
    /// without finishing. An in-progress entry with no start time is stale.
    pub fn is_stale(&self, limit: Duration) -> bool {
        if !self.status.is_in_progress() {
            return false;
        }
        let Some(started_at) = self.started_at else {
            return true;
        };
        match chrono::Duration::from_std(limit) {
            Ok(limit) => Utc::now().signed_duration_since(started_at) > limit,
            Err(_) => false,
        }
    }

    fn not_found(filter_hash: &FilterSetHash, period: Period) -> Self {
        Self {
            filter_hash: filter_hash.clone(),
            period,
            status: ManifestStatus::NotFound,
            started_at: None,
            completed_at: None,
            owner: None,
            error: None,
        }
    }

    fn advance(
        &self,
        next: ManifestStatus,
        owner: Uuid,
        error: Option<String>,
    ) -> Result<ManifestEntry, ManifestError> {
        if !self.status.can_transition_to(next) {
            return Err(ManifestError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        let mut entry = self.clone();
        entry.status = next;
        entry.owner = Some(owner);
        match next {
            ManifestStatus::Requested => {
                entry.started_at = Some(now);
                entry.completed_at = None;
                entry.error = None;
            }
            ManifestStatus::Running => {
                entry.started_at.get_or_insert(now);
            }
            ManifestStatus::Completed => {
                entry.started_at.get_or_insert(now);
                entry.completed_at = Some(now);
            }
            ManifestStatus::Failed => {
                entry.completed_at = Some(now);
                entry.error = error;
            }
            ManifestStatus::NotFound => {}
        }
        Ok(entry)
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest transition {from} -> {to}")]
    InvalidTransition {
        from: ManifestStatus,
        to: ManifestStatus,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("corrupt manifest record under {topic}: {source}")]
    Corrupt {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest record under {topic} kept changing underneath the writer")]
    Contended { topic: String },
}

/// Result of [`Manifest::wait_for_completion`]. A slow job is an outcome,
/// not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// Result of [`Manifest::claim`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This context moved the entry to `requested` and now owns the job.
    Acquired(ManifestEntry),
    /// Another context's job is requested or running.
    InProgress(ManifestEntry),
    AlreadyCompleted,
}

#[derive(Clone)]
pub struct Manifest {
    channel: Arc<dyn StatusChannel>,
    poll_interval: Duration,
    stale_after: Duration,
    context: Uuid,
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("poll_interval", &self.poll_interval)
            .field("stale_after", &self.stale_after)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl Manifest {
    pub fn new(channel: Arc<dyn StatusChannel>, poll_interval: Duration, context: Uuid) -> Self {
        Self {
            channel,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            stale_after: DEFAULT_STALE_AFTER,
            context,
        }
    }

    /// Age after which a requested or running entry is presumed abandoned by
    /// a context that died, and may be failed and reclaimed (default: 10min).
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn context(&self) -> Uuid {
        self.context
    }

    pub fn topic(filter_hash: &FilterSetHash, period: Period) -> String {
        format!("{TOPIC_PREFIX}{filter_hash}:{}", period.key())
    }

    pub fn get_entry(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
    ) -> Result<ManifestEntry, ManifestError> {
        Ok(self.read(filter_hash, period)?.1)
    }

    pub fn get_status(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
    ) -> Result<ManifestStatus, ManifestError> {
        Ok(self.get_entry(filter_hash, period)?.status)
    }

    /// Move the entry to `next`, rejecting transitions the state machine does
    /// not allow. Concurrent writers are detected by compare-and-swap; the
    /// loser re-reads and re-validates against the winner's record.
    pub fn set_status(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
        next: ManifestStatus,
    ) -> Result<ManifestEntry, ManifestError> {
        self.write(filter_hash, period, next, None)
    }

    pub fn set_failed(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
        error: impl Into<String>,
    ) -> Result<ManifestEntry, ManifestError> {
        self.write(filter_hash, period, ManifestStatus::Failed, Some(error.into()))
    }

    /// Take ownership of the job for (filter set, period) unless it is already
    /// running elsewhere or done. A `failed` entry is retried, and so is a
    /// stale in-progress entry, which is failed first.
    pub fn claim(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
    ) -> Result<Claim, ManifestError> {
        let topic = Self::topic(filter_hash, period);
        for _ in 0..CAS_ATTEMPTS {
            let (version, current) = self.read(filter_hash, period)?;
            match current.status {
                ManifestStatus::Completed => return Ok(Claim::AlreadyCompleted),
                status if status.is_in_progress() => {
                    if !current.is_stale(self.stale_after) {
                        return Ok(Claim::InProgress(current));
                    }
                    self.expire(&topic, version, &current)?;
                }
                _ => {
                    let next = current.advance(ManifestStatus::Requested, self.context, None)?;
                    if self.publish(&topic, version, &next)? {
                        debug!("claimed preload {topic} (was {})", current.status);
                        return Ok(Claim::Acquired(next));
                    }
                }
            }
        }
        Err(ManifestError::Contended { topic })
    }

    /// Poll until the entry is completed or failed, or `max_wait` elapses.
    ///
    /// An entry that disappears while waited on (invalidated) counts as failed,
    /// as does a stale one, which is marked failed for every other waiter too.
    pub async fn wait_for_completion(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
        max_wait: Duration,
    ) -> WaitOutcome {
        let topic = Self::topic(filter_hash, period);
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            match self.read(filter_hash, period) {
                Ok((_, entry)) if entry.status == ManifestStatus::Completed => {
                    return WaitOutcome::Completed
                }
                Ok((_, entry)) if !entry.status.is_in_progress() => return WaitOutcome::Failed,
                Ok((version, entry)) if entry.is_stale(self.stale_after) => {
                    if let Err(err) = self.expire(&topic, version, &entry) {
                        warn!("could not fail stale preload {topic}: {err}");
                    }
                    return WaitOutcome::Failed;
                }
                Ok((_, entry)) => trace!("preload {topic} still {}", entry.status),
                Err(err) => {
                    warn!("manifest poll failed; treating preload as failed: {err}");
                    return WaitOutcome::Failed;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub fn invalidate_filter_set(&self, filter_hash: &FilterSetHash) -> Result<usize, ManifestError> {
        Ok(self
            .channel
            .retract_prefix(&format!("{TOPIC_PREFIX}{filter_hash}:"))?)
    }

    pub fn clear(&self) -> Result<usize, ManifestError> {
        Ok(self.channel.retract_prefix(TOPIC_PREFIX)?)
    }

    fn read(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
    ) -> Result<(Option<i64>, ManifestEntry), ManifestError> {
        let topic = Self::topic(filter_hash, period);
        match self.channel.poll(&topic)? {
            None => Ok((None, ManifestEntry::not_found(filter_hash, period))),
            Some(stored) => {
                let entry = serde_json::from_str(&stored.value)
                    .map_err(|source| ManifestError::Corrupt { topic, source })?;
                Ok((Some(stored.version), entry))
            }
        }
    }

    /// Fail a stale in-progress entry. Losing the race to another writer is
    /// fine; the caller re-reads either way.
    fn expire(
        &self,
        topic: &str,
        version: Option<i64>,
        current: &ManifestEntry,
    ) -> Result<(), ManifestError> {
        let reason = match current.started_at {
            Some(started_at) => format!("abandoned: still {} since {started_at}", current.status),
            None => format!("abandoned: {} without a start time", current.status),
        };
        let failed = current.advance(ManifestStatus::Failed, self.context, Some(reason))?;
        if self.publish(topic, version, &failed)? {
            warn!("failed stale preload {topic} (owner {:?})", current.owner);
        }
        Ok(())
    }

    fn write(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
        next: ManifestStatus,
        error: Option<String>,
    ) -> Result<ManifestEntry, ManifestError> {
        let topic = Self::topic(filter_hash, period);
        for _ in 0..CAS_ATTEMPTS {
            let (version, current) = self.read(filter_hash, period)?;
            let entry = current.advance(next, self.context, error.clone())?;
            if self.publish(&topic, version, &entry)? {
                return Ok(entry);
            }
            trace!("manifest write to {topic} lost a race; re-validating");
        }
        Err(ManifestError::Contended { topic })
    }

    fn publish(
        &self,
        topic: &str,
        expected_version: Option<i64>,
        entry: &ManifestEntry,
    ) -> Result<bool, ManifestError> {
        let json = serde_json::to_string(entry).map_err(|source| ManifestError::Corrupt {
            topic: topic.to_string(),
            source,
        })?;
        Ok(self.channel.publish(topic, expected_version, &json)?)
    }
}

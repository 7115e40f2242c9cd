//! Bulk preload of every entity's as-of value for one (filter set, period).

use crate::collaborator::Collaborator;
use crate::engine::Engine;
use crate::filters::{CanonicalFilters, FilterSetHash};
use crate::key::{normalize_entity, CanonicalKey};
use crate::manifest::{Claim, Manifest, ManifestStatus};
use crate::period::Period;
use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// This context ran the job; `entities` values were written to the cache.
    Completed { entities: usize },
    /// The entry was already completed; nothing was fetched.
    AlreadyCompleted,
    /// Another context owns a requested or running job.
    InProgress,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreloadError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

/// An acquired manifest entry that has not reached a terminal status yet.
///
/// Dropped while armed (the task was aborted, panicked, or returned early), it
/// marks the entry failed so peers stop waiting and the job can be reclaimed.
struct PendingPreload<'a> {
    manifest: &'a Manifest,
    hash: &'a FilterSetHash,
    period: Period,
    armed: bool,
}

impl<'a> PendingPreload<'a> {
    fn new(manifest: &'a Manifest, hash: &'a FilterSetHash, period: Period) -> Self {
        Self {
            manifest,
            hash,
            period,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingPreload<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (hash, period) = (self.hash, self.period);
        match self
            .manifest
            .set_failed(hash, period, "preload ended before it finished")
        {
            Ok(_) => warn!("preload of {period} for {hash} ended early; marked failed"),
            Err(err) => warn!("could not mark abandoned preload of {period} for {hash} as failed: {err}"),
        }
    }
}

impl<C: Collaborator> Engine<C> {
    pub(crate) async fn preload(&self, filters: CanonicalFilters, period: Period) -> PreloadOutcome {
        let hash = filters.hash();
        self.preloads
            .run((hash.clone(), period), move || async move {
                self.run_preload(&filters, &hash, period).await
            })
            .await
    }

    async fn run_preload(
        &self,
        filters: &CanonicalFilters,
        hash: &FilterSetHash,
        period: Period,
    ) -> PreloadOutcome {
        match self.manifest.claim(hash, period) {
            Ok(Claim::Acquired(_)) => {}
            Ok(Claim::AlreadyCompleted) => return PreloadOutcome::AlreadyCompleted,
            Ok(Claim::InProgress(entry)) => {
                debug!("preload of {period} for {hash} already {} elsewhere", entry.status);
                return PreloadOutcome::InProgress;
            }
            Err(err) => {
                return PreloadOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }

        let pending = PendingPreload::new(&self.manifest, hash, period);
        if let Err(err) = self.manifest.set_status(hash, period, ManifestStatus::Running) {
            pending.disarm();
            return self.fail_preload(hash, period, err.to_string());
        }

        self.bump(|s| {
            s.preloads = s.preloads.saturating_add(1);
            s.collaborator_calls = s.collaborator_calls.saturating_add(1);
        });
        let values = match self.collaborator.fetch_preload(filters.clone(), period).await {
            Ok(values) => values,
            Err(err) => {
                pending.disarm();
                return self.fail_preload(hash, period, err.to_string());
            }
        };

        // Values land in the cache before the entry reads completed, so a
        // peer that observes completion can always find them.
        let mut written = 0;
        for (raw_entity, value) in values {
            if !value.is_finite() {
                warn!("preload of {period} returned a non-finite value for {raw_entity}; skipping");
                continue;
            }
            let Ok(entity) = normalize_entity(&raw_entity) else {
                warn!("preload of {period} returned an empty entity id; skipping");
                continue;
            };
            self.cache
                .confirm(&CanonicalKey::as_of(hash, &entity, period), value);
            written += 1;
        }

        match self.manifest.set_status(hash, period, ManifestStatus::Completed) {
            Ok(_) => {
                pending.disarm();
                debug!("preload of {period} for {hash} wrote {written} value(s)");
                PreloadOutcome::Completed { entities: written }
            }
            // `pending` still tries to fail the entry on the way out.
            Err(err) => PreloadOutcome::Failed {
                reason: err.to_string(),
            },
        }
    }

    fn fail_preload(&self, hash: &FilterSetHash, period: Period, reason: String) -> PreloadOutcome {
        warn!("preload of {period} for {hash} failed: {reason}");
        if let Err(err) = self.manifest.set_failed(hash, period, reason.clone()) {
            warn!("could not mark preload of {period} for {hash} as failed: {err}");
        }
        PreloadOutcome::Failed { reason }
    }
}

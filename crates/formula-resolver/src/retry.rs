use crate::cache::{CacheEntry, ValueCache};
use crate::filters::FilterSetHash;
use crate::key::CanonicalKey;
use crate::manifest::{Manifest, WaitOutcome};
use crate::period::Period;
use log::{debug, warn};
use std::time::Duration;

/// Bounded wait on another job's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Deadline of each wait.
    pub attempt_wait: Duration,
    /// Pause between waits.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Upper bound on the time a caller can spend waiting before falling through.
    pub fn total_budget(&self) -> Duration {
        (self.attempt_wait + self.backoff) * self.max_attempts
    }
}

/// Why a wait ended without a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallThrough {
    /// The job failed or its entry disappeared.
    PreloadFailed,
    /// The job completed but did not produce this key.
    NotCached,
    /// Every attempt ran out its deadline.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitResolution {
    Cached(CacheEntry),
    FallThrough(FallThrough),
}

/// Waits for an in-progress preload to fill a key, then gets out of the way.
///
/// The only outcomes are a confirmed cached value or a fall-through; a slow
/// job never turns into a failure for the caller.
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    manifest: Manifest,
    cache: ValueCache,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, manifest: Manifest, cache: ValueCache) -> Self {
        Self {
            policy,
            manifest,
            cache,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn await_preload(
        &self,
        filter_hash: &FilterSetHash,
        period: Period,
        key: &CanonicalKey,
    ) -> WaitResolution {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let outcome = self
                .manifest
                .wait_for_completion(filter_hash, period, self.policy.attempt_wait)
                .await;
            match outcome {
                WaitOutcome::Completed => {
                    return match self.cache.get(key) {
                        Some(entry) => WaitResolution::Cached(entry),
                        None => {
                            debug!("preload for {period} completed without {key}");
                            WaitResolution::FallThrough(FallThrough::NotCached)
                        }
                    };
                }
                WaitOutcome::Failed => {
                    return WaitResolution::FallThrough(FallThrough::PreloadFailed);
                }
                WaitOutcome::TimedOut => {
                    // The job may still have written this key before finishing.
                    if let Some(entry) = self.cache.get(key) {
                        return WaitResolution::Cached(entry);
                    }
                    debug!("wait {attempt}/{attempts} for preload of {period} timed out");
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff).await;
                    }
                }
            }
        }

        warn!("preload of {period} still in progress after {attempts} waits; fetching {key} directly");
        WaitResolution::FallThrough(FallThrough::Exhausted { attempts })
    }
}

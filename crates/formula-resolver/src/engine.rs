use crate::cache::{CacheStats, ValueCache};
use crate::channel::StoreChannel;
use crate::classify::RoutingClassifier;
use crate::collaborator::{BalanceQuery, Collaborator, CollaboratorError};
use crate::config::ResolverConfig;
use crate::error::{ResolveError, Result};
use crate::filters::FilterSetHash;
use crate::grid::GridPatternDetector;
use crate::key::{BalanceRequest, CanonicalKey, RequestShape};
use crate::manifest::Manifest;
use crate::period::Period;
use crate::preload::PreloadOutcome;
use crate::retry::{RetryController, WaitResolution};
use crate::scheduler::Scheduler;
use crate::single_flight::{Flight, FlightGuard, SingleFlight, SingleFlightStats};
use formula_storage::Storage;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

pub(crate) type Waiter = oneshot::Sender<Result<f64>>;
pub(crate) type ValueGuard = FlightGuard<CanonicalKey, Result<f64>>;

/// Cumulative counters for one resolver (one execution context).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolverStats {
    pub requests: u64,
    pub cache_hits: u64,
    /// Requests answered by an operation another request started.
    pub coalesced: u64,
    /// Data calls to the collaborator (account-type lookups excluded).
    pub collaborator_calls: u64,
    pub grid_collapses: u64,
    /// Direct fetches after a wait, a failed batch or a failed grid.
    pub fall_throughs: u64,
    pub flushes: u64,
    pub preloads: u64,
    pub cache: CacheStats,
    pub flights: SingleFlightStats,
}

/// A canonical key this context is now responsible for fetching.
pub(crate) struct Claim {
    pub(crate) request: BalanceRequest,
    pub(crate) guard: ValueGuard,
    pub(crate) waiters: Vec<Waiter>,
}

impl Claim {
    pub(crate) fn period(&self) -> Option<Period> {
        self.request.as_of_period()
    }
}

pub(crate) struct Engine<C> {
    pub(crate) collaborator: C,
    pub(crate) config: ResolverConfig,
    pub(crate) cache: ValueCache,
    pub(crate) manifest: Manifest,
    pub(crate) flights: SingleFlight<CanonicalKey, Result<f64>>,
    pub(crate) preloads: SingleFlight<(FilterSetHash, Period), PreloadOutcome>,
    pub(crate) classifier: RoutingClassifier,
    pub(crate) scheduler: Scheduler,
    pub(crate) retry: RetryController,
    pub(crate) grid: GridPatternDetector,
    stats: Mutex<ResolverStats>,
}

impl<C: Collaborator> Engine<C> {
    pub(crate) fn new(collaborator: C, storage: Storage, config: ResolverConfig, context: Uuid) -> Self {
        let config = config.sanitized();
        let cache = ValueCache::new(storage.clone(), config.cache_capacity);
        let manifest = Manifest::new(
            Arc::new(StoreChannel::new(storage.clone())),
            config.manifest_poll_interval(),
            context,
        )
        .with_stale_after(config.preload_stale_after());
        let retry = RetryController::new(config.retry_policy(), manifest.clone(), cache.clone());
        Self {
            collaborator,
            cache,
            manifest,
            flights: SingleFlight::new(),
            preloads: SingleFlight::new(),
            classifier: RoutingClassifier::new(storage),
            scheduler: Scheduler::new(),
            retry,
            grid: GridPatternDetector::new(config.max_period_gap),
            stats: Mutex::new(ResolverStats::default()),
            config,
        }
    }

    pub(crate) fn bump(&self, update: impl FnOnce(&mut ResolverStats)) {
        update(&mut self.stats.lock().expect("resolver stats mutex poisoned"));
    }

    pub(crate) fn stats(&self) -> ResolverStats {
        let mut stats = *self.stats.lock().expect("resolver stats mutex poisoned");
        stats.cache = self.cache.stats();
        stats.flights = self.flights.stats();
        stats
    }

    pub(crate) async fn resolve(self: &Arc<Self>, request: BalanceRequest) -> Result<f64> {
        self.bump(|s| s.requests = s.requests.saturating_add(1));

        if let Some(entry) = self.cache.get(&request.key) {
            self.bump(|s| s.cache_hits = s.cache_hits.saturating_add(1));
            return Ok(entry.value);
        }

        let class = self
            .classifier
            .classify(&self.collaborator, &request.entity)
            .await?;

        if let Some(period) = request.as_of_period() {
            match self.manifest.get_status(&request.filter_hash, period) {
                Ok(status) if status.is_in_progress() => {
                    return self.wait_for_preload(&request, period).await;
                }
                Ok(_) => {}
                Err(err) => warn!("manifest lookup for {} failed; ignoring: {err}", request.key),
            }
        }

        if let Some(waiter) = self.flights.follow(&request.key) {
            self.bump(|s| s.coalesced = s.coalesced.saturating_add(1));
            if let Ok(result) = waiter.wait().await {
                return result;
            }
        }

        let (rx, opened) = self.scheduler.enqueue(request.clone(), class);
        if opened {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.run_window().await });
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => {
                warn!("batch for {} was dropped before settling; fetching directly", request.key);
                self.bump(|s| s.fall_throughs = s.fall_throughs.saturating_add(1));
                self.fetch_single(&request).await
            }
        }
    }

    async fn wait_for_preload(&self, request: &BalanceRequest, period: Period) -> Result<f64> {
        match self
            .retry
            .await_preload(&request.filter_hash, period, &request.key)
            .await
        {
            WaitResolution::Cached(entry) => {
                self.bump(|s| s.cache_hits = s.cache_hits.saturating_add(1));
                Ok(entry.value)
            }
            WaitResolution::FallThrough(reason) => {
                debug!("falling through to a direct fetch of {} ({reason:?})", request.key);
                self.bump(|s| s.fall_throughs = s.fall_throughs.saturating_add(1));
                self.fetch_single(request).await
            }
        }
    }

    /// One collaborator call for one key, shared with anyone else fetching it.
    pub(crate) async fn fetch_single(&self, request: &BalanceRequest) -> Result<f64> {
        match self.flights.join(request.key.clone()) {
            Flight::Leader(guard) => {
                let result = self.call_single(request).await;
                self.settle(Some(guard), &request.key, result.clone(), Vec::new());
                result
            }
            Flight::Follower(waiter) => {
                self.bump(|s| s.coalesced = s.coalesced.saturating_add(1));
                match waiter.wait().await {
                    Ok(result) => result,
                    Err(_) => {
                        let result = self.call_single(request).await;
                        self.settle(None, &request.key, result.clone(), Vec::new());
                        result
                    }
                }
            }
        }
    }

    pub(crate) async fn call_single(&self, request: &BalanceRequest) -> Result<f64> {
        let (from, to) = match request.shape {
            RequestShape::AsOf(period) => (None, period),
            RequestShape::Range { from, to } => (Some(from), to),
        };
        self.bump(|s| s.collaborator_calls = s.collaborator_calls.saturating_add(1));
        let value = self
            .collaborator
            .fetch_balance(BalanceQuery {
                entity: request.entity.clone(),
                from,
                to,
                filters: request.filters.clone(),
            })
            .await?;
        confirmed_number(&request.key, value)
    }

    /// Publish one key's outcome: cache first, then the flight's followers,
    /// then the scheduler waiters.
    pub(crate) fn settle(
        &self,
        guard: Option<ValueGuard>,
        key: &CanonicalKey,
        result: Result<f64>,
        waiters: Vec<Waiter>,
    ) {
        if let Ok(value) = &result {
            self.cache.confirm(key, *value);
        }
        if let Some(guard) = guard {
            guard.settle(result.clone());
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    pub(crate) fn settle_claim(&self, claim: Claim, result: Result<f64>) {
        let Claim {
            request,
            guard,
            waiters,
        } = claim;
        self.settle(Some(guard), &request.key, result, waiters);
    }
}

/// A value the collaborator produced may only be cached if it is a real number.
pub(crate) fn confirmed_number(key: &CanonicalKey, value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ResolveError::Collaborator(CollaboratorError::NonFinite(
            key.to_string(),
        )))
    }
}

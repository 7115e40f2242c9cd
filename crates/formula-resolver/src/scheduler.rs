//! Collection window and flush.
//!
//! The first request that finds the queue empty opens a window; everything
//! that arrives before it closes is flushed together. Later arrivals never
//! extend an open window.

use crate::classify::AccountClass;
use crate::collaborator::{BalanceQuery, BatchQuery, Collaborator, CollaboratorError};
use crate::engine::{confirmed_number, Claim, Engine, Waiter};
use crate::error::{ResolveError, Result};
use crate::filters::{CanonicalFilters, FilterSetHash};
use crate::grid::GridPlan;
use crate::key::{BalanceRequest, CanonicalKey, RequestShape};
use crate::period::Period;
use crate::single_flight::Flight;
use log::{debug, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinSet;

pub(crate) struct Pending {
    pub(crate) request: BalanceRequest,
    pub(crate) class: AccountClass,
    pub(crate) waiter: Waiter,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    window_open: bool,
}

pub(crate) struct Scheduler {
    state: Mutex<QueueState>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Queue a request. The flag is `true` when this request opened the
    /// window, in which case the caller must arrange the flush.
    pub(crate) fn enqueue(
        &self,
        request: BalanceRequest,
        class: AccountClass,
    ) -> (oneshot::Receiver<Result<f64>>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        state.pending.push(Pending {
            request,
            class,
            waiter: tx,
        });
        let opened = !state.window_open;
        state.window_open = true;
        (rx, opened)
    }

    /// Close the window and hand over everything queued in it.
    pub(crate) fn take_pending(&self) -> Vec<Pending> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        state.window_open = false;
        std::mem::take(&mut state.pending)
    }
}

/// Every waiter on one canonical key.
pub(crate) struct KeyedWaiters {
    pub(crate) request: BalanceRequest,
    pub(crate) waiters: Vec<Waiter>,
}

/// Point-in-time requests for one cumulative entity under one filter set.
pub(crate) struct CumulativeGroup {
    pub(crate) entity: String,
    pub(crate) filters: CanonicalFilters,
    pub(crate) keys: Vec<KeyedWaiters>,
}

/// Activity-class entities sharing one filter set and one set of periods.
pub(crate) struct ActivityGroup {
    pub(crate) filters: CanonicalFilters,
    pub(crate) periods: Vec<Period>,
    pub(crate) keys: Vec<KeyedWaiters>,
}

#[derive(Default)]
pub(crate) struct FlushPlan {
    pub(crate) cumulative: Vec<CumulativeGroup>,
    pub(crate) activity: Vec<ActivityGroup>,
    /// Range requests; always a single call each.
    pub(crate) direct: Vec<KeyedWaiters>,
    /// Waiters folded onto a key another waiter in the same window asked for.
    pub(crate) duplicates: usize,
}

/// Group a window's requests. Each canonical key appears in exactly one group,
/// with all of its waiters. Groups hold at most `max_batch` keys, except an
/// activity group for a single entity whose period set alone is larger.
pub(crate) fn partition(pending: Vec<Pending>, max_batch: usize) -> FlushPlan {
    let max_batch = max_batch.max(1);
    let mut plan = FlushPlan::default();

    let mut order: Vec<CanonicalKey> = Vec::new();
    let mut by_key: HashMap<CanonicalKey, (AccountClass, KeyedWaiters)> = HashMap::new();
    for Pending {
        request,
        class,
        waiter,
    } in pending
    {
        match by_key.get_mut(&request.key) {
            Some((_, keyed)) => {
                keyed.waiters.push(waiter);
                plan.duplicates += 1;
            }
            None => {
                order.push(request.key.clone());
                by_key.insert(
                    request.key.clone(),
                    (
                        class,
                        KeyedWaiters {
                            request,
                            waiters: vec![waiter],
                        },
                    ),
                );
            }
        }
    }

    let mut cumulative: BTreeMap<(FilterSetHash, String), Vec<KeyedWaiters>> = BTreeMap::new();
    let mut activity: BTreeMap<FilterSetHash, BTreeMap<String, Vec<KeyedWaiters>>> = BTreeMap::new();

    for key in order {
        let Some((class, keyed)) = by_key.remove(&key) else {
            continue;
        };
        match (keyed.request.shape, class) {
            (RequestShape::Range { .. }, _) => plan.direct.push(keyed),
            (RequestShape::AsOf(_), AccountClass::Cumulative) => cumulative
                .entry((keyed.request.filter_hash.clone(), keyed.request.entity.clone()))
                .or_default()
                .push(keyed),
            (RequestShape::AsOf(_), AccountClass::Activity) => activity
                .entry(keyed.request.filter_hash.clone())
                .or_default()
                .entry(keyed.request.entity.clone())
                .or_default()
                .push(keyed),
        }
    }

    for ((_, entity), mut keys) in cumulative {
        keys.sort_by_key(|keyed| keyed.request.as_of_period());
        let filters = keys[0].request.filters.clone();
        while !keys.is_empty() {
            let rest = keys.split_off(keys.len().min(max_batch));
            plan.cumulative.push(CumulativeGroup {
                entity: entity.clone(),
                filters: filters.clone(),
                keys,
            });
            keys = rest;
        }
    }

    for (_, entities) in activity {
        let mut by_periods: BTreeMap<Vec<Period>, Vec<Vec<KeyedWaiters>>> = BTreeMap::new();
        for (_, keys) in entities {
            let periods: BTreeSet<Period> =
                keys.iter().filter_map(|k| k.request.as_of_period()).collect();
            by_periods
                .entry(periods.into_iter().collect())
                .or_default()
                .push(keys);
        }

        for (periods, entities) in by_periods {
            let filters = entities[0][0].request.filters.clone();
            let per_chunk = (max_batch / periods.len().max(1)).max(1);
            let mut entities = entities.into_iter().peekable();
            while entities.peek().is_some() {
                let keys: Vec<KeyedWaiters> = entities.by_ref().take(per_chunk).flatten().collect();
                plan.activity.push(ActivityGroup {
                    filters: filters.clone(),
                    periods: periods.clone(),
                    keys,
                });
            }
        }
    }

    plan
}

impl<C: Collaborator> Engine<C> {
    pub(crate) async fn run_window(self: Arc<Self>) {
        let window = self.config.collection_window();
        if window.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(window).await;
        }
        self.flush().await;
    }

    pub(crate) async fn flush(self: &Arc<Self>) {
        let pending = self.scheduler.take_pending();
        if pending.is_empty() {
            return;
        }
        let queued = pending.len();
        let plan = partition(pending, self.config.max_batch_size);
        self.bump(|s| {
            s.flushes = s.flushes.saturating_add(1);
            s.coalesced = s.coalesced.saturating_add(plan.duplicates as u64);
        });
        debug!(
            "flushing {queued} request(s): {} cumulative group(s), {} activity batch(es), {} range fetch(es)",
            plan.cumulative.len(),
            plan.activity.len(),
            plan.direct.len()
        );

        let mut tasks = JoinSet::new();
        for group in plan.cumulative {
            let claims = self.claim_all(group.keys);
            if claims.is_empty() {
                continue;
            }
            let engine = Arc::clone(self);
            let (entity, filters) = (group.entity, group.filters);
            tasks.spawn(async move { engine.run_cumulative(entity, filters, claims).await });
        }
        for group in plan.activity {
            let claims = self.claim_all(group.keys);
            if claims.is_empty() {
                continue;
            }
            let engine = Arc::clone(self);
            let (filters, periods) = (group.filters, group.periods);
            tasks.spawn(async move { engine.run_activity(filters, periods, claims).await });
        }
        let direct = self.claim_all(plan.direct);
        if !direct.is_empty() {
            let engine = Arc::clone(self);
            tasks.spawn(async move { engine.run_singles(direct).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("batch task failed: {err}");
            }
        }
    }

    fn claim_all(self: &Arc<Self>, keys: Vec<KeyedWaiters>) -> Vec<Claim> {
        keys.into_iter().filter_map(|keyed| self.claim(keyed)).collect()
    }

    /// Take responsibility for fetching `keyed`, unless the value turned up in
    /// the cache or someone else is already fetching it.
    fn claim(self: &Arc<Self>, keyed: KeyedWaiters) -> Option<Claim> {
        if let Some(entry) = self.cache.get(&keyed.request.key) {
            for waiter in keyed.waiters {
                let _ = waiter.send(Ok(entry.value));
            }
            return None;
        }

        match self.flights.join(keyed.request.key.clone()) {
            Flight::Leader(guard) => Some(Claim {
                request: keyed.request,
                guard,
                waiters: keyed.waiters,
            }),
            Flight::Follower(waiter) => {
                self.bump(|s| s.coalesced = s.coalesced.saturating_add(1));
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    let result = match waiter.wait().await {
                        Ok(result) => result,
                        Err(_) => engine.fetch_single(&keyed.request).await,
                    };
                    for tx in keyed.waiters {
                        let _ = tx.send(result.clone());
                    }
                });
                None
            }
        }
    }

    async fn run_singles(self: &Arc<Self>, claims: Vec<Claim>) {
        let mut tasks = JoinSet::new();
        for claim in claims {
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let result = engine.call_single(&claim.request).await;
                engine.settle_claim(claim, result);
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("single fetch task failed: {err}");
            }
        }
    }

    async fn run_cumulative(
        self: &Arc<Self>,
        entity: String,
        filters: CanonicalFilters,
        claims: Vec<Claim>,
    ) {
        let mut by_period: BTreeMap<Period, Claim> = BTreeMap::new();
        let mut unplanned = Vec::new();
        for claim in claims {
            match claim.period() {
                Some(period) => {
                    by_period.insert(period, claim);
                }
                None => unplanned.push(claim),
            }
        }

        let layout = self.grid.plan(by_period.keys().copied());
        let mut singles = unplanned;
        singles.extend(layout.singles.iter().filter_map(|p| by_period.remove(p)));

        let mut tasks = JoinSet::new();
        for plan in layout.grids {
            let grid_claims: Vec<Claim> = plan
                .requested
                .iter()
                .filter_map(|p| by_period.remove(p))
                .collect();
            let engine = Arc::clone(self);
            let (entity, filters) = (entity.clone(), filters.clone());
            tasks.spawn(async move { engine.run_grid(entity, filters, plan, grid_claims).await });
        }
        if !singles.is_empty() {
            let engine = Arc::clone(self);
            tasks.spawn(async move { engine.run_singles(singles).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!("grid task for {entity} failed: {err}");
            }
        }
    }

    async fn run_grid(
        self: &Arc<Self>,
        entity: String,
        filters: CanonicalFilters,
        plan: GridPlan,
        claims: Vec<Claim>,
    ) {
        debug!(
            "grid collapse for {entity}: anchor {}, breakdown {}..={} ({} period(s))",
            plan.anchor,
            plan.first,
            plan.last,
            claims.len()
        );
        self.bump(|s| {
            s.grid_collapses = s.grid_collapses.saturating_add(1);
            s.collaborator_calls = s.collaborator_calls.saturating_add(2);
        });

        let anchor_query = BalanceQuery {
            entity: entity.clone(),
            from: None,
            to: plan.anchor,
            filters: filters.clone(),
        };
        let breakdown_query = BatchQuery {
            entities: vec![entity.clone()],
            periods: plan.span(),
            filters,
        };
        let (anchor, breakdown) = tokio::join!(
            self.collaborator.fetch_balance(anchor_query),
            self.collaborator.fetch_batch(breakdown_query)
        );

        let assembled = match (anchor, breakdown) {
            (Ok(anchor), Ok(_)) if !anchor.is_finite() => {
                Err(format!("anchor {} is not a finite number", plan.anchor))
            }
            (Ok(anchor), Ok(response)) => match response.values.get(&entity) {
                Some(months) => plan
                    .assemble(anchor, months)
                    .map_err(|missing| format!("breakdown has no row for {missing}")),
                None => Err(response
                    .errors
                    .get(&entity)
                    .cloned()
                    .unwrap_or_else(|| "breakdown returned no rows".to_string())),
            },
            (Err(err), _) | (_, Err(err)) => Err(err.to_string()),
        };

        let leftovers = match assembled {
            Ok(values) => {
                let mut leftovers = Vec::new();
                for claim in claims {
                    match claim.period().and_then(|p| values.get(&p)).copied() {
                        Some(value) if value.is_finite() => self.settle_claim(claim, Ok(value)),
                        _ => leftovers.push(claim),
                    }
                }
                leftovers
            }
            Err(reason) => {
                warn!("grid collapse for {entity} failed ({reason}); fetching periods individually");
                claims
            }
        };

        if !leftovers.is_empty() {
            self.bump(|s| s.fall_throughs = s.fall_throughs.saturating_add(1));
            self.run_singles(leftovers).await;
        }
    }

    async fn run_activity(
        self: &Arc<Self>,
        filters: CanonicalFilters,
        periods: Vec<Period>,
        claims: Vec<Claim>,
    ) {
        let mut entities: Vec<String> = Vec::new();
        for claim in &claims {
            if !entities.contains(&claim.request.entity) {
                entities.push(claim.request.entity.clone());
            }
        }
        debug!(
            "batched activity call: {} entit(ies) x {} period(s)",
            entities.len(),
            periods.len()
        );
        self.bump(|s| s.collaborator_calls = s.collaborator_calls.saturating_add(1));

        let response = self
            .collaborator
            .fetch_batch(BatchQuery {
                entities,
                periods,
                filters,
            })
            .await;

        let leftovers = match response {
            Ok(response) => {
                let mut leftovers = Vec::new();
                for claim in claims {
                    let entity = claim.request.entity.clone();
                    if let Some(message) = response.errors.get(&entity) {
                        let err = ResolveError::Collaborator(CollaboratorError::Rejected(message.clone()));
                        self.settle_claim(claim, Err(err));
                        continue;
                    }
                    match claim.period().and_then(|p| response.value(&entity, p)) {
                        Some(value) => {
                            let result = confirmed_number(&claim.request.key, value);
                            self.settle_claim(claim, result);
                        }
                        None => leftovers.push(claim),
                    }
                }
                leftovers
            }
            Err(err) => {
                warn!("batched activity call failed ({err}); fetching keys individually");
                claims
            }
        };

        if !leftovers.is_empty() {
            self.bump(|s| s.fall_throughs = s.fall_throughs.saturating_add(1));
            self.run_singles(leftovers).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterSet;
    use crate::key::RawRequest;

    fn pending(raw: RawRequest, class: AccountClass) -> (Pending, oneshot::Receiver<Result<f64>>) {
        let (tx, rx) = oneshot::channel();
        let pending = Pending {
            request: raw.normalize().unwrap(),
            class,
            waiter: tx,
        };
        (pending, rx)
    }

    #[test]
    fn enqueue_opens_the_window_once() {
        let scheduler = Scheduler::new();
        let request = RawRequest::as_of("1000", "Jan 2025").normalize().unwrap();
        let (_a, opened_a) = scheduler.enqueue(request.clone(), AccountClass::Cumulative);
        let (_b, opened_b) = scheduler.enqueue(request.clone(), AccountClass::Cumulative);
        assert!(opened_a);
        assert!(!opened_b);

        assert_eq!(scheduler.take_pending().len(), 2);
        let (_c, opened_c) = scheduler.enqueue(request, AccountClass::Cumulative);
        assert!(opened_c);
    }

    #[test]
    fn duplicate_keys_share_one_slot() {
        let mut queue = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (p, rx) = pending(RawRequest::as_of("1000", "Jan 2025"), AccountClass::Cumulative);
            queue.push(p);
            receivers.push(rx);
        }
        let plan = partition(queue, 100);
        assert_eq!(plan.duplicates, 2);
        assert_eq!(plan.cumulative.len(), 1);
        assert_eq!(plan.cumulative[0].keys.len(), 1);
        assert_eq!(plan.cumulative[0].keys[0].waiters.len(), 3);
    }

    #[test]
    fn classes_and_shapes_are_routed_separately() {
        let queue = vec![
            pending(RawRequest::as_of("1000", "Jan 2025"), AccountClass::Cumulative).0,
            pending(RawRequest::as_of("1000", "Feb 2025"), AccountClass::Cumulative).0,
            pending(RawRequest::as_of("4000", "Jan 2025"), AccountClass::Activity).0,
            pending(RawRequest::as_of("4100", "Jan 2025"), AccountClass::Activity).0,
            pending(RawRequest::range("4000", "Jan 2025", "Mar 2025"), AccountClass::Activity).0,
            pending(
                RawRequest::as_of("1000", "Jan 2025").with_filters(FilterSet::new().department("Sales")),
                AccountClass::Cumulative,
            )
            .0,
        ];
        let plan = partition(queue, 100);
        assert_eq!(plan.cumulative.len(), 2);
        assert_eq!(plan.activity.len(), 1);
        assert_eq!(plan.activity[0].keys.len(), 2);
        assert_eq!(plan.direct.len(), 1);
    }

    #[test]
    fn chunks_respect_the_batch_size_without_splitting_keys() {
        let mut queue = Vec::new();
        for entity in ["4000", "4100", "4200", "4300", "4400"] {
            for _ in 0..2 {
                queue.push(pending(RawRequest::as_of(entity, "Jan 2025"), AccountClass::Activity).0);
            }
        }
        let plan = partition(queue, 2);
        let sizes: Vec<usize> = plan.activity.iter().map(|g| g.keys.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        for group in &plan.activity {
            for keyed in &group.keys {
                assert_eq!(keyed.waiters.len(), 2);
            }
        }
    }

    #[test]
    fn empty_window_produces_no_groups() {
        let plan = partition(Vec::new(), 10);
        assert!(plan.cumulative.is_empty());
        assert!(plan.activity.is_empty());
        assert!(plan.direct.is_empty());
    }
}

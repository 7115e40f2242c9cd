mod common;

use common::{Call, FakeLedger};
use formula_resolver::{FilterSet, RawRequest, Resolver, ResolverConfig};
use formula_storage::Storage;
use std::time::Duration;

fn resolver(ledger: &FakeLedger) -> Resolver<FakeLedger> {
    let storage = Storage::open_in_memory().expect("open storage");
    Resolver::new(ledger.clone(), storage, ResolverConfig::default())
}

#[tokio::test(start_paused = true)]
async fn identical_requests_in_one_window_share_one_call() {
    let ledger = FakeLedger::sample();
    ledger.set_latency(Duration::from_millis(40));
    let resolver = resolver(&ledger);

    let mut handles = Vec::new();
    for label in ["Mar 2025", "2025-03", "March 2025", "3/2025", "2025-03-31"] {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver.resolve(&RawRequest::as_of("1000", label)).await
        }));
    }

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await.expect("task").expect("resolved"));
    }

    let expected = ledger.as_of("1000", "Mar 2025");
    assert!(values.iter().all(|v| *v == expected), "{values:?}");
    assert_eq!(ledger.data_calls().len(), 1, "{:?}", ledger.calls());

    let account_lookups = ledger
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::AccountType(_)))
        .count();
    assert_eq!(account_lookups, 1);

    let stats = resolver.stats();
    assert_eq!(stats.requests, 5);
    assert_eq!(stats.collaborator_calls, 1);
    assert_eq!(stats.coalesced, 4);
}

#[tokio::test(start_paused = true)]
async fn settled_values_are_served_from_memory() {
    let ledger = FakeLedger::sample();
    let resolver = resolver(&ledger);
    let request = RawRequest::as_of("2000", "Feb 2025");

    assert_eq!(resolver.cached_snapshot(&request), None);
    let value = resolver.resolve(&request).await.expect("resolved");
    assert_eq!(value, ledger.as_of("2000", "Feb 2025"));
    assert_eq!(resolver.cached_snapshot(&request), Some(value));

    ledger.reset_calls();
    assert_eq!(resolver.resolve(&request).await, Ok(value));
    assert!(ledger.calls().is_empty());
    assert_eq!(resolver.stats().cache_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn late_arrival_follows_the_flight_already_in_progress() {
    let ledger = FakeLedger::sample();
    ledger.set_latency(Duration::from_millis(200));
    let resolver = resolver(&ledger);

    // Classify first so both requests take the same path.
    resolver
        .resolve(&RawRequest::as_of("1000", "Jan 2025"))
        .await
        .expect("warm classification");
    ledger.reset_calls();

    let first = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.resolve(&RawRequest::as_of("1000", "Jun 2025")).await })
    };
    // Past the collection window: the first request's fetch is in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = resolver.resolve(&RawRequest::as_of("1000", "Jun 2025")).await;

    let first = first.await.expect("task");
    assert_eq!(first, second);
    assert_eq!(second, Ok(ledger.as_of("1000", "Jun 2025")));
    assert_eq!(ledger.data_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ledger_sees_filter_names_as_written() {
    let ledger = FakeLedger::sample();
    let resolver = resolver(&ledger);

    let written = FilterSet::new()
        .subsidiary("Celigo Inc. (Consolidated)")
        .department("Sales");
    let value = resolver
        .resolve(&RawRequest::as_of("1000", "Mar 2025").with_filters(written))
        .await
        .expect("resolved");

    let calls = ledger.balance_calls();
    assert_eq!(calls.len(), 1, "{:?}", ledger.calls());
    let filters = &calls[0].filters;
    assert_eq!(filters.subsidiary.as_deref(), Some("Celigo Inc."));
    assert!(filters.consolidated);
    assert_eq!(filters.department.as_deref(), Some("Sales"));
    assert_eq!(filters.location, None);

    // A different spelling of the same filters is the same cache key.
    ledger.reset_calls();
    let respelled = FilterSet::new()
        .subsidiary("  celigo inc.  (CONSOLIDATED) ")
        .department("SALES");
    assert_eq!(
        resolver
            .resolve(&RawRequest::as_of("1000", "Mar 2025").with_filters(respelled))
            .await,
        Ok(value)
    );
    assert!(ledger.calls().is_empty(), "{:?}", ledger.calls());
}

#[tokio::test(start_paused = true)]
async fn a_lone_request_waits_out_its_window() {
    let ledger = FakeLedger::sample();
    let resolver = resolver(&ledger);
    let window = resolver.config().collection_window();

    let started = tokio::time::Instant::now();
    resolver
        .resolve(&RawRequest::as_of("1000", "Jan 2025"))
        .await
        .expect("resolved");
    let waited = started.elapsed();

    // Dispatch happens when the window closes, not on arrival, so a column
    // that trickles in over the window still collapses into one grid.
    assert!(waited >= window, "waited {waited:?}");
    assert!(waited < window + Duration::from_millis(5), "waited {waited:?}");
}

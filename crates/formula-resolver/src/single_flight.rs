//! One outstanding operation per key.
//!
//! The first caller for a key becomes the leader and does the work; everyone
//! who joins before the leader settles receives a clone of the same result.

use log::debug;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;

/// The leader went away without settling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("in-flight operation was abandoned by its leader")]
pub struct Abandoned;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SingleFlightStats {
    pub leaders: u64,
    pub followers: u64,
    pub abandoned: u64,
}

struct Inner<K, V> {
    flights: HashMap<K, Vec<oneshot::Sender<V>>>,
    stats: SingleFlightStats,
}

pub struct SingleFlight<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for SingleFlight<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

pub enum Flight<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    Leader(FlightGuard<K, V>),
    Follower(FlightWaiter<V>),
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                flights: HashMap::new(),
                stats: SingleFlightStats::default(),
            })),
        }
    }

    /// Register intent for `key`. Must be called before any collaborator call
    /// is started for it.
    pub fn join(&self, key: K) -> Flight<K, V> {
        let mut inner = self.inner.lock().expect("single-flight mutex poisoned");
        if let Some(followers) = inner.flights.get_mut(&key) {
            let (tx, rx) = oneshot::channel();
            followers.push(tx);
            inner.stats.followers = inner.stats.followers.saturating_add(1);
            debug!("coalesced onto in-flight operation {key:?}");
            return Flight::Follower(FlightWaiter { rx });
        }

        inner.flights.insert(key.clone(), Vec::new());
        inner.stats.leaders = inner.stats.leaders.saturating_add(1);
        Flight::Leader(FlightGuard {
            key: Some(key),
            registry: self.clone(),
        })
    }

    /// Follow `key` only if an operation is already outstanding.
    pub fn follow(&self, key: &K) -> Option<FlightWaiter<V>> {
        let mut inner = self.inner.lock().expect("single-flight mutex poisoned");
        let followers = inner.flights.get_mut(key)?;
        let (tx, rx) = oneshot::channel();
        followers.push(tx);
        inner.stats.followers = inner.stats.followers.saturating_add(1);
        debug!("coalesced onto in-flight operation {key:?}");
        Some(FlightWaiter { rx })
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inner
            .lock()
            .expect("single-flight mutex poisoned")
            .flights
            .contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .expect("single-flight mutex poisoned")
            .flights
            .len()
    }

    pub fn stats(&self) -> SingleFlightStats {
        self.inner.lock().expect("single-flight mutex poisoned").stats
    }

    /// Run `fetch` as the leader for `key`, or share the result of the leader
    /// already running. A follower whose leader is abandoned runs `fetch`
    /// itself.
    pub async fn run<F, Fut>(&self, key: K, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        match self.join(key) {
            Flight::Leader(guard) => {
                let value = fetch().await;
                guard.settle(value.clone());
                value
            }
            Flight::Follower(waiter) => match waiter.wait().await {
                Ok(value) => value,
                Err(Abandoned) => fetch().await,
            },
        }
    }

    fn take(&self, key: &K) -> Vec<oneshot::Sender<V>> {
        self.inner
            .lock()
            .expect("single-flight mutex poisoned")
            .flights
            .remove(key)
            .unwrap_or_default()
    }
}

/// Leadership of one in-flight key. Dropping it unsettled abandons the flight.
pub struct FlightGuard<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    key: Option<K>,
    registry: SingleFlight<K, V>,
}

impl<K, V> FlightGuard<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Remove the entry and hand `value` to every follower in one pass.
    /// Returns the number of followers released.
    pub fn settle(mut self, value: V) -> usize {
        let Some(key) = self.key.take() else {
            return 0;
        };
        let followers = self.registry.take(&key);
        let released = followers.len();
        for follower in followers {
            let _ = follower.send(value.clone());
        }
        released
    }
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let followers = self.registry.take(&key);
            if let Ok(mut inner) = self.registry.inner.lock() {
                inner.stats.abandoned = inner.stats.abandoned.saturating_add(1);
            }
            debug!(
                "in-flight operation {key:?} abandoned with {} follower(s)",
                followers.len()
            );
        }
    }
}

pub struct FlightWaiter<V> {
    rx: oneshot::Receiver<V>,
}

impl<V> FlightWaiter<V> {
    pub async fn wait(self) -> Result<V, Abandoned> {
        self.rx.await.map_err(|_| Abandoned)
    }
}

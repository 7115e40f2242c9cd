#![allow(dead_code)]

use formula_resolver::classify::account_type;
use formula_resolver::{
    BalanceQuery, BatchQuery, BatchResponse, CanonicalFilters, Collaborator, CollaboratorError,
    Period,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn period(label: &str) -> Period {
    Period::parse(label).expect("valid period label")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Balance(BalanceQuery),
    Batch(BatchQuery),
    Preload(Period),
    AccountType(String),
}

impl Call {
    pub fn is_data(&self) -> bool {
        !matches!(self, Call::AccountType(_))
    }
}

#[derive(Default)]
struct LedgerState {
    account_types: HashMap<String, String>,
    opening: HashMap<String, f64>,
    activity: HashMap<(String, Period), f64>,
    calls: Vec<Call>,
    latency: Duration,
    preload_latency: Duration,
    rejected: HashMap<String, String>,
    batch_errors: HashMap<String, String>,
    omitted: HashSet<(String, Period)>,
    fail_batches: bool,
    fail_preload: bool,
}

/// Scripted ledger: per-month activity on top of an opening balance, with a
/// call log and switches for the failure modes the resolver must survive.
#[derive(Clone, Default)]
pub struct FakeLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The chart of accounts used across the tests.
    pub fn sample() -> Self {
        let ledger = Self::new();
        ledger.account("1000", account_type::BANK, 1_000.0);
        ledger.account("2000", account_type::ACCOUNTS_PAYABLE, -400.0);
        for entity in ["4000", "4100", "4200", "4300", "4400"] {
            ledger.account(entity, account_type::INCOME, 0.0);
        }
        ledger.account("9000", account_type::STATISTICAL, 0.0);

        let months = ["Jan 2025", "Feb 2025", "Mar 2025", "Apr 2025", "May 2025", "Jun 2025", "Jul 2025"];
        for (i, month) in months.iter().enumerate() {
            let step = (i + 1) as f64;
            ledger.set_activity("1000", month, 100.0 * step);
            ledger.set_activity("2000", month, -10.0 * step);
            for (j, entity) in ["4000", "4100", "4200", "4300", "4400"].iter().enumerate() {
                ledger.set_activity(entity, month, 1_000.0 * (j + 1) as f64 + step);
            }
        }
        ledger.set_activity("1000", "Dec 2024", 50.0);
        ledger
    }

    pub fn account(&self, entity: &str, ty: &str, opening: f64) {
        let mut state = self.state.lock().unwrap();
        state.account_types.insert(entity.to_string(), ty.to_string());
        state.opening.insert(entity.to_string(), opening);
    }

    pub fn set_activity(&self, entity: &str, month: &str, value: f64) {
        self.state
            .lock()
            .unwrap()
            .activity
            .insert((entity.to_string(), period(month)), value);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    pub fn set_preload_latency(&self, latency: Duration) {
        self.state.lock().unwrap().preload_latency = latency;
    }

    pub fn reject(&self, entity: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(entity.to_string(), message.to_string());
    }

    pub fn batch_error(&self, entity: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .batch_errors
            .insert(entity.to_string(), message.to_string());
    }

    pub fn omit_from_batch(&self, entity: &str, month: &str) {
        self.state
            .lock()
            .unwrap()
            .omitted
            .insert((entity.to_string(), period(month)));
    }

    pub fn fail_batches(&self, fail: bool) {
        self.state.lock().unwrap().fail_batches = fail;
    }

    pub fn fail_preload(&self, fail: bool) {
        self.state.lock().unwrap().fail_preload = fail;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn data_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_data).collect()
    }

    pub fn balance_calls(&self) -> Vec<BalanceQuery> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Balance(query) => Some(query),
                _ => None,
            })
            .collect()
    }

    pub fn batch_calls(&self) -> Vec<BatchQuery> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Batch(query) => Some(query),
                _ => None,
            })
            .collect()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Expected answer for an as-of request.
    pub fn as_of(&self, entity: &str, month: &str) -> f64 {
        self.state.lock().unwrap().as_of(entity, period(month))
    }

    pub fn activity(&self, entity: &str, month: &str) -> f64 {
        self.state.lock().unwrap().activity_for(entity, period(month))
    }

    fn record(&self, call: Call) -> Duration {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        state.latency
    }
}

impl LedgerState {
    fn is_cumulative(&self, entity: &str) -> bool {
        self.account_types
            .get(entity)
            .is_some_and(|ty| account_type::CUMULATIVE.contains(&ty.as_str()))
    }

    fn activity_for(&self, entity: &str, period: Period) -> f64 {
        self.activity
            .get(&(entity.to_string(), period))
            .copied()
            .unwrap_or(0.0)
    }

    fn running_balance(&self, entity: &str, period: Period) -> f64 {
        let opening = self.opening.get(entity).copied().unwrap_or(0.0);
        self.activity
            .iter()
            .filter(|((e, p), _)| e == entity && *p <= period)
            .map(|(_, v)| v)
            .sum::<f64>()
            + opening
    }

    fn as_of(&self, entity: &str, period: Period) -> f64 {
        if self.is_cumulative(entity) {
            self.running_balance(entity, period)
        } else {
            self.activity_for(entity, period)
        }
    }
}

impl Collaborator for FakeLedger {
    async fn fetch_balance(&self, query: BalanceQuery) -> Result<f64, CollaboratorError> {
        let latency = self.record(Call::Balance(query.clone()));
        tokio::time::sleep(latency).await;

        let state = self.state.lock().unwrap();
        if let Some(message) = state.rejected.get(&query.entity) {
            return Err(CollaboratorError::Rejected(message.clone()));
        }
        Ok(match query.from {
            None => state.as_of(&query.entity, query.to),
            Some(from) => Period::span(from, query.to)
                .map(|p| state.activity_for(&query.entity, p))
                .sum(),
        })
    }

    async fn fetch_batch(&self, query: BatchQuery) -> Result<BatchResponse, CollaboratorError> {
        let latency = self.record(Call::Batch(query.clone()));
        tokio::time::sleep(latency).await;

        let state = self.state.lock().unwrap();
        if state.fail_batches {
            return Err(CollaboratorError::Unavailable("batch endpoint down".to_string()));
        }
        let mut response = BatchResponse::default();
        for entity in &query.entities {
            if let Some(message) = state
                .batch_errors
                .get(entity)
                .or_else(|| state.rejected.get(entity))
            {
                response.errors.insert(entity.clone(), message.clone());
                continue;
            }
            let months: BTreeMap<Period, f64> = query
                .periods
                .iter()
                .filter(|p| !state.omitted.contains(&(entity.clone(), **p)))
                .map(|p| (*p, state.activity_for(entity, *p)))
                .collect();
            response.values.insert(entity.clone(), months);
        }
        Ok(response)
    }

    async fn fetch_preload(
        &self,
        _filters: CanonicalFilters,
        period: Period,
    ) -> Result<HashMap<String, f64>, CollaboratorError> {
        let latency = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Preload(period));
            state.preload_latency
        };
        tokio::time::sleep(latency).await;

        let state = self.state.lock().unwrap();
        if state.fail_preload {
            return Err(CollaboratorError::Unavailable("preload timed out".to_string()));
        }
        Ok(state
            .account_types
            .keys()
            .filter(|entity| state.is_cumulative(entity))
            .map(|entity| (entity.clone(), state.as_of(entity, period)))
            .collect())
    }

    async fn account_type(&self, entity: String) -> Result<String, CollaboratorError> {
        let latency = self.record(Call::AccountType(entity.clone()));
        tokio::time::sleep(latency).await;

        self.state
            .lock()
            .unwrap()
            .account_types
            .get(&entity)
            .cloned()
            .ok_or_else(|| CollaboratorError::Rejected(format!("no account {entity}")))
    }
}

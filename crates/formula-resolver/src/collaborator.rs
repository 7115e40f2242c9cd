//! The ledger service the resolver calls out to.
//!
//! How values are computed is entirely the collaborator's business; the
//! resolver only decides which calls to make and how to share their results.

use crate::filters::CanonicalFilters;
use crate::period::Period;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    #[error("ledger service rejected the request: {0}")]
    Rejected(String),
    #[error("ledger service unavailable: {0}")]
    Unavailable(String),
    #[error("ledger service returned a non-finite value for {0}")]
    NonFinite(String),
}

/// One entity, one range.
///
/// `from = None` asks for the value as of `to`: the cumulative balance for
/// balance-sheet entities, the period's activity for income-statement ones.
/// `from = Some(start)` asks for activity over `start..=to`.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceQuery {
    pub entity: String,
    pub from: Option<Period>,
    pub to: Period,
    pub filters: CanonicalFilters,
}

/// Several entities over several periods; the answer for each
/// (entity, period) is that period's activity.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchQuery {
    pub entities: Vec<String>,
    pub periods: Vec<Period>,
    pub filters: CanonicalFilters,
}

/// Batched answer. An entity listed in `errors` failed on its own without
/// failing the call; an (entity, period) missing from `values` is unknown,
/// not zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResponse {
    pub values: HashMap<String, BTreeMap<Period, f64>>,
    pub errors: HashMap<String, String>,
}

impl BatchResponse {
    pub fn value(&self, entity: &str, period: Period) -> Option<f64> {
        self.values.get(entity)?.get(&period).copied()
    }
}

/// Backend operations consumed by the resolver.
pub trait Collaborator: Send + Sync + 'static {
    fn fetch_balance(
        &self,
        query: BalanceQuery,
    ) -> impl Future<Output = Result<f64, CollaboratorError>> + Send;

    fn fetch_batch(
        &self,
        query: BatchQuery,
    ) -> impl Future<Output = Result<BatchResponse, CollaboratorError>> + Send;

    /// Bulk preload: the as-of value of every relevant entity for one period.
    fn fetch_preload(
        &self,
        filters: CanonicalFilters,
        period: Period,
    ) -> impl Future<Output = Result<HashMap<String, f64>, CollaboratorError>> + Send;

    /// Account type of `entity` (e.g. `Bank`, `Income`), used for routing.
    fn account_type(
        &self,
        entity: String,
    ) -> impl Future<Output = Result<String, CollaboratorError>> + Send;
}

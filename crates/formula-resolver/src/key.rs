//! Request normalization: raw formula arguments in, canonical request out.
//!
//! Everything downstream of [`RawRequest::normalize`] works on
//! [`BalanceRequest`] and never re-interprets optional raw fields.

use crate::error::ResolveError;
use crate::filters::{escape_component, CanonicalFilters, FilterSet, FilterSetHash};
use crate::period::Period;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A period argument as the spreadsheet handed it over.
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodInput {
    /// A date serial (the cell held a date).
    Serial(f64),
    /// A label such as `Jan 2025` or `2025-01`.
    Text(String),
}

impl PeriodInput {
    pub fn resolve(&self) -> Result<Period, ResolveError> {
        let parsed = match self {
            PeriodInput::Serial(serial) => Period::from_serial(*serial),
            PeriodInput::Text(text) => Period::parse(text),
        };
        parsed.map_err(|err| ResolveError::InvalidParameters(err.to_string()))
    }
}

impl From<f64> for PeriodInput {
    fn from(value: f64) -> Self {
        PeriodInput::Serial(value)
    }
}

impl From<&str> for PeriodInput {
    fn from(value: &str) -> Self {
        PeriodInput::Text(value.to_string())
    }
}

impl From<String> for PeriodInput {
    fn from(value: String) -> Self {
        PeriodInput::Text(value)
    }
}

impl From<Period> for PeriodInput {
    fn from(value: Period) -> Self {
        PeriodInput::Text(value.key())
    }
}

/// Formula arguments before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRequest {
    pub entity: String,
    pub from_period: Option<PeriodInput>,
    pub to_period: Option<PeriodInput>,
    pub filters: FilterSet,
}

impl RawRequest {
    /// Value of `entity` as of `period` (cumulative for balance-sheet
    /// entities, the period's activity for income-statement entities).
    pub fn as_of(entity: impl Into<String>, period: impl Into<PeriodInput>) -> Self {
        Self {
            entity: entity.into(),
            from_period: None,
            to_period: Some(period.into()),
            filters: FilterSet::default(),
        }
    }

    /// Activity of `entity` over `from..=to`.
    pub fn range(
        entity: impl Into<String>,
        from: impl Into<PeriodInput>,
        to: impl Into<PeriodInput>,
    ) -> Self {
        Self {
            entity: entity.into(),
            from_period: Some(from.into()),
            to_period: Some(to.into()),
            filters: FilterSet::default(),
        }
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    pub fn normalize(&self) -> Result<BalanceRequest, ResolveError> {
        let entity = normalize_entity(&self.entity)?;

        let shape = match (&self.from_period, &self.to_period) {
            (None, None) => {
                return Err(ResolveError::InvalidParameters(
                    "a period is required".to_string(),
                ))
            }
            (Some(_), None) => {
                return Err(ResolveError::InvalidParameters(
                    "a range start was given without a range end".to_string(),
                ))
            }
            (None, Some(to)) => RequestShape::AsOf(to.resolve()?),
            (Some(from), Some(to)) => {
                let from = from.resolve()?;
                let to = to.resolve()?;
                if from > to {
                    return Err(ResolveError::InvalidParameters(format!(
                        "range start {from} is after range end {to}"
                    )));
                }
                RequestShape::Range { from, to }
            }
        };

        let filters = self
            .filters
            .canonicalize()
            .map_err(ResolveError::InvalidParameters)?;
        let filter_hash = filters.hash();
        let key = CanonicalKey::new(&filter_hash, &entity, shape);

        Ok(BalanceRequest {
            entity,
            shape,
            filters,
            filter_hash,
            key,
            requested_at: Utc::now(),
        })
    }
}

/// The two valid request shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestShape {
    AsOf(Period),
    Range { from: Period, to: Period },
}

impl RequestShape {
    fn key_component(self) -> String {
        match self {
            RequestShape::AsOf(period) => format!("asof={}", period.key()),
            RequestShape::Range { from, to } => format!("range={}..{}", from.key(), to.key()),
        }
    }
}

/// Normalized identity of a request; equal keys are interchangeable for
/// caching and deduplication.
///
/// Layout: `<filterSetHash>|<entity>|<shape>`. The filter hash leads so a
/// filter-set invalidation is a prefix delete.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub(crate) fn new(filter_hash: &FilterSetHash, entity: &str, shape: RequestShape) -> Self {
        CanonicalKey(format!(
            "{}|{}|{}",
            filter_hash,
            escape_component(entity),
            shape.key_component()
        ))
    }

    pub fn as_of(filter_hash: &FilterSetHash, entity: &str, period: Period) -> Self {
        Self::new(filter_hash, entity, RequestShape::AsOf(period))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn filter_prefix(filter_hash: &FilterSetHash) -> String {
        format!("{filter_hash}|")
    }

    /// The filter-set hash this key was built from.
    pub fn filter_component(&self) -> &str {
        self.0.split('|').next().unwrap_or_default()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request after normalization. Immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRequest {
    pub entity: String,
    pub shape: RequestShape,
    pub filters: CanonicalFilters,
    pub filter_hash: FilterSetHash,
    pub key: CanonicalKey,
    pub requested_at: DateTime<Utc>,
}

impl BalanceRequest {
    pub fn as_of_period(&self) -> Option<Period> {
        match self.shape {
            RequestShape::AsOf(period) => Some(period),
            RequestShape::Range { .. } => None,
        }
    }
}

/// Trim and collapse whitespace. Spreadsheets hand numeric account ids over as
/// floats, so a whole-number `4000.0` is keyed as `4000`.
pub(crate) fn normalize_entity(raw: &str) -> Result<String, ResolveError> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return Err(ResolveError::InvalidParameters(
            "entity id is empty".to_string(),
        ));
    }
    if let Some(whole) = collapsed.strip_suffix(".0") {
        if !whole.is_empty() && whole.chars().all(|c| c.is_ascii_digit()) {
            return Ok(whole.to_string());
        }
    }
    Ok(collapsed)
}

//! Resolution of spreadsheet balance formulas against a remote ledger service.
//!
//! Formulas ask for "the value of entity E for period P under filter set F".
//! The resolver turns those requests into as few ledger calls as it can:
//!
//! - equivalent requests normalize to one [`CanonicalKey`] and are answered
//!   from the [`ValueCache`] when possible;
//! - concurrent requests for one key share a single call;
//! - requests arriving within one collection window are batched, and a column
//!   of cumulative balances for one entity collapses into an anchor value plus
//!   one activity breakdown;
//! - bulk preloads run by another execution context are tracked in a persisted
//!   [`Manifest`] and waited on for a bounded time before falling through to a
//!   direct fetch.
//!
//! Every number handed back was confirmed by the ledger service. Failures are
//! explicit ([`ResolveError`], rendered as `#VALUE!` / `#ERROR!`), never zero.

pub mod cache;
pub mod channel;
pub mod classify;
pub mod collaborator;
pub mod config;
mod engine;
pub mod error;
pub mod filters;
pub mod grid;
pub mod key;
pub mod manifest;
pub mod period;
pub mod preload;
mod resolver;
pub mod retry;
mod scheduler;
pub mod single_flight;

pub use cache::{CacheEntry, CacheStats, Provenance, ValueCache};
pub use channel::{StatusChannel, StoreChannel};
pub use classify::{class_for_account_type, AccountClass, RoutingClassifier};
pub use collaborator::{BalanceQuery, BatchQuery, BatchResponse, Collaborator, CollaboratorError};
pub use config::{ConfigError, ResolverConfig};
pub use engine::ResolverStats;
pub use error::{CellOutcome, ErrorSentinel, InvalidationError, ResolveError};
pub use filters::{CanonicalFilters, FilterSet, FilterSetHash};
pub use grid::{GridLayout, GridPatternDetector, GridPlan};
pub use key::{BalanceRequest, CanonicalKey, PeriodInput, RawRequest, RequestShape};
pub use manifest::{Claim, Manifest, ManifestEntry, ManifestError, ManifestStatus, WaitOutcome};
pub use period::{Period, PeriodError};
pub use preload::{PreloadError, PreloadOutcome};
pub use resolver::Resolver;
pub use retry::{FallThrough, RetryController, RetryPolicy, WaitResolution};
pub use single_flight::{Abandoned, SingleFlight};

//! SQLite-backed key/value persistence for the formula resolver.
//!
//! The store is the only state shared between independent execution contexts
//! (for example a formula-evaluation context and a background preload
//! context). It exposes:
//! - SQLite schema creation/migration
//! - String key/value reads and writes
//! - Versioned reads and compare-and-swap writes for optimistic concurrency
//!   between contexts
//! - Prefix deletes for namespace-level invalidation

mod schema;
pub mod storage;

pub use storage::{Storage, StorageError, StoredValue};

use crate::collaborator::Collaborator;
use crate::config::ResolverConfig;
use crate::engine::{Engine, ResolverStats};
use crate::error::{CellOutcome, InvalidationError, Result};
use crate::filters::FilterSet;
use crate::key::{PeriodInput, RawRequest};
use crate::manifest::Manifest;
use crate::preload::{PreloadError, PreloadOutcome};
use formula_storage::Storage;
use log::debug;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Entry point for one execution context.
///
/// A `Resolver` owns its caches, in-flight registries and collection window;
/// clones share them. Separate resolvers opened on the same [`Storage`] (or
/// the same database file) coordinate only through persisted state: confirmed
/// values and preload manifest entries.
///
/// ```no_run
/// # async fn demo<C: formula_resolver::Collaborator>(ledger: C) -> Result<(), Box<dyn std::error::Error>> {
/// use formula_resolver::{RawRequest, Resolver, ResolverConfig};
/// use formula_storage::Storage;
///
/// let resolver = Resolver::new(ledger, Storage::open_path("resolver.db")?, ResolverConfig::default());
/// let cash = resolver.resolve(&RawRequest::as_of("1000", "Jan 2025")).await?;
/// println!("cash at end of Jan 2025: {cash}");
/// # Ok(())
/// # }
/// ```
pub struct Resolver<C: Collaborator> {
    engine: Arc<Engine<C>>,
}

impl<C: Collaborator> Clone for Resolver<C> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<C: Collaborator> Resolver<C> {
    pub fn new(collaborator: C, storage: Storage, config: ResolverConfig) -> Self {
        Self::with_context(collaborator, storage, config, Uuid::new_v4())
    }

    /// Like [`Resolver::new`] with an explicit execution-context id, recorded
    /// as the owner of the manifest entries this resolver writes.
    pub fn with_context(
        collaborator: C,
        storage: Storage,
        config: ResolverConfig,
        context: Uuid,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(collaborator, storage, config, context)),
        }
    }

    pub fn context(&self) -> Uuid {
        self.engine.manifest.context()
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.engine.config
    }

    pub fn collaborator(&self) -> &C {
        &self.engine.collaborator
    }

    pub fn manifest(&self) -> &Manifest {
        &self.engine.manifest
    }

    /// Resolve one formula invocation to a confirmed number.
    pub async fn resolve(&self, raw: &RawRequest) -> Result<f64> {
        let request = raw.normalize()?;
        self.engine.resolve(request).await
    }

    /// [`Resolver::resolve`], rendered for a cell.
    pub async fn resolve_cell(&self, raw: &RawRequest) -> CellOutcome {
        CellOutcome::from(self.resolve(raw).await)
    }

    /// The value already in memory for `raw`, if any. Never waits, never
    /// calls out, never reads storage.
    pub fn cached_snapshot(&self, raw: &RawRequest) -> Option<f64> {
        let request = raw.normalize().ok()?;
        self.engine.cache.snapshot(&request.key)
    }

    /// Run the bulk preload for (filters, period) in this task.
    pub async fn preload(
        &self,
        filters: &FilterSet,
        period: impl Into<PeriodInput>,
    ) -> std::result::Result<PreloadOutcome, PreloadError> {
        let filters = filters
            .canonicalize()
            .map_err(PreloadError::InvalidParameters)?;
        let period = period
            .into()
            .resolve()
            .map_err(|err| PreloadError::InvalidParameters(err.to_string()))?;
        Ok(self.engine.preload(filters, period).await)
    }

    /// Run the bulk preload in the background so resolution never waits on it.
    pub fn spawn_preload(
        &self,
        filters: &FilterSet,
        period: impl Into<PeriodInput>,
    ) -> std::result::Result<JoinHandle<PreloadOutcome>, PreloadError> {
        let filters = filters
            .canonicalize()
            .map_err(PreloadError::InvalidParameters)?;
        let period = period
            .into()
            .resolve()
            .map_err(|err| PreloadError::InvalidParameters(err.to_string()))?;
        let engine = Arc::clone(&self.engine);
        Ok(tokio::spawn(async move { engine.preload(filters, period).await }))
    }

    /// Drop every cached value and manifest entry for one filter set, in this
    /// context and in the persisted store.
    pub fn invalidate_filter_set(
        &self,
        filters: &FilterSet,
    ) -> std::result::Result<usize, InvalidationError> {
        let hash = filters
            .canonicalize()
            .map_err(InvalidationError::InvalidParameters)?
            .hash();
        let values = self.engine.cache.invalidate_filter_set(&hash)?;
        let entries = self.engine.manifest.invalidate_filter_set(&hash)?;
        debug!("invalidated {values} value(s) and {entries} manifest entr(ies) for {hash}");
        Ok(values)
    }

    pub fn clear(&self) -> std::result::Result<(), InvalidationError> {
        self.engine.cache.clear()?;
        self.engine.manifest.clear()?;
        self.engine.classifier.clear()?;
        Ok(())
    }

    pub fn stats(&self) -> ResolverStats {
        self.engine.stats()
    }
}

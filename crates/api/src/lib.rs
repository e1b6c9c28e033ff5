//! Tally public API façade (in-process).
//!
//! This crate defines the traits and types frontends (CLI, sync clients) depend on.
//! `InProcApi` serves from the SQLite catalog; `MockApi` serves from memory for tests.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tally_core::config::Limits;
use tally_core::{Catalog, CoreError, Dataset, Facets, ListPage, ListQuery, Row};
use tally_persist::SqliteCatalog;
use tally_search::MemEngine;
use tracing::{info, warn};

pub mod limit;

pub use limit::{limit_key, RateLimiter};

/// The signed-in user a favorites call acts for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self { Self { user_id: user_id.into() } }
}

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum TallyError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_authenticated")]
    NotAuthenticated,
    #[error("rate_limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl TallyError {
    /// HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self {
            TallyError::Validation(_) => 400,
            TallyError::NotAuthenticated => 401,
            TallyError::RateLimited { .. } => 429,
            TallyError::Timeout(_) => 408,
            TallyError::NotFound(_) => 404,
            TallyError::Internal(_) => 500,
        }
    }
}

impl From<CoreError> for TallyError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnknownCatalog(_) => TallyError::NotFound(e.to_string()),
            CoreError::Config(_) => TallyError::Internal(e.to_string()),
            _ => TallyError::Validation(e.to_string()),
        }
    }
}

pub type TallyResult<T> = Result<T, TallyError>;

/// Trim, drop duplicates (first occurrence wins) and enforce `1..=max` keys.
pub fn normalize_keys(keys: Vec<String>, max: usize) -> TallyResult<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(keys.len());
    for k in keys {
        let k = k.trim().to_string();
        if k.is_empty() {
            return Err(TallyError::Validation("empty favorite key".into()));
        }
        if !out.contains(&k) {
            out.push(k);
        }
    }
    if out.is_empty() {
        return Err(TallyError::Validation("no favorite keys given".into()));
    }
    if out.len() > max {
        return Err(TallyError::Validation(format!("at most {} keys per request, got {}", max, out.len())));
    }
    Ok(out)
}

fn user_of(session: Option<&Session>) -> TallyResult<&str> {
    session.map(|s| s.user_id.as_str()).filter(|u| !u.is_empty()).ok_or(TallyError::NotAuthenticated)
}

/// Catalog list and favorites surface.
#[async_trait::async_trait]
pub trait CatalogApi: Send + Sync {
    /// One page of `catalog` plus facets and counts.
    async fn list(&self, catalog: Catalog, query: ListQuery) -> TallyResult<ListPage>;

    /// Facets over the full catalog.
    async fn facets(&self, catalog: Catalog) -> TallyResult<Facets>;

    /// Replace the rows of `catalog`.
    async fn load(&self, catalog: Catalog, rows: Vec<Row>) -> TallyResult<usize>;

    /// Favorited stable keys of `catalog`. Each catalog keeps its own set.
    async fn favorites(&self, session: Option<&Session>, catalog: Catalog) -> TallyResult<Vec<String>>;

    /// Add keys to the `catalog` set; returns the updated set.
    async fn add_favorites(&self, session: Option<&Session>, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<String>>;

    /// Remove keys from the `catalog` set; returns the updated set.
    async fn remove_favorites(&self, session: Option<&Session>, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<String>>;

    /// Favorited rows of `catalog` through the full filter/sort/paginate pipeline.
    async fn favorite_rows(&self, session: Option<&Session>, catalog: Catalog, query: ListQuery) -> TallyResult<ListPage>;

    async fn resolve_rows(&self, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<Row>>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation over the SQLite catalog.
pub struct InProcApi {
    catalog: Arc<SqliteCatalog>,
    limiter: RateLimiter,
    limits: Limits,
}

enum Write {
    Add,
    Remove,
}

impl InProcApi {
    /// Fails when the configured write window is out of range.
    pub fn new(catalog: SqliteCatalog) -> TallyResult<Self> {
        let limits = *catalog.limits();
        let limiter = RateLimiter::new(limits.write_limit, limits.write_window_secs)?;
        Ok(Self { catalog: Arc::new(catalog), limiter, limits })
    }

    pub fn open_default() -> TallyResult<Self> {
        SqliteCatalog::open_default().map_err(Self::map_err).and_then(Self::new)
    }

    fn map_err(e: anyhow::Error) -> TallyError {
        match e.downcast::<CoreError>() {
            Ok(core) => core.into(),
            Err(other) => TallyError::Internal(format!("{:#}", other)),
        }
    }

    /// Run blocking catalog work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> TallyResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteCatalog) -> anyhow::Result<T> + Send + 'static,
    {
        let catalog = self.catalog.clone();
        tokio::task::spawn_blocking(move || f(&catalog))
            .await
            .map_err(|e| TallyError::Internal(e.to_string()))?
            .map_err(Self::map_err)
    }

    /// A `Timeout` does not cancel the write: the blocking task keeps running and may still
    /// commit. Callers that roll back on `Timeout` should re-read the set afterwards.
    async fn write(&self, session: Option<&Session>, catalog: Catalog, op: Write, keys: Vec<String>) -> TallyResult<Vec<String>> {
        let t0 = Instant::now();
        let user = user_of(session)?.to_string();
        let keys = normalize_keys(keys, self.limits.favorites_batch_max)?;
        if let Err(retry_after_secs) = self.limiter.check(&limit_key(&user, catalog)) {
            metrics::counter!("favorites_rate_limited_total", 1u64, "catalog" => catalog.as_str());
            warn!(user = %user, catalog = %catalog, retry_after_secs, "api: favorites write rate limited");
            return Err(TallyError::RateLimited { retry_after_secs });
        }
        let n = keys.len();
        let work = self.blocking(move |c| match op {
            Write::Add => c.add_favorites(&user, catalog, &keys),
            Write::Remove => c.remove_favorites(&user, catalog, &keys),
        });
        let out = tokio::time::timeout(Duration::from_millis(self.limits.mutation_timeout_ms), work)
            .await
            .map_err(|_| TallyError::Timeout(format!("favorites write exceeded {}ms", self.limits.mutation_timeout_ms)))??;
        info!(catalog = %catalog, keys = n, size = out.len(), took_ms = %t0.elapsed().as_millis(), "api: favorites write ok");
        Ok(out)
    }
}

#[async_trait::async_trait]
impl CatalogApi for InProcApi {
    async fn list(&self, catalog: Catalog, query: ListQuery) -> TallyResult<ListPage> {
        let t0 = Instant::now();
        let page = self.blocking(move |c| c.list(catalog, &query)).await?;
        info!(catalog = %catalog, rows = page.data.len(), filtered = page.meta.filter_row_count, took_ms = %t0.elapsed().as_millis(), "api: list ok");
        Ok(page)
    }

    async fn facets(&self, catalog: Catalog) -> TallyResult<Facets> {
        self.blocking(move |c| c.facets(catalog)).await
    }

    async fn load(&self, catalog: Catalog, rows: Vec<Row>) -> TallyResult<usize> {
        let t0 = Instant::now();
        let n = self.blocking(move |c| c.load(catalog, &rows)).await?;
        info!(catalog = %catalog, rows = n, took_ms = %t0.elapsed().as_millis(), "api: load ok");
        Ok(n)
    }

    async fn favorites(&self, session: Option<&Session>, catalog: Catalog) -> TallyResult<Vec<String>> {
        let user = user_of(session)?.to_string();
        self.blocking(move |c| c.list_favorites(&user, catalog)).await
    }

    async fn add_favorites(&self, session: Option<&Session>, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<String>> {
        self.write(session, catalog, Write::Add, keys).await
    }

    async fn remove_favorites(&self, session: Option<&Session>, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<String>> {
        self.write(session, catalog, Write::Remove, keys).await
    }

    async fn favorite_rows(&self, session: Option<&Session>, catalog: Catalog, query: ListQuery) -> TallyResult<ListPage> {
        let t0 = Instant::now();
        let user = user_of(session)?.to_string();
        let page = self.blocking(move |c| c.favorite_rows(&user, catalog, &query)).await?;
        info!(catalog = %catalog, rows = page.data.len(), took_ms = %t0.elapsed().as_millis(), "api: favorite_rows ok");
        Ok(page)
    }

    async fn resolve_rows(&self, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.blocking(move |c| c.resolve_rows(catalog, &keys)).await
    }
}

// ----------------- Mock implementation -----------------

/// In-memory implementation for tests. Lists run through `MemEngine`; favorites live in a map
/// keyed by user and catalog.
pub struct MockApi {
    engines: Mutex<FxHashMap<Catalog, Arc<MemEngine>>>,
    favorites: Mutex<FxHashMap<(String, Catalog), Vec<String>>>,
    /// Returned (once) by the next favorites write instead of applying it.
    pub fail_next: Mutex<Option<TallyError>>,
    /// Artificial latency for every call.
    pub delay: Option<Duration>,
    limits: Limits,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            engines: Mutex::new(FxHashMap::default()),
            favorites: Mutex::new(FxHashMap::default()),
            fail_next: Mutex::new(None),
            delay: None,
            limits: Limits::default(),
        }
    }
}

impl MockApi {
    pub fn new() -> Self { Self::default() }

    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    pub fn with_rows(self, catalog: Catalog, rows: Vec<Row>) -> Self {
        self.put(catalog, rows);
        self
    }

    pub fn fail_next_write(&self, e: TallyError) {
        *self.fail_next.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
    }

    fn put(&self, catalog: Catalog, rows: Vec<Row>) -> usize {
        let n = rows.len();
        let engine = MemEngine::build(catalog.schema(), Arc::new(Dataset { epoch: 1, rows }));
        self.engines.lock().unwrap_or_else(|p| p.into_inner()).insert(catalog, Arc::new(engine));
        n
    }

    fn engine(&self, catalog: Catalog) -> TallyResult<Arc<MemEngine>> {
        self.engines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&catalog)
            .cloned()
            .ok_or_else(|| TallyError::NotFound(format!("catalog {} not loaded", catalog)))
    }

    async fn pause(&self) {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
    }

    async fn write(&self, session: Option<&Session>, catalog: Catalog, add: bool, keys: Vec<String>) -> TallyResult<Vec<String>> {
        self.pause().await;
        let user = user_of(session)?;
        let keys = normalize_keys(keys, self.limits.favorites_batch_max)?;
        if let Some(e) = self.fail_next.lock().unwrap_or_else(|p| p.into_inner()).take() {
            return Err(e);
        }
        let mut favs = self.favorites.lock().unwrap_or_else(|p| p.into_inner());
        let set = favs.entry((user.to_string(), catalog)).or_default();
        if add {
            for k in keys {
                if !set.contains(&k) {
                    set.push(k);
                }
            }
        } else {
            set.retain(|k| !keys.contains(k));
        }
        Ok(set.clone())
    }
}

#[async_trait::async_trait]
impl CatalogApi for MockApi {
    async fn list(&self, catalog: Catalog, query: ListQuery) -> TallyResult<ListPage> {
        self.pause().await;
        Ok(self.engine(catalog)?.list(&query)?)
    }

    async fn facets(&self, catalog: Catalog) -> TallyResult<Facets> {
        Ok(self.engine(catalog)?.facets().clone())
    }

    async fn load(&self, catalog: Catalog, rows: Vec<Row>) -> TallyResult<usize> {
        Ok(self.put(catalog, rows))
    }

    async fn favorites(&self, session: Option<&Session>, catalog: Catalog) -> TallyResult<Vec<String>> {
        let key = (user_of(session)?.to_string(), catalog);
        Ok(self.favorites.lock().unwrap_or_else(|p| p.into_inner()).get(&key).cloned().unwrap_or_default())
    }

    async fn add_favorites(&self, session: Option<&Session>, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<String>> {
        self.write(session, catalog, true, keys).await
    }

    async fn remove_favorites(&self, session: Option<&Session>, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<String>> {
        self.write(session, catalog, false, keys).await
    }

    async fn favorite_rows(&self, session: Option<&Session>, catalog: Catalog, query: ListQuery) -> TallyResult<ListPage> {
        let keys = self.favorites(session, catalog).await?;
        let rows: Vec<Row> = self.engine(catalog)?.rows_by_keys(&keys).into_iter().cloned().collect();
        let scoped = MemEngine::build(catalog.schema(), Arc::new(Dataset { epoch: 1, rows }));
        Ok(scoped.list(&query)?)
    }

    async fn resolve_rows(&self, catalog: Catalog, keys: Vec<String>) -> TallyResult<Vec<Row>> {
        let mut rows: Vec<Row> = self.engine(catalog)?.rows_by_keys(&keys).into_iter().cloned().collect();
        rows.sort_by(|a, b| a.stable_key.cmp(&b.stable_key).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }
}

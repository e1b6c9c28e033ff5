//! Optimistic favorites mutations.
//!
//! Each action snapshots the cached set, applies the change locally, sends it with a
//! timeout, then either broadcasts the server's set or rolls back to the snapshot.
//! The server owns the set; the cache is allowed to be stale and is never locked
//! across a request. A coordinator serves one catalog's favorites.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_api::{CatalogApi, Session, TallyError};
use tally_core::config::Limits;
use tally_core::{Catalog, Row};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{FavoriteSet, FavoritesCache};
use crate::sync::{favorites_channel, BroadcastMessage, Subscription, SyncChannel};

/// Why a favorites write did not land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationFailure {
    RateLimited { retry_after_secs: u64 },
    Timeout,
    Generic(String),
}

impl From<&TallyError> for MutationFailure {
    fn from(e: &TallyError) -> Self {
        match e {
            TallyError::RateLimited { retry_after_secs } => MutationFailure::RateLimited { retry_after_secs: *retry_after_secs },
            TallyError::Timeout(_) => MutationFailure::Timeout,
            other => MutationFailure::Generic(other.to_string()),
        }
    }
}

impl From<TallyError> for MutationFailure {
    fn from(e: TallyError) -> Self { MutationFailure::from(&e) }
}

/// User-facing outcome of a failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notice {
    SignInRequired,
    RateLimited { retry_after_secs: u64 },
    Timeout,
    Generic { message: String },
}

impl From<MutationFailure> for Notice {
    fn from(f: MutationFailure) -> Self {
        match f {
            MutationFailure::RateLimited { retry_after_secs } => Notice::RateLimited { retry_after_secs },
            MutationFailure::Timeout => Notice::Timeout,
            MutationFailure::Generic(message) => Notice::Generic { message },
        }
    }
}

/// Server side of the favorites protocol as the coordinator sees it.
#[async_trait::async_trait]
pub trait FavoritesRemote: Send + Sync {
    async fn list(&self, session: &Session, catalog: Catalog) -> Result<Vec<String>, MutationFailure>;
    async fn add(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure>;
    async fn remove(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure>;
    async fn resolve(&self, catalog: Catalog, keys: Vec<String>) -> Result<Vec<Row>, MutationFailure>;
}

/// Adapts any `CatalogApi` into a `FavoritesRemote`.
pub struct ApiRemote<A: CatalogApi> {
    api: Arc<A>,
}

impl<A: CatalogApi> ApiRemote<A> {
    pub fn new(api: Arc<A>) -> Self { Self { api } }
}

#[async_trait::async_trait]
impl<A: CatalogApi + 'static> FavoritesRemote for ApiRemote<A> {
    async fn list(&self, session: &Session, catalog: Catalog) -> Result<Vec<String>, MutationFailure> {
        Ok(self.api.favorites(Some(session), catalog).await?)
    }

    async fn add(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure> {
        Ok(self.api.add_favorites(Some(session), catalog, keys).await?)
    }

    async fn remove(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure> {
        Ok(self.api.remove_favorites(Some(session), catalog, keys).await?)
    }

    async fn resolve(&self, catalog: Catalog, keys: Vec<String>) -> Result<Vec<Row>, MutationFailure> {
        Ok(self.api.resolve_rows(catalog, keys).await?)
    }
}

/// Rows currently rendered for the favorites list of one catalog.
#[derive(Debug, Clone, Default)]
pub struct FavoritesView {
    pub catalog: Option<Catalog>,
    pub rows: Vec<Row>,
    /// Favorited keys with no row fetched yet.
    pub pending: Vec<String>,
}

impl FavoritesView {
    /// Drop rows whose key left `set`; queue keys that have no row yet.
    pub fn reconcile(&mut self, set: &[String]) {
        self.rows.retain(|r| set.contains(&r.stable_key));
        let rows = &self.rows;
        self.pending = set.iter().filter(|k| !rows.iter().any(|r| &r.stable_key == *k)).cloned().collect();
    }

    /// Append fetched rows for `requested` keys that are still favorited.
    fn absorb(&mut self, requested: &[String], fetched: Vec<Row>, set: &[String]) {
        for row in fetched {
            let wanted = set.contains(&row.stable_key);
            let present = self.rows.iter().any(|r| r.id == row.id);
            if wanted && !present {
                self.rows.push(row);
            }
        }
        // keys with no row left in the catalog are not retried
        self.pending.retain(|k| !requested.contains(k));
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Remove,
}

impl Op {
    fn apply(self, current: &[String], keys: &[String]) -> Vec<String> {
        match self {
            Op::Add => {
                let mut next = current.to_vec();
                for k in keys {
                    if !next.contains(k) {
                        next.push(k.clone());
                    }
                }
                next
            }
            Op::Remove => current.iter().filter(|k| !keys.contains(k)).cloned().collect(),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Remove => "remove",
        }
    }
}

pub struct FavoritesCoordinator {
    catalog: Catalog,
    remote: Arc<dyn FavoritesRemote>,
    cache: Arc<FavoritesCache>,
    bus: Arc<dyn SyncChannel>,
    origin: String,
    session: Option<Session>,
    timeout: Duration,
    view: Mutex<FavoritesView>,
    notices: broadcast::Sender<Notice>,
}

impl FavoritesCoordinator {
    /// `bus` should be the channel of `catalog` (see `favorites_channel`).
    pub fn new(
        catalog: Catalog,
        remote: Arc<dyn FavoritesRemote>,
        cache: Arc<FavoritesCache>,
        bus: Arc<dyn SyncChannel>,
        session: Option<Session>,
    ) -> Self {
        if bus.name() != favorites_channel(catalog) {
            warn!(catalog = %catalog, channel = %bus.name(), "favorites: bus is not this catalog's channel");
        }
        let (notices, _) = broadcast::channel(16);
        Self {
            catalog,
            remote,
            cache,
            bus,
            origin: uuid::Uuid::new_v4().to_string(),
            session,
            timeout: Duration::from_millis(Limits::default().mutation_timeout_ms),
            view: Mutex::new(FavoritesView::default()),
            notices,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Origin id stamped on every broadcast from this client.
    pub fn origin(&self) -> &str { &self.origin }

    pub fn catalog(&self) -> Catalog { self.catalog }

    pub fn notices(&self) -> broadcast::Receiver<Notice> { self.notices.subscribe() }

    /// Cached set for the signed-in user; empty when signed out or not loaded.
    pub fn favorites(&self) -> Vec<String> {
        self.user().and_then(|u| self.cache.get(u, self.catalog)).map(|s| s.as_ref().clone()).unwrap_or_default()
    }

    pub fn is_favorite(&self, key: &str) -> bool { self.user().map_or(false, |u| self.cache.contains(u, self.catalog, key)) }

    pub fn view(&self) -> FavoritesView { self.lock_view().clone() }

    fn user(&self) -> Option<&str> { self.session.as_ref().map(|s| s.user_id.as_str()) }

    fn lock_view(&self) -> std::sync::MutexGuard<'_, FavoritesView> { self.view.lock().unwrap_or_else(|p| p.into_inner()) }

    fn notify(&self, notice: Notice) {
        // nobody listening is fine
        let _ = self.notices.send(notice);
    }

    fn reconcile_view(&self, set: &[String]) { self.lock_view().reconcile(set); }

    /// Pull the server's set into the cache. Does not broadcast.
    pub async fn refresh(&self) -> Result<FavoriteSet, Notice> {
        let Some(session) = self.session.as_ref() else {
            return Err(Notice::SignInRequired);
        };
        let keys = match tokio::time::timeout(self.timeout, self.remote.list(session, self.catalog)).await {
            Ok(Ok(keys)) => keys,
            Ok(Err(f)) => return Err(f.into()),
            Err(_) => return Err(Notice::Timeout),
        };
        self.reconcile_view(&keys);
        Ok(self.cache.set(&session.user_id, self.catalog, keys))
    }

    /// Render the favorites list, fetching rows for every favorited key.
    pub async fn show(&self) {
        {
            let mut view = self.lock_view();
            if view.catalog != Some(self.catalog) {
                *view = FavoritesView { catalog: Some(self.catalog), ..FavoritesView::default() };
            }
        }
        let set = self.favorites();
        self.reconcile_view(&set);
        self.fill_view().await;
    }

    /// Fetch rows for pending keys of the rendered list.
    pub async fn fill_view(&self) {
        let (catalog, requested) = {
            let view = self.lock_view();
            match view.catalog {
                Some(c) if !view.pending.is_empty() => (c, view.pending.clone()),
                _ => return,
            }
        };
        match self.remote.resolve(catalog, requested.clone()).await {
            Ok(rows) => {
                let set = self.favorites();
                self.lock_view().absorb(&requested, rows, &set);
            }
            Err(f) => warn!(catalog = %catalog, keys = requested.len(), failure = ?f, "favorites: resolving rows failed"),
        }
    }

    pub async fn add(&self, keys: Vec<String>) -> Result<FavoriteSet, Notice> { self.mutate(Op::Add, keys).await }

    pub async fn remove(&self, keys: Vec<String>) -> Result<FavoriteSet, Notice> { self.mutate(Op::Remove, keys).await }

    pub async fn toggle(&self, key: &str) -> Result<FavoriteSet, Notice> {
        let op = if self.is_favorite(key) { Op::Remove } else { Op::Add };
        self.mutate(op, vec![key.to_string()]).await
    }

    async fn mutate(&self, op: Op, keys: Vec<String>) -> Result<FavoriteSet, Notice> {
        let Some(session) = self.session.as_ref() else {
            self.notify(Notice::SignInRequired);
            return Err(Notice::SignInRequired);
        };
        let user = session.user_id.as_str();
        let catalog = self.catalog;

        let snapshot = self.favorites();
        let optimistic = op.apply(&snapshot, &keys);
        self.cache.set(user, catalog, optimistic.clone());
        self.reconcile_view(&optimistic);

        let send = async {
            match op {
                Op::Add => self.remote.add(session, catalog, keys).await,
                Op::Remove => self.remote.remove(session, catalog, keys).await,
            }
        };
        let outcome = match tokio::time::timeout(self.timeout, send).await {
            Ok(r) => r,
            Err(_) => Err(MutationFailure::Timeout),
        };

        match outcome {
            Ok(server) => {
                let set = self.cache.set(user, catalog, server.clone());
                self.reconcile_view(&server);
                self.bus.publish(&BroadcastMessage::updated(server, &self.origin));
                info!(catalog = %catalog, op = op.as_str(), size = set.len(), "favorites: write confirmed");
                self.fill_view().await;
                Ok(set)
            }
            Err(failure) => {
                metrics::counter!("favorites_rollback_total", 1u64, "op" => op.as_str(), "catalog" => catalog.as_str());
                warn!(catalog = %catalog, op = op.as_str(), failure = ?failure, "favorites: write failed, rolling back");
                self.cache.set(user, catalog, snapshot.clone());
                self.reconcile_view(&snapshot);
                let mut settled = snapshot;
                // a timed-out write may still commit on the server
                if failure == MutationFailure::Timeout {
                    match self.refresh().await {
                        Ok(server) => settled = server.as_ref().clone(),
                        Err(n) => debug!(catalog = %catalog, notice = ?n, "favorites: resync after timeout failed"),
                    }
                }
                self.bus.publish(&BroadcastMessage::updated(settled, &self.origin));
                let notice = Notice::from(failure);
                self.notify(notice.clone());
                Err(notice)
            }
        }
    }

    /// Apply a message from another client. Own messages are ignored.
    pub fn on_message(&self, msg: BroadcastMessage) -> bool {
        if msg.source() == self.origin {
            debug!(origin = %self.origin, "favorites: own broadcast ignored");
            return false;
        }
        let Some(user) = self.user() else {
            return false;
        };
        let BroadcastMessage::Updated { favorites, .. } = msg;
        self.reconcile_view(&favorites);
        self.cache.set(user, self.catalog, favorites);
        true
    }

    /// Subscribe this coordinator to its bus. Rows for newly favorited keys are fetched
    /// in the background.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(Box::new(move |msg| {
            let Some(this) = weak.upgrade() else { return };
            if !this.on_message(msg) {
                return;
            }
            let fill = {
                let view = this.lock_view();
                view.catalog.is_some() && !view.pending.is_empty()
            };
            if fill {
                tokio::spawn(async move { this.fill_view().await });
            }
        }))
    }
}

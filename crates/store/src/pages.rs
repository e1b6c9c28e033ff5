//! Infinite-scroll page loader.
//!
//! The request key is the serialized query. A new query stops the running fetch, and any
//! response whose key no longer matches is dropped.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tally_api::{CatalogApi, Session, TallyError, TallyResult};
use tally_core::{Catalog, ListPage, ListQuery, PageRow};
use tally_search::query::to_query_string;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type FetchFn = Arc<dyn Fn(ListQuery) -> BoxFuture<'static, TallyResult<ListPage>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct LoaderState {
    pub key: String,
    pub query: ListQuery,
    pub pages: Vec<ListPage>,
    pub in_flight: bool,
    /// Error of the most recent page request; earlier pages stay loaded.
    pub error: Option<TallyError>,
}

impl LoaderState {
    pub fn has_next_page(&self) -> bool { self.pages.last().map_or(true, ListPage::has_next_page) }

    /// Record a response for `key`. Returns false if the key is stale.
    fn accept(&mut self, key: &str, res: TallyResult<ListPage>) -> bool {
        if self.key != key {
            metrics::counter!("pages_stale_dropped_total", 1u64);
            debug!(key = %key, current = %self.key, "pages: stale response dropped");
            return false;
        }
        self.in_flight = false;
        match res {
            Ok(page) => {
                self.pages.push(page);
                self.error = None;
            }
            Err(e) => {
                warn!(key = %key, page = self.pages.len(), error = %e, "pages: fetch failed");
                self.error = Some(e);
            }
        }
        true
    }

    fn next_query(&self) -> ListQuery {
        let mut q = self.query.clone();
        if let Some(c) = self.pages.last().and_then(|p| p.next_cursor) {
            q.cursor = c as usize;
        }
        q
    }
}

pub struct PageLoader {
    catalog: Catalog,
    fetch: FetchFn,
    state: Arc<Mutex<LoaderState>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PageLoader {
    pub fn new(catalog: Catalog, fetch: FetchFn) -> Self {
        Self { catalog, fetch, state: Arc::new(Mutex::new(LoaderState::default())), stop: Mutex::new(None), task: Mutex::new(None) }
    }

    /// Loader over `api.list`.
    pub fn from_api<A: CatalogApi + 'static>(api: Arc<A>, catalog: Catalog) -> Self {
        let fetch: FetchFn = Arc::new(move |q| {
            let api = api.clone();
            async move { api.list(catalog, q).await }.boxed()
        });
        Self::new(catalog, fetch)
    }

    /// Loader over the favorited rows of `session`.
    pub fn favorites<A: CatalogApi + 'static>(api: Arc<A>, session: Session, catalog: Catalog) -> Self {
        let fetch: FetchFn = Arc::new(move |q| {
            let api = api.clone();
            let session = session.clone();
            async move { api.favorite_rows(Some(&session), catalog, q).await }.boxed()
        });
        Self::new(catalog, fetch)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoaderState> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Switch to `query`, dropping loaded pages and any fetch in flight. No-op if the key is unchanged.
    pub fn set_query(&self, query: ListQuery) {
        let key = to_query_string(self.catalog, &query);
        {
            let mut st = self.lock();
            if st.key == key && (st.in_flight || !st.pages.is_empty()) {
                return;
            }
            *st = LoaderState { key: key.clone(), query: query.clone(), ..LoaderState::default() };
            st.in_flight = true;
        }
        self.cancel();
        self.spawn(key, query);
    }

    /// Load the page after the last one. Returns false when a fetch is running or the list is exhausted.
    pub fn fetch_next(&self) -> bool {
        let (key, query) = {
            let mut st = self.lock();
            if st.in_flight || st.key.is_empty() || !st.has_next_page() {
                return false;
            }
            st.in_flight = true;
            (st.key.clone(), st.next_query())
        };
        self.spawn(key, query);
        true
    }

    fn cancel(&self) {
        if let Some(tx) = self.stop.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = tx.send(());
        }
    }

    fn spawn(&self, key: String, query: ListQuery) {
        let (tx, mut stop_rx) = oneshot::channel::<()>();
        *self.stop.lock().unwrap_or_else(|p| p.into_inner()) = Some(tx);
        let state = self.state.clone();
        let work = (self.fetch)(query);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {
                    debug!(key = %key, "pages: fetch cancelled");
                }
                res = work => {
                    state.lock().unwrap_or_else(|p| p.into_inner()).accept(&key, res);
                }
            }
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Wait for the current fetch, if any, to finish.
    pub async fn settle(&self) {
        loop {
            let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
            match handle {
                Some(h) => {
                    let _ = h.await;
                }
                None => break,
            }
        }
    }

    pub fn key(&self) -> String { self.lock().key.clone() }
    pub fn is_fetching(&self) -> bool { self.lock().in_flight }
    pub fn has_next_page(&self) -> bool { self.lock().has_next_page() }
    pub fn error(&self) -> Option<TallyError> { self.lock().error.clone() }
    pub fn pages(&self) -> Vec<ListPage> { self.lock().pages.clone() }

    /// All loaded rows in order.
    pub fn rows(&self) -> Vec<PageRow> { self.lock().pages.iter().flat_map(|p| p.data.iter().cloned()).collect() }
}

impl Drop for PageLoader {
    fn drop(&mut self) { self.cancel(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(next: Option<u64>) -> ListPage { ListPage { next_cursor: next, ..ListPage::default() } }

    #[test]
    fn stale_responses_are_dropped() {
        let mut st = LoaderState { key: "size=10".into(), in_flight: true, ..LoaderState::default() };
        assert!(!st.accept("size=20", Ok(page(None))));
        assert!(st.pages.is_empty());
        assert!(st.in_flight);
        assert!(st.accept("size=10", Ok(page(Some(10)))));
        assert_eq!(st.pages.len(), 1);
        assert!(!st.in_flight);
    }

    #[test]
    fn failed_page_keeps_earlier_pages() {
        let mut st = LoaderState { key: "k".into(), ..LoaderState::default() };
        st.accept("k", Ok(page(Some(50))));
        st.accept("k", Err(TallyError::Internal("down".into())));
        assert_eq!(st.pages.len(), 1);
        assert!(st.error.is_some());
        assert_eq!(st.next_query().cursor, 50);
    }
}

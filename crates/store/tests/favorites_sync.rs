#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tally_api::{CatalogApi, MockApi, Session, TallyError};
use tally_core::{Catalog, Row};
use tally_store::{
    ApiRemote, BroadcastMessage, FavoritesCache, FavoritesCoordinator, FavoritesRemote, LocalBus, MutationFailure, Notice,
    Subscription, SyncChannel,
};
use tokio::sync::Notify;

fn keys(xs: &[&str]) -> Vec<String> { xs.iter().map(|s| s.to_string()).collect() }

async fn settle() { tokio::time::sleep(Duration::from_millis(50)).await; }

/// Holds every `add` until the gate opens.
struct Gated {
    inner: ApiRemote<MockApi>,
    gate: Arc<Notify>,
}

#[async_trait::async_trait]
impl FavoritesRemote for Gated {
    async fn list(&self, session: &Session, catalog: Catalog) -> Result<Vec<String>, MutationFailure> {
        self.inner.list(session, catalog).await
    }

    async fn add(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure> {
        self.gate.notified().await;
        self.inner.add(session, catalog, keys).await
    }

    async fn remove(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure> {
        self.inner.remove(session, catalog, keys).await
    }

    async fn resolve(&self, catalog: Catalog, keys: Vec<String>) -> Result<Vec<Row>, MutationFailure> {
        self.inner.resolve(catalog, keys).await
    }
}

/// Commits every `add` on the server, then answers too late.
struct LateAck {
    inner: ApiRemote<MockApi>,
    lag: Duration,
}

#[async_trait::async_trait]
impl FavoritesRemote for LateAck {
    async fn list(&self, session: &Session, catalog: Catalog) -> Result<Vec<String>, MutationFailure> {
        self.inner.list(session, catalog).await
    }

    async fn add(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure> {
        let out = self.inner.add(session, catalog, keys).await;
        tokio::time::sleep(self.lag).await;
        out
    }

    async fn remove(&self, session: &Session, catalog: Catalog, keys: Vec<String>) -> Result<Vec<String>, MutationFailure> {
        self.inner.remove(session, catalog, keys).await
    }

    async fn resolve(&self, catalog: Catalog, keys: Vec<String>) -> Result<Vec<Row>, MutationFailure> {
        self.inner.resolve(catalog, keys).await
    }
}

struct Tab {
    coord: Arc<FavoritesCoordinator>,
    _sub: Subscription,
}

fn tab(remote: Arc<dyn FavoritesRemote>, bus: &Arc<LocalBus>, session: Option<&Session>) -> Tab {
    tab_for(Catalog::Gpu, remote, Arc::new(FavoritesCache::new()), bus, session)
}

fn tab_for(
    catalog: Catalog,
    remote: Arc<dyn FavoritesRemote>,
    cache: Arc<FavoritesCache>,
    bus: &Arc<LocalBus>,
    session: Option<&Session>,
) -> Tab {
    let coord = Arc::new(FavoritesCoordinator::new(
        catalog,
        remote,
        cache,
        bus.clone() as Arc<dyn SyncChannel>,
        session.cloned(),
    ));
    let sub = coord.attach();
    Tab { coord, _sub: sub }
}

async fn seeded(initial: &[&str]) -> (Arc<MockApi>, Session) {
    let api = Arc::new(MockApi::new());
    let s = Session::new("u1");
    if !initial.is_empty() {
        api.add_favorites(Some(&s), Catalog::Gpu, keys(initial)).await.unwrap();
    }
    (api, s)
}

fn gpu(id: &str, provider: &str) -> Row {
    Row::new(Catalog::Gpu, id, json!({"provider": provider, "gpu_model": "H100", "vram_gb": 80, "type": "VM"}))
}

#[tokio::test]
async fn two_tabs_converge_after_racing_writes() {
    let (api, s) = seeded(&["A", "B"]).await;
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let gate = Arc::new(Notify::new());
    let tab1 = tab(Arc::new(ApiRemote::new(api.clone())), &bus, Some(&s));
    let tab2 = tab(Arc::new(Gated { inner: ApiRemote::new(api.clone()), gate: gate.clone() }), &bus, Some(&s));
    tab1.coord.refresh().await.unwrap();
    tab2.coord.refresh().await.unwrap();

    let t2 = tab2.coord.clone();
    let pending = tokio::spawn(async move { t2.add(keys(&["C"])).await });
    settle().await;
    assert_eq!(tab2.coord.favorites(), keys(&["A", "B", "C"]));

    tab1.coord.remove(keys(&["A"])).await.unwrap();
    settle().await;
    // tab 1's broadcast lands while tab 2's add is still in flight
    assert_eq!(tab2.coord.favorites(), keys(&["B"]));

    gate.notify_one();
    let confirmed = pending.await.unwrap().unwrap();
    assert_eq!(*confirmed, keys(&["B", "C"]));
    settle().await;
    assert_eq!(tab1.coord.favorites(), keys(&["B", "C"]));
    assert_eq!(tab2.coord.favorites(), keys(&["B", "C"]));
    assert_eq!(api.favorites(Some(&s), Catalog::Gpu).await.unwrap(), keys(&["B", "C"]));
}

#[tokio::test]
async fn failed_write_rolls_back_and_rebroadcasts() {
    let (api, s) = seeded(&["A"]).await;
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let tab1 = tab(Arc::new(ApiRemote::new(api.clone())), &bus, Some(&s));
    let tab2 = tab(Arc::new(ApiRemote::new(api.clone())), &bus, Some(&s));
    tab1.coord.refresh().await.unwrap();
    tab2.coord.refresh().await.unwrap();
    let mut notices = tab1.coord.notices();

    api.fail_next_write(TallyError::Internal("db down".into()));
    let err = tab1.coord.add(keys(&["B"])).await.unwrap_err();
    assert!(matches!(err, Notice::Generic { .. }));
    assert_eq!(tab1.coord.favorites(), keys(&["A"]));
    assert_eq!(notices.recv().await.unwrap(), err);
    settle().await;
    assert_eq!(tab2.coord.favorites(), keys(&["A"]));

    api.fail_next_write(TallyError::RateLimited { retry_after_secs: 30 });
    assert_eq!(tab1.coord.toggle("A").await, Err(Notice::RateLimited { retry_after_secs: 30 }));
    assert_eq!(tab1.coord.favorites(), keys(&["A"]));
}

#[tokio::test]
async fn slow_write_times_out_and_rolls_back() {
    let s = Session::new("u1");
    let api = Arc::new(MockApi::new().with_delay(Duration::from_millis(300)));
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let coord = FavoritesCoordinator::new(
        Catalog::Gpu,
        Arc::new(ApiRemote::new(api.clone())),
        Arc::new(FavoritesCache::new()),
        bus as Arc<dyn SyncChannel>,
        Some(s.clone()),
    )
    .with_timeout(Duration::from_millis(20));
    assert_eq!(coord.add(keys(&["A"])).await, Err(Notice::Timeout));
    assert!(coord.favorites().is_empty());
    assert!(api.favorites(Some(&s), Catalog::Gpu).await.unwrap().is_empty());
}

#[tokio::test]
async fn late_commit_after_timeout_is_resynced() {
    let (api, s) = seeded(&[]).await;
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let other = tab(Arc::new(ApiRemote::new(api.clone())), &bus, Some(&s));
    let coord = FavoritesCoordinator::new(
        Catalog::Gpu,
        Arc::new(LateAck { inner: ApiRemote::new(api.clone()), lag: Duration::from_millis(300) }),
        Arc::new(FavoritesCache::new()),
        bus.clone() as Arc<dyn SyncChannel>,
        Some(s.clone()),
    )
    .with_timeout(Duration::from_millis(50));
    let mut notices = coord.notices();

    assert_eq!(coord.add(keys(&["A"])).await, Err(Notice::Timeout));
    assert_eq!(notices.recv().await.unwrap(), Notice::Timeout);
    // the server kept the write; the client follows the server, not its snapshot
    assert_eq!(api.favorites(Some(&s), Catalog::Gpu).await.unwrap(), keys(&["A"]));
    assert_eq!(coord.favorites(), keys(&["A"]));
    settle().await;
    assert_eq!(other.coord.favorites(), keys(&["A"]));
}

#[tokio::test]
async fn gpu_favorites_never_appear_in_the_cpu_set() {
    let (api, s) = seeded(&["g1"]).await;
    let cache = Arc::new(FavoritesCache::new());
    let gpu_bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let cpu_bus = Arc::new(LocalBus::favorites(Catalog::Cpu));
    let remote: Arc<dyn FavoritesRemote> = Arc::new(ApiRemote::new(api.clone()));
    let gpu_tab = tab_for(Catalog::Gpu, remote.clone(), cache.clone(), &gpu_bus, Some(&s));
    let cpu_tab = tab_for(Catalog::Cpu, remote.clone(), cache.clone(), &cpu_bus, Some(&s));
    let cpu_peer = tab_for(Catalog::Cpu, remote, Arc::new(FavoritesCache::new()), &cpu_bus, Some(&s));
    gpu_tab.coord.refresh().await.unwrap();
    cpu_tab.coord.refresh().await.unwrap();
    assert_eq!(gpu_tab.coord.favorites(), keys(&["g1"]));
    assert!(cpu_tab.coord.favorites().is_empty());

    gpu_tab.coord.add(keys(&["g2"])).await.unwrap();
    cpu_tab.coord.add(keys(&["c1"])).await.unwrap();
    settle().await;
    assert_eq!(gpu_tab.coord.favorites(), keys(&["g1", "g2"]));
    assert_eq!(cpu_tab.coord.favorites(), keys(&["c1"]));
    assert_eq!(cpu_peer.coord.favorites(), keys(&["c1"]));
    assert!(!cpu_tab.coord.is_favorite("g1"));
    assert_eq!(api.favorites(Some(&s), Catalog::Cpu).await.unwrap(), keys(&["c1"]));
    assert_eq!(api.favorites(Some(&s), Catalog::Gpu).await.unwrap(), keys(&["g1", "g2"]));
}

#[tokio::test]
async fn signed_out_writes_never_reach_the_bus() {
    let (api, _) = seeded(&[]).await;
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let seen = Arc::new(std::sync::Mutex::new(0usize));
    let s2 = seen.clone();
    let _probe = bus.subscribe(Box::new(move |_| *s2.lock().unwrap() += 1));
    let anon = tab(Arc::new(ApiRemote::new(api)), &bus, None);
    let mut notices = anon.coord.notices();
    assert_eq!(anon.coord.add(keys(&["A"])).await, Err(Notice::SignInRequired));
    assert_eq!(notices.recv().await.unwrap(), Notice::SignInRequired);
    settle().await;
    assert_eq!(*seen.lock().unwrap(), 0);
}

#[tokio::test]
async fn own_broadcasts_are_ignored() {
    let (api, s) = seeded(&["A"]).await;
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let t = tab(Arc::new(ApiRemote::new(api)), &bus, Some(&s));
    t.coord.refresh().await.unwrap();
    let origin = t.coord.origin().to_string();
    assert!(!t.coord.on_message(BroadcastMessage::updated(keys(&["X"]), &origin)));
    assert_eq!(t.coord.favorites(), keys(&["A"]));
    assert!(t.coord.on_message(BroadcastMessage::updated(keys(&["X"]), "other-tab")));
    assert_eq!(t.coord.favorites(), keys(&["X"]));
}

#[tokio::test]
async fn favorites_view_updates_in_place() {
    let rows = vec![gpu("1", "lambda"), gpu("2", "runpod"), gpu("3", "nebius")];
    let (k1, k2, k3) = (rows[0].stable_key.clone(), rows[1].stable_key.clone(), rows[2].stable_key.clone());
    let api = Arc::new(MockApi::new().with_rows(Catalog::Gpu, rows));
    let s = Session::new("u1");
    api.add_favorites(Some(&s), Catalog::Gpu, vec![k1.clone(), k2.clone()]).await.unwrap();
    let bus = Arc::new(LocalBus::favorites(Catalog::Gpu));
    let t = tab(Arc::new(ApiRemote::new(api)), &bus, Some(&s));
    t.coord.refresh().await.unwrap();
    t.coord.show().await;
    let ids = |t: &Tab| t.coord.view().rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&t), keys(&["1", "2"]));

    t.coord.remove(vec![k1]).await.unwrap();
    assert_eq!(ids(&t), keys(&["2"]));
    t.coord.add(vec![k3]).await.unwrap();
    assert_eq!(ids(&t), keys(&["2", "3"]));
    assert!(t.coord.view().pending.is_empty());
}

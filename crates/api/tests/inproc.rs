#![forbid(unsafe_code)]

use serde_json::json;
use tally_api::{CatalogApi, InProcApi, Session, TallyError};
use tally_core::config::Limits;
use tally_core::{Catalog, FilterState, FilterValue, ListQuery, Row};
use tally_persist::SqliteCatalog;

fn temp_db() -> String {
    let dir = std::env::temp_dir();
    let f = format!("tally-api-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
    dir.join(f).to_string_lossy().to_string()
}

fn api_with(limits: Limits) -> InProcApi {
    InProcApi::new(SqliteCatalog::open(&temp_db()).unwrap().with_limits(limits)).unwrap()
}

fn keys(xs: &[&str]) -> Vec<String> { xs.iter().map(|s| s.to_string()).collect() }

fn cpu(id: &str, provider: &str, vcpus: u32) -> Row {
    Row::new(Catalog::Cpu, id, json!({"provider": provider, "cpu_model": "EPYC", "vcpus": vcpus, "system_ram_gb": vcpus * 4, "type": "VM"}))
}

#[tokio::test]
async fn list_and_favorite_rows() {
    let api = api_with(Limits::default());
    api.load(Catalog::Cpu, vec![cpu("1", "oracle", 8), cpu("2", "oracle", 16), cpu("3", "nebius", 4)]).await.unwrap();
    let q = ListQuery::default().with_filter(FilterState::default().with("vcpus", FilterValue::range(6.0, 64.0))).sorted("vcpus", true);
    let page = api.list(Catalog::Cpu, q.clone()).await.unwrap();
    assert_eq!(page.ids(), vec!["2", "1"]);

    let s = Session::new("u1");
    api.add_favorites(Some(&s), Catalog::Cpu, keys(&["oracle:epyc:16:64gb:vm", "nebius:epyc:4:16gb:vm"])).await.unwrap();
    let favs = api.favorite_rows(Some(&s), Catalog::Cpu, q).await.unwrap();
    assert_eq!(favs.ids(), vec!["2"]);
    assert_eq!(favs.meta.total_row_count, 2);
    assert_eq!(api.resolve_rows(Catalog::Cpu, keys(&["nebius:epyc:4:16gb:vm"])).await.unwrap().len(), 1);
}

#[tokio::test]
async fn writes_are_rate_limited_per_user() {
    let api = api_with(Limits { write_limit: 2, ..Limits::default() });
    let a = Session::new("a");
    assert!(api.add_favorites(Some(&a), Catalog::Gpu, keys(&["k1"])).await.is_ok());
    assert!(api.remove_favorites(Some(&a), Catalog::Gpu, keys(&["k1"])).await.is_ok());
    let err = api.add_favorites(Some(&a), Catalog::Gpu, keys(&["k2"])).await.unwrap_err();
    assert!(matches!(err, TallyError::RateLimited { retry_after_secs } if retry_after_secs > 0));
    assert_eq!(err.status(), 429);
    assert!(api.add_favorites(Some(&Session::new("b")), Catalog::Gpu, keys(&["k2"])).await.is_ok());
    // the cpu set has its own budget
    assert!(api.add_favorites(Some(&a), Catalog::Cpu, keys(&["k2"])).await.is_ok());
}

#[tokio::test]
async fn gpu_favorites_never_show_in_the_cpu_set() {
    let api = api_with(Limits::default());
    api.load(Catalog::Cpu, vec![cpu("1", "oracle", 8)]).await.unwrap();
    let s = Session::new("u1");
    let gk = "lambda:h100:80gb:vm";
    assert_eq!(api.add_favorites(Some(&s), Catalog::Gpu, keys(&[gk])).await.unwrap(), keys(&[gk]));
    assert!(api.favorites(Some(&s), Catalog::Cpu).await.unwrap().is_empty());
    let ck = "oracle:epyc:8:32gb:vm";
    assert_eq!(api.add_favorites(Some(&s), Catalog::Cpu, keys(&[ck])).await.unwrap(), keys(&[ck]));
    assert_eq!(api.favorites(Some(&s), Catalog::Gpu).await.unwrap(), keys(&[gk]));
    let rows = api.favorite_rows(Some(&s), Catalog::Cpu, ListQuery::default()).await.unwrap();
    assert_eq!(rows.ids(), vec!["1"]);
}

#[test]
fn out_of_range_write_window_is_rejected() {
    let catalog = SqliteCatalog::open(&temp_db()).unwrap().with_limits(Limits { write_window_secs: u64::MAX, ..Limits::default() });
    let err = InProcApi::new(catalog).err().unwrap();
    assert_eq!(err.status(), 500);
    assert!(err.to_string().contains("write window"));
}

#[tokio::test]
async fn bad_requests_are_classified() {
    let api = api_with(Limits::default());
    assert_eq!(api.favorites(None, Catalog::Gpu).await, Err(TallyError::NotAuthenticated));
    let s = Session::new("u");
    assert!(matches!(api.add_favorites(Some(&s), Catalog::Gpu, Vec::new()).await, Err(TallyError::Validation(_))));
    let q = ListQuery::default().sorted("nope", false);
    let err = api.list(Catalog::Gpu, q).await.unwrap_err();
    assert_eq!(err.status(), 400);
}

//! Tally persistence: SQLite catalog rows and per-user favorites.
//! Filters, sorts and facets run inside SQLite; rows are never loaded wholesale.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod favorites;
pub mod functions;
pub mod sql;

pub use catalog::{Scope, SqliteCatalog};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::{Catalog, FilterState, FilterValue, ListQuery, Row};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("tally-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn gpu(id: &str, provider: &str, vram: Option<u32>) -> Row {
        let mut data = json!({"provider": provider, "gpu_model": "H100", "type": "VM"});
        if let Some(v) = vram {
            data["vram_gb"] = json!(v);
        }
        Row::new(Catalog::Gpu, id, data)
    }

    #[test]
    fn load_list_and_count() {
        let c = SqliteCatalog::open(&temp_db()).unwrap();
        let rows = vec![gpu("a", "lambda", Some(80)), gpu("b", "runpod", Some(24)), gpu("c", "nebius", None)];
        assert_eq!(c.load(Catalog::Gpu, &rows).unwrap(), 3);
        let q = ListQuery::default().with_filter(FilterState::default().with("vram_gb", FilterValue::range(40.0, 100.0)));
        let p = c.list(Catalog::Gpu, &q).unwrap();
        assert_eq!(p.ids(), vec!["a", "c"]);
        assert_eq!(p.meta.total_row_count, 3);
        assert_eq!(p.meta.facets["vram_gb"].missing(), 1);
    }

    #[test]
    fn reload_invalidates_facets() {
        let c = SqliteCatalog::open(&temp_db()).unwrap();
        c.load(Catalog::Gpu, &[gpu("a", "lambda", Some(80))]).unwrap();
        assert_eq!(c.facets(Catalog::Gpu).unwrap()["provider"].count_of("lambda"), Some(1));
        c.load(Catalog::Gpu, &[gpu("b", "runpod", Some(80)), gpu("c", "runpod", None)]).unwrap();
        let f = c.facets(Catalog::Gpu).unwrap();
        assert_eq!(f["provider"].count_of("lambda"), None);
        assert_eq!(f["provider"].count_of("runpod"), Some(2));
    }

    #[test]
    fn favorites_are_idempotent_and_ordered() {
        let c = SqliteCatalog::open(&temp_db()).unwrap();
        let keys = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(c.add_favorites("u1", Catalog::Gpu, &keys(&["k2", "k1"])).unwrap(), keys(&["k2", "k1"]));
        assert_eq!(c.add_favorites("u1", Catalog::Gpu, &keys(&["k1", "k3"])).unwrap(), keys(&["k2", "k1", "k3"]));
        assert_eq!(c.remove_favorites("u1", Catalog::Gpu, &keys(&["k2", "zz"])).unwrap(), keys(&["k1", "k3"]));
        assert!(c.list_favorites("u2", Catalog::Gpu).unwrap().is_empty());
    }

    #[test]
    fn favorite_rows_follow_stable_keys_across_reloads() {
        let c = SqliteCatalog::open(&temp_db()).unwrap();
        c.load(Catalog::Gpu, &[gpu("a", "lambda", Some(80)), gpu("b", "runpod", Some(24))]).unwrap();
        c.add_favorites("u1", Catalog::Gpu, &["lambda:h100:80gb:vm".to_string()]).unwrap();
        // re-scrape assigns new ids
        c.load(Catalog::Gpu, &[gpu("a2", "lambda", Some(80)), gpu("b2", "runpod", Some(24))]).unwrap();
        let p = c.favorite_rows("u1", Catalog::Gpu, &ListQuery::default()).unwrap();
        assert_eq!(p.ids(), vec!["a2"]);
        assert_eq!(p.meta.total_row_count, 1);
        let rows = c.resolve_rows(Catalog::Gpu, &["lambda:h100:80gb:vm".to_string(), "missing".to_string()]).unwrap();
        assert_eq!(rows.len(), 1);
    }
}

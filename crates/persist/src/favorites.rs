//! Per-user favorites, one set per catalog, keyed by stable key.

use std::time::Instant;

use anyhow::Result;
use metrics::{counter, histogram};
use rusqlite::Connection;

use tally_core::Catalog;

use crate::catalog::SqliteCatalog;

fn list_in(db: &Connection, user: &str, catalog: Catalog) -> Result<Vec<String>> {
    let mut stmt =
        db.prepare("SELECT stable_key FROM favorites WHERE user_id = ?1 AND catalog = ?2 ORDER BY created_at, rowid")?;
    let keys = stmt.query_map((user, catalog.as_str()), |r| r.get::<_, String>(0))?;
    Ok(keys.collect::<rusqlite::Result<Vec<String>>>()?)
}

impl SqliteCatalog {
    pub fn list_favorites(&self, user: &str, catalog: Catalog) -> Result<Vec<String>> {
        let db = self.conn()?;
        list_in(&db, user, catalog)
    }

    /// Insert keys not yet present and return the full set. Already-present keys are left untouched.
    pub fn add_favorites(&self, user: &str, catalog: Catalog, keys: &[String]) -> Result<Vec<String>> {
        let started = Instant::now();
        let now = chrono::Utc::now().timestamp_millis();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT OR IGNORE INTO favorites(user_id, catalog, stable_key, created_at) VALUES (?1, ?2, ?3, ?4)")?;
            for k in keys {
                stmt.execute((user, catalog.as_str(), k, now))?;
            }
        }
        tx.commit()?;
        counter!("favorites_write_total", 1u64, "op" => "add", "catalog" => catalog.as_str());
        histogram!("persist_favorites_ms", started.elapsed().as_secs_f64() * 1000.0);
        list_in(&db, user, catalog)
    }

    pub fn remove_favorites(&self, user: &str, catalog: Catalog, keys: &[String]) -> Result<Vec<String>> {
        let started = Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM favorites WHERE user_id = ?1 AND catalog = ?2 AND stable_key = ?3")?;
            for k in keys {
                stmt.execute((user, catalog.as_str(), k))?;
            }
        }
        tx.commit()?;
        counter!("favorites_write_total", 1u64, "op" => "remove", "catalog" => catalog.as_str());
        histogram!("persist_favorites_ms", started.elapsed().as_secs_f64() * 1000.0);
        list_in(&db, user, catalog)
    }
}

//! SQLite-backed catalog: rows stored as JSON, queried through the compiled `Expr`.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use metrics::histogram;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use rustc_hash::FxHashMap;
use tally_core::config::Limits;
use tally_core::facet::{finalize, FacetValue, Facets};
use tally_core::page::{self, ListMeta, ListPage, PageRow};
use tally_core::{lower, Catalog, CatalogSchema, FieldKind, FieldSpec, ListQuery, Row};
use tracing::{debug, info};

use crate::functions;
use crate::sql::{self, Fragment};

/// Which rows of a catalog a query sees.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    All,
    /// Only rows whose stable key is among this user's favorites of the same catalog.
    Favorites(&'a str),
}

impl Scope<'_> {
    fn clause(&self) -> Fragment {
        match self {
            Scope::All => Fragment::new(""),
            Scope::Favorites(user) => Fragment {
                sql: " AND r.stable_key IN (SELECT f.stable_key FROM favorites f WHERE f.user_id = ? AND f.catalog = r.catalog)".into(),
                params: vec![SqlValue::Text(user.to_string())],
            },
        }
    }
}

pub struct SqliteCatalog {
    db: Mutex<Connection>,
    schemas: FxHashMap<Catalog, CatalogSchema>,
    facets: Mutex<FxHashMap<Catalog, Facets>>,
    limits: Limits,
}

impl SqliteCatalog {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("TALLY_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS catalog_rows (
                id          TEXT NOT NULL,
                catalog     TEXT NOT NULL,
                stable_key  TEXT NOT NULL,
                data        TEXT NOT NULL,
                observed_at INTEGER,
                PRIMARY KEY (catalog, id)
            )",
            [],
        )
        .context("creating catalog_rows table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_catalog_rows_key ON catalog_rows(catalog, stable_key)", [])
            .context("creating catalog_rows index")?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS favorites (
                user_id    TEXT NOT NULL,
                catalog    TEXT NOT NULL,
                stable_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, catalog, stable_key)
            )",
            [],
        )
        .context("creating favorites table")?;
        functions::register(&db).context("registering tally_* sql functions")?;

        let schemas = Catalog::ALL.iter().map(|c| (*c, c.schema())).collect();
        let me = Self { db: Mutex::new(db), schemas, facets: Mutex::new(FxHashMap::default()), limits: Limits::from_env() };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    /// Replace the built-in schema of `schema.catalog` (e.g. a different canonical precedence).
    pub fn with_schema(mut self, schema: CatalogSchema) -> Self {
        self.schemas.insert(schema.catalog, schema);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits(&self) -> &Limits { &self.limits }

    pub fn schema(&self, catalog: Catalog) -> Result<&CatalogSchema> {
        self.schemas.get(&catalog).ok_or_else(|| anyhow!("no schema for catalog {}", catalog))
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("catalog db lock poisoned"))
    }

    fn invalidate(&self, catalog: Catalog) {
        if let Ok(mut cache) = self.facets.lock() {
            cache.remove(&catalog);
        }
    }

    /// Replace every row of `catalog` with `rows`. Returns the number stored; a repeated id keeps its last row.
    pub fn load(&self, catalog: Catalog, rows: &[Row]) -> Result<usize> {
        let started = Instant::now();
        let observed = self.schema(catalog)?.field("observed_at").cloned();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM catalog_rows WHERE catalog = ?1", [catalog.as_str()])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO catalog_rows(id, catalog, stable_key, data, observed_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in rows {
                let data = serde_json::to_string(&r.data).with_context(|| format!("encoding row {}", r.id))?;
                let ts = observed.as_ref().and_then(|f| f.canonical_ts(&r.data));
                stmt.execute((&r.id, catalog.as_str(), &r.stable_key, data, ts))?;
            }
        }
        let stored: i64 =
            tx.query_row("SELECT COUNT(*) FROM catalog_rows WHERE catalog = ?1", [catalog.as_str()], |r| r.get(0))?;
        tx.commit()?;
        drop(db);
        self.invalidate(catalog);
        if stored as usize != rows.len() {
            debug!(catalog = %catalog, given = rows.len(), stored, "persist: duplicate ids collapsed");
        }
        info!(catalog = %catalog, rows = stored, took_ms = %started.elapsed().as_millis(), "persist: load");
        Ok(stored as usize)
    }

    pub fn total(&self, catalog: Catalog) -> Result<u64> {
        let db = self.conn()?;
        let n: i64 = db.query_row("SELECT COUNT(*) FROM catalog_rows WHERE catalog = ?1", [catalog.as_str()], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn list(&self, catalog: Catalog, q: &ListQuery) -> Result<ListPage> {
        self.list_scoped(catalog, Scope::All, q)
    }

    pub fn list_scoped(&self, catalog: Catalog, scope: Scope<'_>, q: &ListQuery) -> Result<ListPage> {
        let started = Instant::now();
        let schema = self.schema(catalog)?;
        let expr = lower(schema, &q.filter)?;
        let (sort_field, descending) = schema.sort_spec(q.sort.as_ref())?;
        let cond = sql::compile(&expr);
        let scope_sql = scope.clause();

        // catalog, scope, predicate: the prefix shared by every statement below
        let mut base: Vec<SqlValue> = vec![SqlValue::Text(catalog.as_str().into())];
        base.extend(scope_sql.params.iter().cloned());
        let scoped_len = base.len();
        base.extend(cond.params.iter().cloned());
        let from = format!("FROM catalog_rows r WHERE r.catalog = ?{} AND {}", scope_sql.sql, cond.sql);

        let db = self.conn()?;
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM catalog_rows r WHERE r.catalog = ?{}", scope_sql.sql),
            params_from_iter(base[..scoped_len].iter()),
            |r| r.get(0),
        )?;
        let filtered: i64 =
            db.query_row(&format!("SELECT COUNT(*) {}", from), params_from_iter(base.iter()), |r| r.get(0))?;

        let pct_field = schema.percentile_field.as_deref().and_then(|n| schema.field(n));
        let pct_values: Vec<f64> = match pct_field {
            Some(f) => {
                let stmt_sql = format!("SELECT v FROM (SELECT {} AS v {}) WHERE v IS NOT NULL ORDER BY v", sql::canon_num(f), from);
                let mut stmt = db.prepare(&stmt_sql)?;
                let vals = stmt.query_map(params_from_iter(base.iter()), |r| r.get::<_, f64>(0))?;
                vals.collect::<rusqlite::Result<Vec<f64>>>()?
            }
            None => Vec::new(),
        };

        let size = self.limits.clamp_size(q.size);
        let mut page_params = base.clone();
        page_params.push(SqlValue::Integer(size as i64));
        page_params.push(SqlValue::Integer(q.cursor as i64));
        let page_sql = format!(
            "SELECT r.id, r.stable_key, r.data {} ORDER BY {} LIMIT ? OFFSET ?",
            from,
            sql::order_by(sort_field, descending)
        );
        let rows = read_rows(&db, catalog, &page_sql, page_params)?;
        drop(db);

        let data: Vec<PageRow> = rows
            .into_iter()
            .map(|row| {
                let percentile = pct_field.and_then(|f| f.canonical_num(&row.data)).map(|v| page::rank_of(&pct_values, v));
                PageRow { row, percentile }
            })
            .collect();

        let facets = match scope {
            Scope::All => self.facets(catalog)?,
            Scope::Favorites(_) => self.compute_facets(schema, &scope_sql, total as u64)?,
        };
        let (prev_cursor, next_cursor) = page::cursors(q.cursor, size, filtered as usize);
        histogram!("persist_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(catalog = %catalog, total, filtered, page = data.len(), took_ms = %started.elapsed().as_millis(), "persist: list");
        Ok(ListPage {
            data,
            meta: ListMeta {
                total_row_count: total as u64,
                filter_row_count: filtered as u64,
                facets,
                percentiles: page::percentiles(&pct_values),
            },
            prev_cursor,
            next_cursor,
        })
    }

    /// Facets over the full catalog, cached until the next `load`.
    pub fn facets(&self, catalog: Catalog) -> Result<Facets> {
        if let Some(hit) = self.facets.lock().ok().and_then(|c| c.get(&catalog).cloned()) {
            return Ok(hit);
        }
        let total = self.total(catalog)?;
        let computed = self.compute_facets(self.schema(catalog)?, &Scope::All.clause(), total)?;
        if let Ok(mut cache) = self.facets.lock() {
            cache.insert(catalog, computed.clone());
        }
        Ok(computed)
    }

    fn compute_facets(&self, schema: &CatalogSchema, scope: &Fragment, total: u64) -> Result<Facets> {
        let started = Instant::now();
        let db = self.conn()?;
        let mut prefix: Vec<SqlValue> = vec![SqlValue::Text(schema.catalog.as_str().into())];
        prefix.extend(scope.params.iter().cloned());
        let mut out = Facets::new();
        for field in schema.facet_fields() {
            let counts = match field.kind {
                FieldKind::TextList => list_counts(&db, field, scope, &prefix)?,
                _ => scalar_counts(&db, field, scope, &prefix)?,
            };
            out.insert(field.name.clone(), finalize(field, counts, total));
        }
        histogram!("persist_facets_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    /// Rows of `catalog` whose stable key is in `keys`, looked up `rows_chunk` keys at a time.
    pub fn resolve_rows(&self, catalog: Catalog, keys: &[String]) -> Result<Vec<Row>> {
        let db = self.conn()?;
        let mut out = Vec::new();
        for chunk in keys.chunks(self.limits.rows_chunk.max(1)) {
            let marks = vec!["?"; chunk.len()].join(", ");
            let stmt_sql = format!(
                "SELECT r.id, r.stable_key, r.data FROM catalog_rows r WHERE r.catalog = ? AND r.stable_key IN ({}) ORDER BY r.stable_key, r.id",
                marks
            );
            let mut params = vec![SqlValue::Text(catalog.as_str().into())];
            params.extend(chunk.iter().map(|k| SqlValue::Text(k.clone())));
            out.extend(read_rows(&db, catalog, &stmt_sql, params)?);
        }
        Ok(out)
    }

    /// The user's favorited rows of `catalog`, through the full filter/sort/paginate pipeline.
    pub fn favorite_rows(&self, user: &str, catalog: Catalog, q: &ListQuery) -> Result<ListPage> {
        self.list_scoped(catalog, Scope::Favorites(user), q)
    }
}

fn read_rows(db: &Connection, catalog: Catalog, stmt_sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>> {
    let mut stmt = db.prepare(stmt_sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let id: String = r.get(0)?;
        let stable_key: String = r.get(1)?;
        let raw: String = r.get(2)?;
        let data = serde_json::from_str(&raw).with_context(|| format!("decoding row {}", id))?;
        out.push(Row { id, stable_key, catalog, data });
    }
    Ok(out)
}

fn scalar_counts(
    db: &Connection,
    field: &FieldSpec,
    scope: &Fragment,
    prefix: &[SqlValue],
) -> Result<Vec<(Option<FacetValue>, u64)>> {
    let expr = match field.kind {
        FieldKind::Number => sql::canon_num(field),
        _ => sql::canon_text(field),
    };
    let stmt_sql = format!("SELECT {} AS v, COUNT(*) FROM catalog_rows r WHERE r.catalog = ?{} GROUP BY v", expr, scope.sql);
    let mut stmt = db.prepare(&stmt_sql)?;
    let mut rows = stmt.query(params_from_iter(prefix.iter()))?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let count: i64 = r.get(1)?;
        let value = match field.kind {
            FieldKind::Number => r.get::<_, Option<f64>>(0)?.map(|n| FacetValue::Number(n + 0.0)),
            _ => r.get::<_, Option<String>>(0)?.map(FacetValue::Text),
        };
        out.push((value, count as u64));
    }
    Ok(out)
}

/// Per-tag row counts over the union of a list field's sources, plus rows with no tags.
fn list_counts(
    db: &Connection,
    field: &FieldSpec,
    scope: &Fragment,
    prefix: &[SqlValue],
) -> Result<Vec<(Option<FacetValue>, u64)>> {
    let mut selects = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    for path in &field.sources {
        let p = format!("'$.{}'", path.replace('\'', "''"));
        selects.push(format!(
            "SELECT r.id AS id, j.value AS v FROM catalog_rows r, json_each(r.data, {p}) j
             WHERE r.catalog = ?{} AND json_type(r.data, {p}) = 'array' AND j.type = 'text'",
            scope.sql
        ));
        params.extend(prefix.iter().cloned());
    }
    let stmt_sql = format!("SELECT t.v, COUNT(DISTINCT t.id) FROM ({}) t GROUP BY t.v", selects.join(" UNION ALL "));
    let mut stmt = db.prepare(&stmt_sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let tag: String = r.get(0)?;
        let count: i64 = r.get(1)?;
        out.push((Some(FacetValue::Text(tag)), count as u64));
    }
    let missing: i64 = db.query_row(
        &format!("SELECT COUNT(*) FROM catalog_rows r WHERE r.catalog = ?{} AND NOT {}", scope.sql, sql::list_present(field)),
        params_from_iter(prefix.iter()),
        |r| r.get(0),
    )?;
    if missing > 0 {
        out.push((None, missing as u64));
    }
    Ok(out)
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".tally");
        let _ = std::fs::create_dir_all(&p);
        p.push("tally.db");
        return p.to_string_lossy().to_string();
    }
    "tally.db".to_string()
}

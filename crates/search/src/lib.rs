//! Tally search: in-memory list engine over a loaded catalog.
//! Filter, sort, paginate and facet a `Dataset` with the same semantics the SQLite
//! backend compiles to SQL.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use tally_core::config::Limits;
use tally_core::page::{self, ListMeta, ListPage, PageRow};
use tally_core::{lower, CatalogSchema, CoreError, Dataset, Facets, ListQuery, Row};
use tracing::debug;

pub mod codec;
pub mod eval;
pub mod facet;
pub mod query;
pub mod sort;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ListDebugInfo {
    pub total: usize,
    pub after_filter: usize,
    pub page_len: usize,
    pub sort_field: String,
}

/// Immutable engine over one dataset epoch. Facets are computed once at build time
/// because they always describe the full dataset.
pub struct MemEngine {
    schema: CatalogSchema,
    data: Arc<Dataset>,
    facets: Facets,
    limits: Limits,
}

impl MemEngine {
    pub fn build(schema: CatalogSchema, data: Arc<Dataset>) -> Self {
        let facets = facet::compute(&schema, &data.rows);
        metrics::gauge!("search_rows", data.rows.len() as f64);
        Self { schema, data, facets, limits: Limits::default() }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn schema(&self) -> &CatalogSchema { &self.schema }
    pub fn epoch(&self) -> u64 { self.data.epoch }
    pub fn len(&self) -> usize { self.data.rows.len() }
    pub fn is_empty(&self) -> bool { self.data.rows.is_empty() }
    pub fn facets(&self) -> &Facets { &self.facets }

    pub fn list(&self, q: &ListQuery) -> Result<ListPage, CoreError> {
        self.list_with_debug(q).map(|(p, _)| p)
    }

    pub fn list_with_debug(&self, q: &ListQuery) -> Result<(ListPage, ListDebugInfo), CoreError> {
        let started = Instant::now();
        let expr = lower(&self.schema, &q.filter)?;
        let mut hits: Vec<&Row> = self.data.rows.iter().filter(|r| eval::matches(&expr, &r.data)).collect();
        let after_filter = hits.len();
        sort::sort_rows(&self.schema, q.sort.as_ref(), &mut hits)?;

        let pct_field = self.schema.percentile_field.as_deref().and_then(|n| self.schema.field(n));
        let mut pct_values: Vec<f64> = match pct_field {
            Some(f) => hits.iter().filter_map(|r| f.canonical_num(&r.data)).collect(),
            None => Vec::new(),
        };
        pct_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let size = self.limits.clamp_size(q.size);
        let win = page::window(q.cursor, size, hits.len());
        let data: Vec<PageRow> = hits[win]
            .iter()
            .map(|r| PageRow {
                row: (*r).clone(),
                percentile: pct_field.and_then(|f| f.canonical_num(&r.data)).map(|v| page::rank_of(&pct_values, v)),
            })
            .collect();
        let (prev_cursor, next_cursor) = page::cursors(q.cursor, size, after_filter);

        let dbg = ListDebugInfo {
            total: self.data.rows.len(),
            after_filter,
            page_len: data.len(),
            sort_field: q.sort.as_ref().unwrap_or(&self.schema.default_sort).field.clone(),
        };
        let page = ListPage {
            data,
            meta: ListMeta {
                total_row_count: self.data.rows.len() as u64,
                filter_row_count: after_filter as u64,
                facets: self.facets.clone(),
                percentiles: page::percentiles(&pct_values),
            },
            prev_cursor,
            next_cursor,
        };
        let elapsed = started.elapsed();
        metrics::histogram!("search_eval_ms", elapsed.as_secs_f64() * 1_000.0);
        debug!(catalog = %self.schema.catalog, total = dbg.total, matched = after_filter, took_ms = %elapsed.as_millis(), "search: list");
        Ok((page, dbg))
    }

    /// Rows whose stable key is in `keys`, in dataset order.
    pub fn rows_by_keys(&self, keys: &[String]) -> Vec<&Row> {
        let wanted: rustc_hash::FxHashSet<&str> = keys.iter().map(String::as_str).collect();
        self.data.rows.iter().filter(|r| wanted.contains(r.stable_key.as_str())).collect()
    }
}

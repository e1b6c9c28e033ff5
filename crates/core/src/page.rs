//! List response envelope and offset-window arithmetic.

use serde::{Deserialize, Serialize};

use crate::facet::Facets;
use crate::Row;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRow {
    #[serde(flatten)]
    pub row: Row,
    /// Rank of this row's percentile-field value within the filtered set, in `[0, 100]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    pub total_row_count: u64,
    pub filter_row_count: u64,
    pub facets: Facets,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Percentiles>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub data: Vec<PageRow>,
    pub meta: ListMeta,
    pub prev_cursor: Option<u64>,
    pub next_cursor: Option<u64>,
}

impl ListPage {
    pub fn ids(&self) -> Vec<&str> { self.data.iter().map(|r| r.row.id.as_str()).collect() }
    pub fn has_next_page(&self) -> bool { self.next_cursor.is_some() }
}

/// `(prev, next)` cursors for an offset window over `filter_count` rows.
pub fn cursors(cursor: usize, size: usize, filter_count: usize) -> (Option<u64>, Option<u64>) {
    let next = cursor.saturating_add(size);
    let next = if next < filter_count { Some(next as u64) } else { None };
    let prev = if cursor > 0 { Some(cursor.saturating_sub(size) as u64) } else { None };
    (prev, next)
}

/// `[start, end)` of the page inside `len` rows.
pub fn window(cursor: usize, size: usize, len: usize) -> std::ops::Range<usize> {
    let start = cursor.min(len);
    let end = cursor.saturating_add(size).min(len);
    start..end
}

/// Nearest-rank percentile over ascending `sorted` values.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() { return 0.0; }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub fn percentiles(sorted: &[f64]) -> Option<Percentiles> {
    if sorted.is_empty() { return None; }
    Some(Percentiles {
        p50: nearest_rank(sorted, 50.0),
        p75: nearest_rank(sorted, 75.0),
        p90: nearest_rank(sorted, 90.0),
        p95: nearest_rank(sorted, 95.0),
        p99: nearest_rank(sorted, 99.0),
    })
}

/// Share of `sorted` values that are `<= value`, as a percentage.
pub fn rank_of(sorted: &[f64], value: f64) -> f64 {
    if sorted.is_empty() { return 0.0; }
    let at_or_below = sorted.partition_point(|v| *v <= value);
    at_or_below as f64 / sorted.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_cursor_is_null_exactly_at_the_end() {
        assert_eq!(cursors(0, 50, 120), (None, Some(50)));
        assert_eq!(cursors(50, 50, 120), (Some(0), Some(100)));
        assert_eq!(cursors(100, 50, 120), (Some(50), None));
        assert_eq!(cursors(70, 50, 120), (Some(20), None));
        assert_eq!(cursors(30, 50, 120), (Some(0), Some(80)));
        assert_eq!(cursors(0, 10, 10), (None, None));
    }

    #[test]
    fn window_is_clamped() {
        assert_eq!(window(0, 5, 3), 0..3);
        assert_eq!(window(10, 5, 3), 3..3);
    }

    #[test]
    fn percentile_math() {
        let v = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(nearest_rank(&v, 50.0), 2.0);
        assert_eq!(nearest_rank(&v, 99.0), 4.0);
        assert_eq!(rank_of(&v, 2.0), 50.0);
        assert_eq!(rank_of(&v, 0.5), 0.0);
        assert!(percentiles(&[]).is_none());
    }
}

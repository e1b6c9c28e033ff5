//! Runtime limits, overridable through `TALLY_*` environment variables.

use serde::{Deserialize, Serialize};

/// Longest accepted write-limit window (30 days).
pub const MAX_WRITE_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub page_size_default: usize,
    pub page_size_max: usize,
    /// Max keys per favorites add/remove request.
    pub favorites_batch_max: usize,
    /// Keys per lookup when resolving favorites back to rows.
    pub rows_chunk: usize,
    pub write_limit: u32,
    pub write_window_secs: u64,
    pub mutation_timeout_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            page_size_default: 50,
            page_size_max: 200,
            favorites_batch_max: 100,
            rows_chunk: 200,
            write_limit: 100,
            write_window_secs: 24 * 60 * 60,
            mutation_timeout_ms: 10_000,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

impl Limits {
    pub fn from_env() -> Self {
        let d = Self::default();
        let page_size_max = env_or("TALLY_PAGE_SIZE_MAX", d.page_size_max).max(1);
        Self {
            page_size_default: env_or("TALLY_PAGE_SIZE_DEFAULT", d.page_size_default).clamp(1, page_size_max),
            page_size_max,
            favorites_batch_max: env_or("TALLY_FAV_BATCH_MAX", d.favorites_batch_max).max(1),
            rows_chunk: env_or("TALLY_ROWS_CHUNK", d.rows_chunk).max(1),
            write_limit: env_or("TALLY_WRITE_LIMIT", d.write_limit),
            write_window_secs: env_or("TALLY_WRITE_WINDOW_SECS", d.write_window_secs).clamp(1, MAX_WRITE_WINDOW_SECS),
            mutation_timeout_ms: env_or("TALLY_MUTATION_TIMEOUT_MS", d.mutation_timeout_ms),
        }
    }

    /// Clamp a requested page size into `[1, page_size_max]`.
    pub fn clamp_size(&self, size: usize) -> usize { size.clamp(1, self.page_size_max) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_size_bounds() {
        let l = Limits::default();
        assert_eq!(l.clamp_size(0), 1);
        assert_eq!(l.clamp_size(50), 50);
        assert_eq!(l.clamp_size(10_000), 200);
    }

    #[test]
    fn default_window_is_in_range() {
        assert!(Limits::default().write_window_secs <= MAX_WRITE_WINDOW_SECS);
    }
}

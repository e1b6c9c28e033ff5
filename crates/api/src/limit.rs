//! Fixed-window write limiter, one window per key (user and catalog).

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use tally_core::config::MAX_WRITE_WINDOW_SECS;
use tally_core::{Catalog, CoreError};

#[derive(Debug, Clone, Copy)]
struct Window {
    started: DateTime<Utc>,
    count: u32,
}

pub struct RateLimiter {
    limit: u32,
    window: Duration,
    users: Mutex<FxHashMap<String, Window>>,
}

/// Limiter key: each catalog's favorites are limited separately.
pub fn limit_key(user: &str, catalog: Catalog) -> String { format!("{}-favorites:{}", catalog, user) }

impl RateLimiter {
    /// `window_secs` must lie in `1..=MAX_WRITE_WINDOW_SECS`.
    pub fn new(limit: u32, window_secs: u64) -> Result<Self, CoreError> {
        if window_secs == 0 || window_secs > MAX_WRITE_WINDOW_SECS {
            return Err(CoreError::Config(format!(
                "write window of {}s is outside 1..={}s",
                window_secs, MAX_WRITE_WINDOW_SECS
            )));
        }
        let window = i64::try_from(window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| CoreError::Config(format!("write window of {}s does not fit a duration", window_secs)))?;
        Ok(Self { limit, window, users: Mutex::new(FxHashMap::default()) })
    }

    /// Count one write for `key` at `now`. `Err` carries the seconds until the window resets.
    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), u64> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.retain(|_, w| now - w.started < self.window);
        let w = users.entry(key.to_string()).or_insert(Window { started: now, count: 0 });
        if w.count >= self.limit {
            let left = (w.started + self.window - now).num_seconds().max(1);
            return Err(left as u64);
        }
        w.count += 1;
        Ok(())
    }

    pub fn check(&self, key: &str) -> Result<(), u64> { self.check_at(key, Utc::now()) }

    /// Keys with a live window.
    pub fn tracked(&self) -> usize { self.users.lock().unwrap_or_else(|e| e.into_inner()).len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_blocks_then_resets() {
        let rl = RateLimiter::new(2, 60).unwrap();
        let t0 = Utc::now();
        assert!(rl.check_at("u", t0).is_ok());
        assert!(rl.check_at("u", t0 + Duration::seconds(1)).is_ok());
        assert_eq!(rl.check_at("u", t0 + Duration::seconds(10)), Err(50));
        assert!(rl.check_at("other", t0 + Duration::seconds(10)).is_ok());
        assert!(rl.check_at("u", t0 + Duration::seconds(60)).is_ok());
    }

    #[test]
    fn out_of_range_windows_are_config_errors() {
        assert!(matches!(RateLimiter::new(1, u64::MAX), Err(CoreError::Config(_))));
        assert!(matches!(RateLimiter::new(1, i64::MAX as u64 + 1), Err(CoreError::Config(_))));
        assert!(matches!(RateLimiter::new(1, 0), Err(CoreError::Config(_))));
        let widest = RateLimiter::new(1, MAX_WRITE_WINDOW_SECS).unwrap();
        let t0 = Utc::now();
        assert!(widest.check_at("u", t0).is_ok());
        assert_eq!(widest.check_at("u", t0), Err(MAX_WRITE_WINDOW_SECS));
    }

    #[test]
    fn expired_windows_are_pruned() {
        let rl = RateLimiter::new(5, 60).unwrap();
        let t0 = Utc::now();
        for u in ["a", "b", "c"] {
            rl.check_at(u, t0).unwrap();
        }
        assert_eq!(rl.tracked(), 3);
        rl.check_at("b", t0 + Duration::seconds(30)).unwrap();
        assert_eq!(rl.tracked(), 3);
        rl.check_at("d", t0 + Duration::seconds(61)).unwrap();
        assert_eq!(rl.tracked(), 1);
    }

    #[test]
    fn catalogs_have_separate_keys() {
        assert_ne!(limit_key("u", Catalog::Gpu), limit_key("u", Catalog::Cpu));
        assert_eq!(limit_key("u", Catalog::Model), "model-favorites:u");
    }
}

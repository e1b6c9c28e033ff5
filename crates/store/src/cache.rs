//! Favorites cache keyed by user id and catalog. Readers load a snapshot without locking.

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tally_core::Catalog;

pub type FavoriteSet = Arc<Vec<String>>;

type Key = (String, Catalog);

#[derive(Default)]
pub struct FavoritesCache {
    sets: ArcSwap<FxHashMap<Key, FavoriteSet>>,
}

impl FavoritesCache {
    pub fn new() -> Self { Self::default() }

    pub fn get(&self, user: &str, catalog: Catalog) -> Option<FavoriteSet> {
        self.sets.load().get(&(user.to_string(), catalog)).cloned()
    }

    pub fn contains(&self, user: &str, catalog: Catalog, key: &str) -> bool {
        self.get(user, catalog).map_or(false, |s| s.iter().any(|k| k == key))
    }

    pub fn set(&self, user: &str, catalog: Catalog, keys: Vec<String>) -> FavoriteSet {
        let set: FavoriteSet = Arc::new(keys);
        self.sets.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.insert((user.to_string(), catalog), set.clone());
            next
        });
        set
    }

    /// Forget every catalog's set for `user`.
    pub fn clear(&self, user: &str) {
        self.sets.rcu(|cur| {
            let mut next = FxHashMap::clone(cur);
            next.retain(|(u, _), _| u != user);
            next
        });
    }
}

//! Tally client-side state: the favorites cache, cross-client sync, optimistic
//! favorites mutations and the infinite-scroll page loader.

#![forbid(unsafe_code)]

pub mod cache;
pub mod coordinator;
pub mod pages;
pub mod sync;

pub use cache::{FavoriteSet, FavoritesCache};
pub use coordinator::{ApiRemote, FavoritesCoordinator, FavoritesRemote, FavoritesView, MutationFailure, Notice};
pub use pages::{FetchFn, LoaderState, PageLoader};
pub use sync::{
    favorites_channel, BroadcastMessage, LocalBus, Subscription, SyncChannel, CPU_FAVORITES_CHANNEL, FAVORITES_CHANNEL,
    MODEL_FAVORITES_CHANNEL,
};

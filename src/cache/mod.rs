//! Generic client-side query cache.
//!
//! This module provides a domain-agnostic caching mechanism that:
//! - Stores single records or ordered lists under composite keys
//! - Supports point reads, point writes and prefix invalidation
//! - Cancels in-flight reads so they cannot clobber local edits
//! - Refetches invalidated keys that have an active observer
//! - Serves stale entries when the network is unavailable

mod key;
mod layer;
mod store;
mod traits;

pub use key::QueryKey;
pub use layer::{fetcher, CacheLayer, FetchFuture, Fetcher, Observer};
pub use store::{CacheEvent, CachedEntry, QueryStore};
pub use traits::{CacheData, CacheResult, CacheSource, Cacheable};

#[cfg(test)]
pub(crate) use traits::tests as test_support;

//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key used to locate a record
/// inside a cached list.
pub trait Cacheable: Clone + Debug + PartialEq + Send + Sync + 'static {
  /// Unique identifier for this entity (e.g., product id)
  fn cache_key(&self) -> String;
}

/// Data held by a single cache entry: one record or an ordered list of them.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheData<T> {
  One(T),
  Many(Vec<T>),
}

impl<T: Cacheable> CacheData<T> {
  /// Find a record by its cache key.
  pub fn find(&self, key: &str) -> Option<&T> {
    match self {
      CacheData::One(item) => (item.cache_key() == key).then_some(item),
      CacheData::Many(items) => items.iter().find(|item| item.cache_key() == key),
    }
  }

  /// Apply `f` to the record with the given key, leaving every other record
  /// and the list order untouched. Returns whether a record matched.
  pub fn update_item(&mut self, key: &str, f: impl FnOnce(&mut T)) -> bool {
    let target = match self {
      CacheData::One(item) => (item.cache_key() == key).then_some(item),
      CacheData::Many(items) => items.iter_mut().find(|item| item.cache_key() == key),
    };

    match target {
      Some(item) => {
        f(item);
        true
      }
      None => false,
    }
  }

  /// Append a record. A single-record entry is promoted to a list.
  pub fn push(&mut self, item: T) {
    match self {
      CacheData::Many(items) => items.push(item),
      CacheData::One(existing) => {
        *self = CacheData::Many(vec![existing.clone(), item]);
      }
    }
  }

  pub fn as_one(&self) -> Option<&T> {
    match self {
      CacheData::One(item) => Some(item),
      CacheData::Many(_) => None,
    }
  }

  pub fn as_many(&self) -> Option<&[T]> {
    match self {
      CacheData::Many(items) => Some(items),
      CacheData::One(_) => None,
    }
  }

  /// Take the single record, if this is a single-record entry.
  pub fn into_one(self) -> Option<T> {
    match self {
      CacheData::One(item) => Some(item),
      CacheData::Many(_) => None,
    }
  }

  /// Take all records in order.
  pub fn into_vec(self) -> Vec<T> {
    match self {
      CacheData::One(item) => vec![item],
      CacheData::Many(items) => items,
    }
  }

  /// Number of records held.
  pub fn len(&self) -> usize {
    match self {
      CacheData::One(_) => 1,
      CacheData::Many(items) => items.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale but the fetch was cancelled or superseded
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

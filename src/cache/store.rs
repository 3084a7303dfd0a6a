//! In-memory query store with invalidation and in-flight fetch tracking.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use super::key::QueryKey;
use super::traits::{CacheData, Cacheable};

const EVENT_CAPACITY: usize = 256;

/// A single cached entry as seen by readers.
#[derive(Debug, Clone)]
pub struct CachedEntry<T> {
  /// The cached data
  pub data: CacheData<T>,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
  /// Set by invalidation until the next successful write
  pub invalidated: bool,
}

/// Change notifications broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
  /// Entry data was replaced (write, speculative edit, rollback or fetch)
  Updated(QueryKey),
  /// Entry was marked stale
  Invalidated(QueryKey),
}

struct Inner<T> {
  entries: HashMap<QueryKey, CachedEntry<T>>,
  /// Bumped on cancellation; fetch results carrying an older generation are dropped
  generations: HashMap<QueryKey, u64>,
  fetches: HashMap<QueryKey, Vec<JoinHandle<()>>>,
}

/// Key-indexed store of fetched results.
///
/// All methods take `&self`; the store is meant to be shared behind an `Arc`
/// between the cache layer, the fetch tasks it spawns and mutation
/// coordinators.
pub struct QueryStore<T> {
  inner: Mutex<Inner<T>>,
  events: broadcast::Sender<CacheEvent>,
}

impl<T: Cacheable> QueryStore<T> {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Mutex::new(Inner {
        entries: HashMap::new(),
        generations: HashMap::new(),
        fetches: HashMap::new(),
      }),
      events,
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, Inner<T>>> {
    self
      .inner
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn emit(&self, event: CacheEvent) {
    // No receivers is fine
    let _ = self.events.send(event);
  }

  /// Subscribe to change notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// Point read.
  pub fn read(&self, key: &QueryKey) -> Result<Option<CacheData<T>>> {
    let inner = self.lock()?;
    Ok(inner.entries.get(key).map(|entry| entry.data.clone()))
  }

  /// Point read including entry metadata.
  pub fn entry(&self, key: &QueryKey) -> Result<Option<CachedEntry<T>>> {
    let inner = self.lock()?;
    Ok(inner.entries.get(key).cloned())
  }

  /// Replace the entry with the result of applying `updater` to the current
  /// value (or `None` when absent).
  pub fn write<F>(&self, key: &QueryKey, updater: F) -> Result<()>
  where
    F: FnOnce(Option<&CacheData<T>>) -> CacheData<T>,
  {
    {
      let mut inner = self.lock()?;
      let data = updater(inner.entries.get(key).map(|entry| &entry.data));
      inner.entries.insert(
        key.clone(),
        CachedEntry {
          data,
          cached_at: Utc::now(),
          invalidated: false,
        },
      );
    }

    debug!(key = %key, "cache write");
    self.emit(CacheEvent::Updated(key.clone()));
    Ok(())
  }

  /// Replace the entry unconditionally.
  pub fn set(&self, key: &QueryKey, data: CacheData<T>) -> Result<()> {
    self.write(key, |_| data)
  }

  /// Edit an existing entry in place. Absent entries are left alone.
  ///
  /// Returns whether an entry existed.
  pub fn update<F>(&self, key: &QueryKey, f: F) -> Result<bool>
  where
    F: FnOnce(&mut CacheData<T>),
  {
    let updated = {
      let mut inner = self.lock()?;
      match inner.entries.get_mut(key) {
        Some(entry) => {
          f(&mut entry.data);
          entry.cached_at = Utc::now();
          entry.invalidated = false;
          true
        }
        None => false,
      }
    };

    if updated {
      debug!(key = %key, "cache update");
      self.emit(CacheEvent::Updated(key.clone()));
    }
    Ok(updated)
  }

  /// Mark every entry under `prefix` as stale. Returns the matched keys.
  pub fn invalidate(&self, prefix: &QueryKey) -> Result<Vec<QueryKey>> {
    let keys: Vec<QueryKey> = {
      let mut inner = self.lock()?;
      inner
        .entries
        .iter_mut()
        .filter(|(key, _)| key.matches(prefix))
        .map(|(key, entry)| {
          entry.invalidated = true;
          key.clone()
        })
        .collect()
    };

    debug!(prefix = %prefix, count = keys.len(), "invalidated entries");
    for key in &keys {
      self.emit(CacheEvent::Invalidated(key.clone()));
    }
    Ok(keys)
  }

  /// Register the start of a fetch and return the generation its result
  /// must carry to be committed.
  pub fn begin_fetch(&self, key: &QueryKey) -> Result<u64> {
    let mut inner = self.lock()?;
    Ok(*inner.generations.entry(key.clone()).or_insert(0))
  }

  /// Store a fetch result unless the key was cancelled since the fetch began.
  ///
  /// Returns whether the result was written.
  pub fn commit_fetch(&self, key: &QueryKey, generation: u64, data: CacheData<T>) -> Result<bool> {
    let committed = {
      let mut inner = self.lock()?;
      let current = inner.generations.get(key).copied().unwrap_or(0);
      if current == generation {
        inner.entries.insert(
          key.clone(),
          CachedEntry {
            data,
            cached_at: Utc::now(),
            invalidated: false,
          },
        );
        true
      } else {
        false
      }
    };

    if committed {
      debug!(key = %key, "fetch committed");
      self.emit(CacheEvent::Updated(key.clone()));
    } else {
      debug!(key = %key, generation, "discarding result of cancelled fetch");
    }
    Ok(committed)
  }

  /// Track a spawned fetch task so it can be cancelled or awaited.
  pub fn track_fetch(&self, key: &QueryKey, handle: JoinHandle<()>) -> Result<()> {
    let mut inner = self.lock()?;
    let handles = inner.fetches.entry(key.clone()).or_default();
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
    Ok(())
  }

  fn take_fetches(&self, prefix: &QueryKey) -> Result<Vec<JoinHandle<()>>> {
    let mut inner = self.lock()?;
    let keys: Vec<QueryKey> = inner
      .fetches
      .keys()
      .filter(|key| key.matches(prefix))
      .cloned()
      .collect();

    Ok(
      keys
        .iter()
        .filter_map(|key| inner.fetches.remove(key))
        .flatten()
        .collect(),
    )
  }

  /// Suppress delivery of every in-flight fetch under `prefix`.
  ///
  /// Results of fetches that already started are discarded, the fetch tasks
  /// are aborted and awaited. Returns the number of tasks that were still
  /// running.
  pub async fn cancel_in_flight(&self, prefix: &QueryKey) -> Result<usize> {
    {
      let mut inner = self.lock()?;
      for (_, generation) in inner
        .generations
        .iter_mut()
        .filter(|(key, _)| key.matches(prefix))
      {
        *generation += 1;
      }
    }

    let handles = self.take_fetches(prefix)?;
    let mut cancelled = 0;
    for handle in handles {
      if !handle.is_finished() {
        handle.abort();
        cancelled += 1;
      }
      // Aborted tasks resolve to a cancellation error
      let _ = handle.await;
    }

    debug!(prefix = %prefix, cancelled, "cancelled in-flight fetches");
    Ok(cancelled)
  }

  /// Wait until every tracked fetch under `prefix` has finished.
  pub async fn wait_for_fetches(&self, prefix: &QueryKey) -> Result<()> {
    loop {
      let handles = self.take_fetches(prefix)?;
      if handles.is_empty() {
        return Ok(());
      }
      for handle in handles {
        let _ = handle.await;
      }
    }
  }
}

impl<T: Cacheable> Default for QueryStore<T> {
  fn default() -> Self {
    Self::new()
  }
}

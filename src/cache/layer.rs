//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use super::key::QueryKey;
use super::store::{CacheEvent, CachedEntry, QueryStore};
use super::traits::{CacheData, CacheResult, Cacheable};

/// A boxed future producing fresh data for a key.
pub type FetchFuture<T> = BoxFuture<'static, Result<CacheData<T>>>;

/// A shareable factory for fetch futures. Called once per attempt.
pub type Fetcher<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

/// Wrap a closure returning a future into a [`Fetcher`].
pub fn fetcher<T, F, Fut>(f: F) -> Fetcher<T>
where
  T: Cacheable,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<CacheData<T>>> + Send + 'static,
{
  Arc::new(move || Box::pin(f()))
}

enum FetchOutcome<T> {
  /// Result was written to the cache
  Committed(CacheData<T>),
  /// Key was cancelled while the fetch ran
  Superseded,
}

struct ObserverEntry<T> {
  id: u64,
  fetcher: Fetcher<T>,
}

type ObserverMap<T> = Arc<Mutex<HashMap<QueryKey, Vec<ObserverEntry<T>>>>>;

/// Registration of an active observer. Unregisters on drop.
pub struct Observer<T> {
  id: u64,
  key: QueryKey,
  observers: ObserverMap<T>,
}

impl<T> Drop for Observer<T> {
  fn drop(&mut self) {
    if let Ok(mut observers) = self.observers.lock() {
      if let Some(entries) = observers.get_mut(&self.key) {
        entries.retain(|entry| entry.id != self.id);
        if entries.is_empty() {
          observers.remove(&self.key);
        }
      }
    }
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the application and the network client,
/// providing cache-first reads, background refetch of observed keys after
/// invalidation, and offline fallback to stale entries.
pub struct CacheLayer<T: Cacheable> {
  store: Arc<QueryStore<T>>,
  observers: ObserverMap<T>,
  next_observer: Arc<AtomicU64>,
  /// How long before cached data is considered stale
  stale_time: Duration,
  /// Extra attempts after a failed fetch
  retry: u32,
  retry_delay: std::time::Duration,
}

impl<T: Cacheable> CacheLayer<T> {
  /// Create a new cache layer over the given store.
  pub fn new(store: QueryStore<T>) -> Self {
    Self {
      store: Arc::new(store),
      observers: Arc::new(Mutex::new(HashMap::new())),
      next_observer: Arc::new(AtomicU64::new(0)),
      stale_time: Duration::seconds(10),
      retry: 1,
      retry_delay: std::time::Duration::from_secs(1),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Set how many times a failed fetch is retried and the pause between attempts.
  pub fn with_retry(mut self, retry: u32, retry_delay: std::time::Duration) -> Self {
    self.retry = retry;
    self.retry_delay = retry_delay;
    self
  }

  /// The underlying store.
  pub fn store(&self) -> &QueryStore<T> {
    &self.store
  }

  /// Subscribe to cache change notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.store.subscribe()
  }

  /// Check if an entry is stale: invalidated, or older than the stale time.
  pub fn is_stale(&self, entry: &CachedEntry<T>) -> bool {
    entry.invalidated || Utc::now() - entry.cached_at > self.stale_time
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network (with retries)
  /// 3. If the fetch was cancelled, return whatever the cache now holds, or
  ///    fetch again when there is still nothing cached
  /// 4. On network failure, return stale cache (offline mode)
  pub async fn fetch<F, Fut>(&self, key: &QueryKey, f: F) -> Result<CacheResult<CacheData<T>>>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CacheData<T>>> + Send + 'static,
  {
    self.fetch_with(key, fetcher(f)).await
  }

  /// Same as [`CacheLayer::fetch`] with an already boxed fetcher.
  pub async fn fetch_with(
    &self,
    key: &QueryKey,
    fetcher: Fetcher<T>,
  ) -> Result<CacheResult<CacheData<T>>> {
    if let Some(cached) = self.store.entry(key)? {
      if !self.is_stale(&cached) {
        return Ok(CacheResult::from_cache(cached.data, cached.cached_at, false));
      }
    }

    loop {
      let receiver = self.spawn_fetch(key, Arc::clone(&fetcher))?;
      match receiver.await {
        Ok(Ok(FetchOutcome::Committed(data))) => return Ok(CacheResult::from_network(data)),
        Ok(Ok(FetchOutcome::Superseded)) | Err(_) => match self.store.entry(key)? {
          Some(current) => {
            let stale = self.is_stale(&current);
            return Ok(CacheResult::from_cache(current.data, current.cached_at, stale));
          }
          // Nothing to show yet; the caller keeps loading
          None => debug!(key = %key, "first load was cancelled, fetching again"),
        },
        Ok(Err(e)) => {
          return match self.store.entry(key)? {
            Some(current) => {
              warn!(key = %key, error = %e, "fetch failed, serving cached data");
              Ok(CacheResult::offline(current.data, current.cached_at))
            }
            None => Err(e),
          }
        }
      }
    }
  }

  /// Start a tracked fetch task for `key`.
  fn spawn_fetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher<T>,
  ) -> Result<oneshot::Receiver<Result<FetchOutcome<T>>>> {
    let runtime = tokio::runtime::Handle::try_current()
      .map_err(|e| eyre!("No async runtime available to fetch {}: {}", key, e))?;

    let generation = self.store.begin_fetch(key)?;
    let (tx, rx) = oneshot::channel();
    let store = Arc::clone(&self.store);
    let task_key = key.clone();
    let retry = self.retry;
    let retry_delay = self.retry_delay;

    let handle = runtime.spawn(async move {
      let result = match fetch_with_retry(&fetcher, &task_key, retry, retry_delay).await {
        Ok(data) => store
          .commit_fetch(&task_key, generation, data.clone())
          .map(|committed| {
            if committed {
              FetchOutcome::Committed(data)
            } else {
              FetchOutcome::Superseded
            }
          }),
        Err(e) => Err(e),
      };
      // Ignore send errors - background refetches have no receiver
      let _ = tx.send(result);
    });

    self.store.track_fetch(key, handle)?;
    Ok(rx)
  }

  /// Register an active observer for `key`.
  ///
  /// While the returned guard is alive, invalidating the key triggers a
  /// background refetch through `fetcher`.
  pub fn observe(&self, key: &QueryKey, fetcher: Fetcher<T>) -> Result<Observer<T>> {
    let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
    let mut observers = self
      .observers
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    observers
      .entry(key.clone())
      .or_default()
      .push(ObserverEntry { id, fetcher });

    Ok(Observer {
      id,
      key: key.clone(),
      observers: Arc::clone(&self.observers),
    })
  }

  /// Mark every entry under `prefix` stale and refetch the observed ones.
  ///
  /// Refetches run in the background; use [`CacheLayer::wait_idle`] to await them.
  pub fn invalidate(&self, prefix: &QueryKey) -> Result<Vec<QueryKey>> {
    let invalidated = self.store.invalidate(prefix)?;

    let active: Vec<(QueryKey, Fetcher<T>)> = {
      let observers = self
        .observers
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      observers
        .iter()
        .filter(|(key, _)| key.matches(prefix))
        .filter_map(|(key, entries)| {
          entries
            .first()
            .map(|entry| (key.clone(), Arc::clone(&entry.fetcher)))
        })
        .collect()
    };

    for (key, fetcher) in active {
      debug!(key = %key, "refetching invalidated query");
      self.spawn_fetch(&key, fetcher)?;
    }

    Ok(invalidated)
  }

  /// Cancel in-flight fetches under `prefix`; completes once they are gone.
  pub async fn cancel(&self, prefix: &QueryKey) -> Result<usize> {
    self.store.cancel_in_flight(prefix).await
  }

  /// Wait for every in-flight fetch under `prefix` to finish.
  pub async fn wait_idle(&self, prefix: &QueryKey) -> Result<()> {
    self.store.wait_for_fetches(prefix).await
  }
}

async fn fetch_with_retry<T: Cacheable>(
  fetcher: &Fetcher<T>,
  key: &QueryKey,
  retry: u32,
  retry_delay: std::time::Duration,
) -> Result<CacheData<T>> {
  let mut attempt = 0;
  loop {
    match fetcher().await {
      Ok(data) => return Ok(data),
      Err(e) if attempt < retry => {
        attempt += 1;
        debug!(key = %key, attempt, error = %e, "fetch failed, retrying");
        if !retry_delay.is_zero() {
          tokio::time::sleep(retry_delay).await;
        }
      }
      Err(e) => return Err(e),
    }
  }
}

impl<T: Cacheable> Clone for CacheLayer<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      observers: Arc::clone(&self.observers),
      next_observer: Arc::clone(&self.next_observer),
      stale_time: self.stale_time,
      retry: self.retry,
      retry_delay: self.retry_delay,
    }
  }
}

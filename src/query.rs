//! Cache-backed query observers.
//!
//! Inspired by TanStack Query, a `Query<T>` watches one cache key: it fetches
//! through the [`CacheLayer`], tracks loading/success/error states, picks up
//! any later change to the entry (speculative edits, rollbacks, refetches)
//! and keeps the key registered as actively observed so invalidation
//! refetches it.
//!
//! # Example
//!
//! ```ignore
//! let mut query = catalog.product_query("p1", "bracket")?;
//!
//! // Start fetching; shows list data for p1 as a placeholder if cached
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Placeholder(data) | QueryState::Success(data) => render_data(data),
//!     QueryState::Error(e) => render_error(e),
//!     QueryState::Idle => {}
//! }
//! ```

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::cache::{CacheData, CacheEvent, CacheLayer, Cacheable, Fetcher, Observer, QueryKey};

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is fetching and has nothing to show
  Loading,
  /// Query is fetching and shows provisional data from another entry
  Placeholder(T),
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading | QueryState::Placeholder(_))
  }

  pub fn is_placeholder(&self) -> bool {
    matches!(self, QueryState::Placeholder(_))
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  /// Data to display: the fetched data, or the placeholder while loading.
  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) | QueryState::Placeholder(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Active observer of a single cache key.
pub struct Query<T: Cacheable> {
  key: QueryKey,
  cache: CacheLayer<T>,
  fetcher: Fetcher<T>,
  placeholder: Option<CacheData<T>>,
  state: QueryState<CacheData<T>>,
  receiver: Option<mpsc::UnboundedReceiver<Result<CacheData<T>, String>>>,
  events: broadcast::Receiver<CacheEvent>,
  _observer: Observer<T>,
}

impl<T: Cacheable> Query<T> {
  /// Create a query for `key`, registering it as an active observer.
  pub fn new(cache: CacheLayer<T>, key: QueryKey, fetcher: Fetcher<T>) -> Result<Self> {
    let observer = cache.observe(&key, Arc::clone(&fetcher))?;
    let events = cache.subscribe();

    Ok(Self {
      key,
      cache,
      fetcher,
      placeholder: None,
      state: QueryState::Idle,
      receiver: None,
      events,
      _observer: observer,
    })
  }

  /// Data shown while the first fetch is pending.
  pub fn with_placeholder(mut self, placeholder: Option<CacheData<T>>) -> Self {
    self.placeholder = placeholder;
    self
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<CacheData<T>> {
    &self.state
  }

  /// Get the data to display, if any.
  pub fn data(&self) -> Option<&CacheData<T>> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_placeholder(&self) -> bool {
    self.state.is_placeholder()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Start fetching data if not already fetching.
  pub fn fetch(&mut self) {
    if self.receiver.is_some() {
      return;
    }
    self.start_fetch();
  }

  /// Force a new fetch, dropping interest in any pending one.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for fetch results and cache changes.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.poll_fetch();

    loop {
      match self.events.try_recv() {
        Ok(CacheEvent::Updated(key)) if key == self.key => {
          changed |= self.sync_from_cache();
        }
        Ok(_) => {}
        Err(broadcast::error::TryRecvError::Lagged(_)) => {
          changed |= self.sync_from_cache();
        }
        Err(broadcast::error::TryRecvError::Empty)
        | Err(broadcast::error::TryRecvError::Closed) => break,
      }
    }

    changed
  }

  fn poll_fetch(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.state = QueryState::Success(data);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.state = QueryState::Error("Query was cancelled".to_string());
        self.receiver = None;
        true
      }
    }
  }

  /// Replace the state with the current cache entry if it differs.
  fn sync_from_cache(&mut self) -> bool {
    match self.cache.store().read(&self.key) {
      Ok(Some(data)) if self.state != QueryState::Success(data.clone()) => {
        self.state = QueryState::Success(data);
        true
      }
      _ => false,
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);

    // Background refetches keep showing the data we already have
    if !self.state.is_success() {
      self.state = match &self.placeholder {
        Some(placeholder) => QueryState::Placeholder(placeholder.clone()),
        None => QueryState::Loading,
      };
    }

    let cache = self.cache.clone();
    let key = self.key.clone();
    let fetcher = Arc::clone(&self.fetcher);
    tokio::spawn(async move {
      let result = cache
        .fetch_with(&key, fetcher)
        .await
        .map(|result| result.data)
        .map_err(|e| e.to_string());
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<T: Cacheable> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

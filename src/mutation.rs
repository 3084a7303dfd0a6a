//! Optimistic mutations against the query cache.
//!
//! Every mutation runs through the same state machine:
//!
//! ```text
//! Idle -> Cancelling -> Snapshotting -> Speculating -> InFlight -> Confirmed  -> Settled
//!                                                              \-> RolledBack -> Settled
//! ```
//!
//! In-flight reads of the affected keys are cancelled (and awaited) before the
//! snapshot is taken, so a late server response cannot overwrite the
//! speculative edit. On failure every affected key that had an entry is
//! restored from the snapshot. Settlement invalidates the mutation's keys
//! unconditionally so observers refetch server truth; it runs from a drop
//! guard and therefore also happens when the mutation future is dropped.

use color_eyre::Report;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cache::{CacheData, CacheLayer, Cacheable, QueryKey, QueryStore};

/// Phase of a single mutation invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  Cancelling,
  Snapshotting,
  Speculating,
  InFlight,
  Confirmed,
  RolledBack,
  Settled,
}

impl MutationPhase {
  /// Transition table.
  ///
  /// A mutation that fails while preparing its speculative state rolls back
  /// without dispatching the request.
  pub fn can_advance_to(self, next: MutationPhase) -> bool {
    use MutationPhase::*;

    matches!(
      (self, next),
      (Idle, Cancelling)
        | (Cancelling, Snapshotting)
        | (Snapshotting, Speculating)
        | (Speculating, InFlight)
        | (InFlight, Confirmed)
        | (InFlight, RolledBack)
        | (Cancelling, RolledBack)
        | (Snapshotting, RolledBack)
        | (Speculating, RolledBack)
        | (Confirmed, Settled)
        | (RolledBack, Settled)
    )
  }
}

/// A mutation that can be applied optimistically to cached entries of `T`.
pub trait OptimisticMutation<T: Cacheable>: Send + Sync {
  type Output: Send;
  type Error: std::error::Error + Send + Sync + 'static;

  /// Name used in logs.
  fn name(&self) -> &'static str;

  /// Keys that are cancelled, snapshotted, edited and restored.
  fn affected_keys(&self) -> Vec<QueryKey>;

  /// Key prefixes invalidated once the mutation settles.
  fn invalidation_keys(&self) -> Vec<QueryKey>;

  /// Apply the speculative edit to one existing entry.
  fn speculate(&self, key: &QueryKey, data: &mut CacheData<T>);

  /// Send the real request.
  fn execute(&self) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;
}

/// Why a mutation did not succeed.
#[derive(Debug)]
pub enum MutationError<E> {
  /// The request failed; the speculative edit was rolled back
  Rejected(E),
  /// The cache itself failed while preparing or rolling back
  Cache(Report),
}

impl<E> MutationError<E> {
  /// The request error, if the server or transport rejected the mutation.
  pub fn rejection(&self) -> Option<&E> {
    match self {
      MutationError::Rejected(e) => Some(e),
      MutationError::Cache(_) => None,
    }
  }
}

impl<E: fmt::Display> fmt::Display for MutationError<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MutationError::Rejected(e) => write!(f, "mutation rejected: {}", e),
      MutationError::Cache(e) => write!(f, "cache failure during mutation: {}", e),
    }
  }
}

impl<E: std::error::Error + 'static> std::error::Error for MutationError<E> {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      MutationError::Rejected(e) => Some(e),
      MutationError::Cache(_) => None,
    }
  }
}

/// Result of one mutation together with the phases it went through.
#[derive(Debug)]
pub struct MutationOutcome<O, E> {
  pub result: Result<O, MutationError<E>>,
  pub transitions: Vec<MutationPhase>,
}

impl<O, E> MutationOutcome<O, E> {
  pub fn is_confirmed(&self) -> bool {
    self.transitions.contains(&MutationPhase::Confirmed)
  }

  pub fn is_rolled_back(&self) -> bool {
    self.transitions.contains(&MutationPhase::RolledBack)
  }
}

/// Pre-mutation copy of every affected entry.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
  entries: Vec<(QueryKey, Option<CacheData<T>>)>,
}

impl<T: Cacheable> Snapshot<T> {
  pub fn capture(store: &QueryStore<T>, keys: &[QueryKey]) -> color_eyre::Result<Self> {
    let entries = keys
      .iter()
      .map(|key| Ok((key.clone(), store.read(key)?)))
      .collect::<color_eyre::Result<Vec<_>>>()?;
    Ok(Self { entries })
  }

  /// Write every captured value back. Keys that had no entry are left alone.
  ///
  /// Returns the number of restored entries.
  pub fn restore(self, store: &QueryStore<T>) -> color_eyre::Result<usize> {
    let mut restored = 0;
    for (key, data) in self.entries {
      if let Some(data) = data {
        store.set(&key, data)?;
        restored += 1;
      }
    }
    Ok(restored)
  }
}

/// Phase bookkeeping for one invocation.
struct MutationRun {
  name: &'static str,
  phase: MutationPhase,
  transitions: Vec<MutationPhase>,
}

impl MutationRun {
  fn new(name: &'static str) -> Self {
    Self {
      name,
      phase: MutationPhase::Idle,
      transitions: vec![MutationPhase::Idle],
    }
  }

  fn advance(&mut self, next: MutationPhase) {
    debug_assert!(
      self.phase.can_advance_to(next),
      "illegal mutation transition {:?} -> {:?}",
      self.phase,
      next
    );
    debug!(mutation = self.name, from = ?self.phase, to = ?next, "mutation transition");
    self.phase = next;
    self.transitions.push(next);
  }
}

/// Invalidates the settle keys when dropped.
struct SettleGuard<'a, T: Cacheable> {
  cache: &'a CacheLayer<T>,
  keys: Vec<QueryKey>,
}

impl<T: Cacheable> Drop for SettleGuard<'_, T> {
  fn drop(&mut self) {
    for key in &self.keys {
      if let Err(e) = self.cache.invalidate(key) {
        warn!(key = %key, error = %e, "failed to invalidate after mutation");
      }
    }
  }
}

type LockMap = std::sync::Mutex<HashMap<QueryKey, Arc<Mutex<()>>>>;

/// Per-key async locks, acquired in key order.
#[derive(Default)]
struct KeyLocks {
  locks: LockMap,
}

impl KeyLocks {
  fn map(&self) -> MutexGuard<'_, HashMap<QueryKey, Arc<Mutex<()>>>> {
    self.locks.lock().unwrap_or_else(PoisonError::into_inner)
  }

  async fn acquire(self: &Arc<Self>, keys: &[QueryKey]) -> KeyPermits {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();

    let handles: Vec<Arc<Mutex<()>>> = {
      let mut locks = self.map();
      sorted
        .iter()
        .map(|key| Arc::clone(locks.entry(key.clone()).or_default()))
        .collect()
    };

    let mut permits = KeyPermits {
      locks: Arc::clone(self),
      guards: Vec::with_capacity(handles.len()),
    };
    for handle in handles {
      permits.guards.push(handle.lock_owned().await);
    }
    permits
  }

  /// Drop locks nobody holds or waits for.
  fn prune(&self) {
    self.map().retain(|_, lock| Arc::strong_count(lock) > 1);
  }
}

/// Held locks of one mutation. Releases them and prunes idle ones on drop.
struct KeyPermits {
  locks: Arc<KeyLocks>,
  guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyPermits {
  fn drop(&mut self) {
    self.guards.clear();
    self.locks.prune();
  }
}

/// Runs optimistic mutations against a cache.
pub struct MutationCoordinator<T: Cacheable> {
  cache: CacheLayer<T>,
  locks: Option<Arc<KeyLocks>>,
}

impl<T: Cacheable> MutationCoordinator<T> {
  /// Create a coordinator that serializes mutations with overlapping keys.
  pub fn new(cache: CacheLayer<T>) -> Self {
    Self {
      cache,
      locks: Some(Arc::new(KeyLocks::default())),
    }
  }

  /// Enable or disable per-key serialization. Without it, concurrent
  /// mutations on one key interleave and the last write wins.
  pub fn with_serialization(mut self, serialize: bool) -> Self {
    self.locks = serialize.then(|| Arc::new(KeyLocks::default()));
    self
  }

  pub fn cache(&self) -> &CacheLayer<T> {
    &self.cache
  }

  /// Run `mutation` optimistically.
  pub async fn mutate<M>(&self, mutation: &M) -> MutationOutcome<M::Output, M::Error>
  where
    M: OptimisticMutation<T>,
  {
    let affected = mutation.affected_keys();
    let _permits = match &self.locks {
      Some(locks) => Some(locks.acquire(&affected).await),
      None => None,
    };

    let mut run = MutationRun::new(mutation.name());
    let result = {
      let _settle = SettleGuard {
        cache: &self.cache,
        keys: mutation.invalidation_keys(),
      };
      self.drive(mutation, &affected, &mut run).await
    };
    run.advance(MutationPhase::Settled);

    MutationOutcome {
      result,
      transitions: run.transitions,
    }
  }

  async fn drive<M>(
    &self,
    mutation: &M,
    affected: &[QueryKey],
    run: &mut MutationRun,
  ) -> Result<M::Output, MutationError<M::Error>>
  where
    M: OptimisticMutation<T>,
  {
    let store = self.cache.store();

    run.advance(MutationPhase::Cancelling);
    for key in affected {
      if let Err(e) = self.cache.cancel(key).await {
        run.advance(MutationPhase::RolledBack);
        return Err(MutationError::Cache(e));
      }
    }

    run.advance(MutationPhase::Snapshotting);
    let snapshot = match Snapshot::capture(store, affected) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        run.advance(MutationPhase::RolledBack);
        return Err(MutationError::Cache(e));
      }
    };

    run.advance(MutationPhase::Speculating);
    for key in affected {
      match store.update(key, |data| mutation.speculate(key, data)) {
        Ok(true) => debug!(mutation = run.name, key = %key, "applied speculative edit"),
        Ok(false) => debug!(mutation = run.name, key = %key, "no cached entry, nothing to speculate on"),
        Err(e) => {
          run.advance(MutationPhase::RolledBack);
          if let Err(restore_err) = snapshot.restore(store) {
            warn!(mutation = run.name, error = %restore_err, "rollback failed");
          }
          return Err(MutationError::Cache(e));
        }
      }
    }

    run.advance(MutationPhase::InFlight);
    match mutation.execute().await {
      Ok(output) => {
        run.advance(MutationPhase::Confirmed);
        Ok(output)
      }
      Err(error) => {
        warn!(mutation = run.name, error = %error, "mutation failed, rolling back");
        run.advance(MutationPhase::RolledBack);
        let restored = snapshot.restore(store).map_err(MutationError::Cache)?;
        debug!(mutation = run.name, restored, "restored snapshot");
        Err(MutationError::Rejected(error))
      }
    }
  }
}

impl<T: Cacheable> Clone for MutationCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      locks: self.locks.clone(),
    }
  }
}

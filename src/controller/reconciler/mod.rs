//! # Reconciler
//!
//! Cascade reconciliation for BindingConfigs and the (config, instance) pairs
//! they produce.
//!
//! ## Module Structure
//!
//! - `types.rs` - Errors, backoff state, pair identities and pass summaries
//! - `cascade.rs` - Config apply/cleanup and the per-pair upsert/delete paths
//! - `status.rs` - BindingConfig status construction and writes
//! - `utils.rs` - Small helpers

mod cascade;
pub mod status;
mod types;
mod utils;

pub use types::{ApplySummary, BackoffState, PairAction, PairKey, PairUnit, ReconcilerError};

use crate::controller::watch_manager::WatchManager;
use crate::store::ObjectStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type PairLocks = Arc<Mutex<HashMap<PairKey, Arc<AsyncMutex<()>>>>>;

#[derive(Clone)]
pub struct Reconciler {
    pub store: Arc<dyn ObjectStore>,
    pub watches: Arc<WatchManager>,
    // Backoff state per BindingConfig name, owned by the error policy
    pub backoff_states: Arc<Mutex<HashMap<String, BackoffState>>>,
    // Serializes work on one (config, instance) pair; entries live only while held or awaited
    pub pair_locks: PairLocks,
}

/// Exclusive hold on one (config, instance) pair.
///
/// Dropping the guard releases the lock and removes the map entry once no
/// other task holds or waits for it.
pub struct PairGuard {
    locks: PairLocks,
    pair: PairKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for PairGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairGuard").field("pair", &self.pair).finish_non_exhaustive()
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.pair).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.pair);
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("watches", &self.watches)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, watches: Arc<WatchManager>) -> Self {
        Self {
            store,
            watches,
            backoff_states: Arc::new(Mutex::new(HashMap::new())),
            pair_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to a (config, instance) pair
    pub async fn lock_pair(&self, pair: &PairKey) -> PairGuard {
        let lock = {
            let mut locks = self.pair_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                locks
                    .entry(pair.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        PairGuard {
            locks: Arc::clone(&self.pair_locks),
            pair: pair.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of pairs currently locked or awaited
    pub fn pair_lock_count(&self) -> usize {
        self.pair_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Clear the error backoff for a config after a successful pass
    pub fn reset_backoff(&self, config_name: &str) {
        let mut states = self.backoff_states.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = states.get_mut(config_name) {
            state.reset();
        }
    }

    pub fn forget_backoff(&self, config_name: &str) {
        self.backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(config_name);
    }
}

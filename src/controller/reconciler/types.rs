//! # Types
//!
//! Core types for the reconciler.

use crate::controller::backoff::FibonacciBackoff;
use crate::controller::watch_manager::KindKey;
use crate::store::StoreError;
use kube::core::ApiResource;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("cannot resolve target kind for BindingConfig {config}: {reason}")]
    KindResolution { config: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("InstanceProxy {namespace}/{name} belongs to {owner}, refusing to take it over for {pair}")]
    NameCollision {
        namespace: String,
        name: String,
        owner: String,
        pair: String,
    },

    #[error("gave up on {pair} after {attempts} conflicting updates")]
    ConflictRetriesExhausted { pair: String, attempts: u32 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube_runtime::finalizer::Error<ReconcilerError>>),
}

impl ReconcilerError {
    /// Short label for metrics
    pub fn metric_label(&self) -> &'static str {
        match self {
            ReconcilerError::KindResolution { .. } => "kind_resolution",
            ReconcilerError::Store(_) => "store",
            ReconcilerError::NameCollision { .. } => "name_collision",
            ReconcilerError::ConflictRetriesExhausted { .. } => "conflict",
            ReconcilerError::Serialization(_) => "serialization",
            ReconcilerError::Finalizer(_) => "finalizer",
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, ReconcilerError::Store(e) if e.is_conflict())
    }
}

/// Backoff state for a specific resource
/// Tracks error count and backoff calculator for progressive retries
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new(start_ms: u64, max_ms: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(start_ms, max_ms),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count += 1;
    }

    pub fn reset(&mut self) {
        self.error_count = 0;
        self.backoff.reset();
    }
}

/// Identity of one (BindingConfig, instance) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub config_ref: String,
    pub namespace: String,
    pub name: String,
}

impl PairKey {
    pub fn new(config_ref: &str, namespace: &str, name: &str) -> Self {
        Self {
            config_ref: config_ref.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}/{}", self.config_ref, self.namespace, self.name)
    }
}

/// One schedulable piece of work derived from an instance event
#[derive(Debug, Clone)]
pub struct PairUnit {
    pub pair: PairKey,
    pub kind: KindKey,
    pub resource: ApiResource,
}

/// What a pair unit ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairAction {
    Upserted,
    Deleted,
    Skipped,
}

/// Result of one full pass over a BindingConfig's instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Instances whose proxy and artifact are in place
    pub instances: usize,
    /// Instances whose upsert failed
    pub failed: usize,
    /// Stale proxies removed
    pub removed: usize,
}

impl ApplySummary {
    pub fn is_degraded(&self) -> bool {
        self.failed > 0
    }
}

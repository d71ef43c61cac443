//! # Object Store
//!
//! Abstraction over the cluster object store the controller reads and writes.
//!
//! Each backend implements the [`ObjectStore`] trait:
//! - [`KubeStore`] talks to the Kubernetes API server
//! - [`MemoryStore`] keeps everything in process (tests and local runs)
//!
//! Objects cross the trait as [`DynamicObject`]; [`typed`] converts to and
//! from the CRD and `k8s-openapi` types.

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{ApiResource, DynamicObject};
use std::fmt;
use thiserror::Error;

mod cluster;
mod index;
pub mod memory;
pub mod typed;

pub use cluster::KubeStore;
pub use index::{FieldIndexer, FieldSelector, IndexRegistry};
pub use memory::MemoryStore;

/// Namespace/name identity of a stored object
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Key of a dynamic object, if it carries a name
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let name = obj.metadata.name.clone()?;
        Some(Self {
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Change notification from a watch stream
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Updated(DynamicObject),
    Deleted(DynamicObject),
}

impl WatchEvent {
    pub fn object(&self) -> &DynamicObject {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Updated(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }

    /// Short label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Updated(_) => "updated",
            WatchEvent::Deleted(_) => "deleted",
        }
    }
}

/// Object store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: ObjectKey },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: ObjectKey },

    #[error("conflict updating {kind} {key}: the object has been modified")]
    Conflict { kind: String, key: ObjectKey },

    #[error("resource kind {kind} not found in {group_version}")]
    KindNotFound { group_version: String, kind: String },

    #[error("object of kind {kind} has no name")]
    MissingName { kind: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("watch stream error: {0}")]
    Watch(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Backend-agnostic object store
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Resolve `group/version` plus a kind or plural to an API resource
    async fn resolve(&self, group: &str, version: &str, kind: &str) -> StoreResult<ApiResource>;

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<DynamicObject>>;

    /// List objects, optionally scoped to a namespace and filtered by a field index
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: Option<&FieldSelector>,
    ) -> StoreResult<Vec<DynamicObject>>;

    /// Create an object; `AlreadyExists` when the name is taken
    async fn create(&self, resource: &ApiResource, obj: DynamicObject) -> StoreResult<DynamicObject>;

    /// Replace an object.
    ///
    /// When `metadata.resourceVersion` is set and stale the call fails with
    /// `Conflict`; when unset the replace is unconditional.
    async fn update(&self, resource: &ApiResource, obj: DynamicObject) -> StoreResult<DynamicObject>;

    /// Replace only the `status` of an object
    async fn update_status(
        &self,
        resource: &ApiResource,
        obj: DynamicObject,
    ) -> StoreResult<DynamicObject>;

    /// Delete an object; `NotFound` when absent
    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> StoreResult<()>;

    /// Stream changes to objects of a resource.
    ///
    /// The stream starts with an `Added` event for every existing object.
    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> StoreResult<BoxStream<'static, StoreResult<WatchEvent>>>;
}

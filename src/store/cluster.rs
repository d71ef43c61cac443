//! # Kubernetes Object Store
//!
//! [`ObjectStore`] backed by the Kubernetes API server.
//!
//! Field indexes are materialized as labels: on every write the store stamps
//! `index.binding.operators.coreos.com/<field>=<digest>` where the digest is a
//! truncated SHA-256 of the indexed value (label values are limited to 63
//! characters and a restricted alphabet). Index queries use a label selector
//! and then filter the results on the exact value, so digest collisions can
//! never leak foreign objects.

use super::{
    FieldIndexer, FieldSelector, IndexRegistry, ObjectKey, ObjectStore, StoreError, StoreResult,
    WatchEvent,
};
use crate::constants::INDEX_LABEL_PREFIX;
use crate::crd::proxy_indexers;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersion};
use kube::Client;
use kube_runtime::{watcher, WatchStreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Hex characters kept from the SHA-256 of an index value
const INDEX_DIGEST_LEN: usize = 40;

/// Kubernetes-backed object store
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: IndexRegistry,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    /// Store maintaining the InstanceProxy indexes
    pub fn new(client: Client) -> Self {
        Self::with_indexers(client, proxy_indexers())
    }

    pub fn with_indexers(client: Client, indexers: Vec<FieldIndexer>) -> Self {
        Self {
            client,
            registry: IndexRegistry::new(indexers),
        }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    /// Stamp index labels for every indexer that applies to `resource`
    fn stamp_index_labels(&self, resource: &ApiResource, obj: &mut DynamicObject) {
        let stamped: Vec<(String, Option<String>)> = self
            .registry
            .for_resource(resource)
            .map(|indexer| {
                (
                    index_label_key(indexer.field),
                    (indexer.extract)(obj).map(|v| index_label_value(&v)),
                )
            })
            .collect();
        if stamped.is_empty() {
            return;
        }

        let labels = obj.metadata.labels.get_or_insert_with(Default::default);
        for (key, value) in stamped {
            match value {
                Some(value) => {
                    labels.insert(key, value);
                }
                None => {
                    labels.remove(&key);
                }
            }
        }
    }
}

/// Label key for an indexed field (`.spec.config_ref` -> `.../spec.config_ref`)
fn index_label_key(field: &str) -> String {
    format!("{INDEX_LABEL_PREFIX}/{}", field.trim_start_matches('.'))
}

fn index_label_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..INDEX_DIGEST_LEN].to_string()
}

/// Translate API errors into store errors for one object
fn map_api_error(resource: &ApiResource, key: ObjectKey, err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound {
            kind: resource.kind.clone(),
            key,
        },
        kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind: resource.kind.clone(),
                key,
            }
        }
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict {
            kind: resource.kind.clone(),
            key,
        },
        _ => StoreError::Kube(err),
    }
}

fn required_key(resource: &ApiResource, obj: &DynamicObject) -> StoreResult<ObjectKey> {
    ObjectKey::of(obj).ok_or_else(|| StoreError::MissingName {
        kind: resource.kind.clone(),
    })
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn resolve(&self, group: &str, version: &str, kind: &str) -> StoreResult<ApiResource> {
        let gv = GroupVersion::gv(group, version);
        let api_group = kube::discovery::pinned_group(&self.client, &gv).await?;
        api_group
            .versioned_resources(version)
            .into_iter()
            .map(|(resource, _caps)| resource)
            .find(|r| r.plural == kind || r.kind.eq_ignore_ascii_case(kind))
            .ok_or_else(|| StoreError::KindNotFound {
                group_version: format!("{group}/{version}"),
                kind: kind.to_string(),
            })
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> StoreResult<Option<DynamicObject>> {
        self.api(resource, namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error(resource, ObjectKey::new(namespace, name), e))
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: Option<&FieldSelector>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let api = self.api(resource, namespace);
        let Some(selector) = selector else {
            return Ok(api.list(&ListParams::default()).await?.items);
        };

        if self.registry.get(resource, &selector.field).is_some() {
            let label_selector = format!(
                "{}={}",
                index_label_key(&selector.field),
                index_label_value(&selector.value)
            );
            let items = api.list(&ListParams::default().labels(&label_selector)).await?.items;
            return Ok(items
                .into_iter()
                .filter(|obj| self.registry.matches(resource, selector, obj))
                .collect());
        }

        // Not one of ours: hand it to the API server as a real field selector.
        let field_selector = format!("{}={}", selector.field, selector.value);
        Ok(api.list(&ListParams::default().fields(&field_selector)).await?.items)
    }

    async fn create(&self, resource: &ApiResource, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = required_key(resource, &obj)?;
        self.stamp_index_labels(resource, &mut obj);
        debug!(kind = %resource.kind, key = %key, "Creating object");
        self.api(resource, key.namespace.as_deref())
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_api_error(resource, key, e))
    }

    async fn update(&self, resource: &ApiResource, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = required_key(resource, &obj)?;
        self.stamp_index_labels(resource, &mut obj);
        self.api(resource, key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_api_error(resource, key, e))
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        obj: DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let key = required_key(resource, &obj)?;
        let status = obj.data.get("status").cloned().unwrap_or(serde_json::Value::Null);
        let patch = match obj.metadata.resource_version.as_deref() {
            Some(rv) => json!({"metadata": {"resourceVersion": rv}, "status": status}),
            None => json!({ "status": status }),
        };
        self.api(resource, key.namespace.as_deref())
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_api_error(resource, key, e))
    }

    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        self.api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error(resource, ObjectKey::new(namespace, name), e))
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> StoreResult<BoxStream<'static, StoreResult<WatchEvent>>> {
        let kind = resource.kind.clone();
        let stream = watcher(self.api(resource, namespace), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let mapped = match event {
                    Ok(watcher::Event::InitApply(obj)) => Some(Ok(WatchEvent::Added(obj))),
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Updated(obj))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Watch stream error");
                        Some(Err(StoreError::Watch(e.to_string())))
                    }
                };
                futures::future::ready(mapped)
            });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_label_key_is_a_valid_label_name() {
        assert_eq!(
            index_label_key(".spec.config_ref"),
            "index.binding.operators.coreos.com/spec.config_ref"
        );
    }

    #[test]
    fn test_index_label_value_is_stable_and_short() {
        let a = index_label_value("team-a/db");
        assert_eq!(a.len(), INDEX_DIGEST_LEN);
        assert_eq!(a, index_label_value("team-a/db"));
        assert_ne!(a, index_label_value("team-a/cache"));
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

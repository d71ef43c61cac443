//! # In-Memory Object Store
//!
//! A process-local [`ObjectStore`] with the parts of API server behaviour the
//! controller relies on:
//!
//! - monotonically increasing `resourceVersion` and optimistic conflict detection
//! - `update` leaves `status` untouched, `update_status` touches nothing else
//! - secondary field indexes maintained on every write
//! - watch streams that replay existing objects as `Added`, then follow changes
//!
//! Used by the test-suite and for running the controller without a cluster.

use super::index::same_resource;
use super::{
    FieldIndexer, FieldSelector, IndexRegistry, ObjectKey, ObjectStore, StoreError, StoreResult,
    WatchEvent,
};
use crate::crd::{proxy_indexers, BindingConfig, InstanceProxy};
use crate::store::typed::api_resource;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::core::{ApiResource, DynamicObject};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

const WATCH_BUFFER: usize = 1024;

/// Collection identity inside the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TypeKey {
    group: String,
    plural: String,
}

impl TypeKey {
    fn of(resource: &ApiResource) -> Self {
        Self {
            group: resource.group.clone(),
            plural: resource.plural.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredEvent {
    type_key: TypeKey,
    namespace: Option<String>,
    event: WatchEvent,
}

type FieldIndex = HashMap<String, BTreeSet<ObjectKey>>;

#[derive(Debug, Default)]
struct State {
    objects: HashMap<TypeKey, BTreeMap<ObjectKey, DynamicObject>>,
    indexes: HashMap<(TypeKey, &'static str), FieldIndex>,
    kinds: Vec<ApiResource>,
    pending_conflicts: HashMap<TypeKey, u32>,
    resource_version: u64,
    uid: u64,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("00000000-0000-0000-0000-{:012x}", self.uid)
    }

    fn take_injected_conflict(&mut self, type_key: &TypeKey) -> bool {
        match self.pending_conflicts.get_mut(type_key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn reindex(
        &mut self,
        indexers: &[&FieldIndexer],
        type_key: &TypeKey,
        key: &ObjectKey,
        old: Option<&DynamicObject>,
        new: Option<&DynamicObject>,
    ) {
        for indexer in indexers {
            let index = self
                .indexes
                .entry((type_key.clone(), indexer.field))
                .or_default();
            if let Some(value) = old.and_then(|o| (indexer.extract)(o)) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
            if let Some(value) = new.and_then(|n| (indexer.extract)(n)) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<StoredEvent>,
    registry: IndexRegistry,
}

/// In-process object store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with the controller's own kinds, `Secret`, `ConfigMap` and the
    /// InstanceProxy indexes registered
    pub fn new() -> Self {
        let store = Self::with_indexers(proxy_indexers());
        store.register_kind(api_resource::<BindingConfig>());
        store.register_kind(api_resource::<InstanceProxy>());
        store.register_kind(api_resource::<Secret>());
        store.register_kind(api_resource::<ConfigMap>());
        store
    }

    /// Empty store maintaining the given indexes
    pub fn with_indexers(indexers: Vec<FieldIndexer>) -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                registry: IndexRegistry::new(indexers),
            }),
        }
    }

    /// Make a kind discoverable through [`ObjectStore::resolve`]
    pub fn register_kind(&self, resource: ApiResource) {
        let mut state = self.lock();
        if !state.kinds.iter().any(|k| same_resource(k, &resource) && k.version == resource.version) {
            state.kinds.push(resource);
        }
    }

    /// Fail the next `count` updates of `resource` with `Conflict`
    pub fn inject_conflicts(&self, resource: &ApiResource, count: u32) {
        self.lock()
            .pending_conflicts
            .insert(TypeKey::of(resource), count);
    }

    /// Number of live watch streams
    pub fn watcher_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn indexers_for<'a>(&'a self, resource: &'a ApiResource) -> Vec<&'a FieldIndexer> {
        self.inner.registry.for_resource(resource).collect()
    }

    fn publish(&self, type_key: &TypeKey, event: WatchEvent) {
        let namespace = event.object().metadata.namespace.clone();
        // No receivers is not an error.
        let _ = self.inner.events.send(StoredEvent {
            type_key: type_key.clone(),
            namespace,
            event,
        });
    }

    fn key_for(resource: &ApiResource, obj: &DynamicObject) -> StoreResult<ObjectKey> {
        ObjectKey::of(obj).ok_or_else(|| StoreError::MissingName {
            kind: resource.kind.clone(),
        })
    }
}

fn namespace_matches(filter: Option<&str>, namespace: Option<&str>) -> bool {
    filter.is_none() || filter == namespace
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn resolve(&self, group: &str, version: &str, kind: &str) -> StoreResult<ApiResource> {
        let state = self.lock();
        state
            .kinds
            .iter()
            .find(|r| {
                r.group == group
                    && r.version == version
                    && (r.plural == kind || r.kind.eq_ignore_ascii_case(kind))
            })
            .cloned()
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
        let state = self.lock();
        let key = ObjectKey::new(namespace, name);
        Ok(state
            .objects
            .get(&TypeKey::of(resource))
            .and_then(|objects| objects.get(&key))
            .cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        selector: Option<&FieldSelector>,
    ) -> StoreResult<Vec<DynamicObject>> {
        let state = self.lock();
        let type_key = TypeKey::of(resource);
        let Some(objects) = state.objects.get(&type_key) else {
            return Ok(Vec::new());
        };

        let in_namespace =
            |key: &ObjectKey| namespace_matches(namespace, key.namespace.as_deref());

        let found = match selector {
            Some(selector) => {
                let indexed = self
                    .inner
                    .registry
                    .get(resource, &selector.field)
                    .map(|indexer| (type_key.clone(), indexer.field))
                    .and_then(|index_key| state.indexes.get(&index_key))
                    .and_then(|index| index.get(&selector.value));
                indexed
                    .into_iter()
                    .flatten()
                    .filter(|key| in_namespace(key))
                    .filter_map(|key| objects.get(key).cloned())
                    .collect()
            }
            None => objects
                .iter()
                .filter(|(key, _)| in_namespace(key))
                .map(|(_, obj)| obj.clone())
                .collect(),
        };
        Ok(found)
    }

    async fn create(&self, resource: &ApiResource, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = Self::key_for(resource, &obj)?;
        let type_key = TypeKey::of(resource);
        let indexers = self.indexers_for(resource);

        let mut state = self.lock();
        if state
            .objects
            .get(&type_key)
            .is_some_and(|objects| objects.contains_key(&key))
        {
            return Err(StoreError::AlreadyExists {
                kind: resource.kind.clone(),
                key,
            });
        }

        obj.metadata.resource_version = Some(state.next_resource_version());
        obj.metadata.uid = Some(state.next_uid());
        obj.metadata.generation = Some(1);
        if obj.types.is_none() {
            obj.types = Some(kube::core::TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            });
        }

        state.reindex(&indexers, &type_key, &key, None, Some(&obj));
        state
            .objects
            .entry(type_key.clone())
            .or_default()
            .insert(key.clone(), obj.clone());
        self.publish(&type_key, WatchEvent::Added(obj.clone()));
        debug!(kind = %resource.kind, key = %key, "memory store: created");
        Ok(obj)
    }

    async fn update(&self, resource: &ApiResource, mut obj: DynamicObject) -> StoreResult<DynamicObject> {
        let key = Self::key_for(resource, &obj)?;
        let type_key = TypeKey::of(resource);
        let indexers = self.indexers_for(resource);

        let mut state = self.lock();
        let Some(stored) = state
            .objects
            .get(&type_key)
            .and_then(|objects| objects.get(&key))
            .cloned()
        else {
            return Err(StoreError::NotFound {
                kind: resource.kind.clone(),
                key,
            });
        };

        let stale = obj
            .metadata
            .resource_version
            .as_ref()
            .is_some_and(|rv| Some(rv) != stored.metadata.resource_version.as_ref());
        if stale || state.take_injected_conflict(&type_key) {
            return Err(StoreError::Conflict {
                kind: resource.kind.clone(),
                key,
            });
        }

        match (stored.data.get("status"), obj.data.as_object_mut()) {
            (Some(status), Some(fields)) => {
                fields.insert("status".to_string(), status.clone());
            }
            (None, Some(fields)) => {
                fields.remove("status");
            }
            _ => {}
        }

        let generation = stored.metadata.generation.unwrap_or(1);
        let spec_changed = stored.data.get("spec") != obj.data.get("spec");
        obj.metadata.generation = Some(if spec_changed { generation + 1 } else { generation });
        obj.metadata.uid = stored.metadata.uid.clone();
        obj.metadata.resource_version = Some(state.next_resource_version());
        if obj.types.is_none() {
            obj.types = stored.types.clone();
        }

        state.reindex(&indexers, &type_key, &key, Some(&stored), Some(&obj));
        state
            .objects
            .entry(type_key.clone())
            .or_default()
            .insert(key, obj.clone());
        self.publish(&type_key, WatchEvent::Updated(obj.clone()));
        Ok(obj)
    }

    async fn update_status(
        &self,
        resource: &ApiResource,
        obj: DynamicObject,
    ) -> StoreResult<DynamicObject> {
        let key = Self::key_for(resource, &obj)?;
        let type_key = TypeKey::of(resource);

        let mut state = self.lock();
        let Some(mut stored) = state
            .objects
            .get(&type_key)
            .and_then(|objects| objects.get(&key))
            .cloned()
        else {
            return Err(StoreError::NotFound {
                kind: resource.kind.clone(),
                key,
            });
        };

        let stale = obj
            .metadata
            .resource_version
            .as_ref()
            .is_some_and(|rv| Some(rv) != stored.metadata.resource_version.as_ref());
        if stale || state.take_injected_conflict(&type_key) {
            return Err(StoreError::Conflict {
                kind: resource.kind.clone(),
                key,
            });
        }

        if let Some(fields) = stored.data.as_object_mut() {
            match obj.data.get("status") {
                Some(status) => {
                    fields.insert("status".to_string(), status.clone());
                }
                None => {
                    fields.remove("status");
                }
            }
        }
        stored.metadata.resource_version = Some(state.next_resource_version());

        state
            .objects
            .entry(type_key.clone())
            .or_default()
            .insert(key, stored.clone());
        self.publish(&type_key, WatchEvent::Updated(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, resource: &ApiResource, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        let key = ObjectKey::new(namespace, name);
        let type_key = TypeKey::of(resource);
        let indexers = self.indexers_for(resource);

        let mut state = self.lock();
        let removed = state
            .objects
            .get_mut(&type_key)
            .and_then(|objects| objects.remove(&key));
        let Some(removed) = removed else {
            return Err(StoreError::NotFound {
                kind: resource.kind.clone(),
                key,
            });
        };

        state.reindex(&indexers, &type_key, &key, Some(&removed), None);
        self.publish(&type_key, WatchEvent::Deleted(removed));
        debug!(kind = %resource.kind, key = %key, "memory store: deleted");
        Ok(())
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
    ) -> StoreResult<BoxStream<'static, StoreResult<WatchEvent>>> {
        let type_key = TypeKey::of(resource);
        let namespace = namespace.map(str::to_string);

        // Subscribe and snapshot under the same lock so no write falls between them.
        let (receiver, snapshot) = {
            let state = self.lock();
            let receiver = self.inner.events.subscribe();
            let snapshot: Vec<StoreResult<WatchEvent>> = state
                .objects
                .get(&type_key)
                .into_iter()
                .flat_map(|objects| objects.iter())
                .filter(|(key, _)| namespace_matches(namespace.as_deref(), key.namespace.as_deref()))
                .map(|(_, obj)| Ok(WatchEvent::Added(obj.clone())))
                .collect();
            (receiver, snapshot)
        };

        let live = stream::unfold(
            (receiver, type_key, namespace),
            |(mut receiver, type_key, namespace)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(stored) => {
                            if stored.type_key == type_key
                                && namespace_matches(namespace.as_deref(), stored.namespace.as_deref())
                            {
                                return Some((Ok(stored.event), (receiver, type_key, namespace)));
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            let err = StoreError::Watch(format!("watch lagged, {missed} events dropped"));
                            return Some((Err(err), (receiver, type_key, namespace)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(stream::iter(snapshot).chain(live).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{instance_index_value, CONFIG_INDEX, INSTANCE_INDEX};
    use crate::store::typed::{to_dynamic, TypedStoreExt};
    use std::time::Duration;

    fn proxy(config: &str, namespace: &str, instance: &str) -> InstanceProxy {
        InstanceProxy::for_instance(config, namespace, instance)
    }

    #[tokio::test]
    async fn test_create_assigns_versions_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect("create should succeed");
        assert_eq!(created.metadata.resource_version.as_deref(), Some("1"));
        assert!(created.metadata.uid.is_some());

        let err = store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect_err("duplicate create should fail");
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = MemoryStore::new();
        let created = store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect("create should succeed");

        let mut first = created.clone();
        first.spec.config_ref = "other".to_string();
        store.update_typed(&first).await.expect("first update should succeed");

        let err = store
            .update_typed(&created)
            .await
            .expect_err("stale update should conflict");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_without_resource_version_is_unconditional() {
        let store = MemoryStore::new();
        store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect("create should succeed");

        let mut replacement = proxy("cfg", "ns", "db");
        replacement.metadata.resource_version = None;
        let updated = store
            .update_typed(&replacement)
            .await
            .expect("unconditional update should succeed");
        assert_eq!(updated.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_update_preserves_status_and_update_status_preserves_spec() {
        let store = MemoryStore::new();
        let mut created = store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect("create should succeed");

        created.status = Some(crate::crd::InstanceProxyStatus {
            artifact_name: Some("db-cfg-sed".to_string()),
        });
        let with_status = store
            .update_status_typed(&created)
            .await
            .expect("status update should succeed");

        let mut respec = with_status.clone();
        respec.status = None;
        respec.spec.config_ref = "cfg2".to_string();
        let updated = store.update_typed(&respec).await.expect("update should succeed");

        assert_eq!(updated.spec.config_ref, "cfg2");
        assert_eq!(
            updated.status.and_then(|s| s.artifact_name).as_deref(),
            Some("db-cfg-sed")
        );
        assert_eq!(updated.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_index_follows_updates_and_deletes() {
        let store = MemoryStore::new();
        let created = store
            .create_typed(&proxy("cfg-a", "ns", "db"))
            .await
            .expect("create should succeed");
        store
            .create_typed(&proxy("cfg-b", "ns", "cache"))
            .await
            .expect("create should succeed");

        let by_config = |config: &str| FieldSelector::new(CONFIG_INDEX, config);

        let owned: Vec<InstanceProxy> = store
            .list_typed(None, Some(&by_config("cfg-a")))
            .await
            .expect("list should succeed");
        assert_eq!(owned.len(), 1);

        let mut moved = created.clone();
        moved.spec.config_ref = "cfg-b".to_string();
        store.update_typed(&moved).await.expect("update should succeed");

        let owned_a: Vec<InstanceProxy> = store
            .list_typed(None, Some(&by_config("cfg-a")))
            .await
            .expect("list should succeed");
        let owned_b: Vec<InstanceProxy> = store
            .list_typed(None, Some(&by_config("cfg-b")))
            .await
            .expect("list should succeed");
        assert!(owned_a.is_empty());
        assert_eq!(owned_b.len(), 2);

        let name = created.metadata.name.clone().unwrap_or_default();
        store
            .delete_typed::<InstanceProxy>(Some("ns"), &name)
            .await
            .expect("delete should succeed");
        let by_instance = FieldSelector::new(INSTANCE_INDEX, instance_index_value("ns", "db"));
        let remaining: Vec<InstanceProxy> = store
            .list_typed(None, Some(&by_instance))
            .await
            .expect("list should succeed");
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .delete_typed::<InstanceProxy>(Some("ns"), "nope")
            .await
            .expect_err("delete should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let store = MemoryStore::new();
        let created = store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect("create should succeed");
        store.inject_conflicts(&api_resource::<InstanceProxy>(), 1);

        let err = store.update_typed(&created).await.expect_err("should conflict");
        assert!(err.is_conflict());
        store.update_typed(&created).await.expect("second attempt should succeed");
    }

    #[tokio::test]
    async fn test_watch_replays_then_follows() {
        let store = MemoryStore::new();
        store
            .create_typed(&proxy("cfg", "ns", "db"))
            .await
            .expect("create should succeed");

        let resource = api_resource::<InstanceProxy>();
        let mut events = store.watch(&resource, Some("ns")).await.expect("watch should open");

        let first = events.next().await.expect("replay event").expect("no error");
        assert!(matches!(first, WatchEvent::Added(_)));

        store
            .create_typed(&proxy("cfg", "other-ns", "ignored"))
            .await
            .expect("create should succeed");
        store
            .delete_typed::<InstanceProxy>(Some("ns"), "db-cfg")
            .await
            .expect("delete should succeed");

        let next = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("event should arrive")
            .expect("stream open")
            .expect("no error");
        match next {
            WatchEvent::Deleted(obj) => assert_eq!(obj.metadata.name.as_deref(), Some("db-cfg")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_by_kind_or_plural() {
        let store = MemoryStore::new();
        let by_plural = store
            .resolve("", "v1", "secrets")
            .await
            .expect("plural should resolve");
        let by_kind = store
            .resolve("", "v1", "Secret")
            .await
            .expect("kind should resolve");
        assert_eq!(by_plural.plural, by_kind.plural);

        let err = store
            .resolve("apps", "v1", "deployments")
            .await
            .expect_err("unregistered kind should fail");
        assert!(matches!(err, StoreError::KindNotFound { .. }));
    }

    #[test]
    fn test_dynamic_conversion_keeps_name() {
        let obj = to_dynamic(&proxy("cfg", "ns", "db")).expect("convert");
        assert_eq!(ObjectKey::of(&obj), Some(ObjectKey::new(Some("ns"), "db-cfg")));
    }
}

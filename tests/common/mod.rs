//! Common test utilities
//!
//! Builds a reconciler over an in-memory store with two instance kinds
//! registered (`databases` and `caches` in `example.com/v1`).

#![allow(dead_code, reason = "each test binary uses a different subset of helpers")]

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, ObjectMeta};
use serde_json::Value;
use service_mapper_controller::config::ControllerConfig;
use service_mapper_controller::controller::reconciler::Reconciler;
use service_mapper_controller::controller::watch_manager::{InstanceEvent, WatchManager};
use service_mapper_controller::crd::{artifact_name, proxy_name, BindingConfig, BindingConfigSpec, TargetKind};
use service_mapper_controller::store::typed::TypedStoreExt;
use service_mapper_controller::store::{MemoryStore, ObjectStore};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn databases() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("example.com", "v1", "Database"))
}

pub fn caches() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("example.com", "v1", "Cache"))
}

pub struct Harness {
    pub store: MemoryStore,
    pub reconciler: Arc<Reconciler>,
    pub events: mpsc::Receiver<InstanceEvent>,
}

pub fn harness() -> Harness {
    let store = MemoryStore::new();
    store.register_kind(databases());
    store.register_kind(caches());

    let shared: Arc<dyn ObjectStore> = Arc::new(store.clone());
    let (tx, events) = mpsc::channel(256);
    let watches = Arc::new(WatchManager::new(
        Arc::clone(&shared),
        None,
        tx,
        Duration::from_millis(20),
    ));

    Harness {
        store,
        reconciler: Arc::new(Reconciler::new(shared, watches)),
        events,
    }
}

/// Settings tuned for fast retries in tests
pub fn test_settings() -> ControllerConfig {
    ControllerConfig {
        instance_retry_attempts: 3,
        instance_retry_delay_ms: 10,
        max_concurrent_reconciliations: 4,
        ..ControllerConfig::default()
    }
}

pub fn config(name: &str, plural: &str, rules: &[(&str, &str)]) -> BindingConfig {
    BindingConfig::new(
        name,
        BindingConfigSpec {
            target_kind: TargetKind {
                api_group: "example.com/v1".to_string(),
                kind: plural.to_string(),
            },
            rule_set: rules
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        },
    )
}

/// Store a BindingConfig and return the stored copy (with uid and generation)
pub async fn store_config(store: &MemoryStore, config: &BindingConfig) -> BindingConfig {
    store
        .create_typed(config)
        .await
        .expect("config should be created")
}

pub async fn create_instance(
    store: &MemoryStore,
    resource: &ApiResource,
    namespace: &str,
    name: &str,
    spec: Value,
) -> DynamicObject {
    let mut obj = DynamicObject::new(name, resource).data(serde_json::json!({ "spec": spec }));
    obj.metadata.namespace = Some(namespace.to_string());
    store
        .create(resource, obj)
        .await
        .expect("instance should be created")
}

pub async fn create_secret(store: &MemoryStore, namespace: &str, name: &str, data: &[(&str, &str)]) {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    };
    store
        .create_typed(&secret)
        .await
        .expect("secret should be created");
}

pub async fn create_config_map(store: &MemoryStore, namespace: &str, name: &str, data: &[(&str, &str)]) {
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ),
        ..Default::default()
    };
    store
        .create_typed(&config_map)
        .await
        .expect("config map should be created");
}

/// Name of the InstanceProxy for a (config, instance) pair
pub fn proxy_of(config: &str, namespace: &str, instance: &str) -> String {
    proxy_name(config, namespace, instance)
}

/// Name of the derived artifact for a (config, instance) pair
pub fn artifact_of(config: &str, namespace: &str, instance: &str) -> String {
    artifact_name(&proxy_name(config, namespace, instance))
}

pub async fn get_artifact(store: &MemoryStore, namespace: &str, name: &str) -> Option<Secret> {
    store
        .get_typed::<Secret>(Some(namespace), name)
        .await
        .expect("store get should succeed")
}

/// Decoded content of a derived artifact Secret
pub async fn artifact_content(store: &MemoryStore, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
    let secret = get_artifact(store, namespace, name).await?;
    Some(
        secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, String::from_utf8(v.0).expect("artifact values are utf-8")))
            .collect(),
    )
}

pub fn bindings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Evaluates a single binding rule against one instance.

use super::error::EvalError;
use super::path::PathError;
use super::rule::{ObjectType, ReferenceRule, Rule};
use crate::store::typed::api_resource;
use crate::store::ObjectStore;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::core::DynamicObject;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Output key to value produced by one rule
pub type Bindings = BTreeMap<String, String>;

/// Evaluate `rule` for `output_key` against `instance`.
///
/// Reference rules look objects up in `namespace` through `lookup`; nothing
/// else touches the store.
pub async fn evaluate(
    output_key: &str,
    rule: &Rule,
    instance: &Value,
    lookup: &dyn ObjectStore,
    namespace: &str,
) -> Result<Bindings, EvalError> {
    match rule {
        Rule::Literal(value) => Ok(Bindings::from([(output_key.to_string(), value.clone())])),
        Rule::Path(path) => {
            let value = path.evaluate(instance)?;
            Ok(Bindings::from([(output_key.to_string(), value)]))
        }
        Rule::Reference(reference) => {
            evaluate_reference(output_key, reference, instance, lookup, namespace).await
        }
    }
}

/// Parse `expr` and evaluate it
pub async fn evaluate_expr(
    output_key: &str,
    expr: &str,
    instance: &Value,
    lookup: &dyn ObjectStore,
    namespace: &str,
) -> Result<Bindings, EvalError> {
    let rule = Rule::parse(expr)?;
    evaluate(output_key, &rule, instance, lookup, namespace).await
}

async fn evaluate_reference(
    output_key: &str,
    reference: &ReferenceRule,
    instance: &Value,
    lookup: &dyn ObjectStore,
    namespace: &str,
) -> Result<Bindings, EvalError> {
    let name = reference.name_path.evaluate(instance)?;
    if name.is_empty() {
        return Err(PathError::Unresolved {
            path: reference.name_path.source().to_string(),
            reason: "resolved to an empty object name".to_string(),
        }
        .into());
    }

    let resource = match reference.object_type {
        ObjectType::Secret => api_resource::<Secret>(),
        ObjectType::ConfigMap => api_resource::<ConfigMap>(),
    };
    let not_found = || EvalError::ReferenceNotFound {
        object_type: reference.object_type.to_string(),
        namespace: namespace.to_string(),
        name: name.clone(),
    };

    let obj = match lookup.get(&resource, Some(namespace), &name).await {
        Ok(Some(obj)) => obj,
        Ok(None) => return Err(not_found()),
        Err(e) if e.is_not_found() => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    debug!(
        object_type = %reference.object_type,
        resource.namespace = namespace,
        resource.name = name.as_str(),
        "Resolved referenced object"
    );

    let mut entries = match reference.object_type {
        ObjectType::Secret => secret_entries(&obj),
        ObjectType::ConfigMap => string_map(&obj, "data"),
    };

    match &reference.key {
        Some(key) => match entries.remove(key) {
            Some(value) => Ok(Bindings::from([(output_key.to_string(), value)])),
            None => Err(EvalError::MissingReferenceKey {
                object_type: reference.object_type.to_string(),
                namespace: namespace.to_string(),
                name,
                key: key.clone(),
            }),
        },
        None => Ok(entries),
    }
}

/// Decoded Secret content
///
/// `data` holds base64 wire values; entries that fail to decode are skipped.
/// `stringData` (only present on objects that never went through an API
/// server) overrides `data`.
fn secret_entries(obj: &DynamicObject) -> Bindings {
    let mut entries = Bindings::new();
    if let Some(Value::Object(data)) = obj.data.get("data") {
        for (key, value) in data {
            let Some(encoded) = value.as_str() else {
                continue;
            };
            match STANDARD.decode(encoded) {
                Ok(bytes) => {
                    entries.insert(key.clone(), String::from_utf8_lossy(&bytes).into_owned());
                }
                Err(e) => {
                    warn!(
                        key = key.as_str(),
                        resource.name = obj.metadata.name.as_deref().unwrap_or_default(),
                        error = %e,
                        "Skipping Secret entry that is not valid base64"
                    );
                }
            }
        }
    }
    entries.extend(string_map(obj, "stringData"));
    entries
}

fn string_map(obj: &DynamicObject, field: &str) -> Bindings {
    match obj.data.get(field) {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
        _ => Bindings::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::typed::TypedStoreExt;
    use crate::store::MemoryStore;
    use k8s_openapi::ByteString;
    use kube::core::ObjectMeta;
    use serde_json::json;

    async fn store_with_secret(name: &str, data: &[(&str, &str)]) -> MemoryStore {
        let store = MemoryStore::new();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| ((*k).to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        store.create_typed(&secret).await.expect("secret should be created");
        store
    }

    #[tokio::test]
    async fn literal_is_verbatim() {
        let store = MemoryStore::new();
        let out = evaluate_expr("type", "postgresql", &json!({}), &store, "ns")
            .await
            .unwrap();
        assert_eq!(out, Bindings::from([("type".to_string(), "postgresql".to_string())]));
    }

    #[tokio::test]
    async fn path_rule_reads_instance() {
        let store = MemoryStore::new();
        let instance = json!({"spec": {"username": "alice"}});
        let out = evaluate_expr("user", "path={.spec.username}", &instance, &store, "ns")
            .await
            .unwrap();
        assert_eq!(out, Bindings::from([("user".to_string(), "alice".to_string())]));
    }

    #[tokio::test]
    async fn secret_reference_with_key() {
        let store = store_with_secret("creds", &[("password", "p@ss"), ("user", "x")]).await;
        let instance = json!({"spec": {"secretRef": "creds"}});
        let out = evaluate_expr(
            "pwd",
            "{.spec.secretRef},objectType=Secret,key=password",
            &instance,
            &store,
            "ns",
        )
        .await
        .unwrap();
        assert_eq!(out, Bindings::from([("pwd".to_string(), "p@ss".to_string())]));
    }

    #[tokio::test]
    async fn secret_reference_without_key_copies_all() {
        let store = store_with_secret("creds", &[("password", "p@ss"), ("user", "x")]).await;
        let instance = json!({"spec": {"secretRef": "creds"}});
        let out = evaluate_expr("ignored", "{.spec.secretRef},objectType=Secret", &instance, &store, "ns")
            .await
            .unwrap();
        assert_eq!(
            out,
            Bindings::from([
                ("password".to_string(), "p@ss".to_string()),
                ("user".to_string(), "x".to_string()),
            ])
        );
    }

    #[tokio::test]
    async fn configmap_reference_is_verbatim() {
        let store = MemoryStore::new();
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("host".to_string(), "db.local".to_string())])),
            ..Default::default()
        };
        store.create_typed(&cm).await.unwrap();

        let instance = json!({"spec": {"config": "settings"}});
        let out = evaluate_expr(
            "db_host",
            "path={.spec.config},objectType=ConfigMap,key=host",
            &instance,
            &store,
            "ns",
        )
        .await
        .unwrap();
        assert_eq!(out, Bindings::from([("db_host".to_string(), "db.local".to_string())]));
    }

    #[tokio::test]
    async fn literal_reference_name_is_fetched_as_written() {
        let store = store_with_secret("shared-creds", &[("password", "p@ss")]).await;
        let out = evaluate_expr(
            "pwd",
            "shared-creds,objectType=Secret,key=password",
            &json!({"spec": {}}),
            &store,
            "ns",
        )
        .await
        .unwrap();
        assert_eq!(out, Bindings::from([("pwd".to_string(), "p@ss".to_string())]));
    }

    #[tokio::test]
    async fn missing_reference_and_key() {
        let store = store_with_secret("creds", &[("user", "x")]).await;

        let err = evaluate_expr(
            "pwd",
            "{.spec.secretRef},objectType=Secret",
            &json!({"spec": {"secretRef": "absent"}}),
            &store,
            "ns",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EvalError::ReferenceNotFound { .. }));

        let err = evaluate_expr(
            "pwd",
            "{.spec.secretRef},objectType=Secret,key=password",
            &json!({"spec": {"secretRef": "creds"}}),
            &store,
            "ns",
        )
        .await
        .unwrap_err();
        assert!(err.is_reference_not_found());
    }

    #[tokio::test]
    async fn reference_is_namespace_scoped() {
        let store = store_with_secret("creds", &[("user", "x")]).await;
        let err = evaluate_expr(
            "u",
            "{.spec.secretRef},objectType=Secret",
            &json!({"spec": {"secretRef": "creds"}}),
            &store,
            "other",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EvalError::ReferenceNotFound { .. }));
    }

    #[tokio::test]
    async fn empty_reference_name_is_a_path_error() {
        let store = MemoryStore::new();
        let err = evaluate_expr(
            "u",
            "{.spec.secretRef},objectType=Secret",
            &json!({"spec": {"secretRef": ""}}),
            &store,
            "ns",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EvalError::PathEval(_)));
        assert_eq!(err.reason(), "path_eval");
    }

    #[test]
    fn undecodable_secret_entries_are_skipped() {
        let mut obj = DynamicObject::new("s", &api_resource::<Secret>());
        obj.data = json!({"data": {"good": "eA==", "bad": "***"}});
        assert_eq!(
            secret_entries(&obj),
            Bindings::from([("good".to_string(), "x".to_string())])
        );
    }
}

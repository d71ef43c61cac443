//! # InstanceProxy
//!
//! One InstanceProxy exists per (BindingConfig, discovered instance) pair and
//! lives in the instance's namespace. Its name is derived deterministically so
//! lookups never need a side table.

use crate::constants::{ARTIFACT_SUFFIX, MAX_OBJECT_NAME_LEN};
use crate::store::FieldIndexer;
use kube::core::DynamicObject;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Index over `.spec.config_ref` (value: config name)
pub const CONFIG_INDEX: &str = ".spec.config_ref";

/// Index over `.spec.instance_ref` (value: `namespace/name`)
pub const INSTANCE_INDEX: &str = ".spec.instance_ref";

/// InstanceProxy spec
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "binding.operators.coreos.com",
    version = "v1alpha1",
    kind = "InstanceProxy",
    namespaced,
    shortname = "ip",
    status = "InstanceProxyStatus",
    printcolumn = r#"{"name":"Config", "type":"string", "jsonPath":".spec.config_ref"}"#,
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.instance_ref.name"}"#,
    printcolumn = r#"{"name":"Artifact", "type":"string", "jsonPath":".status.artifact_name"}"#
)]
pub struct InstanceProxySpec {
    /// Name of the owning BindingConfig
    pub config_ref: String,
    /// The discovered instance this proxy stands for
    pub instance_ref: InstanceRef,
}

/// Namespaced reference to a discovered instance
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct InstanceRef {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq, Eq)]
pub struct InstanceProxyStatus {
    /// Name of the derived artifact Secret, once materialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
}

/// Deterministic InstanceProxy name for a (config, instance) pair.
///
/// `<instance>-<config>-<digest>`, where the digest is 8 hex characters of the
/// SHA-256 of the NUL-joined pair identity. Plain concatenation is ambiguous
/// (`a` + `b-c` vs `a-b` + `c`); the digest is not. Long names lose the end of
/// the readable prefix, never the digest.
pub fn proxy_name(config_name: &str, namespace: &str, instance_name: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [config_name, namespace, instance_name] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();

    let readable = format!("{instance_name}-{config_name}");
    let limit = MAX_OBJECT_NAME_LEN - ARTIFACT_SUFFIX.len() - suffix.len() - 1;
    let mut cut = readable.len().min(limit);
    while !readable.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = readable[..cut].trim_end_matches(['-', '.']);
    format!("{prefix}-{suffix}")
}

/// Name of the derived artifact for a proxy
pub fn artifact_name(proxy_name: &str) -> String {
    format!("{proxy_name}{ARTIFACT_SUFFIX}")
}

/// Value stored under [`INSTANCE_INDEX`] for an instance
pub fn instance_index_value(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn spec_str<'a>(obj: &'a DynamicObject, field: &str) -> Option<&'a str> {
    obj.data.get("spec")?.get(field)?.as_str()
}

fn extract_config_ref(obj: &DynamicObject) -> Option<String> {
    spec_str(obj, "config_ref").map(str::to_string)
}

fn extract_instance_ref(obj: &DynamicObject) -> Option<String> {
    let instance = obj.data.get("spec")?.get("instance_ref")?;
    let namespace = instance.get("namespace")?.as_str()?;
    let name = instance.get("name")?.as_str()?;
    Some(instance_index_value(namespace, name))
}

/// Field indexers the store must maintain over InstanceProxy objects
pub fn proxy_indexers() -> Vec<FieldIndexer> {
    let resource = kube::core::ApiResource::erase::<InstanceProxy>(&());
    vec![
        FieldIndexer::new(resource.clone(), CONFIG_INDEX, extract_config_ref),
        FieldIndexer::new(resource, INSTANCE_INDEX, extract_instance_ref),
    ]
}

impl InstanceProxy {
    /// Whether this proxy stands for the given (config, instance) pair
    pub fn belongs_to(&self, config_ref: &str, instance_namespace: &str, instance_name: &str) -> bool {
        self.spec.config_ref == config_ref
            && self.spec.instance_ref.namespace == instance_namespace
            && self.spec.instance_ref.name == instance_name
    }

    /// Build a proxy for an instance, owned by `config_ref`
    pub fn for_instance(config_ref: &str, instance_namespace: &str, instance_name: &str) -> Self {
        let mut proxy = InstanceProxy::new(
            &proxy_name(config_ref, instance_namespace, instance_name),
            InstanceProxySpec {
                config_ref: config_ref.to_string(),
                instance_ref: InstanceRef {
                    name: instance_name.to_string(),
                    namespace: instance_namespace.to_string(),
                },
            },
        );
        proxy.meta_mut().namespace = Some(instance_namespace.to_string());
        proxy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::typed::to_dynamic;

    #[test]
    fn test_names_are_readable_and_deterministic() {
        let name = proxy_name("postgres-map", "ns", "db");
        assert!(name.starts_with("db-postgres-map-"));
        assert_eq!(name.len(), "db-postgres-map-".len() + 8);
        assert_eq!(name, proxy_name("postgres-map", "ns", "db"));
        assert_eq!(artifact_name(&name), format!("{name}-sed"));
    }

    #[test]
    fn test_dash_split_pairs_do_not_collide() {
        // Both read "a-b-c" once concatenated.
        let first = proxy_name("b-c", "ns", "a");
        let second = proxy_name("c", "ns", "a-b");
        assert_ne!(first, second);
        assert!(first.starts_with("a-b-c-"));
        assert!(second.starts_with("a-b-c-"));
    }

    #[test]
    fn test_long_names_are_truncated_with_digest() {
        let instance = "a".repeat(200);
        let config = "b".repeat(100);
        let name = proxy_name(&config, "ns", &instance);
        assert_eq!(name.len(), MAX_OBJECT_NAME_LEN - ARTIFACT_SUFFIX.len());
        assert!(artifact_name(&name).len() <= MAX_OBJECT_NAME_LEN);
        assert_eq!(name, proxy_name(&config, "ns", &instance));

        let other = proxy_name(&"c".repeat(100), "ns", &instance);
        assert_ne!(name, other);
    }

    #[test]
    fn test_names_differ_per_config_and_namespace() {
        assert_ne!(proxy_name("one", "ns", "db"), proxy_name("two", "ns", "db"));
        assert_ne!(proxy_name("one", "a", "db"), proxy_name("one", "b", "db"));
    }

    #[test]
    fn test_belongs_to() {
        let proxy = InstanceProxy::for_instance("cfg", "team-a", "db");
        assert!(proxy.belongs_to("cfg", "team-a", "db"));
        assert!(!proxy.belongs_to("cfg", "team-b", "db"));
        assert!(!proxy.belongs_to("other", "team-a", "db"));
    }

    #[test]
    fn test_indexers_extract_values() {
        let proxy = InstanceProxy::for_instance("cfg", "team-a", "db");
        let obj = to_dynamic(&proxy).expect("proxy should convert");
        let indexers = proxy_indexers();

        let values: Vec<Option<String>> = indexers.iter().map(|i| (i.extract)(&obj)).collect();
        assert_eq!(
            values,
            vec![Some("cfg".to_string()), Some("team-a/db".to_string())]
        );
    }
}

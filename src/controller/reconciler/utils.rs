//! # Utilities
//!
//! Small helpers shared by the reconciler.

use crate::constants::{CONTROLLER_NAME, MANAGED_BY_LABEL};
use crate::crd::BindingConfig;
use kube::core::DynamicObject;
use std::collections::BTreeMap;

/// `(namespace, name)` of a namespaced instance
///
/// Cluster-scoped instances have no namespace for a proxy to live in.
pub fn instance_identity(obj: &DynamicObject) -> Option<(&str, &str)> {
    let namespace = obj.metadata.namespace.as_deref().filter(|ns| !ns.is_empty())?;
    let name = obj.metadata.name.as_deref()?;
    Some((namespace, name))
}

/// Labels stamped on every object the controller creates
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_LABEL.to_string(), CONTROLLER_NAME.to_string())])
}

/// True when every managed label is already present
pub fn has_managed_labels(labels: &BTreeMap<String, String>) -> bool {
    managed_labels()
        .iter()
        .all(|(k, v)| labels.get(k) == Some(v))
}

pub fn is_being_deleted(config: &BindingConfig) -> bool {
    config.metadata.deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};

    fn instance(namespace: Option<&str>) -> DynamicObject {
        let resource = ApiResource::from_gvk(&GroupVersionKind::gvk("example.com", "v1", "Database"));
        let mut obj = DynamicObject::new("db", &resource);
        obj.metadata.namespace = namespace.map(str::to_string);
        obj
    }

    #[test]
    fn test_instance_identity() {
        assert_eq!(instance_identity(&instance(Some("team-a"))), Some(("team-a", "db")));
        assert_eq!(instance_identity(&instance(None)), None);
        assert_eq!(instance_identity(&instance(Some(""))), None);
    }

    #[test]
    fn test_managed_labels_check() {
        let mut labels = BTreeMap::from([("app".to_string(), "db".to_string())]);
        assert!(!has_managed_labels(&labels));
        labels.extend(managed_labels());
        assert!(has_managed_labels(&labels));
    }
}

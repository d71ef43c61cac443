//! # BindingConfig
//!
//! Declares which resource kind to discover and how to derive binding data
//! from each of its instances.

use super::status::BindingConfigStatus;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// BindingConfig spec
///
/// Cluster-scoped. The object name is the config identity (`config_ref`) that
/// every InstanceProxy it produces points back to.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "binding.operators.coreos.com",
    version = "v1alpha1",
    kind = "BindingConfig",
    shortname = "bc",
    status = "BindingConfigStatus",
    printcolumn = r#"{"name":"Kind", "type":"string", "jsonPath":".spec.target_kind.kind"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".status.instances"}"#
)]
pub struct BindingConfigSpec {
    /// Kind whose instances are discovered
    pub target_kind: TargetKind,
    /// Output key to rule expression
    #[serde(default)]
    pub rule_set: BTreeMap<String, String>,
}

/// Reference to the watched resource kind
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TargetKind {
    /// `group/version`, e.g. `apps/v1`; the core group is written `/v1`
    pub api_group: String,
    /// Resource plural (`deployments`) or kind name (`Deployment`)
    pub kind: String,
}

impl TargetKind {
    /// Split `api_group` into `(group, version)`.
    ///
    /// Returns `None` when the version segment is missing or empty.
    pub fn group_version(&self) -> Option<(&str, &str)> {
        let (group, version) = self.api_group.split_once('/')?;
        let version = version.trim();
        if version.is_empty() || version.contains('/') {
            return None;
        }
        Some((group.trim(), version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(api_group: &str) -> TargetKind {
        TargetKind {
            api_group: api_group.to_string(),
            kind: "deployments".to_string(),
        }
    }

    #[test]
    fn test_group_version_split() {
        assert_eq!(target("apps/v1").group_version(), Some(("apps", "v1")));
        assert_eq!(target("/v1").group_version(), Some(("", "v1")));
    }

    #[test]
    fn test_group_version_requires_version() {
        assert_eq!(target("apps").group_version(), None);
        assert_eq!(target("apps/").group_version(), None);
        assert_eq!(target("a/b/c").group_version(), None);
    }

    #[test]
    fn test_spec_wire_names_are_snake_case() {
        let spec: BindingConfigSpec = serde_json::from_value(serde_json::json!({
            "target_kind": {"api_group": "apps/v1", "kind": "deployments"},
            "rule_set": {"user": "path={.spec.username}"}
        }))
        .expect("spec should deserialize");
        assert_eq!(spec.target_kind.kind, "deployments");
        assert_eq!(spec.rule_set["user"], "path={.spec.username}");
    }
}

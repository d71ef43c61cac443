//! # Binding Set Materializer
//!
//! Evaluates a whole rule set for one instance and persists the result as the
//! derived artifact Secret.

use super::evaluate::{evaluate, Bindings};
use super::rule::Rule;
use crate::constants::{CONTROLLER_NAME, MANAGED_BY_LABEL};
use crate::crd::{BindingConfig, InstanceProxy};
use crate::observability::metrics;
use crate::store::typed::TypedStoreExt;
use crate::store::{ObjectKey, ObjectStore, StoreError, StoreResult};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

const SECRET_TYPE: &str = "Opaque";

/// Derived artifact content for one InstanceProxy
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedArtifact {
    pub name: String,
    pub namespace: String,
    pub content: Bindings,
    pub owner: Option<OwnerReference>,
}

/// What [`persist`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Created,
    Replaced,
    Unchanged,
}

impl DerivedArtifact {
    /// Attach the proxy as controlling owner
    ///
    /// Has no effect when the proxy has not been stored yet (no uid).
    pub fn owned_by(mut self, proxy: &InstanceProxy) -> Self {
        self.owner = proxy.controller_owner_ref(&());
        self
    }

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([(MANAGED_BY_LABEL.to_string(), CONTROLLER_NAME.to_string())])
    }

    /// The Secret this artifact is stored as
    pub fn to_secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(Self::labels()),
                owner_references: self.owner.clone().map(|o| vec![o]),
                ..Default::default()
            },
            type_: Some(SECRET_TYPE.to_string()),
            data: Some(self.encoded_content()),
            ..Default::default()
        }
    }

    fn encoded_content(&self) -> BTreeMap<String, ByteString> {
        self.content
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    /// Whether `existing` already carries this artifact's content, labels and owner
    fn matches(&self, existing: &Secret) -> bool {
        let data_equal = existing.data.clone().unwrap_or_default() == self.encoded_content();
        let labels = existing.labels();
        let labels_equal = Self::labels()
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v));
        let owners_equal = match &self.owner {
            Some(owner) => existing.owner_references() == std::slice::from_ref(owner),
            None => true,
        };
        data_equal && labels_equal && owners_equal
    }
}

/// Evaluate every rule of `config` against `instance`.
///
/// Rules run in sorted output-key order and their results are unioned;
/// when two rules produce the same key the later one wins. A failing rule is
/// logged, counted and skipped.
pub async fn materialize(
    store: &dyn ObjectStore,
    config: &BindingConfig,
    proxy_namespace: &str,
    proxy_name: &str,
    instance: &Value,
) -> DerivedArtifact {
    let config_name = config.name_any();
    let mut content = Bindings::new();

    for (output_key, expr) in &config.spec.rule_set {
        let result = match Rule::parse(expr) {
            Ok(rule) => evaluate(output_key, &rule, instance, store, proxy_namespace).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(bindings) => content.extend(bindings),
            Err(e) => {
                metrics::increment_rule_evaluation_errors(e.reason());
                warn!(
                    config = config_name.as_str(),
                    resource.namespace = proxy_namespace,
                    resource.name = proxy_name,
                    output_key = output_key.as_str(),
                    error = %e,
                    "Skipping binding rule that failed to evaluate"
                );
            }
        }
    }

    DerivedArtifact {
        name: crate::crd::artifact_name(proxy_name),
        namespace: proxy_namespace.to_string(),
        content,
        owner: None,
    }
}

/// Create the artifact Secret, or replace its content wholesale.
///
/// A Secret that already matches is left untouched.
pub async fn persist(store: &dyn ObjectStore, artifact: &DerivedArtifact) -> StoreResult<PersistOutcome> {
    let desired = artifact.to_secret();
    let existing = store
        .get_typed::<Secret>(Some(&artifact.namespace), &artifact.name)
        .await?;

    let Some(existing) = existing else {
        return match store.create_typed(&desired).await {
            Ok(_) => {
                metrics::increment_artifacts_materialized();
                debug!(
                    resource.namespace = artifact.namespace.as_str(),
                    resource.name = artifact.name.as_str(),
                    "Created derived artifact"
                );
                Ok(PersistOutcome::Created)
            }
            // Someone created it between our read and write; let the caller retry.
            Err(e) if e.is_already_exists() => Err(StoreError::Conflict {
                kind: "Secret".to_string(),
                key: ObjectKey::new(Some(&artifact.namespace), &artifact.name),
            }),
            Err(e) => Err(e),
        };
    };

    if artifact.matches(&existing) {
        return Ok(PersistOutcome::Unchanged);
    }

    let mut replacement = desired;
    replacement.metadata.resource_version = existing.metadata.resource_version.clone();
    let mut labels = existing.metadata.labels.clone().unwrap_or_default();
    labels.extend(DerivedArtifact::labels());
    replacement.metadata.labels = Some(labels);
    if replacement.metadata.owner_references.is_none() {
        replacement.metadata.owner_references = existing.metadata.owner_references.clone();
    }

    store.update_typed(&replacement).await?;
    metrics::increment_artifacts_materialized();
    debug!(
        resource.namespace = artifact.namespace.as_str(),
        resource.name = artifact.name.as_str(),
        "Replaced derived artifact"
    );
    Ok(PersistOutcome::Replaced)
}

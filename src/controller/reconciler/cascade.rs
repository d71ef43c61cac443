//! # Cascade
//!
//! The reconciliation state machine:
//!
//! - `apply_config`: resolve the target kind, subscribe to its watch, upsert a
//!   pair for every current instance and sweep proxies that no longer match one
//! - `upsert_pair`: locate-or-create the InstanceProxy, materialize and persist
//!   its artifact, record the artifact name
//! - `delete_pair`: remove the artifact and the proxy, tolerating `NotFound`
//! - `units_for` / `reconcile_pair`: turn an instance watch event into pair
//!   units and converge each one against the current instance state
//! - `cleanup_config`: tear down every pair a config owns and release its watch

use super::types::{ApplySummary, PairAction, PairKey, PairUnit, ReconcilerError};
use super::utils::{has_managed_labels, instance_identity, is_being_deleted, managed_labels};
use super::Reconciler;
use crate::binding::{materialize, persist};
use crate::constants::CONFLICT_RETRY_ATTEMPTS;
use crate::controller::watch_manager::{InstanceEvent, KindKey};
use crate::crd::{
    artifact_name, instance_index_value, proxy_name, BindingConfig, InstanceProxy,
    InstanceProxyStatus, CONFIG_INDEX, INSTANCE_INDEX,
};
use crate::store::typed::TypedStoreExt;
use crate::store::{FieldSelector, ObjectKey, StoreError, StoreResult, WatchEvent};
use k8s_openapi::api::core::v1::Secret;
use kube::core::{ApiResource, DynamicObject};
use kube::ResourceExt;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Treat `NotFound` as success; returns whether something was deleted
fn tolerate_not_found(result: StoreResult<()>) -> StoreResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

impl Reconciler {
    /// Resolve a config's target kind reference to an API resource
    pub async fn resolve_target(&self, config: &BindingConfig) -> Result<ApiResource, ReconcilerError> {
        let target = &config.spec.target_kind;
        let kind_error = |reason: String| ReconcilerError::KindResolution {
            config: config.name_any(),
            reason,
        };

        let (group, version) = target.group_version().ok_or_else(|| {
            kind_error(format!(
                "api_group '{}' must be <group>/<version>",
                target.api_group
            ))
        })?;
        let kind = target.kind.trim();
        if kind.is_empty() {
            return Err(kind_error("kind is empty".to_string()));
        }

        match self.store.resolve(group, version, kind).await {
            Ok(resource) => Ok(resource),
            Err(e @ StoreError::KindNotFound { .. }) => Err(kind_error(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Bring every instance of the config's target kind up to date.
    ///
    /// A failing instance is counted and logged; it does not abort the pass.
    pub async fn apply_config(&self, config: &BindingConfig) -> Result<ApplySummary, ReconcilerError> {
        let config_ref = config.name_any();
        let resource = match self.resolve_target(config).await {
            Ok(resource) => resource,
            Err(e @ ReconcilerError::KindResolution { .. }) => {
                // An unresolvable target must not keep a previous kind watched.
                self.watches.release(&config_ref).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let kind = KindKey::of(&resource);

        if self.watches.acquire(&config_ref, &resource).await {
            info!(config = config_ref.as_str(), kind = %kind, "Watching new target kind");
        }

        let instances = self
            .store
            .list(&resource, self.watches.namespace(), None)
            .await?;

        let mut summary = ApplySummary::default();
        let mut live = BTreeSet::new();
        for instance in &instances {
            let Some((namespace, name)) = instance_identity(instance) else {
                debug!(config = config_ref.as_str(), kind = %kind, "Skipping cluster-scoped instance");
                continue;
            };
            live.insert((namespace.to_string(), name.to_string()));

            match self.upsert_pair(config, instance).await {
                Ok(()) => summary.instances += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        config = config_ref.as_str(),
                        resource.namespace = namespace,
                        resource.name = name,
                        error = %e,
                        "Failed to reconcile instance"
                    );
                }
            }
        }

        summary.removed = self.sweep_stale(&config_ref, &resource, &live).await?;

        info!(
            config = config_ref.as_str(),
            kind = %kind,
            instances = summary.instances,
            failed = summary.failed,
            removed = summary.removed,
            "BindingConfig applied"
        );
        Ok(summary)
    }

    /// Delete proxies owned by `config_ref` whose instance is not in `live`
    async fn sweep_stale(
        &self,
        config_ref: &str,
        resource: &ApiResource,
        live: &BTreeSet<(String, String)>,
    ) -> Result<usize, ReconcilerError> {
        let selector = FieldSelector::new(CONFIG_INDEX, config_ref);
        let proxies: Vec<InstanceProxy> = self
            .store
            .list_typed(self.watches.namespace(), Some(&selector))
            .await?;

        let mut removed = 0;
        for proxy in proxies {
            let instance = &proxy.spec.instance_ref;
            if live.contains(&(instance.namespace.clone(), instance.name.clone())) {
                continue;
            }

            let pair = PairKey::new(config_ref, &instance.namespace, &instance.name);
            let _guard = self.lock_pair(&pair).await;

            // Created after our list? Leave it for the event that announced it.
            if self
                .store
                .get(resource, Some(&instance.namespace), &instance.name)
                .await?
                .is_some()
            {
                continue;
            }

            if self.delete_proxy(&proxy).await? {
                removed += 1;
                info!(pair = %pair, "Removed stale InstanceProxy");
            }
        }
        Ok(removed)
    }

    /// Locate-or-create the proxy for `instance` and re-derive its artifact
    pub async fn upsert_pair(&self, config: &BindingConfig, instance: &DynamicObject) -> Result<(), ReconcilerError> {
        let Some((namespace, name)) = instance_identity(instance) else {
            return Ok(());
        };
        let pair = PairKey::new(&config.name_any(), namespace, name);
        let _guard = self.lock_pair(&pair).await;
        self.upsert_with_retry(config, &pair, instance).await
    }

    async fn upsert_with_retry(
        &self,
        config: &BindingConfig,
        pair: &PairKey,
        instance: &DynamicObject,
    ) -> Result<(), ReconcilerError> {
        for attempt in 1..=CONFLICT_RETRY_ATTEMPTS {
            match self.upsert_once(config, pair, instance).await {
                Err(e) if e.is_conflict() => {
                    debug!(pair = %pair, attempt, error = %e, "Conflict during upsert, retrying");
                }
                other => return other,
            }
        }
        Err(ReconcilerError::ConflictRetriesExhausted {
            pair: pair.to_string(),
            attempts: CONFLICT_RETRY_ATTEMPTS,
        })
    }

    async fn upsert_once(
        &self,
        config: &BindingConfig,
        pair: &PairKey,
        instance: &DynamicObject,
    ) -> Result<(), ReconcilerError> {
        let mut desired = InstanceProxy::for_instance(&pair.config_ref, &pair.namespace, &pair.name);
        desired.metadata.labels = Some(managed_labels());
        let proxy_name = desired.name_any();

        let existing: Option<InstanceProxy> = self
            .store
            .get_typed(Some(&pair.namespace), &proxy_name)
            .await?;
        let proxy = match existing {
            None => match self.store.create_typed(&desired).await {
                Ok(created) => {
                    debug!(pair = %pair, resource.name = proxy_name.as_str(), "Created InstanceProxy");
                    created
                }
                Err(e) if e.is_already_exists() => {
                    return Err(StoreError::Conflict {
                        kind: "InstanceProxy".to_string(),
                        key: ObjectKey::new(Some(&pair.namespace), &proxy_name),
                    }
                    .into());
                }
                Err(e) => return Err(e.into()),
            },
            Some(existing) if !existing.belongs_to(&pair.config_ref, &pair.namespace, &pair.name) => {
                return Err(ReconcilerError::NameCollision {
                    namespace: pair.namespace.clone(),
                    name: proxy_name,
                    owner: PairKey::new(
                        &existing.spec.config_ref,
                        &existing.spec.instance_ref.namespace,
                        &existing.spec.instance_ref.name,
                    )
                    .to_string(),
                    pair: pair.to_string(),
                });
            }
            Some(mut existing) => {
                let labels = existing.metadata.labels.get_or_insert_with(Default::default);
                if !has_managed_labels(labels) {
                    labels.extend(managed_labels());
                    self.store.update_typed(&existing).await?
                } else {
                    existing
                }
            }
        };

        let instance_value = serde_json::to_value(instance)?;
        let artifact = materialize(
            self.store.as_ref(),
            config,
            &pair.namespace,
            &proxy_name,
            &instance_value,
        )
        .await
        .owned_by(&proxy);
        let outcome = persist(self.store.as_ref(), &artifact).await?;
        debug!(pair = %pair, outcome = ?outcome, "Derived artifact persisted");

        let recorded = proxy.status.as_ref().and_then(|s| s.artifact_name.as_deref());
        if recorded != Some(artifact.name.as_str()) {
            let mut proxy = proxy;
            proxy.status = Some(InstanceProxyStatus {
                artifact_name: Some(artifact.name),
            });
            self.store.update_status_typed(&proxy).await?;
        }
        Ok(())
    }

    /// Remove the proxy (and its artifact) for one pair.
    ///
    /// Returns whether anything was deleted.
    pub async fn delete_pair(
        &self,
        config_ref: &str,
        namespace: &str,
        instance_name: &str,
    ) -> Result<bool, ReconcilerError> {
        let pair = PairKey::new(config_ref, namespace, instance_name);
        let _guard = self.lock_pair(&pair).await;
        self.delete_pair_locked(&pair).await
    }

    async fn delete_pair_locked(&self, pair: &PairKey) -> Result<bool, ReconcilerError> {
        let name = proxy_name(&pair.config_ref, &pair.namespace, &pair.name);
        let proxy: Option<InstanceProxy> = self.store.get_typed(Some(&pair.namespace), &name).await?;
        match proxy {
            Some(proxy) if !proxy.belongs_to(&pair.config_ref, &pair.namespace, &pair.name) => {
                warn!(
                    pair = %pair,
                    resource.name = name.as_str(),
                    "InstanceProxy belongs to another pair, leaving it"
                );
                Ok(false)
            }
            Some(proxy) => {
                let removed = self.delete_proxy(&proxy).await?;
                info!(pair = %pair, "Deleted InstanceProxy and derived artifact");
                Ok(removed)
            }
            None => {
                // A half-finished earlier delete can leave the artifact behind.
                let removed = tolerate_not_found(
                    self.store
                        .delete_typed::<Secret>(Some(&pair.namespace), &artifact_name(&name))
                        .await,
                )?;
                Ok(removed)
            }
        }
    }

    /// Delete a proxy's artifact, then the proxy itself.
    ///
    /// Returns whether the proxy was still there.
    async fn delete_proxy(&self, proxy: &InstanceProxy) -> Result<bool, ReconcilerError> {
        let namespace = proxy.namespace().unwrap_or_else(|| proxy.spec.instance_ref.namespace.clone());
        let name = proxy.name_any();
        let artifact = proxy
            .status
            .as_ref()
            .and_then(|s| s.artifact_name.clone())
            .unwrap_or_else(|| artifact_name(&name));

        tolerate_not_found(self.store.delete_typed::<Secret>(Some(&namespace), &artifact).await)?;
        let removed = tolerate_not_found(
            self.store
                .delete_typed::<InstanceProxy>(Some(&namespace), &name)
                .await,
        )?;
        Ok(removed)
    }

    /// Pair units affected by an instance event.
    ///
    /// Added/Updated events fan out to every config subscribed to the kind.
    /// Deleted events use the instance index so only pairs that exist are
    /// touched.
    pub async fn units_for(&self, event: &InstanceEvent) -> Result<Vec<PairUnit>, ReconcilerError> {
        let Some(resource) = self.watches.resource_of(&event.kind).await else {
            debug!(kind = %event.kind, "Kind no longer watched, dropping event");
            return Ok(Vec::new());
        };
        let Some((namespace, name)) = instance_identity(event.event.object()) else {
            return Ok(Vec::new());
        };
        let subscribers = self.watches.subscribers(&event.kind).await;

        let configs: Vec<String> = match &event.event {
            WatchEvent::Deleted(_) => {
                let selector = FieldSelector::new(INSTANCE_INDEX, instance_index_value(namespace, name));
                let proxies: Vec<InstanceProxy> = self
                    .store
                    .list_typed(Some(namespace), Some(&selector))
                    .await?;
                proxies
                    .into_iter()
                    .map(|p| p.spec.config_ref)
                    .filter(|config_ref| subscribers.contains(config_ref))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect()
            }
            WatchEvent::Added(_) | WatchEvent::Updated(_) => subscribers.into_iter().collect(),
        };

        Ok(configs
            .into_iter()
            .map(|config_ref| PairUnit {
                pair: PairKey::new(&config_ref, namespace, name),
                kind: event.kind.clone(),
                resource: resource.clone(),
            })
            .collect())
    }

    /// Converge one pair against the current state of its instance and config.
    ///
    /// The instance is re-read under the pair lock, so units for the same pair
    /// that run out of order still leave the latest state behind. The config
    /// is re-read after the upsert: a cleanup that listed proxies before this
    /// unit created one would otherwise leave it orphaned.
    pub async fn reconcile_pair(&self, unit: &PairUnit) -> Result<PairAction, ReconcilerError> {
        let pair = &unit.pair;
        let _guard = self.lock_pair(pair).await;

        let instance = self
            .store
            .get(&unit.resource, Some(&pair.namespace), &pair.name)
            .await?;
        let Some(instance) = instance else {
            let removed = self.delete_pair_locked(pair).await?;
            return Ok(if removed { PairAction::Deleted } else { PairAction::Skipped });
        };

        if !self.watches.subscribers(&unit.kind).await.contains(&pair.config_ref) {
            return Ok(PairAction::Skipped);
        }
        let config: Option<BindingConfig> = self.store.get_typed(None, &pair.config_ref).await?;
        let Some(config) = config.filter(|c| !is_being_deleted(c)) else {
            return Ok(PairAction::Skipped);
        };

        self.upsert_with_retry(&config, pair, &instance).await?;

        let config: Option<BindingConfig> = self.store.get_typed(None, &pair.config_ref).await?;
        if config.is_none_or(|c| is_being_deleted(&c)) {
            debug!(pair = %pair, "BindingConfig went away during upsert, undoing");
            self.delete_pair_locked(pair).await?;
            return Ok(PairAction::Deleted);
        }
        Ok(PairAction::Upserted)
    }

    /// Process an instance event unit by unit.
    ///
    /// Every unit is attempted; the first failure is returned.
    pub async fn handle_instance_event(&self, event: &InstanceEvent) -> Result<usize, ReconcilerError> {
        let units = self.units_for(event).await?;
        let mut first_error = None;
        let mut processed = 0;
        for unit in &units {
            match self.reconcile_pair(unit).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    warn!(pair = %unit.pair, error = %e, "Instance event unit failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(processed),
        }
    }

    /// Tear down every pair owned by `config_ref` and release its watch.
    ///
    /// Returns the number of proxies deleted.
    pub async fn cleanup_config(&self, config_ref: &str) -> Result<usize, ReconcilerError> {
        let mut deleted = self.delete_owned_proxies(config_ref).await?;

        if let Some(kind) = self.watches.release(config_ref).await {
            info!(config = config_ref, kind = %kind, "Released last subscription on kind");
        }
        // Units already past their config check can still create a proxy.
        deleted += self.delete_owned_proxies(config_ref).await?;

        info!(config = config_ref, proxies = deleted, "BindingConfig cleaned up");
        Ok(deleted)
    }

    async fn delete_owned_proxies(&self, config_ref: &str) -> Result<usize, ReconcilerError> {
        let selector = FieldSelector::new(CONFIG_INDEX, config_ref);
        let proxies: Vec<InstanceProxy> = self.store.list_typed(None, Some(&selector)).await?;

        let mut deleted = 0;
        for proxy in &proxies {
            let instance = &proxy.spec.instance_ref;
            let pair = PairKey::new(config_ref, &instance.namespace, &instance.name);
            let _guard = self.lock_pair(&pair).await;
            if self.delete_proxy(proxy).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

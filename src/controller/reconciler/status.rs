//! # Status
//!
//! Builds and writes BindingConfig status.
//!
//! Status writes are skipped when nothing but timestamps would change, so a
//! steady-state resync does not generate watch traffic on the config itself.

use super::types::{ApplySummary, ReconcilerError};
use crate::crd::{BindingConfig, BindingConfigStatus, Condition, Phase};
use crate::store::typed::TypedStoreExt;
use crate::store::ObjectStore;
use kube::ResourceExt;
use tracing::debug;

/// Status after a pass that ran to completion
pub fn applied_status(config: &BindingConfig, summary: &ApplySummary, now: &str) -> BindingConfigStatus {
    let (phase, message) = if summary.is_degraded() {
        (
            Phase::Degraded,
            format!(
                "{} of {} instances failed to materialize",
                summary.failed,
                summary.instances + summary.failed
            ),
        )
    } else {
        (
            Phase::Ready,
            format!("{} instances materialized", summary.instances),
        )
    };

    build(config, phase, message, Some(summary.instances), now)
}

/// Status after a pass that could not run
pub fn failed_status(config: &BindingConfig, error: &ReconcilerError, now: &str) -> BindingConfigStatus {
    let previous_instances = config
        .status
        .as_ref()
        .and_then(|s| s.instances)
        .and_then(|n| usize::try_from(n).ok());
    build(config, Phase::Failed, error.to_string(), previous_instances, now)
}

fn build(
    config: &BindingConfig,
    phase: Phase,
    message: String,
    instances: Option<usize>,
    now: &str,
) -> BindingConfigStatus {
    let mut condition = Condition::ready(phase, &message, now);

    // Keep the transition time while the phase holds.
    if let Some(previous) = config
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.r#type == condition.r#type))
    {
        if previous.reason == condition.reason {
            condition
                .last_transition_time
                .clone_from(&previous.last_transition_time);
        }
    }

    BindingConfigStatus {
        phase: Some(phase),
        message: Some(message),
        observed_generation: config.metadata.generation,
        instances: instances.map(|n| i32::try_from(n).unwrap_or(i32::MAX)),
        last_reconcile_time: Some(now.to_string()),
        conditions: vec![condition],
    }
}

/// Whether `desired` differs from `current` in anything but `last_reconcile_time`
pub fn status_changed(current: Option<&BindingConfigStatus>, desired: &BindingConfigStatus) -> bool {
    let Some(current) = current else {
        return true;
    };
    current.phase != desired.phase
        || current.message != desired.message
        || current.observed_generation != desired.observed_generation
        || current.instances != desired.instances
        || current.conditions != desired.conditions
}

/// Write `status` onto the config if it changed. Returns whether a write happened.
pub async fn write_status(
    store: &dyn ObjectStore,
    config: &BindingConfig,
    status: BindingConfigStatus,
) -> Result<bool, ReconcilerError> {
    if !status_changed(config.status.as_ref(), &status) {
        debug!(resource.name = config.name_any().as_str(), "Status unchanged, skipping write");
        return Ok(false);
    }

    let mut updated = config.clone();
    // The controller is the only status writer.
    updated.metadata.resource_version = None;
    updated.metadata.managed_fields = None;
    updated.status = Some(status);
    store.update_status_typed(&updated).await?;
    Ok(true)
}

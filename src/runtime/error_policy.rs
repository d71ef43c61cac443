//! # Error Policy
//!
//! Error handling and backoff logic for the BindingConfig control loop.

use crate::controller::reconciler::{BackoffState, ReconcilerError};
use crate::crd::BindingConfig;
use crate::observability::metrics;
use crate::runtime::watch_loop::ControllerContext;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tracing::{error, info};

/// Handle reconciliation errors with Fibonacci backoff
///
/// Backoff state is tracked per BindingConfig so one failing config never
/// slows down the others. The Failed status itself is written by the apply
/// path before the error reaches this point.
pub fn handle_reconciliation_error(
    obj: Arc<BindingConfig>,
    error: &ReconcilerError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let name = obj.name_any();

    let error_span = tracing::error_span!(
        "controller.watch.reconciliation_error",
        resource.name = name.as_str(),
        error = %error
    );
    let _error_guard = error_span.enter();

    error!(reason = error.metric_label(), "Reconciliation error for {}: {}", name, error);
    metrics::increment_config_reconciliation_errors();

    let (backoff_ms, error_count) = {
        let mut states = ctx
            .reconciler
            .backoff_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(name.clone()).or_insert_with(|| {
            BackoffState::new(ctx.settings.backoff_start_ms, ctx.settings.backoff_max_ms)
        });
        state.increment_error();
        (state.backoff.next_backoff_ms(), state.error_count)
    };

    let next_trigger_time = chrono::Utc::now()
        + chrono::Duration::milliseconds(i64::try_from(backoff_ms).unwrap_or(i64::MAX));

    info!(
        "🔄 Retrying with Fibonacci backoff: {}ms (error count: {}, trigger source: error-backoff)",
        backoff_ms, error_count
    );
    info!(
        "📅 Next retry scheduled: {} (trigger source: error-backoff)",
        next_trigger_time.to_rfc3339()
    );

    metrics::increment_requeues("error-backoff");
    Action::requeue(Duration::from_millis(backoff_ms))
}

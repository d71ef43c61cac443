//! # Watch Loop
//!
//! Controller watch loop that monitors BindingConfig resources and drives the
//! cascade reconciler through a finalizer.
//!
//! - `Apply`: run a full pass, write status, requeue for the periodic resync
//!   (sooner when some instances failed)
//! - `Cleanup`: delete every pair the config owns and release its watch
//!
//! SIGINT and SIGTERM both cancel the shared shutdown token: readiness drops,
//! the Controller drains and the loop exits instead of restarting.

use crate::config::ControllerConfig;
use crate::constants::CONFIG_FINALIZER;
use crate::controller::reconciler::{status, Reconciler, ReconcilerError};
use crate::controller::server::ServerState;
use crate::crd::BindingConfig;
use crate::observability::metrics;
use crate::runtime::error_policy::handle_reconciliation_error;
use futures::StreamExt;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube_runtime::{watcher, Controller};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Shared context handed to every BindingConfig reconciliation
pub struct ControllerContext {
    pub reconciler: Arc<Reconciler>,
    pub configs: Api<BindingConfig>,
    pub settings: ControllerConfig,
}

impl std::fmt::Debug for ControllerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerContext")
            .field("reconciler", &self.reconciler)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

/// Wait for `signal`, then fail readiness and cancel `shutdown`
pub async fn trigger_shutdown_on<F>(signal: F, server_state: Arc<ServerState>, shutdown: CancellationToken)
where
    F: Future<Output = ()>,
{
    tokio::select! {
        () = signal => {
            info!("Initiating graceful shutdown...");
            server_state.begin_shutdown();
            shutdown.cancel();
        }
        () = shutdown.cancelled() => {}
    }
}

/// Run the controller watch loop
///
/// Lists BindingConfigs once so readiness reflects API access, then runs the
/// Controller until `shutdown` is cancelled (SIGINT or SIGTERM), restarting
/// the stream if it ever ends on its own.
pub async fn run_watch_loop(
    ctx: Arc<ControllerContext>,
    server_state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    info!("Starting controller watch loop...");

    tokio::spawn(trigger_shutdown_on(
        shutdown_signal(),
        Arc::clone(&server_state),
        shutdown.clone(),
    ));

    let initial = ctx.configs.list(&ListParams::default()).await?;
    info!(configs = initial.items.len(), "Initial BindingConfig sync complete");
    server_state.mark_synced();

    while !shutdown.is_cancelled() {
        let watch_span = tracing::info_span!("controller.watch", operation = "watch_loop");

        Controller::new(ctx.configs.clone(), watcher::Config::default().any_semantic())
            .graceful_shutdown_on(shutdown.clone().cancelled_owned())
            .run(reconcile_config, handle_reconciliation_error, Arc::clone(&ctx))
            .for_each(|result| {
                match result {
                    Ok((obj, action)) => {
                        debug!(resource.name = obj.name.as_str(), action = ?action, "watch.event.reconciled");
                    }
                    Err(e) => warn!(error = %e, "watch.event.error"),
                }
                futures::future::ready(())
            })
            .instrument(watch_span)
            .await;

        if shutdown.is_cancelled() {
            break;
        }

        let delay = ctx.settings.watch_restart_delay_after_end();
        warn!(
            "Controller watch stream ended, restarting in {} seconds...",
            delay.as_secs()
        );
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    info!("Controller stopped gracefully");
    Ok(())
}

/// Reconcile one BindingConfig through its finalizer
async fn reconcile_config(config: Arc<BindingConfig>, ctx: Arc<ControllerContext>) -> Result<Action, ReconcilerError> {
    let name = config.name_any();
    let span = tracing::info_span!(
        "reconcile",
        resource.name = name.as_str(),
        resource.generation = config.metadata.generation.unwrap_or(0),
        resource.version = config.metadata.resource_version.as_deref().unwrap_or("unknown"),
    );

    async move {
        let start = Instant::now();
        metrics::increment_config_reconciliations();

        let inner = Arc::clone(&ctx);
        let result = finalizer(&ctx.configs, CONFIG_FINALIZER, config, |event| async move {
            match event {
                FinalizerEvent::Apply(config) => apply(config, &inner).await,
                FinalizerEvent::Cleanup(config) => cleanup(config, &inner).await,
            }
        })
        .await
        .map_err(|e| ReconcilerError::Finalizer(Box::new(e)));

        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
        result
    }
    .instrument(span)
    .await
}

async fn apply(config: Arc<BindingConfig>, ctx: &ControllerContext) -> Result<Action, ReconcilerError> {
    let name = config.name_any();
    let now = chrono::Utc::now().to_rfc3339();
    let store = ctx.reconciler.store.as_ref();

    match ctx.reconciler.apply_config(&config).await {
        Ok(summary) => {
            let desired = status::applied_status(&config, &summary, &now);
            status::write_status(store, &config, desired).await?;
            ctx.reconciler.reset_backoff(&name);

            if summary.is_degraded() {
                metrics::increment_requeues("degraded");
                Ok(Action::requeue(ctx.settings.degraded_requeue()))
            } else {
                metrics::increment_requeues("resync");
                Ok(Action::requeue(ctx.settings.resync_interval()))
            }
        }
        Err(e) => {
            let desired = status::failed_status(&config, &e, &now);
            if let Err(status_err) = status::write_status(store, &config, desired).await {
                warn!(resource.name = name.as_str(), error = %status_err, "Failed to record Failed status");
            }
            Err(e)
        }
    }
}

async fn cleanup(config: Arc<BindingConfig>, ctx: &ControllerContext) -> Result<Action, ReconcilerError> {
    let name = config.name_any();
    let deleted = ctx.reconciler.cleanup_config(&name).await?;
    ctx.reconciler.forget_backoff(&name);
    info!(resource.name = name.as_str(), proxies = deleted, "✅ BindingConfig teardown complete");
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_signal_cancels_token_and_drops_readiness() {
        let state = Arc::new(ServerState::default());
        state.mark_synced();
        let shutdown = CancellationToken::new();
        let (fire, fired) = oneshot::channel::<()>();

        let waiter = tokio::spawn(trigger_shutdown_on(
            async move {
                let _ = fired.await;
            },
            Arc::clone(&state),
            shutdown.clone(),
        ));
        assert!(!shutdown.is_cancelled());

        fire.send(()).unwrap();
        waiter.await.unwrap();
        assert!(shutdown.is_cancelled());
        assert!(state.is_shutting_down());
        assert!(!state.readiness().ready);
    }

    #[tokio::test]
    async fn test_waiter_exits_when_shutdown_comes_from_elsewhere() {
        let state = Arc::new(ServerState::default());
        let shutdown = CancellationToken::new();
        let waiter = tokio::spawn(trigger_shutdown_on(
            std::future::pending::<()>(),
            Arc::clone(&state),
            shutdown.clone(),
        ));

        shutdown.cancel();
        waiter.await.unwrap();
        assert!(!state.is_shutting_down());
    }
}

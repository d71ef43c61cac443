//! # Initialization
//!
//! Controller initialization logic including rustls setup, tracing, metrics,
//! server startup, and Kubernetes client setup.

use crate::config::ControllerConfig;
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::controller::watch_manager::{InstanceEvent, WatchManager};
use crate::crd::BindingConfig;
use crate::observability;
use crate::store::{KubeStore, ObjectStore};
use anyhow::Result;
use kube::{api::Api, Client};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Initialization result containing all necessary components for the controller
pub struct InitializationResult {
    /// API for BindingConfig CRD (cluster-scoped)
    pub configs: Api<BindingConfig>,
    /// Reconciler context
    pub reconciler: Arc<Reconciler>,
    /// Server state for health checks
    pub server_state: Arc<ServerState>,
    /// Settings read from the environment
    pub settings: ControllerConfig,
    /// Receiving end of the instance event channel, fed by the watch manager
    pub events: mpsc::Receiver<InstanceEvent>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("server", &self.server_state.readiness())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Object store, watch manager and reconciler setup
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before anything touches rustls.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|existing| {
            anyhow::anyhow!("Failed to install rustls crypto provider, one is already installed: {existing:?}")
        })?;

    let settings = ControllerConfig::from_env();
    observability::init_tracing(&settings);

    info!("Starting Service Mapper Controller");
    info!(
        "Build info: datetime={}, git_hash={}",
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );
    info!(settings = ?settings, "Loaded controller configuration");

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::default());

    // Start HTTP server for metrics and probes
    let server_state_clone = Arc::clone(&server_state);
    let server_port = settings.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_server_ready(&server_state, &server_handle, &settings).await?;

    let client = Client::try_default().await?;

    // BindingConfig is cluster-scoped
    let configs: Api<BindingConfig> = Api::all(client.clone());

    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client));
    let (events_tx, events) = mpsc::channel(settings.event_channel_capacity.max(1));
    let watches = Arc::new(WatchManager::new(
        Arc::clone(&store),
        settings.watch_namespace.clone(),
        events_tx,
        settings.watch_restart_delay(),
    ));
    let reconciler = Arc::new(Reconciler::new(store, watches));

    match settings.watch_namespace.as_deref() {
        Some(ns) => info!("Instance watches restricted to namespace '{}'", ns),
        None => info!("Instance watches span all namespaces"),
    }
    info!("Controller initialized, starting watch loop...");

    Ok(InitializationResult {
        configs,
        reconciler,
        server_state,
        settings,
        events,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    settings: &ControllerConfig,
) -> Result<()> {
    let startup_timeout = settings.server_startup_timeout();
    let poll_interval = settings.server_poll_interval();
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        // Set by start_server once bound
        if server_state.is_listening() {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

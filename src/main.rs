//! # Service Mapper Controller
//!
//! A Kubernetes controller that maps instances of arbitrary resource kinds to
//! InstanceProxy records and derived binding Secrets.
//!
//! ## Overview
//!
//! 1. **BindingConfig** names a target kind and a rule set
//! 2. **Dynamic watches** are opened per target kind and shared between configs
//! 3. **InstanceProxy** records are kept one per (config, instance) pair
//! 4. **Derived Secrets** (`<proxy>-sed`) carry the evaluated rules
//!
//! Deleting a BindingConfig tears all of its proxies and Secrets down.

use anyhow::Result;
use service_mapper_controller::runtime::dispatcher::Dispatcher;
use service_mapper_controller::runtime::initialization::initialize;
use service_mapper_controller::runtime::watch_loop::{run_watch_loop, ControllerContext};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let init = initialize().await?;

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(Arc::clone(&init.reconciler), &init.settings, shutdown.clone());
    let dispatcher_handle = tokio::spawn(dispatcher.run(init.events));

    let ctx = Arc::new(ControllerContext {
        reconciler: Arc::clone(&init.reconciler),
        configs: init.configs,
        settings: init.settings,
    });
    let result = run_watch_loop(ctx, Arc::clone(&init.server_state), shutdown.clone()).await;

    info!("Stopping instance watches and dispatcher...");
    init.server_state.begin_shutdown();
    shutdown.cancel();
    init.reconciler.watches.shutdown().await;
    if let Err(e) = dispatcher_handle.await {
        error!("Dispatcher task failed: {}", e);
    }

    result
}

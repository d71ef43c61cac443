//! # Instance Event Dispatcher
//!
//! Consumes the instance event channel fed by the watch manager. Each event is
//! split into (config, instance) pair units that run concurrently, bounded by
//! a semaphore. At most `max_concurrent_reconciliations` events are in flight;
//! past that the channel is left alone so the watches feel backpressure. A
//! failing unit is retried after a fixed delay; once the
//! attempts are used up it is counted and dropped, and the next periodic
//! resync of its config picks the pair up again.

use crate::config::ControllerConfig;
use crate::controller::reconciler::{PairUnit, Reconciler};
use crate::controller::watch_manager::InstanceEvent;
use crate::observability::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug)]
struct DispatchContext {
    reconciler: Arc<Reconciler>,
    permits: Semaphore,
    attempts: u32,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

#[derive(Debug)]
pub struct Dispatcher {
    ctx: Arc<DispatchContext>,
    max_in_flight: usize,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<Reconciler>, settings: &ControllerConfig, shutdown: CancellationToken) -> Self {
        Self {
            ctx: Arc::new(DispatchContext {
                reconciler,
                permits: Semaphore::new(settings.max_concurrent_reconciliations.max(1)),
                attempts: settings.instance_retry_attempts.max(1),
                retry_delay: settings.instance_retry_delay(),
                shutdown,
            }),
            max_in_flight: settings.max_concurrent_reconciliations.max(1),
        }
    }

    /// Consume events until the channel closes or shutdown is requested,
    /// then wait for in-flight units to finish.
    pub async fn run(self, mut events: mpsc::Receiver<InstanceEvent>) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                () = self.ctx.shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Instance event task panicked");
                    }
                }
                received = events.recv(), if tasks.len() < self.max_in_flight => match received {
                    Some(event) => {
                        tasks.spawn(process_event(Arc::clone(&self.ctx), event));
                    }
                    None => {
                        info!("Instance event channel closed");
                        break;
                    }
                },
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Instance event task panicked");
            }
        }
        info!("Instance event dispatcher stopped");
    }
}

async fn process_event(ctx: Arc<DispatchContext>, event: InstanceEvent) {
    let obj = event.event.object();
    let span = tracing::info_span!(
        "controller.instance_event",
        kind = %event.kind,
        event = event.event.label(),
        resource.namespace = obj.metadata.namespace.as_deref().unwrap_or(""),
        resource.name = obj.metadata.name.as_deref().unwrap_or(""),
    );

    async move {
        metrics::increment_instance_events(event.event.label());

        let Some(units) = units_with_retry(&ctx, &event).await else {
            return;
        };
        debug!(units = units.len(), "Dispatching instance event");

        futures::future::join_all(units.iter().map(|unit| run_unit(&ctx, unit))).await;
    }
    .instrument(span)
    .await;
}

async fn units_with_retry(ctx: &DispatchContext, event: &InstanceEvent) -> Option<Vec<PairUnit>> {
    for attempt in 1..=ctx.attempts {
        match ctx.reconciler.units_for(event).await {
            Ok(units) => return Some(units),
            Err(e) if attempt < ctx.attempts => {
                warn!(attempt, error = %e, "Failed to resolve event units, retrying");
                if !sleep_unless_shutdown(ctx).await {
                    return None;
                }
            }
            Err(e) => {
                metrics::increment_instance_event_failures();
                error!(attempts = attempt, error = %e, "Dropping instance event after retries");
            }
        }
    }
    None
}

async fn run_unit(ctx: &DispatchContext, unit: &PairUnit) {
    for attempt in 1..=ctx.attempts {
        let result = {
            let Ok(_permit) = ctx.permits.acquire().await else {
                return;
            };
            ctx.reconciler.reconcile_pair(unit).await
        };

        match result {
            Ok(action) => {
                debug!(pair = %unit.pair, action = ?action, "Pair reconciled");
                return;
            }
            Err(e) if attempt < ctx.attempts => {
                warn!(pair = %unit.pair, attempt, error = %e, "Pair reconciliation failed, retrying");
                if !sleep_unless_shutdown(ctx).await {
                    return;
                }
            }
            Err(e) => {
                metrics::increment_instance_event_failures();
                error!(pair = %unit.pair, attempts = attempt, error = %e, "Pair reconciliation failed, giving up");
            }
        }
    }
}

/// Returns `false` when shutdown interrupted the wait
async fn sleep_unless_shutdown(ctx: &DispatchContext) -> bool {
    tokio::select! {
        () = ctx.shutdown.cancelled() => false,
        () = tokio::time::sleep(ctx.retry_delay) => true,
    }
}

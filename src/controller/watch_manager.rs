//! # Dynamic Watch Manager
//!
//! Keeps at most one instance watch open per resolved resource kind, shared by
//! every BindingConfig that targets that kind.
//!
//! Each open watch is a background task that forwards [`InstanceEvent`]s onto
//! the controller's event channel until its cancellation token fires. The
//! token is cancelled exactly once, when the last subscribed config leaves.

use crate::observability::metrics;
use crate::store::{ObjectStore, WatchEvent};
use futures::StreamExt;
use kube::core::ApiResource;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Identity of a watched resource kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindKey {
    pub group: String,
    pub version: String,
    pub plural: String,
}

impl KindKey {
    pub fn of(resource: &ApiResource) -> Self {
        Self {
            group: resource.group.clone(),
            version: resource.version.clone(),
            plural: resource.plural.clone(),
        }
    }
}

impl fmt::Display for KindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.plural)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// A change to an instance of a watched kind
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub kind: KindKey,
    pub event: WatchEvent,
}

struct WatchEntry {
    resource: ApiResource,
    cancel: CancellationToken,
    subscribers: BTreeSet<String>,
    task: JoinHandle<()>,
}

/// Table of open watches keyed by kind
pub struct WatchManager {
    store: Arc<dyn ObjectStore>,
    namespace: Option<String>,
    events: mpsc::Sender<InstanceEvent>,
    restart_delay: Duration,
    watches: AsyncMutex<HashMap<KindKey, WatchEntry>>,
}

impl fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchManager")
            .field("namespace", &self.namespace)
            .field("restart_delay", &self.restart_delay)
            .finish_non_exhaustive()
    }
}

impl WatchManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        namespace: Option<String>,
        events: mpsc::Sender<InstanceEvent>,
        restart_delay: Duration,
    ) -> Self {
        Self {
            store,
            namespace,
            events,
            restart_delay,
            watches: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Namespace instance watches are scoped to (`None` = all)
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Subscribe `config_ref` to the kind of `resource`, opening the watch if needed.
    ///
    /// A config subscribed to a different kind is released from it first.
    /// Returns `true` when a new watch was opened.
    pub async fn acquire(&self, config_ref: &str, resource: &ApiResource) -> bool {
        let kind = KindKey::of(resource);
        let mut watches = self.watches.lock().await;

        release_locked(&mut watches, config_ref, Some(&kind));

        let opened = match watches.get_mut(&kind) {
            Some(entry) => {
                entry.subscribers.insert(config_ref.to_string());
                false
            }
            None => {
                let cancel = CancellationToken::new();
                let task = self.spawn_watch(kind.clone(), resource.clone(), cancel.clone());
                watches.insert(
                    kind.clone(),
                    WatchEntry {
                        resource: resource.clone(),
                        cancel,
                        subscribers: BTreeSet::from([config_ref.to_string()]),
                        task,
                    },
                );
                info!(kind = %kind, config = config_ref, "Opened instance watch");
                true
            }
        };

        metrics::set_active_watches(watches.len() as i64);
        opened
    }

    /// Remove `config_ref` from whatever kind it subscribes to.
    ///
    /// Returns the kind whose watch was closed, if this was its last subscriber.
    pub async fn release(&self, config_ref: &str) -> Option<KindKey> {
        let mut watches = self.watches.lock().await;
        let closed = release_locked(&mut watches, config_ref, None);
        metrics::set_active_watches(watches.len() as i64);
        closed
    }

    /// Configs currently subscribed to `kind`
    pub async fn subscribers(&self, kind: &KindKey) -> BTreeSet<String> {
        self.watches
            .lock()
            .await
            .get(kind)
            .map(|entry| entry.subscribers.clone())
            .unwrap_or_default()
    }

    pub async fn is_watching(&self, kind: &KindKey) -> bool {
        self.watches.lock().await.contains_key(kind)
    }

    pub async fn watched_kinds(&self) -> Vec<KindKey> {
        let mut kinds: Vec<KindKey> = self.watches.lock().await.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// API resource behind a watched kind
    pub async fn resource_of(&self, kind: &KindKey) -> Option<ApiResource> {
        self.watches
            .lock()
            .await
            .get(kind)
            .map(|entry| entry.resource.clone())
    }

    /// Cancel every watch and wait for the tasks to finish
    pub async fn shutdown(&self) {
        let drained: Vec<(KindKey, WatchEntry)> = self.watches.lock().await.drain().collect();
        metrics::set_active_watches(0);
        for (kind, entry) in drained {
            entry.cancel.cancel();
            if let Err(e) = entry.task.await {
                warn!(kind = %kind, error = %e, "Watch task did not shut down cleanly");
            }
        }
        info!("All instance watches stopped");
    }

    fn spawn_watch(&self, kind: KindKey, resource: ApiResource, cancel: CancellationToken) -> JoinHandle<()> {
        let span = tracing::info_span!("controller.watch", kind = %kind);
        let worker = WatchWorker {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            events: self.events.clone(),
            restart_delay: self.restart_delay,
            kind,
            resource,
            cancel,
        };
        tokio::spawn(worker.run().instrument(span))
    }
}

/// Drop `config_ref` from every entry except `keep`; close entries left empty
fn release_locked(
    watches: &mut HashMap<KindKey, WatchEntry>,
    config_ref: &str,
    keep: Option<&KindKey>,
) -> Option<KindKey> {
    let mut closed = None;
    watches.retain(|kind, entry| {
        if Some(kind) == keep || !entry.subscribers.remove(config_ref) {
            return true;
        }
        if !entry.subscribers.is_empty() {
            return true;
        }
        entry.cancel.cancel();
        info!(kind = %kind, config = config_ref, "Closed instance watch, no subscribers left");
        closed = Some(kind.clone());
        false
    });
    closed
}

struct WatchWorker {
    store: Arc<dyn ObjectStore>,
    namespace: Option<String>,
    events: mpsc::Sender<InstanceEvent>,
    restart_delay: Duration,
    kind: KindKey,
    resource: ApiResource,
    cancel: CancellationToken,
}

impl WatchWorker {
    async fn run(self) {
        loop {
            let opened = tokio::select! {
                () = self.cancel.cancelled() => break,
                opened = self.store.watch(&self.resource, self.namespace.as_deref()) => opened,
            };

            match opened {
                Ok(mut stream) => {
                    debug!("Watch stream opened");
                    loop {
                        let next = tokio::select! {
                            () = self.cancel.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                let event = InstanceEvent {
                                    kind: self.kind.clone(),
                                    event,
                                };
                                let sent = tokio::select! {
                                    () = self.cancel.cancelled() => return,
                                    sent = self.events.send(event) => sent,
                                };
                                if sent.is_err() {
                                    warn!("Event channel closed, stopping watch");
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Watch stream error");
                            }
                            None => {
                                warn!("Watch stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to open watch stream");
                }
            }

            warn!(delay_secs = self.restart_delay.as_secs_f64(), "Restarting watch stream");
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.restart_delay) => {}
            }
        }
        debug!("Watch cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn deployments() -> ApiResource {
        ApiResource {
            group: "apps".to_string(),
            version: "v1".to_string(),
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            plural: "deployments".to_string(),
        }
    }

    fn statefulsets() -> ApiResource {
        ApiResource {
            group: "apps".to_string(),
            version: "v1".to_string(),
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            plural: "statefulsets".to_string(),
        }
    }

    fn manager() -> (WatchManager, mpsc::Receiver<InstanceEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        (
            WatchManager::new(store, None, tx, Duration::from_millis(10)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_one_watch_per_kind() {
        let (manager, _rx) = manager();
        assert!(manager.acquire("a", &deployments()).await);
        assert!(!manager.acquire("b", &deployments()).await);

        let kind = KindKey::of(&deployments());
        assert_eq!(manager.watched_kinds().await, vec![kind.clone()]);
        assert_eq!(
            manager.subscribers(&kind).await,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn test_last_release_closes_watch() {
        let (manager, _rx) = manager();
        let kind = KindKey::of(&deployments());
        manager.acquire("a", &deployments()).await;
        manager.acquire("b", &deployments()).await;

        assert_eq!(manager.release("a").await, None);
        assert!(manager.is_watching(&kind).await);

        assert_eq!(manager.release("b").await, Some(kind.clone()));
        assert!(!manager.is_watching(&kind).await);

        // Releasing again is a no-op.
        assert_eq!(manager.release("b").await, None);
    }

    #[tokio::test]
    async fn test_retarget_moves_subscription() {
        let (manager, _rx) = manager();
        manager.acquire("a", &deployments()).await;
        manager.acquire("a", &statefulsets()).await;

        assert_eq!(
            manager.watched_kinds().await,
            vec![KindKey::of(&statefulsets())]
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (manager, _rx) = manager();
        manager.acquire("a", &deployments()).await;
        manager.acquire("b", &statefulsets()).await;
        manager.shutdown().await;
        assert!(manager.watched_kinds().await.is_empty());
    }

    #[test]
    fn test_kind_key_display() {
        assert_eq!(KindKey::of(&deployments()).to_string(), "apps/v1/deployments");
    }
}

//! Latest snapshots for the daemon's standing subscriptions, served to the
//! API without touching the engine lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::types::{BrowseKey, ServiceInstance};
use crate::error::{EngineError, Result};
use crate::hash;
use crate::hub::{Hub, Subscription, Update};
use crate::store::non_zero_types;

/// A `Failed` view is terminal for the life of the process
#[derive(Debug, Clone)]
pub enum View {
    Ready(Arc<Vec<ServiceInstance>>),
    Failed(EngineError),
}

impl View {
    fn into_result(self) -> Result<Arc<Vec<ServiceInstance>>> {
        match self {
            View::Ready(snapshot) => Ok(snapshot),
            View::Failed(e) => Err(e),
        }
    }
}

/// Handle to the snapshot cache
#[derive(Clone)]
pub struct SnapshotCache {
    hub: Hub,
    domain: String,
    settle: Duration,
    views: Arc<HashMap<BrowseKey, watch::Receiver<View>>>,
    hash_rx: watch::Receiver<String>,
}

impl SnapshotCache {
    /// Subscribe to the type view of `domain` plus every key in `watched`, and
    /// spawn one forwarder per subscription. Forwarders exit, releasing their
    /// subscriptions, when `cancel` fires.
    pub fn spawn(
        hub: Hub,
        domain: &str,
        watched: Vec<BrowseKey>,
        settle: Duration,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let types_key = BrowseKey::type_enumeration(domain);
        let (hash_tx, hash_rx) = watch::channel(hash::compute_hash(&[]));
        let mut views = HashMap::new();
        let mut handles = Vec::new();

        let mut keys = vec![types_key.clone()];
        keys.extend(watched.into_iter().filter(|key| *key != types_key));

        for key in keys {
            if views.contains_key(&key) {
                continue;
            }
            let (tx, rx) = watch::channel(View::Ready(Arc::new(Vec::new())));
            let subscription = hub.subscribe(key.clone());
            let hash_tx = (key == types_key).then(|| hash_tx.clone());
            handles.push(tokio::spawn(forward(subscription, tx, hash_tx, cancel.clone())));
            tracing::info!("Watching {}", key);
            views.insert(key, rx);
        }

        let cache = Self {
            hub,
            domain: types_key.domain,
            settle,
            views: Arc::new(views),
            hash_rx,
        };
        (cache, handles)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Service types with at least one live instance
    pub fn types(&self) -> Result<Vec<ServiceInstance>> {
        let key = BrowseKey::type_enumeration(&self.domain);
        let snapshot = self.current(&key).unwrap_or_else(|| Ok(Arc::new(Vec::new())))?;
        Ok(non_zero_types(&snapshot))
    }

    pub fn types_hash(&self) -> String {
        self.hash_rx.borrow().clone()
    }

    pub fn is_watched(&self, key: &BrowseKey) -> bool {
        self.views.contains_key(key)
    }

    /// Snapshot for any browse key. Unwatched keys get a short-lived
    /// subscription that collects updates for the settle period.
    pub async fn lookup(&self, key: &BrowseKey) -> Result<Arc<Vec<ServiceInstance>>> {
        if let Some(view) = self.current(key) {
            return view;
        }

        tracing::debug!("On-demand lookup of {}", key);
        let mut subscription = self.hub.subscribe(key.clone());
        let mut latest = Arc::new(Vec::new());
        let deadline = tokio::time::sleep(self.settle);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                update = subscription.recv() => match update {
                    Some(Update::Snapshot(snapshot)) => latest = snapshot,
                    Some(Update::Failed(e)) if e.is_browse_failure() => return Err(e),
                    Some(Update::Failed(e)) => tracing::debug!("Lookup of {}: {}", key, e),
                    None => break,
                },
            }
        }
        Ok(latest)
    }

    fn current(&self, key: &BrowseKey) -> Option<Result<Arc<Vec<ServiceInstance>>>> {
        self.views
            .get(key)
            .map(|rx| rx.borrow().clone().into_result())
    }
}

async fn forward(
    mut subscription: Subscription,
    tx: watch::Sender<View>,
    hash_tx: Option<watch::Sender<String>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            update = subscription.recv() => {
                match update {
                    Some(Update::Snapshot(snapshot)) => {
                        if let Some(hash_tx) = &hash_tx {
                            hash_tx.send_replace(hash::compute_hash(&non_zero_types(&snapshot)));
                        }
                        tx.send_replace(View::Ready(snapshot));
                    }
                    Some(Update::Failed(e)) if e.is_browse_failure() => {
                        tracing::error!(
                            "Watch on {} failed, serving the error until restart: {}",
                            subscription.key(),
                            e
                        );
                        tx.send_replace(View::Failed(e));
                    }
                    Some(Update::Failed(e)) => tracing::warn!("{}", e),
                    None => break,
                }
            }
        }
    }
    tracing::debug!("Stopped watching {}", subscription.key());
    subscription.unsubscribe();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;

    fn http() -> BrowseKey {
        BrowseKey::new("_http._tcp", "local.")
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn spawn(backend: &FakeBackend, watched: Vec<BrowseKey>) -> (SnapshotCache, Hub, CancellationToken, Vec<JoinHandle<()>>) {
        let hub = Hub::new(Arc::new(backend.clone()));
        let cancel = CancellationToken::new();
        let (cache, handles) =
            SnapshotCache::spawn(hub.clone(), "local.", watched, Duration::from_millis(50), cancel.clone());
        (cache, hub, cancel, handles)
    }

    #[tokio::test]
    async fn test_watched_types_and_hash() {
        let backend = FakeBackend::new();
        let (cache, _hub, _cancel, _handles) = spawn(&backend, vec![http()]);
        let empty_hash = cache.types_hash();

        backend.found_type("_http", "_tcp");
        backend.found(&http(), "web", false);

        eventually(|| cache.types().map(|t| t.len() == 1).unwrap_or(false)).await;
        assert_eq!(cache.types().unwrap()[0].service_count, Some(1));
        eventually(|| cache.types_hash() != empty_hash).await;

        let services = cache.lookup(&http()).await.unwrap();
        assert_eq!(services.len(), 1);
    }

    #[tokio::test]
    async fn test_on_demand_lookup_releases_session() {
        let backend = FakeBackend::new();
        let (cache, hub, _cancel, _handles) = spawn(&backend, Vec::new());
        let ssh = BrowseKey::new("_ssh._tcp", "local.");

        assert!(!cache.is_watched(&ssh));
        let services = cache.lookup(&ssh).await.unwrap();

        assert!(services.is_empty());
        assert_eq!(backend.opened(&ssh), 1);
        assert_eq!(backend.stopped(&ssh), 1);
        assert!(!hub.open_sessions().contains(&ssh));
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let backend = FakeBackend::new();
        let ssh = BrowseKey::new("_ssh._tcp", "local.");
        backend.refuse_browse(&ssh);
        let (cache, _hub, _cancel, _handles) = spawn(&backend, Vec::new());

        assert!(cache.lookup(&ssh).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_watch_stays_failed() {
        let backend = FakeBackend::new();
        let ssh = BrowseKey::new("_ssh._tcp", "local.");
        backend.refuse_browse(&ssh);
        let (cache, _hub, _cancel, _handles) = spawn(&backend, vec![ssh.clone()]);

        eventually(|| matches!(cache.current(&ssh), Some(Err(_)))).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.lookup(&ssh).await.is_err());
        assert!(cache.types().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_releases_watches() {
        let backend = FakeBackend::new();
        let (_cache, hub, cancel, handles) = spawn(&backend, vec![http()]);
        assert_eq!(backend.live(), 2);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backend.live(), 0);
        assert!(hub.open_sessions().is_empty());
    }
}

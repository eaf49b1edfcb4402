//! Kubernetes resource watchers.
//!
//! A [`ResourceWatcher`] turns a [`WatchSource`] into an endless,
//! de-duplicated sequence of Added/Modified/Deleted notifications:
//! - a missing or expired resourceVersion triggers a full relist, which
//!   re-emits Added for every live object and Deleted for every object that
//!   vanished while we were not watching
//! - a watch stream that ends is resumed from the last seen resourceVersion
//! - repeated notifications for the same object version are dropped
//!
//! Watchers never write to the cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cluster_client::{ClusterError, WatchChange, WatchSource};
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::channel::ChangeType;
use crate::metrics::Metrics;

type ObjectId = (Option<String>, String);

fn object_id<K: Resource>(object: &K) -> ObjectId {
    (object.namespace(), object.name_any())
}

pub struct ResourceWatcher<K> {
    name: String,
    source: Arc<dyn WatchSource<K>>,
    backoff_min: Duration,
    backoff_max: Duration,
    metrics: Arc<Metrics>,
    ready: Option<Arc<AtomicBool>>,
    known: HashMap<ObjectId, K>,
}

impl<K> ResourceWatcher<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(source: Arc<dyn WatchSource<K>>, metrics: Arc<Metrics>) -> Self {
        Self {
            name: source.describe(),
            source,
            backoff_min: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            metrics,
            ready: None,
            known: HashMap::new(),
        }
    }

    /// Backoff applied after list or watch failures
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max;
        self
    }

    /// Flag set once the first list completed
    pub fn with_ready_flag(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Watch until `shutdown` flips (or its sender is dropped)
    pub async fn run<F>(mut self, mut sink: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(ChangeType, K) + Send,
    {
        info!("Starting {} watcher", self.name);
        let mut backoff = FibonacciBackoff::new(self.backoff_min, self.backoff_max);
        let mut resource_version: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let version = match resource_version.clone() {
                Some(version) => version,
                None => {
                    let listed = tokio::select! {
                        listed = self.source.list() => listed,
                        _ = shutdown.changed() => break,
                    };
                    match listed {
                        Ok((items, version)) => {
                            self.relist(items, &mut sink);
                            if let Some(ready) = &self.ready {
                                ready.store(true, Ordering::SeqCst);
                            }
                            backoff.reset();
                            resource_version = Some(version.clone());
                            version
                        }
                        Err(e) => {
                            warn!("Failed to list {}: {}", self.name, e);
                            if !pause(&mut backoff, &mut shutdown).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let opened = tokio::select! {
                opened = self.source.watch(&version) => opened,
                _ = shutdown.changed() => break,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(ClusterError::Expired(_)) => {
                    self.restarted("expired");
                    resource_version = None;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to watch {} from {}: {}", self.name, version, e);
                    self.restarted("error");
                    if !pause(&mut backoff, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let next = tokio::select! {
                    next = stream.next() => next,
                    _ = shutdown.changed() => return,
                };
                match next {
                    Some(Ok(WatchChange::Added(object))) => {
                        backoff.reset();
                        self.observe(ChangeType::Added, object, &mut resource_version, &mut sink);
                    }
                    Some(Ok(WatchChange::Modified(object))) => {
                        backoff.reset();
                        self.observe(ChangeType::Modified, object, &mut resource_version, &mut sink);
                    }
                    Some(Ok(WatchChange::Deleted(object))) => {
                        backoff.reset();
                        if let Some(version) = object.resource_version() {
                            resource_version = Some(version);
                        }
                        self.known.remove(&object_id(&object));
                        sink(ChangeType::Deleted, object);
                    }
                    Some(Ok(WatchChange::Bookmark(version))) => {
                        resource_version = Some(version);
                    }
                    Some(Ok(WatchChange::Expired)) | Some(Err(ClusterError::Expired(_))) => {
                        info!("{} resourceVersion expired, relisting", self.name);
                        self.restarted("expired");
                        resource_version = None;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("{} watch failed: {}", self.name, e);
                        self.restarted("error");
                        if !pause(&mut backoff, &mut shutdown).await {
                            return;
                        }
                        break;
                    }
                    None => {
                        debug!(
                            "{} watch stream ended, resuming from {:?}",
                            self.name, resource_version
                        );
                        self.restarted("closed");
                        break;
                    }
                }
            }
        }
        info!("Stopped {} watcher", self.name);
    }

    fn observe<F>(&mut self, change: ChangeType, object: K, resource_version: &mut Option<String>, sink: &mut F)
    where
        F: FnMut(ChangeType, K),
    {
        let id = object_id(&object);
        let version = object.resource_version();
        if version.is_some() {
            if let Some(known) = self.known.get(&id) {
                if known.resource_version() == version {
                    debug!("Dropping duplicate {} event for {:?}", self.name, id);
                    return;
                }
            }
            resource_version.clone_from(&version);
        }
        self.known.insert(id, object.clone());
        sink(change, object);
    }

    fn relist<F>(&mut self, items: Vec<K>, sink: &mut F)
    where
        F: FnMut(ChangeType, K),
    {
        let mut live: HashMap<ObjectId, K> = HashMap::with_capacity(items.len());
        for object in items {
            live.insert(object_id(&object), object);
        }

        let vanished: Vec<K> = self
            .known
            .iter()
            .filter(|(id, _)| !live.contains_key(*id))
            .map(|(_, object)| object.clone())
            .collect();

        debug!(
            "{} relist: {} live, {} vanished",
            self.name,
            live.len(),
            vanished.len()
        );

        let mut ordered: Vec<(ObjectId, K)> = live.into_iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        self.known.clear();
        for (id, object) in ordered {
            self.known.insert(id, object.clone());
            sink(ChangeType::Added, object);
        }
        for object in vanished {
            sink(ChangeType::Deleted, object);
        }
    }

    fn restarted(&self, reason: &str) {
        self.metrics
            .watch_restarts
            .with_label_values(&[self.name.as_str()])
            .inc();
        debug!("{} watch restart ({})", self.name, reason);
    }
}

/// Sleep for the next backoff; false when shutdown was requested meanwhile
async fn pause(backoff: &mut FibonacciBackoff, shutdown: &mut watch::Receiver<bool>) -> bool {
    let delay = backoff.next_backoff();
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use cluster_client::MockWatchSource;
    use k8s_openapi::api::core::v1::ConfigMap;
    use tokio::sync::mpsc;

    type Seen = (ChangeType, String, Option<String>);

    fn start(source: Arc<MockWatchSource<ConfigMap>>) -> (mpsc::UnboundedReceiver<Seen>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ResourceWatcher::new(source, test_metrics())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5));
        tokio::spawn(watcher.run(
            move |change, cm: ConfigMap| {
                let _ = tx.send((change, cm.name_any(), cm.resource_version()));
            },
            shutdown_rx,
        ));
        (rx, shutdown_tx)
    }

    async fn take(rx: &mut mpsc::UnboundedReceiver<Seen>, n: usize) -> Vec<Seen> {
        let mut out = Vec::new();
        for _ in 0..n {
            let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            out.push(item);
        }
        out
    }

    async fn wait_for_watches(source: &MockWatchSource<ConfigMap>, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let versions = source.watch_versions();
            if versions.len() >= n {
                return versions;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watch was not restarted");
    }

    #[tokio::test]
    async fn test_resumes_from_last_resource_version() {
        let source = Arc::new(MockWatchSource::new());
        source.push_list(vec![create_test_config_map_rv("a", "ns", "10")], "10");
        source.push_session(vec![Ok(WatchChange::Modified(create_test_config_map_rv("a", "ns", "11")))]);

        let (mut rx, _shutdown) = start(source.clone());
        let seen = take(&mut rx, 2).await;
        assert_eq!(seen[0], (ChangeType::Added, "a".to_string(), Some("10".to_string())));
        assert_eq!(seen[1], (ChangeType::Modified, "a".to_string(), Some("11".to_string())));

        let versions = wait_for_watches(&source, 2).await;
        assert_eq!(versions, vec!["10".to_string(), "11".to_string()]);
        assert_eq!(source.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_triggers_relist_with_synthetic_events() {
        let source = Arc::new(MockWatchSource::new());
        source.push_list(
            vec![
                create_test_config_map_rv("a", "ns", "1"),
                create_test_config_map_rv("b", "ns", "2"),
            ],
            "5",
        );
        source.push_session(vec![Ok(WatchChange::Expired)]);
        source.push_list(vec![create_test_config_map_rv("a", "ns", "1")], "9");

        let (mut rx, _shutdown) = start(source.clone());
        let seen = take(&mut rx, 4).await;
        let summary: Vec<(ChangeType, String)> = seen.into_iter().map(|(c, n, _)| (c, n)).collect();
        assert_eq!(
            summary,
            vec![
                (ChangeType::Added, "a".to_string()),
                (ChangeType::Added, "b".to_string()),
                (ChangeType::Added, "a".to_string()),
                (ChangeType::Deleted, "b".to_string()),
            ]
        );
        let versions = wait_for_watches(&source, 2).await;
        assert_eq!(versions[1], "9");
        assert_eq!(source.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_versions_are_dropped() {
        let source = Arc::new(MockWatchSource::new());
        source.push_list(vec![], "1");
        source.push_session(vec![
            Ok(WatchChange::Added(create_test_config_map_rv("a", "ns", "2"))),
            Ok(WatchChange::Added(create_test_config_map_rv("a", "ns", "2"))),
            Ok(WatchChange::Modified(create_test_config_map_rv("a", "ns", "3"))),
            Ok(WatchChange::Deleted(create_test_config_map_rv("a", "ns", "4"))),
        ]);

        let (mut rx, _shutdown) = start(source.clone());
        let seen = take(&mut rx, 3).await;
        let kinds: Vec<ChangeType> = seen.into_iter().map(|(c, _, _)| c).collect();
        assert_eq!(kinds, vec![ChangeType::Added, ChangeType::Modified, ChangeType::Deleted]);
        let versions = wait_for_watches(&source, 2).await;
        assert_eq!(versions[1], "4");
    }

    #[tokio::test]
    async fn test_bookmark_and_errors_keep_position() {
        let source = Arc::new(MockWatchSource::new());
        source.push_list(vec![], "1");
        source.push_session(vec![Ok(WatchChange::Bookmark("20".to_string()))]);
        source.push_session(vec![Err(ClusterError::Transient("connection reset".to_string()))]);

        let (_rx, _shutdown) = start(source.clone());
        let versions = wait_for_watches(&source, 3).await;
        assert_eq!(versions, vec!["1".to_string(), "20".to_string(), "20".to_string()]);
        assert_eq!(source.list_calls(), 1);
    }

    #[tokio::test]
    async fn test_list_failure_is_retried_and_sets_ready() {
        let source = Arc::new(MockWatchSource::new());
        source.push_list_error(ClusterError::Transient("apiserver down".to_string()));
        source.push_list(vec![create_test_config_map_rv("a", "ns", "3")], "3");

        let ready = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let watcher = ResourceWatcher::new(source.clone() as Arc<dyn WatchSource<ConfigMap>>, test_metrics())
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
            .with_ready_flag(ready.clone());
        tokio::spawn(watcher.run(
            move |change, cm: ConfigMap| {
                let _ = tx.send((change, cm.name_any(), cm.resource_version()));
            },
            shutdown_rx,
        ));

        let seen = take(&mut rx, 1).await;
        assert_eq!(seen[0].1, "a");
        assert!(ready.load(Ordering::SeqCst));
        assert_eq!(source.list_calls(), 2);
    }
}

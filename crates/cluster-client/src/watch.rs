//! List and watch sources
//!
//! A [`WatchSource`] exposes the two primitives a resumable watcher needs:
//! a full list returning the collection resourceVersion, and a watch stream
//! starting from a given resourceVersion. Resumption and relisting are the
//! caller's job.

use std::fmt::Debug;

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use k8s_openapi::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::ClusterError;

/// One change record from a watch stream
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Progress marker carrying a resourceVersion
    Bookmark(String),
    /// The resourceVersion is too old, relist required
    Expired,
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchChange<K>, ClusterError>>;

#[async_trait::async_trait]
pub trait WatchSource<K>: Send + Sync
where
    K: Send + 'static,
{
    /// Human readable name of the watched collection
    fn describe(&self) -> String;

    /// List all objects, returning them with the collection resourceVersion
    async fn list(&self) -> Result<(Vec<K>, String), ClusterError>;

    /// Watch for changes after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, ClusterError>;
}

/// Server-side watch timeout in seconds (must stay below 295)
const WATCH_TIMEOUT_SECS: u32 = 290;

/// WatchSource backed by the API server
pub struct KubeWatchSource<K>
where
    K: Resource,
{
    api: Api<K>,
    selector: Option<String>,
    kind: String,
}

impl<K> KubeWatchSource<K>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    /// Watch `K` in `namespace` (all namespaces when `None`), filtered by label selector
    pub fn new(client: Client, namespace: Option<&str>, selector: Option<String>) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all_with(client, &Default::default()),
        };
        Self {
            api,
            selector,
            kind: K::kind(&Default::default()).to_string(),
        }
    }
}

fn convert<K>(event: Result<WatchEvent<K>, kube::Error>) -> Result<WatchChange<K>, ClusterError> {
    match event {
        Ok(WatchEvent::Added(obj)) => Ok(WatchChange::Added(obj)),
        Ok(WatchEvent::Modified(obj)) => Ok(WatchChange::Modified(obj)),
        Ok(WatchEvent::Deleted(obj)) => Ok(WatchChange::Deleted(obj)),
        Ok(WatchEvent::Bookmark(bm)) => Ok(WatchChange::Bookmark(bm.metadata.resource_version)),
        Ok(WatchEvent::Error(e)) if e.code == 410 => Ok(WatchChange::Expired),
        Ok(WatchEvent::Error(e)) => Err(ClusterError::Transient(format!("watch error {}: {}", e.code, e.message))),
        Err(e) => match ClusterError::from_kube(e, "watch") {
            ClusterError::Expired(_) => Ok(WatchChange::Expired),
            other => Err(other),
        },
    }
}

#[async_trait::async_trait]
impl<K> WatchSource<K> for KubeWatchSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    fn describe(&self) -> String {
        self.kind.clone()
    }

    async fn list(&self) -> Result<(Vec<K>, String), ClusterError> {
        let mut params = ListParams::default();
        if let Some(selector) = &self.selector {
            params = params.labels(selector);
        }
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| ClusterError::from_kube(e, &format!("list {}", self.kind)))?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(kind = %self.kind, count = list.items.len(), %resource_version, "Listed");
        Ok((list.items, resource_version))
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, ClusterError> {
        let mut params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(selector) = &self.selector {
            params = params.labels(selector);
        }

        // The kube stream borrows its Api, so it is driven by a task that
        // owns a clone and forwards into a channel.
        let api = self.api.clone();
        let version = resource_version.to_string();
        let (tx, rx) = futures::channel::mpsc::unbounded();
        tokio::spawn(async move {
            let stream = match api.watch(&params, &version).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.unbounded_send(convert::<K>(Err(e)));
                    return;
                }
            };
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                if tx.unbounded_send(convert(event)).is_err() {
                    break;
                }
            }
        });
        Ok(rx.boxed())
    }
}

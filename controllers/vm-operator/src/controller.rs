//! Main controller implementation.
//!
//! Wires the watchers, the VM channel registry and its handlers, the pool
//! sweeper and the probe server together and runs them until shutdown.

use std::fmt::Debug;
use std::sync::Arc;

use cluster_client::{ClusterClient, ClusterClientTrait, KubeWatchSource, ManagedObject, VmKey, WatchSource};
use crds::{VirtualMachine, VmPool, managed_by_selector};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::channel::{ChangeType, ChannelRegistry, VmChannelEvent, VmEventHandler};
use crate::config::OperatorConfig;
use crate::console::ConsoleAccess;
use crate::display_secret::DisplaySecretManager;
use crate::error::ControllerError;
use crate::metrics::{self, Metrics, ProbeState, Readiness};
use crate::pool::PoolManager;
use crate::reconciler::Reconciler;
use crate::store::VmDirectory;
use crate::watcher::ResourceWatcher;

/// Route a child event to the channel of the VM that owns it
fn route_child(registry: &ChannelRegistry, change: ChangeType, object: ManagedObject) {
    let Some(vm_name) = object.instance().or_else(|| object.owner_vm()).map(str::to_string) else {
        debug!(object = %object.key(), "Ignoring child without owning VM");
        return;
    };
    let key = VmKey::new(object.namespace(), vm_name);
    registry.dispatch(key, VmChannelEvent::Child { change, object });
}

/// Main controller for VirtualMachine management.
pub struct Controller {
    config: Arc<OperatorConfig>,
    kube_client: Client,
    metrics: Arc<Metrics>,
    readiness: Arc<Readiness>,
    registry: Arc<ChannelRegistry>,
    pools: Arc<PoolManager>,
    console: Arc<ConsoleAccess>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: OperatorConfig) -> Result<Self, ControllerError> {
        info!("Initializing VM operator");
        let config = Arc::new(config);

        let kube_client = Client::try_default().await?;
        let client: Arc<dyn ClusterClientTrait> =
            Arc::new(ClusterClient::new(kube_client.clone(), &config.operator_name));

        let metrics = Arc::new(
            Metrics::new().map_err(|e| ControllerError::InvalidConfig(format!("metrics registry: {}", e)))?,
        );
        let readiness = Arc::new(Readiness::new());
        let directory = Arc::new(VmDirectory::new());

        let secrets = Arc::new(DisplaySecretManager::new(client.clone(), config.clone(), metrics.clone()));
        let pools = Arc::new(PoolManager::new(client.clone(), directory.clone(), metrics.clone()));
        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            config.clone(),
            secrets.clone(),
            metrics.clone(),
        ));
        let console = Arc::new(ConsoleAccess::new(
            client,
            config.clone(),
            directory,
            pools.clone(),
            secrets.clone(),
        ));

        // Secrets and pools see each event before the reconciler does
        let handlers: Vec<Arc<dyn VmEventHandler>> = vec![secrets, pools.clone(), reconciler];
        let registry = ChannelRegistry::new(handlers, metrics.clone());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            kube_client,
            metrics,
            readiness,
            registry,
            pools,
            console,
            shutdown,
            tasks: Vec::new(),
        })
    }

    /// Console operations backed by this controller's state
    pub fn console(&self) -> Arc<ConsoleAccess> {
        self.console.clone()
    }

    fn watcher<K>(&self, selector: Option<String>) -> ResourceWatcher<K>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        <K as Resource>::DynamicType: Default,
    {
        let source: Arc<dyn WatchSource<K>> = Arc::new(KubeWatchSource::<K>::new(
            self.kube_client.clone(),
            self.config.namespace.as_deref(),
            selector,
        ));
        let gate = self.readiness.gate(&source.describe());
        ResourceWatcher::new(source, self.metrics.clone()).with_ready_flag(gate)
    }

    fn spawn_child_watcher<K>(&mut self)
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        <K as Resource>::DynamicType: Default,
        ManagedObject: From<K>,
    {
        let watcher = self.watcher::<K>(Some(managed_by_selector(&self.config.operator_name)));
        let registry = self.registry.clone();
        let shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(watcher.run(
            move |change, object: K| route_child(&registry, change, ManagedObject::from(object)),
            shutdown,
        )));
    }

    fn spawn_watchers(&mut self) {
        let vms = self.watcher::<VirtualMachine>(None);
        let registry = self.registry.clone();
        self.tasks.push(tokio::spawn(vms.run(
            move |change, vm: VirtualMachine| {
                let key = VmKey::new(vm.namespace().unwrap_or_default(), vm.name_any());
                registry.dispatch(key, VmChannelEvent::Vm { change, vm: Box::new(vm) });
            },
            self.shutdown.subscribe(),
        )));

        let pools = self.watcher::<VmPool>(None);
        let manager = self.pools.clone();
        self.tasks.push(tokio::spawn(pools.run(
            move |change, pool: VmPool| manager.observe_pool(change, &pool),
            self.shutdown.subscribe(),
        )));

        self.spawn_child_watcher::<ConfigMap>();
        self.spawn_child_watcher::<PersistentVolumeClaim>();
        self.spawn_child_watcher::<Pod>();
        self.spawn_child_watcher::<Service>();
        self.spawn_child_watcher::<Secret>();
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!(
            namespace = self.config.namespace.as_deref().unwrap_or("all namespaces"),
            operator = %self.config.operator_name,
            "VM operator running"
        );
        self.spawn_watchers();

        let sweeper = self
            .pools
            .clone()
            .run_sweeper(self.config.pool_sweep_interval, self.shutdown.subscribe());
        self.tasks.push(tokio::spawn(sweeper));

        let probes = ProbeState {
            metrics: self.metrics.clone(),
            readiness: self.readiness.clone(),
        };
        let mut server = tokio::spawn(metrics::serve(self.config.metrics_addr, probes, self.shutdown.subscribe()));

        let result = tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown requested");
                Ok(())
            }
            result = &mut server => match result {
                Ok(served) => served,
                Err(e) => Err(ControllerError::Watch(format!("probe server panicked: {}", e))),
            }
        };

        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        if !server.is_finished() {
            let _ = server.await;
        }
        info!(channels = self.registry.len(), "VM operator stopped");
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

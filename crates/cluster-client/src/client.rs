//! ClusterClient backed by `kube::Client`

use std::fmt::Debug;

use crds::{PoolAssignment, VirtualMachine, VirtualMachineStatus};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{ChildKind, ManagedObject, ObjectKey, VmEvent, VmKey, status_patch};

#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    recorder: Recorder,
    field_manager: String,
}

impl ClusterClient {
    /// Create a client; `operator_name` is the field manager and event reporter
    pub fn new(client: Client, operator_name: &str) -> Self {
        let reporter = Reporter {
            controller: operator_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            field_manager: operator_name.to_string(),
        }
    }

    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        }
    }

    async fn get_typed<K>(&self, key: &ObjectKey) -> Result<Option<K>, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| ClusterError::from_kube(e, &key.to_string()))
    }

    async fn create_typed<K>(&self, key: &ObjectKey, object: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..PostParams::default()
        };
        self.api::<K>(&key.namespace)
            .create(&params, object)
            .await
            .map_err(|e| ClusterError::from_kube(e, &key.to_string()))
    }

    async fn patch_typed<K>(&self, key: &ObjectKey, object: &K) -> Result<K, ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(&key.namespace)
            .patch(&key.name, &self.patch_params(), &Patch::Merge(object))
            .await
            .map_err(|e| ClusterError::from_kube(e, &key.to_string()))
    }

    async fn delete_typed<K>(&self, key: &ObjectKey) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>(&key.namespace)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, &key.to_string()))
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for ClusterClient {
    async fn get_child(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, ClusterError> {
        let object = match key.kind {
            ChildKind::ConfigMap => self.get_typed::<ConfigMap>(key).await?.map(ManagedObject::from),
            ChildKind::Secret => self.get_typed::<Secret>(key).await?.map(ManagedObject::from),
            ChildKind::PersistentVolumeClaim => self
                .get_typed::<PersistentVolumeClaim>(key)
                .await?
                .map(ManagedObject::from),
            ChildKind::Pod => self.get_typed::<Pod>(key).await?.map(ManagedObject::from),
            ChildKind::Service => self.get_typed::<Service>(key).await?.map(ManagedObject::from),
        };
        Ok(object)
    }

    async fn create_child(&self, object: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        let key = object.key();
        debug!(object = %key, "Creating");
        Ok(match object {
            ManagedObject::ConfigMap(o) => self.create_typed(&key, o).await?.into(),
            ManagedObject::Secret(o) => self.create_typed(&key, o).await?.into(),
            ManagedObject::PersistentVolumeClaim(o) => self.create_typed(&key, o).await?.into(),
            ManagedObject::Pod(o) => self.create_typed(&key, o).await?.into(),
            ManagedObject::Service(o) => self.create_typed(&key, o).await?.into(),
        })
    }

    async fn patch_child(&self, object: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        let key = object.key();
        debug!(object = %key, resource_version = ?object.resource_version(), "Patching");
        Ok(match object {
            ManagedObject::ConfigMap(o) => self.patch_typed(&key, o).await?.into(),
            ManagedObject::Secret(o) => self.patch_typed(&key, o).await?.into(),
            ManagedObject::PersistentVolumeClaim(o) => self.patch_typed(&key, o).await?.into(),
            ManagedObject::Pod(o) => self.patch_typed(&key, o).await?.into(),
            ManagedObject::Service(o) => self.patch_typed(&key, o).await?.into(),
        })
    }

    async fn delete_child(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        debug!(object = %key, "Deleting");
        match key.kind {
            ChildKind::ConfigMap => self.delete_typed::<ConfigMap>(key).await,
            ChildKind::Secret => self.delete_typed::<Secret>(key).await,
            ChildKind::PersistentVolumeClaim => self.delete_typed::<PersistentVolumeClaim>(key).await,
            ChildKind::Pod => self.delete_typed::<Pod>(key).await,
            ChildKind::Service => self.delete_typed::<Service>(key).await,
        }
    }

    async fn patch_vm_status(&self, vm: &VmKey, status: &VirtualMachineStatus) -> Result<(), ClusterError> {
        let api: Api<VirtualMachine> = self.api(&vm.namespace);
        let body = status_patch(status)?;
        api.patch_status(&vm.name, &self.patch_params(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, &format!("VirtualMachine {}", vm)))
    }

    async fn patch_vm_assignment(&self, vm: &VmKey, assignment: Option<&PoolAssignment>) -> Result<(), ClusterError> {
        let api: Api<VirtualMachine> = self.api(&vm.namespace);
        let body = json!({ "status": { "assignment": assignment } });
        api.patch_status(&vm.name, &self.patch_params(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, &format!("VirtualMachine {}", vm)))
    }

    async fn patch_vm_spec(&self, vm: &VmKey, patch: Value) -> Result<(), ClusterError> {
        let api: Api<VirtualMachine> = self.api(&vm.namespace);
        let body = json!({ "spec": patch });
        api.patch(&vm.name, &self.patch_params(), &Patch::Merge(&body))
            .await
            .map(|_| ())
            .map_err(|e| ClusterError::from_kube(e, &format!("VirtualMachine {}", vm)))
    }

    async fn record_event(&self, vm: &VirtualMachine, event: &VmEvent) -> Result<(), ClusterError> {
        let reference = vm.object_ref(&());
        let ev = Event {
            type_: if event.warning {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: event.reason.clone(),
            note: Some(event.note.clone()),
            action: event.action.clone(),
            secondary: None,
        };
        self.recorder
            .publish(&ev, &reference)
            .await
            .map_err(|e| ClusterError::from_kube(e, "Event"))
    }
}

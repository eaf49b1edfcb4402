//! Managed object models
//!
//! A VM owns a small fixed set of child kinds. [`ManagedObject`] is a tagged
//! union over the typed k8s-openapi objects so the reconciler can diff and
//! apply them uniformly.

use std::collections::BTreeMap;
use std::fmt;

use crds::{INSTANCE_LABEL, SPEC_HASH_ANNOTATION, VirtualMachineStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{Value, json};

/// Namespace-qualified VM name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmKey {
    pub namespace: String,
    pub name: String,
}

impl VmKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChildKind {
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    Pod,
    Service,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::ConfigMap => "ConfigMap",
            ChildKind::Secret => "Secret",
            ChildKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ChildKind::Pod => "Pod",
            ChildKind::Service => "Service",
        }
    }
}

impl fmt::Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a child object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ChildKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ChildKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Pod(Pod),
    Service(Service),
}

impl ManagedObject {
    pub fn kind(&self) -> ChildKind {
        match self {
            ManagedObject::ConfigMap(_) => ChildKind::ConfigMap,
            ManagedObject::Secret(_) => ChildKind::Secret,
            ManagedObject::PersistentVolumeClaim(_) => ChildKind::PersistentVolumeClaim,
            ManagedObject::Pod(_) => ChildKind::Pod,
            ManagedObject::Service(_) => ChildKind::Service,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ManagedObject::ConfigMap(o) => &o.metadata,
            ManagedObject::Secret(o) => &o.metadata,
            ManagedObject::PersistentVolumeClaim(o) => &o.metadata,
            ManagedObject::Pod(o) => &o.metadata,
            ManagedObject::Service(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedObject::ConfigMap(o) => &mut o.metadata,
            ManagedObject::Secret(o) => &mut o.metadata,
            ManagedObject::PersistentVolumeClaim(o) => &mut o.metadata,
            ManagedObject::Pod(o) => &mut o.metadata,
            ManagedObject::Service(o) => &mut o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace(), self.name())
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    pub fn set_resource_version(&mut self, resource_version: Option<String>) {
        self.metadata_mut().resource_version = resource_version;
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata().annotations.as_ref()?.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: String) {
        self.metadata_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value);
    }

    /// Content hash stamped on generated objects
    pub fn spec_hash(&self) -> Option<&str> {
        self.annotation(SPEC_HASH_ANNOTATION)
    }

    /// Name of the VM named by the instance label
    pub fn instance(&self) -> Option<&str> {
        self.metadata().labels.as_ref()?.get(INSTANCE_LABEL).map(String::as_str)
    }

    /// Name of the owning VirtualMachine from the owner references
    pub fn owner_vm(&self) -> Option<&str> {
        self.metadata()
            .owner_references
            .as_ref()?
            .iter()
            .find(|r| r.kind == "VirtualMachine")
            .map(|r| r.name.as_str())
    }

    /// Deletion has been requested but the object still exists
    pub fn is_terminating(&self) -> bool {
        self.metadata().deletion_timestamp.is_some()
    }

    pub fn as_pod(&self) -> Option<&Pod> {
        match self {
            ManagedObject::Pod(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&Secret> {
        match self {
            ManagedObject::Secret(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_config_map(&self) -> Option<&ConfigMap> {
        match self {
            ManagedObject::ConfigMap(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            ManagedObject::Service(s) => Some(s),
            _ => None,
        }
    }
}

impl From<ConfigMap> for ManagedObject {
    fn from(o: ConfigMap) -> Self {
        ManagedObject::ConfigMap(o)
    }
}

impl From<Secret> for ManagedObject {
    fn from(o: Secret) -> Self {
        ManagedObject::Secret(o)
    }
}

impl From<PersistentVolumeClaim> for ManagedObject {
    fn from(o: PersistentVolumeClaim) -> Self {
        ManagedObject::PersistentVolumeClaim(o)
    }
}

impl From<Pod> for ManagedObject {
    fn from(o: Pod) -> Self {
        ManagedObject::Pod(o)
    }
}

impl From<Service> for ManagedObject {
    fn from(o: Service) -> Self {
        ManagedObject::Service(o)
    }
}

/// Kubernetes event published against a VirtualMachine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEvent {
    pub warning: bool,
    pub reason: String,
    pub note: String,
    pub action: String,
}

impl VmEvent {
    pub fn normal(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            warning: false,
            reason: reason.into(),
            note: note.into(),
            action: "Reconcile".to_string(),
        }
    }

    pub fn warning(reason: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            warning: true,
            ..Self::normal(reason, note)
        }
    }
}

/// Merge patch body for a status update
///
/// Unset optional fields are sent as `null` so a merge patch clears them.
/// `assignment` belongs to the pool manager and is never part of this patch.
pub fn status_patch(status: &VirtualMachineStatus) -> Result<Value, serde_json::Error> {
    let mut body = serde_json::to_value(status)?;
    if let Value::Object(map) = &mut body {
        map.remove("assignment");
        for field in ["conditions", "cpus", "ram", "nodeName", "observedGeneration"] {
            map.entry(field).or_insert(Value::Null);
        }
    }
    Ok(json!({ "status": body }))
}

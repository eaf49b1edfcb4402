//! Per-VM state and the shared VM directory
//!
//! [`VmState`] is owned by the VM's channel task and is only ever touched
//! from there. [`VmDirectory`] is the read side used by the pool manager and
//! console access, which run outside the channel tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use cluster_client::{ManagedObject, ObjectKey, VmKey};
use crds::VirtualMachine;

use crate::channel::{ChangeType, VmChannelEvent};

/// Last known desired and observed state of one VM
#[derive(Debug, Clone)]
pub struct VmState {
    pub key: VmKey,
    /// Desired state, `None` until the VM is first seen or after deletion
    pub vm: Option<VirtualMachine>,
    /// Child objects as last seen through watches or our own writes
    pub observed: BTreeMap<ObjectKey, ManagedObject>,
    /// Objects we asked to delete whose Deleted event has not arrived yet
    pub deleting: BTreeSet<ObjectKey>,
    /// Generation whose spec was rejected, reconciliation waits for a newer one
    pub suspended_generation: Option<i64>,
    pub invalid_spec: Option<String>,
    pub transient_error: Option<String>,
    /// Generation for which a guest shutdown was turned into `state: Stopped`
    pub stop_requested_generation: Option<i64>,
    /// The VM Deleted event has been processed
    pub deleted: bool,
}

impl VmState {
    pub fn new(key: VmKey) -> Self {
        Self {
            key,
            vm: None,
            observed: BTreeMap::new(),
            deleting: BTreeSet::new(),
            suspended_generation: None,
            invalid_spec: None,
            transient_error: None,
            stop_requested_generation: None,
            deleted: false,
        }
    }

    /// Fold a watch event into the cached state
    pub fn apply(&mut self, event: &VmChannelEvent) {
        match event {
            VmChannelEvent::Vm { change, vm } => match change {
                ChangeType::Added | ChangeType::Modified => {
                    self.vm = Some(vm.as_ref().clone());
                    self.deleted = false;
                }
                ChangeType::Deleted => {
                    self.vm = None;
                    self.deleted = true;
                    self.suspended_generation = None;
                    self.invalid_spec = None;
                    self.transient_error = None;
                }
            },
            VmChannelEvent::Child { change, object } => match change {
                ChangeType::Added | ChangeType::Modified => {
                    self.remember(object.clone());
                }
                ChangeType::Deleted => {
                    let key = object.key();
                    self.observed.remove(&key);
                    self.deleting.remove(&key);
                }
            },
            VmChannelEvent::Resync => {}
        }
    }

    /// Cache an object unless a newer version is already known
    pub fn remember(&mut self, object: ManagedObject) {
        let key = object.key();
        if let (Some(known), Some(incoming)) = (
            self.observed.get(&key).and_then(|o| parse_version(o.resource_version())),
            parse_version(object.resource_version()),
        ) {
            if incoming < known {
                return;
            }
        }
        self.observed.insert(key, object);
    }

    /// Record that deletion of `key` was requested
    pub fn mark_terminating(&mut self, key: &ObjectKey) {
        if self.observed.contains_key(key) {
            self.deleting.insert(key.clone());
        }
    }

    /// Deletion is in progress, either requested by us or seen on the object
    pub fn is_terminating(&self, key: &ObjectKey) -> bool {
        self.deleting.contains(key) || self.observed.get(key).is_some_and(ManagedObject::is_terminating)
    }

    /// Forget a child that no longer exists
    pub fn forget(&mut self, key: &ObjectKey) {
        self.observed.remove(key);
        self.deleting.remove(key);
    }

    /// Nothing left to wait for, the channel can be torn down
    pub fn is_retired(&self) -> bool {
        self.vm.is_none() && (self.deleted || self.observed.is_empty())
    }
}

/// resourceVersions are opaque, but in practice numeric; only compare when both are
fn parse_version(version: Option<&str>) -> Option<u64> {
    version?.parse().ok()
}

/// Shared read-only view of the live VirtualMachines
#[derive(Default)]
pub struct VmDirectory {
    vms: Mutex<HashMap<VmKey, Arc<VirtualMachine>>>,
}

impl VmDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, key: VmKey, vm: VirtualMachine) {
        if let Ok(mut vms) = self.vms.lock() {
            vms.insert(key, Arc::new(vm));
        }
    }

    pub fn remove(&self, key: &VmKey) {
        if let Ok(mut vms) = self.vms.lock() {
            vms.remove(key);
        }
    }

    pub fn get(&self, key: &VmKey) -> Option<Arc<VirtualMachine>> {
        self.vms.lock().ok()?.get(key).cloned()
    }

    /// All VMs in `namespace`, sorted by name
    pub fn in_namespace(&self, namespace: &str) -> Vec<(VmKey, Arc<VirtualMachine>)> {
        let mut vms: Vec<_> = match self.vms.lock() {
            Ok(vms) => vms
                .iter()
                .filter(|(k, _)| k.namespace == namespace)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };
        vms.sort_by(|a, b| a.0.cmp(&b.0));
        vms
    }
}

//! Mock cluster client for unit testing
//!
//! Stores child objects in memory, bumps resourceVersions on every write,
//! rejects patches carrying a stale resourceVersion with `Conflict`, counts
//! every call and lets tests inject failures per verb.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crds::{PoolAssignment, VirtualMachine, VirtualMachineStatus};
use futures::StreamExt;
use kube::ResourceExt;
use serde_json::Value;

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{ManagedObject, ObjectKey, VmEvent, VmKey};
use crate::watch::{WatchChange, WatchSource, WatchStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Patch,
    Delete,
    PatchStatus,
    PatchAssignment,
    PatchSpec,
    Event,
}

impl Verb {
    /// Whether the verb changes cluster state
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Verb::Get)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub verb: Verb,
    pub target: String,
}

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) objects: Arc<Mutex<BTreeMap<ObjectKey, ManagedObject>>>,
    pub(crate) statuses: Arc<Mutex<HashMap<VmKey, VirtualMachineStatus>>>,
    pub(crate) assignments: Arc<Mutex<HashMap<VmKey, Option<PoolAssignment>>>>,
    pub(crate) spec_patches: Arc<Mutex<Vec<(VmKey, Value)>>>,
    pub(crate) events: Arc<Mutex<Vec<(VmKey, VmEvent)>>>,
    pub(crate) calls: Arc<Mutex<Vec<ApiCall>>>,
    pub(crate) failures: Arc<Mutex<HashMap<Verb, VecDeque<ClusterError>>>>,
    pub(crate) delays: Arc<Mutex<HashMap<Verb, VecDeque<Duration>>>>,
    // Counter for generating resourceVersions
    pub(crate) next_version: Arc<Mutex<u64>>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object as if it already existed in the cluster
    pub fn insert(&self, mut object: ManagedObject) -> ManagedObject {
        object.set_resource_version(Some(self.bump_version()));
        if object.metadata().uid.is_none() {
            object.metadata_mut().uid = Some(format!("uid-{}", object.name()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object.key(), object.clone());
        object
    }

    /// Remove an object behind the operator's back
    pub fn remove(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.objects.lock().unwrap().remove(key)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn objects(&self) -> Vec<ManagedObject> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    pub fn status(&self, vm: &VmKey) -> Option<VirtualMachineStatus> {
        self.statuses.lock().unwrap().get(vm).cloned()
    }

    /// Last persisted assignment, `Some(None)` when it was cleared
    pub fn assignment(&self, vm: &VmKey) -> Option<Option<PoolAssignment>> {
        self.assignments.lock().unwrap().get(vm).cloned()
    }

    pub fn spec_patches(&self) -> Vec<(VmKey, Value)> {
        self.spec_patches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<(VmKey, VmEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, verb: Verb) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.verb == verb).count()
    }

    /// Calls that change cluster state, events excluded
    pub fn mutating_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.verb.is_mutating() && c.verb != Verb::Event)
            .count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Fail the next call of `verb` with `error`; queued failures are consumed in order
    pub fn fail_next(&self, verb: Verb, error: ClusterError) {
        self.failures
            .lock()
            .unwrap()
            .entry(verb)
            .or_default()
            .push_back(error);
    }

    /// Fail the next `times` calls of `verb` with `error`
    pub fn fail_times(&self, verb: Verb, times: usize, error: ClusterError) {
        for _ in 0..times {
            self.fail_next(verb, error.clone());
        }
    }

    /// Hold the next call of `verb` for `delay` before it takes effect
    pub fn delay_next(&self, verb: Verb, delay: Duration) {
        self.delays.lock().unwrap().entry(verb).or_default().push_back(delay);
    }

    async fn pause(&self, verb: Verb) {
        let delay = self.delays.lock().unwrap().get_mut(&verb).and_then(VecDeque::pop_front);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn bump_version(&self) -> String {
        let mut next = self.next_version.lock().unwrap();
        *next += 1;
        next.to_string()
    }

    fn record(&self, verb: Verb, target: String) -> Result<(), ClusterError> {
        self.calls.lock().unwrap().push(ApiCall { verb, target });
        match self.failures.lock().unwrap().get_mut(&verb).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_child(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, ClusterError> {
        self.record(Verb::Get, key.to_string())?;
        Ok(self.object(key))
    }

    async fn create_child(&self, object: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        let key = object.key();
        self.record(Verb::Create, key.to_string())?;
        if self.objects.lock().unwrap().contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key.to_string()));
        }
        let mut created = object.clone();
        created.metadata_mut().uid = Some(format!("uid-{}", key.name));
        created.set_resource_version(Some(self.bump_version()));
        self.objects.lock().unwrap().insert(key, created.clone());
        Ok(created)
    }

    async fn patch_child(&self, object: &ManagedObject) -> Result<ManagedObject, ClusterError> {
        let key = object.key();
        self.record(Verb::Patch, key.to_string())?;
        let stored = self
            .object(&key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
        if let Some(version) = object.resource_version() {
            if Some(version) != stored.resource_version() {
                return Err(ClusterError::Conflict(format!(
                    "{} has resourceVersion {:?}, patch carried {}",
                    key,
                    stored.resource_version(),
                    version
                )));
            }
        }
        let mut patched = object.clone();
        patched.metadata_mut().uid = stored.metadata().uid.clone();
        patched.set_resource_version(Some(self.bump_version()));
        self.objects.lock().unwrap().insert(key, patched.clone());
        Ok(patched)
    }

    async fn delete_child(&self, key: &ObjectKey) -> Result<(), ClusterError> {
        self.record(Verb::Delete, key.to_string())?;
        match self.objects.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(key.to_string())),
        }
    }

    async fn patch_vm_status(&self, vm: &VmKey, status: &VirtualMachineStatus) -> Result<(), ClusterError> {
        self.record(Verb::PatchStatus, vm.to_string())?;
        self.statuses.lock().unwrap().insert(vm.clone(), status.clone());
        Ok(())
    }

    async fn patch_vm_assignment(&self, vm: &VmKey, assignment: Option<&PoolAssignment>) -> Result<(), ClusterError> {
        self.record(Verb::PatchAssignment, vm.to_string())?;
        self.pause(Verb::PatchAssignment).await;
        self.assignments
            .lock()
            .unwrap()
            .insert(vm.clone(), assignment.cloned());
        Ok(())
    }

    async fn patch_vm_spec(&self, vm: &VmKey, patch: Value) -> Result<(), ClusterError> {
        self.record(Verb::PatchSpec, vm.to_string())?;
        self.pause(Verb::PatchSpec).await;
        self.spec_patches.lock().unwrap().push((vm.clone(), patch));
        Ok(())
    }

    async fn record_event(&self, vm: &VirtualMachine, event: &VmEvent) -> Result<(), ClusterError> {
        let key = VmKey::new(vm.namespace().unwrap_or_default(), vm.name_any());
        self.record(Verb::Event, key.to_string())?;
        self.events.lock().unwrap().push((key, event.clone()));
        Ok(())
    }
}

/// Scripted WatchSource
///
/// Each `list` pops the next scripted list result and each `watch` pops the
/// next scripted session. Once a script is exhausted the call never
/// completes, which parks the watcher.
pub struct MockWatchSource<K> {
    lists: Mutex<VecDeque<Result<(Vec<K>, String), ClusterError>>>,
    sessions: Mutex<VecDeque<Vec<Result<WatchChange<K>, ClusterError>>>>,
    watch_versions: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
}

impl<K> Default for MockWatchSource<K> {
    fn default() -> Self {
        Self {
            lists: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(VecDeque::new()),
            watch_versions: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
        }
    }
}

impl<K> MockWatchSource<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, items: Vec<K>, resource_version: &str) -> &Self {
        self.lists
            .lock()
            .unwrap()
            .push_back(Ok((items, resource_version.to_string())));
        self
    }

    pub fn push_list_error(&self, error: ClusterError) -> &Self {
        self.lists.lock().unwrap().push_back(Err(error));
        self
    }

    /// Script one watch session; the stream ends after the last change
    pub fn push_session(&self, changes: Vec<Result<WatchChange<K>, ClusterError>>) -> &Self {
        self.sessions.lock().unwrap().push_back(changes);
        self
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// resourceVersions passed to `watch`, in call order
    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_versions.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl<K> WatchSource<K> for MockWatchSource<K>
where
    K: Clone + Send + Sync + 'static,
{
    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn list(&self) -> Result<(Vec<K>, String), ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, ClusterError> {
        self.watch_versions
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(changes) => Ok(futures::stream::iter(changes).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

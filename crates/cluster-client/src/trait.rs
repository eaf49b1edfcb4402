//! ClusterClient trait for mocking
//!
//! The concrete [`crate::ClusterClient`] talks to the API server; tests use
//! `MockClusterClient` from the `test-util` feature.

use crds::{PoolAssignment, VirtualMachine, VirtualMachineStatus};
use serde_json::Value;

use crate::error::ClusterError;
use crate::models::{ManagedObject, ObjectKey, VmEvent, VmKey};

/// Cluster API operations used by the operator
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    /// Read a child object, `None` when it does not exist
    async fn get_child(&self, key: &ObjectKey) -> Result<Option<ManagedObject>, ClusterError>;

    /// Create a child object, fails with `AlreadyExists` when it exists
    async fn create_child(&self, object: &ManagedObject) -> Result<ManagedObject, ClusterError>;

    /// Merge-patch a child object
    ///
    /// When the object carries a resourceVersion the server rejects the
    /// patch with `Conflict` if the stored object has moved on.
    async fn patch_child(&self, object: &ManagedObject) -> Result<ManagedObject, ClusterError>;

    async fn delete_child(&self, key: &ObjectKey) -> Result<(), ClusterError>;

    /// Patch the reconciler-owned part of the status (everything but `assignment`)
    async fn patch_vm_status(&self, vm: &VmKey, status: &VirtualMachineStatus) -> Result<(), ClusterError>;

    /// Set or clear `status.assignment`
    async fn patch_vm_assignment(&self, vm: &VmKey, assignment: Option<&PoolAssignment>) -> Result<(), ClusterError>;

    /// Merge-patch the spec of a VirtualMachine with `patch` (a `spec` fragment)
    async fn patch_vm_spec(&self, vm: &VmKey, patch: Value) -> Result<(), ClusterError>;

    /// Publish a Kubernetes event against `vm`
    async fn record_event(&self, vm: &VirtualMachine, event: &VmEvent) -> Result<(), ClusterError>;
}

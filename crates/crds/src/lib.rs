//! VM Operator CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the VM operator, plus the
//! types shared between the operator and the runner:
//! - `VirtualMachine`: desired and observed state of one guest
//! - `VmPool`: a named collection of interchangeable VMs
//! - `runner_config`: the rendered `/Runner` configuration document

pub mod duration;
pub mod labels;
pub mod permissions;
pub mod quantity;
pub mod runner_config;
pub mod virtual_machine;
pub mod vm_pool;

pub use duration::*;
pub use labels::*;
pub use permissions::*;
pub use quantity::*;
pub use virtual_machine::*;
pub use vm_pool::*;

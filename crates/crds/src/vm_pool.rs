//! VmPool CRD
//!
//! A named set of interchangeable VMs. Membership is declared on the VMs
//! through `spec.pools`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::duration::IsoDuration;
use crate::permissions::PermissionRule;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "vmoperator.microscaler.io",
    version = "v1",
    kind = "VmPool",
    namespaced,
    shortname = "vmpool"
)]
#[serde(rename_all = "camelCase")]
pub struct VmPoolSpec {
    /// How long a released VM stays reserved for its last user
    #[serde(default)]
    pub retention: IsoDuration,

    /// Log the assigned user into the guest
    #[serde(default)]
    pub login_on_assignment: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionRule>,
}

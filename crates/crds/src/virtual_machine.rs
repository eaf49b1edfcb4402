//! VirtualMachine CRD
//!
//! Desired state of one guest and the status the operator publishes for it.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::permissions::PermissionRule;
use crate::quantity::Quantity;

/// Default SPICE port inside the runner pod
pub const DEFAULT_SPICE_PORT: u16 = 5900;

/// Default graceful powerdown timeout in seconds
pub const DEFAULT_POWERDOWN_TIMEOUT: u64 = 900;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "vmoperator.microscaler.io",
    version = "v1",
    kind = "VirtualMachine",
    namespaced,
    status = "VirtualMachineStatus",
    shortname = "vm",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.vm.state"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// Runner image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<RunnerImage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<PermissionRule>,

    /// Names of the pools this VM is a member of
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pools: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Pod resource override (defaults are derived from the VM size)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceOverride>,

    /// Expose the display through a LoadBalancer service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_service: Option<LoadBalancerService>,

    /// A shutdown initiated from inside the guest sets the state to Stopped
    #[serde(default)]
    pub guest_shutdown_stops: bool,

    pub vm: VmSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerImage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverride {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Quantity>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerService {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    #[serde(default)]
    pub state: RequestedState,

    /// Fixed SMBIOS UUID (defaults to the resource UID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_uuid: Option<String>,

    #[serde(default)]
    pub firmware: Firmware,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,

    /// Hot-plug ceiling (defaults to `currentCpus`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_cpus: Option<u32>,

    #[serde(default = "default_current_cpus")]
    pub current_cpus: u32,

    pub maximum_ram: Quantity,

    /// Balloon target (defaults to `maximumRam`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ram: Option<Quantity>,

    #[serde(default)]
    pub rtc_base: RtcBase,

    /// Seconds to wait for a guest powerdown before the hypervisor is signalled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powerdown_timeout: Option<u64>,

    /// Attach a software TPM
    #[serde(default)]
    pub use_tpm: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<Network>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<Display>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
}

fn default_current_cpus() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RequestedState {
    Running,
    #[default]
    Stopped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Uefi,
    /// UEFI with secure boot
    Secure,
    Bios,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RtcBase {
    #[default]
    Utc,
    Localtime,
}

/// A network interface, exactly one of `tap` or `user`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<TapNetwork>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserNetwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TapNetwork {
    #[serde(default = "default_bridge")]
    pub bridge: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

fn default_bridge() -> String {
    "br0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// A disk, exactly one of `volumeClaimTemplate` or `cdrom`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<DiskClaimTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<Cdrom>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootindex: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskClaimTemplate {
    /// Disk name, unique within the VM
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    pub size: Quantity,

    #[serde(default)]
    pub volume_mode: VolumeMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VolumeMode {
    #[default]
    Block,
    Filesystem,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Cdrom {
    /// Image path or URL, empty for an empty drive
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Display {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice: Option<Spice>,

    /// User the guest agent should log in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_in_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Spice {
    #[serde(default = "default_spice_port")]
    pub port: u16,

    /// Disable password authentication
    #[serde(default)]
    pub ticketless: bool,

    /// Generate a display secret
    #[serde(default = "default_true")]
    pub generate_secret: bool,

    /// Password validity in seconds (0 means never expires)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_validity: Option<u64>,

    /// Proxy handed to console clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Default for Spice {
    fn default() -> Self {
        Self {
            port: DEFAULT_SPICE_PORT,
            ticketless: false,
            generate_secret: true,
            password_validity: None,
            proxy_url: None,
        }
    }
}

fn default_spice_port() -> u16 {
    DEFAULT_SPICE_PORT
}

fn default_true() -> bool {
    true
}

/// Cloud-init documents as YAML text
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudInit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_config: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<VmCondition>,

    /// Observed vCPU count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,

    /// Observed RAM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<PoolAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmCondition {
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False" or "Unknown"
    pub status: String,

    pub reason: String,

    #[serde(default)]
    pub message: String,

    pub last_transition_time: chrono::DateTime<chrono::Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Condition types published on a VirtualMachine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConditionType {
    Running,
    Ready,
    Progressing,
    InvalidSpec,
    TransientError,
}

impl ConditionType {
    pub const ALL: [ConditionType; 5] = [
        ConditionType::Running,
        ConditionType::Ready,
        ConditionType::Progressing,
        ConditionType::InvalidSpec,
        ConditionType::TransientError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionType::Running => "Running",
            ConditionType::Ready => "Ready",
            ConditionType::Progressing => "Progressing",
            ConditionType::InvalidSpec => "InvalidSpec",
            ConditionType::TransientError => "TransientError",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolAssignment {
    pub pool: String,

    pub user: String,

    /// Set when the user released the VM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<chrono::DateTime<chrono::Utc>>,
}

impl VirtualMachine {
    /// Whether the user wants the guest running
    pub fn wants_running(&self) -> bool {
        self.spec.vm.state == RequestedState::Running
    }

    pub fn condition(&self, type_: ConditionType) -> Option<&VmCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_.as_str())
    }

    /// The spice display, if one is configured
    pub fn spice(&self) -> Option<&Spice> {
        self.spec.vm.display.as_ref()?.spice.as_ref()
    }
}

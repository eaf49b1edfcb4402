//! Runner configuration document
//!
//! The operator renders this document into the VM's ConfigMap; the runner
//! reads it from the mounted volume. All sizes are normalized (bytes,
//! whole vCPUs) so the rendering is deterministic.

use serde::{Deserialize, Serialize};

use crate::virtual_machine::{CloudInit, Firmware, RequestedState, RtcBase};

/// Mount point of the runner ConfigMap
pub const CONFIG_DIR: &str = "/etc/opt/vmrunner";

/// Mount point of the display secret
pub const DISPLAY_SECRET_DIR: &str = "/etc/opt/vmrunner-secrets/display";

/// Mount point of the runner data PVC
pub const DATA_DIR: &str = "/var/local/vm-data";

/// Directory for sockets and other runtime state
pub const RUNTIME_DIR: &str = "/run/vmrunner";

/// Mount point prefix of filesystem-mode disk PVCs
pub const DISK_MOUNT_DIR: &str = "/var/local/vm-disks";

/// Name of the virtio-serial port of the guest agent
pub const AGENT_PORT_NAME: &str = "io.microscaler.vmop-agent.0";

/// Top-level document, everything lives under `/Runner`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfigDocument {
    #[serde(rename = "/Runner")]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    pub data_dir: String,

    pub runtime_dir: String,

    #[serde(default)]
    pub guest_shutdown_stops: bool,

    pub vm: RunnerVm,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerVm {
    pub name: String,

    pub uuid: String,

    pub state: RequestedState,

    pub firmware: Firmware,

    /// Bytes
    pub maximum_ram: u64,

    /// Bytes
    pub current_ram: u64,

    pub cpu_model: String,

    pub maximum_cpus: u32,

    pub current_cpus: u32,

    pub rtc_base: RtcBase,

    /// Seconds
    pub powerdown_timeout: u64,

    #[serde(default)]
    pub use_tpm: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<RunnerNetwork>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drives: Vec<RunnerDrive>,

    #[serde(default)]
    pub display: RunnerDisplay,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunnerNetwork {
    Tap {
        bridge: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac: Option<String>,
    },
    User {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mac: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    /// Block device or disk image
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDrive {
    pub name: String,

    #[serde(rename = "type")]
    pub type_: DriveType,

    /// Raw block device path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Image file path (created with `size` bytes when missing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootindex: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnerDisplay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spice: Option<RunnerSpice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logged_in_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpice {
    pub port: u16,

    #[serde(default)]
    pub ticketless: bool,
}

impl RunnerConfigDocument {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunnerConfigDocument {
        RunnerConfigDocument {
            runner: RunnerConfig {
                data_dir: DATA_DIR.to_string(),
                runtime_dir: RUNTIME_DIR.to_string(),
                guest_shutdown_stops: false,
                vm: RunnerVm {
                    name: "test-vm".to_string(),
                    uuid: "6f3c3c5e-9d2b-4c1d-8a51-0f0e7d5c2b11".to_string(),
                    state: RequestedState::Running,
                    firmware: Firmware::Uefi,
                    maximum_ram: 4 << 30,
                    current_ram: 2 << 30,
                    cpu_model: "host".to_string(),
                    maximum_cpus: 4,
                    current_cpus: 2,
                    rtc_base: RtcBase::Utc,
                    powerdown_timeout: 900,
                    use_tpm: false,
                    network: vec![RunnerNetwork::Tap {
                        bridge: "br0".to_string(),
                        mac: None,
                    }],
                    drives: vec![RunnerDrive {
                        name: "system".to_string(),
                        type_: DriveType::Disk,
                        device: Some("/dev/system".to_string()),
                        file: None,
                        size: None,
                        bootindex: Some(0),
                    }],
                    display: RunnerDisplay::default(),
                },
                cloud_init: None,
            },
        }
    }

    #[test]
    fn test_root_key() {
        let yaml = sample().to_yaml().unwrap();
        assert!(yaml.starts_with("/Runner:"));
        assert!(yaml.contains("currentCpus: 2"));
        assert!(yaml.contains("maximumCpus: 4"));
        assert!(yaml.contains("type: tap"));
    }

    #[test]
    fn test_yaml_round_trip() {
        let doc = sample();
        let parsed = RunnerConfigDocument::from_yaml(&doc.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed, doc);
    }
}

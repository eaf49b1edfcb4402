//! Test utilities for the runner

use std::path::Path;
use std::time::Duration;

use crds::runner_config::{
    DriveType, RunnerConfig, RunnerDisplay, RunnerDrive, RunnerNetwork, RunnerSpice, RunnerVm,
};
use crds::{Firmware, RequestedState, RtcBase};

use crate::config::RunnerSettings;

/// A running VM with 2 of 4 vCPUs, 4 GiB of RAM, a block disk, a CD-ROM and SPICE
pub fn test_runner_config() -> RunnerConfig {
    RunnerConfig {
        data_dir: "/var/local/vm-data".to_string(),
        runtime_dir: "/run/vmrunner".to_string(),
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
            powerdown_timeout: 1,
            use_tpm: false,
            network: vec![RunnerNetwork::Tap {
                bridge: "br0".to_string(),
                mac: Some("52:54:00:12:34:56".to_string()),
            }],
            drives: vec![
                RunnerDrive {
                    name: "system".to_string(),
                    type_: DriveType::Disk,
                    device: Some("/dev/system".to_string()),
                    file: None,
                    size: None,
                    bootindex: Some(0),
                },
                RunnerDrive {
                    name: "cdrom0".to_string(),
                    type_: DriveType::Cdrom,
                    device: None,
                    file: Some("/images/install.iso".to_string()),
                    size: None,
                    bootindex: Some(1),
                },
            ],
            display: RunnerDisplay {
                spice: Some(RunnerSpice {
                    port: 5910,
                    ticketless: false,
                }),
                logged_in_user: None,
            },
        },
        cloud_init: None,
    }
}

/// Config whose directories live under `root`
pub fn test_runner_config_in(root: &Path) -> RunnerConfig {
    let mut config = test_runner_config();
    config.data_dir = root.join("data").display().to_string();
    config.runtime_dir = root.join("run").display().to_string();
    config
}

pub fn test_settings(root: &Path) -> RunnerSettings {
    RunnerSettings {
        config_path: root.join("config.yaml"),
        display_secret_dir: root.join("secret"),
        config_poll_interval: Duration::from_millis(20),
        start_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

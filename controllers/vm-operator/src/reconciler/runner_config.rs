//! Spec normalization and runner configuration rendering
//!
//! [`NormalizedVm`] is the validated, unit-normalized view of a
//! VirtualMachine spec. Everything generated from a VM goes through it, so
//! equivalent specs (`4Gi` vs `4294967296`) render identically.

use std::collections::{BTreeMap, BTreeSet};

use crds::runner_config::{
    DATA_DIR, DISK_MOUNT_DIR, DriveType, RUNTIME_DIR, RunnerConfig, RunnerConfigDocument, RunnerDisplay,
    RunnerDrive, RunnerNetwork, RunnerSpice, RunnerVm,
};
use crds::{DEFAULT_POWERDOWN_TIMEOUT, Quantity, VirtualMachine, VolumeMode, disk_pvc_name};
use kube::ResourceExt;

use crate::error::ControllerError;

const DEFAULT_CPU_MODEL: &str = "host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    /// Backed by a PVC generated from the volume claim template
    Claim {
        claim_name: String,
        storage_class: Option<String>,
        size: u64,
        mode: VolumeMode,
    },
    Cdrom {
        image: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDisk {
    pub name: String,
    pub bootindex: Option<u32>,
    pub source: DiskSource,
}

/// Canonical pod resource quantities
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PodResources {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVm {
    pub uuid: String,
    /// Bytes
    pub maximum_ram: u64,
    /// Bytes
    pub current_ram: u64,
    pub maximum_cpus: u32,
    pub current_cpus: u32,
    pub powerdown_timeout: u64,
    pub disks: Vec<NormalizedDisk>,
    /// User supplied pod resources, already normalized
    pub resources: Option<PodResources>,
    pub uses_tap: bool,
}

fn invalid(message: impl Into<String>) -> ControllerError {
    ControllerError::InvalidSpec(message.into())
}

fn bytes(field: &str, quantity: &Quantity) -> Result<u64, ControllerError> {
    quantity
        .bytes()
        .map_err(|e| invalid(format!("{}: {}", field, e)))
}

/// Render a quantity in its canonical text form
///
/// CPU becomes whole cores or millicores, memory-like resources become the
/// largest exact binary unit, anything else is passed through.
pub fn canonical_quantity(resource: &str, quantity: &Quantity) -> Result<String, ControllerError> {
    if resource == "cpu" || resource.ends_with("/cpu") {
        let millis = quantity
            .millicores()
            .map_err(|e| invalid(format!("resources.{}: {}", resource, e)))?;
        return Ok(if millis % 1000 == 0 {
            (millis / 1000).to_string()
        } else {
            format!("{}m", millis)
        });
    }
    if resource.contains("memory") || resource.contains("storage") {
        let value = bytes(&format!("resources.{}", resource), quantity)?;
        return Ok(crds::format_binary(value));
    }
    Ok(quantity.0.trim().to_string())
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

impl NormalizedVm {
    /// Validate `vm` and normalize all quantities
    ///
    /// Errors are always [`ControllerError::InvalidSpec`].
    pub fn from_vm(vm: &VirtualMachine) -> Result<Self, ControllerError> {
        let spec = &vm.spec.vm;
        let vm_name = vm.name_any();

        let maximum_ram = bytes("vm.maximumRam", &spec.maximum_ram)?;
        if maximum_ram == 0 {
            return Err(invalid("vm.maximumRam must be positive"));
        }
        let current_ram = match &spec.current_ram {
            Some(q) => bytes("vm.currentRam", q)?,
            None => maximum_ram,
        };
        if current_ram == 0 || current_ram > maximum_ram {
            return Err(invalid(format!(
                "vm.currentRam ({}) must be between 1 and vm.maximumRam ({})",
                current_ram, maximum_ram
            )));
        }

        let current_cpus = spec.current_cpus;
        let maximum_cpus = spec.maximum_cpus.unwrap_or(current_cpus);
        if current_cpus == 0 || current_cpus > maximum_cpus {
            return Err(invalid(format!(
                "vm.currentCpus ({}) must be between 1 and vm.maximumCpus ({})",
                current_cpus, maximum_cpus
            )));
        }

        let uuid = match (&spec.machine_uuid, &vm.metadata.uid) {
            (Some(machine_uuid), _) => uuid::Uuid::parse_str(machine_uuid)
                .map_err(|e| invalid(format!("vm.machineUuid {:?}: {}", machine_uuid, e)))?
                .hyphenated()
                .to_string(),
            (None, Some(uid)) => uid.clone(),
            (None, None) => return Err(invalid("no vm.machineUuid and the resource has no uid")),
        };

        let mut uses_tap = false;
        for (index, network) in spec.networks.iter().enumerate() {
            match (&network.tap, &network.user) {
                (Some(_), None) => uses_tap = true,
                (None, Some(_)) => {}
                _ => {
                    return Err(invalid(format!(
                        "vm.networks[{}] must set exactly one of tap or user",
                        index
                    )));
                }
            }
        }

        let mut disks = Vec::with_capacity(spec.disks.len());
        let mut names = BTreeSet::new();
        let mut boot_indices = BTreeSet::new();
        for (index, disk) in spec.disks.iter().enumerate() {
            let (name, source) = match (&disk.volume_claim_template, &disk.cdrom) {
                (Some(template), None) => {
                    if !is_dns_label(&template.name) {
                        return Err(invalid(format!(
                            "vm.disks[{}].volumeClaimTemplate.name {:?} is not a valid name",
                            index, template.name
                        )));
                    }
                    let size = bytes(&format!("vm.disks[{}].volumeClaimTemplate.size", index), &template.size)?;
                    if size == 0 {
                        return Err(invalid(format!("vm.disks[{}] has zero size", index)));
                    }
                    (
                        template.name.clone(),
                        DiskSource::Claim {
                            claim_name: disk_pvc_name(&vm_name, &template.name),
                            storage_class: template.storage_class_name.clone(),
                            size,
                            mode: template.volume_mode,
                        },
                    )
                }
                (None, Some(cdrom)) => (
                    format!("cdrom{}", index),
                    DiskSource::Cdrom {
                        image: cdrom.image.clone(),
                    },
                ),
                _ => {
                    return Err(invalid(format!(
                        "vm.disks[{}] must set exactly one of volumeClaimTemplate or cdrom",
                        index
                    )));
                }
            };
            if !names.insert(name.clone()) {
                return Err(invalid(format!("duplicate disk name {:?}", name)));
            }
            if let Some(bootindex) = disk.bootindex {
                if !boot_indices.insert(bootindex) {
                    return Err(invalid(format!("duplicate bootindex {}", bootindex)));
                }
            }
            disks.push(NormalizedDisk {
                name,
                bootindex: disk.bootindex,
                source,
            });
        }

        if let Some(spice) = vm.spice() {
            if spice.ticketless && spice.password_validity.is_some() {
                return Err(invalid("display.spice.ticketless contradicts passwordValidity"));
            }
            if spice.port == 0 {
                return Err(invalid("display.spice.port must be positive"));
            }
        }
        if vm.spec.load_balancer_service.is_some() && vm.spice().is_none() {
            return Err(invalid("loadBalancerService requires a spice display"));
        }

        let resources = match &vm.spec.resources {
            Some(overrides) => {
                let mut normalized = PodResources::default();
                for (name, quantity) in &overrides.requests {
                    normalized
                        .requests
                        .insert(name.clone(), canonical_quantity(name, quantity)?);
                }
                for (name, quantity) in &overrides.limits {
                    normalized
                        .limits
                        .insert(name.clone(), canonical_quantity(name, quantity)?);
                }
                Some(normalized)
            }
            None => None,
        };

        Ok(Self {
            uuid,
            maximum_ram,
            current_ram,
            maximum_cpus,
            current_cpus,
            powerdown_timeout: spec.powerdown_timeout.unwrap_or(DEFAULT_POWERDOWN_TIMEOUT),
            disks,
            resources,
            uses_tap,
        })
    }

    /// The `/Runner` document for the VM's ConfigMap
    pub fn render(&self, vm: &VirtualMachine) -> RunnerConfigDocument {
        let spec = &vm.spec.vm;

        let network = spec
            .networks
            .iter()
            .filter_map(|n| match (&n.tap, &n.user) {
                (Some(tap), _) => Some(RunnerNetwork::Tap {
                    bridge: tap.bridge.clone(),
                    mac: tap.mac.clone(),
                }),
                (None, Some(user)) => Some(RunnerNetwork::User { mac: user.mac.clone() }),
                (None, None) => None,
            })
            .collect();

        let drives = self
            .disks
            .iter()
            .map(|disk| match &disk.source {
                DiskSource::Claim {
                    mode: VolumeMode::Block,
                    ..
                } => RunnerDrive {
                    name: disk.name.clone(),
                    type_: DriveType::Disk,
                    device: Some(format!("/dev/{}", disk.name)),
                    file: None,
                    size: None,
                    bootindex: disk.bootindex,
                },
                DiskSource::Claim {
                    mode: VolumeMode::Filesystem,
                    size,
                    ..
                } => RunnerDrive {
                    name: disk.name.clone(),
                    type_: DriveType::Disk,
                    device: None,
                    file: Some(format!("{}/{}/disk.img", DISK_MOUNT_DIR, disk.name)),
                    size: Some(*size),
                    bootindex: disk.bootindex,
                },
                DiskSource::Cdrom { image } => RunnerDrive {
                    name: disk.name.clone(),
                    type_: DriveType::Cdrom,
                    device: None,
                    file: (!image.is_empty()).then(|| image.clone()),
                    size: None,
                    bootindex: disk.bootindex,
                },
            })
            .collect();

        let display = spec
            .display
            .as_ref()
            .map(|d| RunnerDisplay {
                spice: d.spice.as_ref().map(|s| RunnerSpice {
                    port: s.port,
                    ticketless: s.ticketless,
                }),
                logged_in_user: d.logged_in_user.clone(),
            })
            .unwrap_or_default();

        RunnerConfigDocument {
            runner: RunnerConfig {
                data_dir: DATA_DIR.to_string(),
                runtime_dir: RUNTIME_DIR.to_string(),
                guest_shutdown_stops: vm.spec.guest_shutdown_stops,
                vm: RunnerVm {
                    name: vm.name_any(),
                    uuid: self.uuid.clone(),
                    state: spec.state,
                    firmware: spec.firmware,
                    maximum_ram: self.maximum_ram,
                    current_ram: self.current_ram,
                    cpu_model: spec
                        .cpu_model
                        .clone()
                        .unwrap_or_else(|| DEFAULT_CPU_MODEL.to_string()),
                    maximum_cpus: self.maximum_cpus,
                    current_cpus: self.current_cpus,
                    rtc_base: spec.rtc_base,
                    powerdown_timeout: self.powerdown_timeout,
                    use_tpm: spec.use_tpm,
                    network,
                    drives,
                    display,
                },
                cloud_init: spec.cloud_init.clone(),
            },
        }
    }
}

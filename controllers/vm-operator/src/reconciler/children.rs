//! Desired child objects of a VirtualMachine
//!
//! Every generated object is a pure function of the VM and the operator
//! configuration. The content hash stamped into `SPEC_HASH_ANNOTATION` is
//! what the diff compares, so nothing time or order dependent may end up in
//! here.

use std::collections::BTreeMap;

use cluster_client::ManagedObject;
use crds::runner_config::{CONFIG_DIR, DATA_DIR, DISK_MOUNT_DIR, DISPLAY_SECRET_DIR};
use crds::{
    APP_NAME, APP_NAME_LABEL, INSTANCE_LABEL, MANAGED_BY_LABEL, RUNNER_CONFIG_KEY, SPEC_HASH_ANNOTATION,
    VirtualMachine, VolumeMode, display_secret_name, runner_data_pvc_name,
};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod, PodSpec, ResourceRequirements,
    SecretVolumeSource, SecurityContext, Service, ServicePort, ServiceSpec, Volume, VolumeDevice, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crate::hashing::json_hash;
use crate::reconciler::runner_config::{DiskSource, NormalizedVm, PodResources};

pub const RUNNER_CONTAINER: &str = "runner";

/// Size of the runner's own state volume
pub const RUNNER_DATA_SIZE: u64 = 1 << 30;

/// Memory reserved for the hypervisor on top of guest RAM
pub const MEMORY_OVERHEAD: u64 = 256 << 20;

/// Extra grace beyond the guest powerdown timeout before the kubelet kills the runner
const TERMINATION_GRACE_EXTRA_SECS: i64 = 5;

const DEFAULT_IMAGE_REPOSITORY: &str = "ghcr.io";
const DEFAULT_IMAGE_PATH: &str = "microscaler/vm-runner";
const DEFAULT_IMAGE_VERSION: &str = "latest";

/// Labels selecting the children of `vm_name`
pub fn child_labels(vm_name: &str, operator_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL.to_string(), APP_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), vm_name.to_string()),
        (MANAGED_BY_LABEL.to_string(), operator_name.to_string()),
    ])
}

/// Metadata shared by all children: name, labels and the controller owner reference
pub fn child_metadata(vm: &VirtualMachine, name: &str, config: &OperatorConfig) -> Result<ObjectMeta, ControllerError> {
    let owner = vm.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::InvalidSpec(format!("VirtualMachine {} has no uid yet", vm.name_any()))
    })?;
    Ok(ObjectMeta {
        name: Some(name.to_string()),
        namespace: vm.namespace(),
        labels: Some(child_labels(&vm.name_any(), &config.operator_name)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

/// Hash of `object` as serialized without its spec hash annotation
pub fn content_hash(object: &ManagedObject) -> Result<String, ControllerError> {
    let mut object = object.clone();
    if let Some(annotations) = object.metadata_mut().annotations.as_mut() {
        annotations.remove(SPEC_HASH_ANNOTATION);
        if annotations.is_empty() {
            object.metadata_mut().annotations = None;
        }
    }
    let hash = match &object {
        ManagedObject::ConfigMap(o) => json_hash(o),
        ManagedObject::Secret(o) => json_hash(o),
        ManagedObject::PersistentVolumeClaim(o) => json_hash(o),
        ManagedObject::Pod(o) => json_hash(o),
        ManagedObject::Service(o) => json_hash(o),
    }?;
    Ok(hash)
}

fn stamped(object: impl Into<ManagedObject>) -> Result<ManagedObject, ControllerError> {
    let mut object = object.into();
    let hash = content_hash(&object)?;
    object.set_annotation(SPEC_HASH_ANNOTATION, hash);
    Ok(object)
}

/// Whether `vm` needs a generated display password
pub fn wants_display_secret(vm: &VirtualMachine) -> bool {
    vm.spice().is_some_and(|s| s.generate_secret && !s.ticketless)
}

/// The full desired child set, in apply order
///
/// ConfigMap and PVCs come before the Pod that mounts them. The Pod is only
/// present while the VM should be running, the Service only when requested.
pub fn desired_children(
    vm: &VirtualMachine,
    normalized: &NormalizedVm,
    config: &OperatorConfig,
) -> Result<Vec<ManagedObject>, ControllerError> {
    let mut children = Vec::new();
    children.push(stamped(config_map(vm, normalized, config)?)?);
    children.push(stamped(runner_data_pvc(vm, config)?)?);
    for pvc in disk_pvcs(vm, normalized, config)? {
        children.push(stamped(pvc)?);
    }
    if let Some(service) = service(vm, config)? {
        children.push(stamped(service)?);
    }
    if vm.wants_running() {
        children.push(stamped(pod(vm, normalized, config)?)?);
    }
    Ok(children)
}

pub fn config_map(vm: &VirtualMachine, normalized: &NormalizedVm, config: &OperatorConfig) -> Result<ConfigMap, ControllerError> {
    let document = normalized.render(vm).to_yaml()?;
    Ok(ConfigMap {
        metadata: child_metadata(vm, &vm.name_any(), config)?,
        data: Some(BTreeMap::from([(RUNNER_CONFIG_KEY.to_string(), document)])),
        ..Default::default()
    })
}

fn claim(
    metadata: ObjectMeta,
    size: u64,
    storage_class: Option<String>,
    mode: VolumeMode,
) -> PersistentVolumeClaim {
    let volume_mode = match mode {
        VolumeMode::Block => "Block",
        VolumeMode::Filesystem => "Filesystem",
    };
    PersistentVolumeClaim {
        metadata,
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class,
            volume_mode: Some(volume_mode.to_string()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    K8sQuantity(crds::format_binary(size)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn runner_data_pvc(vm: &VirtualMachine, config: &OperatorConfig) -> Result<PersistentVolumeClaim, ControllerError> {
    let metadata = child_metadata(vm, &runner_data_pvc_name(&vm.name_any()), config)?;
    Ok(claim(metadata, RUNNER_DATA_SIZE, None, VolumeMode::Filesystem))
}

pub fn disk_pvcs(
    vm: &VirtualMachine,
    normalized: &NormalizedVm,
    config: &OperatorConfig,
) -> Result<Vec<PersistentVolumeClaim>, ControllerError> {
    let mut claims = Vec::new();
    for disk in &normalized.disks {
        if let DiskSource::Claim {
            claim_name,
            storage_class,
            size,
            mode,
        } = &disk.source
        {
            let metadata = child_metadata(vm, claim_name, config)?;
            claims.push(claim(metadata, *size, storage_class.clone(), *mode));
        }
    }
    Ok(claims)
}

pub fn service(vm: &VirtualMachine, config: &OperatorConfig) -> Result<Option<Service>, ControllerError> {
    let (Some(lb), Some(spice)) = (&vm.spec.load_balancer_service, vm.spice()) else {
        return Ok(None);
    };
    let mut metadata = child_metadata(vm, &vm.name_any(), config)?;
    if let Some(labels) = metadata.labels.as_mut() {
        for (key, value) in &lb.labels {
            labels.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    if !lb.annotations.is_empty() {
        metadata.annotations = Some(lb.annotations.clone());
    }

    let selector = BTreeMap::from([
        (APP_NAME_LABEL.to_string(), APP_NAME.to_string()),
        (INSTANCE_LABEL.to_string(), vm.name_any()),
    ]);
    Ok(Some(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("spice".to_string()),
                port: i32::from(spice.port),
                target_port: Some(IntOrString::Int(i32::from(spice.port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

fn image(vm: &VirtualMachine, config: &OperatorConfig) -> String {
    match &vm.spec.image {
        Some(image) => format!(
            "{}/{}:{}",
            image.repository.as_deref().unwrap_or(DEFAULT_IMAGE_REPOSITORY),
            image.path.as_deref().unwrap_or(DEFAULT_IMAGE_PATH),
            image.version.as_deref().unwrap_or(DEFAULT_IMAGE_VERSION),
        ),
        None => config.runner_image.clone(),
    }
}

/// Pod resources derived from the VM size unless overridden
///
/// Sized from the maximum vCPU and RAM values so hot-plug changes never
/// alter the Pod.
fn resources(normalized: &NormalizedVm, config: &OperatorConfig) -> ResourceRequirements {
    let PodResources { requests, mut limits } = match &normalized.resources {
        Some(resources) => resources.clone(),
        None => {
            let memory = crds::format_binary(normalized.maximum_ram + MEMORY_OVERHEAD);
            PodResources {
                requests: BTreeMap::from([
                    ("cpu".to_string(), normalized.maximum_cpus.to_string()),
                    ("memory".to_string(), memory.clone()),
                ]),
                limits: BTreeMap::from([("memory".to_string(), memory)]),
            }
        }
    };
    limits
        .entry(config.kvm_device_resource.clone())
        .or_insert_with(|| "1".to_string());

    let convert = |map: BTreeMap<String, String>| -> Option<BTreeMap<String, K8sQuantity>> {
        (!map.is_empty()).then(|| map.into_iter().map(|(k, v)| (k, K8sQuantity(v))).collect())
    };
    ResourceRequirements {
        requests: convert(requests),
        limits: convert(limits),
        ..Default::default()
    }
}

pub fn pod(vm: &VirtualMachine, normalized: &NormalizedVm, config: &OperatorConfig) -> Result<Pod, ControllerError> {
    let vm_name = vm.name_any();
    let mut volumes = vec![
        Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: vm_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "runner-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: runner_data_pvc_name(&vm_name),
                read_only: None,
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: "config".to_string(),
            mount_path: CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "runner-data".to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        },
    ];
    let mut devices = Vec::new();

    if wants_display_secret(vm) {
        volumes.push(Volume {
            name: "display-secret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(display_secret_name(&vm_name)),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "display-secret".to_string(),
            mount_path: DISPLAY_SECRET_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    for disk in &normalized.disks {
        let DiskSource::Claim { claim_name, mode, .. } = &disk.source else {
            continue;
        };
        let volume_name = format!("disk-{}", disk.name);
        volumes.push(Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.clone(),
                read_only: None,
            }),
            ..Default::default()
        });
        match mode {
            VolumeMode::Block => devices.push(VolumeDevice {
                name: volume_name,
                device_path: format!("/dev/{}", disk.name),
            }),
            VolumeMode::Filesystem => mounts.push(VolumeMount {
                name: volume_name,
                mount_path: format!("{}/{}", DISK_MOUNT_DIR, disk.name),
                ..Default::default()
            }),
        }
    }

    let ports = vm.spice().map(|spice| {
        vec![ContainerPort {
            name: Some("spice".to_string()),
            container_port: i32::from(spice.port),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]
    });

    let security_context = normalized.uses_tap.then(|| SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_ADMIN".to_string()]),
            drop: None,
        }),
        ..Default::default()
    });

    let grace = i64::try_from(normalized.powerdown_timeout)
        .unwrap_or(i64::MAX - TERMINATION_GRACE_EXTRA_SECS)
        .saturating_add(TERMINATION_GRACE_EXTRA_SECS);

    let container = Container {
        name: RUNNER_CONTAINER.to_string(),
        image: Some(image(vm, config)),
        env: Some(vec![EnvVar {
            name: "RUNNER_CONFIG".to_string(),
            value: Some(format!("{}/{}", CONFIG_DIR, RUNNER_CONFIG_KEY)),
            ..Default::default()
        }]),
        ports,
        resources: Some(resources(normalized, config)),
        security_context,
        volume_mounts: Some(mounts),
        volume_devices: (!devices.is_empty()).then_some(devices),
        ..Default::default()
    };

    Ok(Pod {
        metadata: child_metadata(vm, &vm_name, config)?,
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            termination_grace_period_seconds: Some(grace),
            node_selector: (!vm.spec.node_selector.is_empty()).then(|| vm.spec.node_selector.clone()),
            hostname: Some(vm_name),
            ..Default::default()
        }),
        status: None,
    })
}

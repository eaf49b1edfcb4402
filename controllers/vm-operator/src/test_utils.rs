//! Test utilities for unit testing the operator
//!
//! Builders for VirtualMachines, pools and child objects plus a reconciler
//! wired to a `MockClusterClient`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cluster_client::{ClusterClientTrait, MockClusterClient};
use crds::*;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;

use crate::config::OperatorConfig;
use crate::display_secret::DisplaySecretManager;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;

pub fn test_metrics() -> Arc<Metrics> {
    Arc::new(Metrics::new().expect("metrics registry"))
}

/// Configuration with short backoffs so retry tests finish quickly
pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        backoff_min: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        reconcile_max_attempts: 3,
        ..Default::default()
    }
}

/// A running VM with 2 of 4 vCPUs, 4Gi of RAM, one block disk, a tap NIC and SPICE
pub fn create_test_vm_spec() -> VirtualMachineSpec {
    serde_json::from_value(json!({
        "vm": {
            "state": "Running",
            "maximumCpus": 4,
            "currentCpus": 2,
            "maximumRam": "4Gi",
            "networks": [{ "tap": { "mac": "52:54:00:12:34:56" } }],
            "disks": [{
                "volumeClaimTemplate": { "name": "system", "size": "20Gi" },
                "bootindex": 0
            }],
            "display": { "spice": { "port": 5910 } }
        }
    }))
    .expect("valid test spec")
}

pub fn create_test_vm(name: &str, namespace: &str) -> VirtualMachine {
    create_test_vm_with_spec(name, namespace, create_test_vm_spec())
}

pub fn create_test_vm_with_spec(name: &str, namespace: &str, spec: VirtualMachineSpec) -> VirtualMachine {
    let mut vm = VirtualMachine::new(name, spec);
    vm.metadata.namespace = Some(namespace.to_string());
    vm.metadata.uid = Some(format!("00000000-0000-0000-0000-{:0>12}", name.len()));
    vm.metadata.generation = Some(1);
    vm.metadata.resource_version = Some("1".to_string());
    vm
}

/// Mutate a test VM's spec in place and bump its generation
pub fn update_test_vm(vm: &mut VirtualMachine, update: impl FnOnce(&mut VirtualMachineSpec)) {
    update(&mut vm.spec);
    vm.metadata.generation = Some(vm.metadata.generation.unwrap_or(0) + 1);
}

pub fn create_test_pool(name: &str, namespace: &str, retention: &str, login_on_assignment: bool) -> VmPool {
    let mut pool = VmPool::new(
        name,
        VmPoolSpec {
            retention: IsoDuration(retention.to_string()),
            login_on_assignment,
            permissions: vec![PermissionRule {
                user: None,
                role: Some("students".to_string()),
                may: vec![Permission::AccessConsole],
            }],
        },
    );
    pool.metadata.namespace = Some(namespace.to_string());
    pool
}

/// A VM of `pool` whose permissions are left to the pool
pub fn create_test_pool_member(name: &str, namespace: &str, pool: &str) -> VirtualMachine {
    let mut spec = create_test_vm_spec();
    spec.pools = vec![pool.to_string()];
    create_test_vm_with_spec(name, namespace, spec)
}

pub fn create_test_config_map(name: &str, namespace: &str) -> ConfigMap {
    let mut labels = BTreeMap::new();
    labels.insert(APP_NAME_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(INSTANCE_LABEL.to_string(), name.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), "vm-operator".to_string());
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn create_test_config_map_rv(name: &str, namespace: &str, resource_version: &str) -> ConfigMap {
    let mut config_map = create_test_config_map(name, namespace);
    config_map.metadata.resource_version = Some(resource_version.to_string());
    config_map
}

/// Reconciler over a fresh mock client
pub fn create_test_reconciler() -> (Reconciler, MockClusterClient) {
    create_test_reconciler_with_config(test_config())
}

pub fn create_test_reconciler_with_config(config: OperatorConfig) -> (Reconciler, MockClusterClient) {
    let mock = MockClusterClient::new();
    let client: Arc<dyn ClusterClientTrait> = Arc::new(mock.clone());
    let config = Arc::new(config);
    let metrics = test_metrics();
    let secrets = Arc::new(DisplaySecretManager::new(client.clone(), config.clone(), metrics.clone()));
    let reconciler = Reconciler::new(client, config, secrets, metrics);
    (reconciler, mock)
}

//! Well-known labels and annotations
//!
//! Every object the operator creates carries the three `app.kubernetes.io`
//! labels below; watchers select on `managed-by` and correlate on `instance`.

/// API group of all VM operator resources
pub const API_GROUP: &str = "vmoperator.microscaler.io";

/// API version of all VM operator resources
pub const API_VERSION: &str = "v1";

/// `app.kubernetes.io/name` label key
pub const APP_NAME_LABEL: &str = "app.kubernetes.io/name";

/// `app.kubernetes.io/instance` label key (value: the VM name)
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// `app.kubernetes.io/managed-by` label key (value: the operator name)
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the `app.kubernetes.io/name` label on every child object
pub const APP_NAME: &str = "vm-runner";

/// Content hash of a generated child object
pub const SPEC_HASH_ANNOTATION: &str = "vmoperator.microscaler.io/spec-hash";

/// Hash of the display spec the display secret was generated for
pub const DISPLAY_SPEC_HASH_ANNOTATION: &str = "vmoperator.microscaler.io/display-spec-hash";

/// Key of the rendered runner configuration inside the ConfigMap
pub const RUNNER_CONFIG_KEY: &str = "config.yaml";

/// Display secret data key holding the password
pub const DISPLAY_PASSWORD_KEY: &str = "display-password";

/// Display secret data key holding the expiry (`never` or epoch seconds)
pub const PASSWORD_EXPIRY_KEY: &str = "password-expiry";

/// Label selector matching every child object managed by `operator_name`
pub fn managed_by_selector(operator_name: &str) -> String {
    format!("{}={}", MANAGED_BY_LABEL, operator_name)
}

/// Name of the display secret of a VM
pub fn display_secret_name(vm_name: &str) -> String {
    format!("{}-display-secret", vm_name)
}

/// Name of the runner data PVC of a VM
pub fn runner_data_pvc_name(vm_name: &str) -> String {
    format!("{}-runner-data", vm_name)
}

/// Name of the PVC backing a VM disk
pub fn disk_pvc_name(vm_name: &str, disk_name: &str) -> String {
    format!("{}-{}-disk", vm_name, disk_name)
}

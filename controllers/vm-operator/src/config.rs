//! Operator configuration from environment variables

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ControllerError;

pub const DEFAULT_OPERATOR_NAME: &str = "vm-operator";
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/microscaler/vm-runner:latest";
pub const DEFAULT_KVM_DEVICE_RESOURCE: &str = "devices.kubevirt.io/kvm";

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Namespace to watch, all namespaces when `None`
    pub namespace: Option<String>,
    /// Value of the managed-by label, field manager and event reporter
    pub operator_name: String,
    pub runner_image: String,
    /// Default display password validity, zero means never expires
    pub display_password_validity: Duration,
    pub reconcile_max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub pool_sweep_interval: Duration,
    pub console_proxy_url: Option<String>,
    pub console_host: Option<String>,
    pub kvm_device_resource: String,
    pub metrics_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            operator_name: DEFAULT_OPERATOR_NAME.to_string(),
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            display_password_validity: Duration::from_secs(10),
            reconcile_max_attempts: 5,
            backoff_min: Duration::from_millis(200),
            backoff_max: Duration::from_millis(5000),
            pool_sweep_interval: Duration::from_secs(30),
            console_proxy_url: None,
            console_host: None,
            kvm_device_resource: DEFAULT_KVM_DEVICE_RESOURCE.to_string(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

fn parse<T: FromStr>(name: &str, value: String) -> Result<T, ControllerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ControllerError::InvalidConfig(format!("{}={:?}: {}", name, value, e)))
}

impl OperatorConfig {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let config = Self {
            namespace: get("WATCH_NAMESPACE"),
            operator_name: get("OPERATOR_NAME").unwrap_or(defaults.operator_name),
            runner_image: get("RUNNER_IMAGE").unwrap_or(defaults.runner_image),
            display_password_validity: match get("DISPLAY_PASSWORD_VALIDITY_SECS") {
                Some(v) => Duration::from_secs(parse("DISPLAY_PASSWORD_VALIDITY_SECS", v)?),
                None => defaults.display_password_validity,
            },
            reconcile_max_attempts: match get("RECONCILE_MAX_ATTEMPTS") {
                Some(v) => parse("RECONCILE_MAX_ATTEMPTS", v)?,
                None => defaults.reconcile_max_attempts,
            },
            backoff_min: match get("RECONCILE_BACKOFF_MIN_MS") {
                Some(v) => Duration::from_millis(parse("RECONCILE_BACKOFF_MIN_MS", v)?),
                None => defaults.backoff_min,
            },
            backoff_max: match get("RECONCILE_BACKOFF_MAX_MS") {
                Some(v) => Duration::from_millis(parse("RECONCILE_BACKOFF_MAX_MS", v)?),
                None => defaults.backoff_max,
            },
            pool_sweep_interval: match get("POOL_SWEEP_INTERVAL_SECS") {
                Some(v) => Duration::from_secs(parse("POOL_SWEEP_INTERVAL_SECS", v)?),
                None => defaults.pool_sweep_interval,
            },
            console_proxy_url: get("CONSOLE_PROXY_URL"),
            console_host: get("CONSOLE_HOST"),
            kvm_device_resource: get("KVM_DEVICE_RESOURCE").unwrap_or(defaults.kvm_device_resource),
            metrics_addr: match get("METRICS_ADDR") {
                Some(v) => parse("METRICS_ADDR", v)?,
                None => defaults.metrics_addr,
            },
        };

        if config.reconcile_max_attempts == 0 {
            return Err(ControllerError::InvalidConfig(
                "RECONCILE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if config.backoff_min > config.backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "RECONCILE_BACKOFF_MIN_MS ({:?}) exceeds RECONCILE_BACKOFF_MAX_MS ({:?})",
                config.backoff_min, config.backoff_max
            )));
        }
        if config.pool_sweep_interval.is_zero() {
            return Err(ControllerError::InvalidConfig(
                "POOL_SWEEP_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.operator_name, "vm-operator");
        assert_eq!(config.display_password_validity, Duration::from_secs(10));
        assert_eq!(config.reconcile_max_attempts, 5);
        assert_eq!(config.namespace, None);
        assert_eq!(config.metrics_addr.port(), 8080);
    }

    #[test]
    fn test_overrides() {
        let config = OperatorConfig::from_lookup(lookup(&[
            ("WATCH_NAMESPACE", "vms"),
            ("DISPLAY_PASSWORD_VALIDITY_SECS", "3600"),
            ("RECONCILE_BACKOFF_MIN_MS", "10"),
            ("RECONCILE_BACKOFF_MAX_MS", "20"),
            ("CONSOLE_PROXY_URL", "http://proxy:3128"),
        ]))
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("vms"));
        assert_eq!(config.display_password_validity, Duration::from_secs(3600));
        assert_eq!(config.backoff_min, Duration::from_millis(10));
        assert_eq!(config.console_proxy_url.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            OperatorConfig::from_lookup(lookup(&[("RECONCILE_MAX_ATTEMPTS", "many")])),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            OperatorConfig::from_lookup(lookup(&[("RECONCILE_MAX_ATTEMPTS", "0")])),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            OperatorConfig::from_lookup(lookup(&[
                ("RECONCILE_BACKOFF_MIN_MS", "500"),
                ("RECONCILE_BACKOFF_MAX_MS", "100"),
            ])),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}

//! Runner configuration
//!
//! Process level settings come from environment variables; the VM itself is
//! described by the rendered document mounted from the VM's ConfigMap.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crds::runner_config::{CONFIG_DIR, DISPLAY_SECRET_DIR, RunnerConfig, RunnerConfigDocument};
use crds::{RUNNER_CONFIG_KEY, RequestedState};

use crate::error::RunnerError;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub config_path: PathBuf,
    pub qemu_binary: String,
    pub swtpm_binary: String,
    pub iso_builder: String,
    pub ovmf_code: PathBuf,
    pub ovmf_vars: PathBuf,
    pub display_secret_dir: PathBuf,
    pub config_poll_interval: Duration,
    /// Bound for companion readiness and the QMP handshake
    pub start_timeout: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            config_path: Path::new(CONFIG_DIR).join(RUNNER_CONFIG_KEY),
            qemu_binary: "qemu-system-x86_64".to_string(),
            swtpm_binary: "swtpm".to_string(),
            iso_builder: "genisoimage".to_string(),
            ovmf_code: PathBuf::from("/usr/share/edk2/ovmf/OVMF_CODE.fd"),
            ovmf_vars: PathBuf::from("/usr/share/edk2/ovmf/OVMF_VARS.fd"),
            display_secret_dir: PathBuf::from(DISPLAY_SECRET_DIR),
            config_poll_interval: Duration::from_secs(2),
            start_timeout: Duration::from_secs(30),
        }
    }
}

fn parse<T: FromStr>(name: &str, value: String) -> Result<T, RunnerError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| RunnerError::InvalidConfig(format!("{}={:?}: {}", name, value, e)))
}

impl RunnerSettings {
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RunnerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let settings = Self {
            config_path: get("RUNNER_CONFIG").map(PathBuf::from).unwrap_or(defaults.config_path),
            qemu_binary: get("QEMU_BINARY").unwrap_or(defaults.qemu_binary),
            swtpm_binary: get("SWTPM_BINARY").unwrap_or(defaults.swtpm_binary),
            iso_builder: get("ISO_BUILDER").unwrap_or(defaults.iso_builder),
            ovmf_code: get("OVMF_CODE").map(PathBuf::from).unwrap_or(defaults.ovmf_code),
            ovmf_vars: get("OVMF_VARS").map(PathBuf::from).unwrap_or(defaults.ovmf_vars),
            display_secret_dir: get("DISPLAY_SECRET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.display_secret_dir),
            config_poll_interval: match get("CONFIG_POLL_INTERVAL_MS") {
                Some(v) => Duration::from_millis(parse("CONFIG_POLL_INTERVAL_MS", v)?),
                None => defaults.config_poll_interval,
            },
            start_timeout: match get("START_TIMEOUT_SECS") {
                Some(v) => Duration::from_secs(parse("START_TIMEOUT_SECS", v)?),
                None => defaults.start_timeout,
            },
        };

        if settings.config_poll_interval.is_zero() {
            return Err(RunnerError::InvalidConfig(
                "CONFIG_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        Ok(settings)
    }
}

/// Read and parse the runner document at `path`
pub fn load_document(path: &Path) -> Result<RunnerConfig, RunnerError> {
    let text = std::fs::read_to_string(path)?;
    RunnerConfigDocument::from_yaml(&text)
        .map(|doc| doc.runner)
        .map_err(|source| RunnerError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// A change that is applied to the running VM without a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveChange {
    State(RequestedState),
    Cpus(u32),
    Ram(u64),
    LoggedInUser(Option<String>),
}

/// Differences between two revisions of the document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub live: Vec<LiveChange>,
    /// Something else changed; it applies on the next start
    pub needs_restart: bool,
}

pub fn diff(old: &RunnerConfig, new: &RunnerConfig) -> ConfigDiff {
    let mut live = Vec::new();
    if old.vm.state != new.vm.state {
        live.push(LiveChange::State(new.vm.state));
    }
    if old.vm.current_cpus != new.vm.current_cpus {
        live.push(LiveChange::Cpus(new.vm.current_cpus));
    }
    if old.vm.current_ram != new.vm.current_ram {
        live.push(LiveChange::Ram(new.vm.current_ram));
    }
    if old.vm.display.logged_in_user != new.vm.display.logged_in_user {
        live.push(LiveChange::LoggedInUser(new.vm.display.logged_in_user.clone()));
    }

    // Blank out the live fields and compare the rest
    let mut old_rest = old.clone();
    let mut new_rest = new.clone();
    for rest in [&mut old_rest, &mut new_rest] {
        rest.vm.state = RequestedState::Running;
        rest.vm.current_cpus = 0;
        rest.vm.current_ram = 0;
        rest.vm.display.logged_in_user = None;
    }
    ConfigDiff {
        live,
        needs_restart: old_rest != new_rest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
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
        let settings = RunnerSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.config_path, PathBuf::from("/etc/opt/vmrunner/config.yaml"));
        assert_eq!(settings.qemu_binary, "qemu-system-x86_64");
        assert_eq!(settings.start_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_and_errors() {
        let settings = RunnerSettings::from_lookup(lookup(&[
            ("RUNNER_CONFIG", "/tmp/runner.yaml"),
            ("CONFIG_POLL_INTERVAL_MS", "250"),
            ("START_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(settings.config_path, PathBuf::from("/tmp/runner.yaml"));
        assert_eq!(settings.config_poll_interval, Duration::from_millis(250));
        assert_eq!(settings.start_timeout, Duration::from_secs(5));

        assert!(matches!(
            RunnerSettings::from_lookup(lookup(&[("START_TIMEOUT_SECS", "soon")])),
            Err(RunnerError::InvalidConfig(_))
        ));
        assert!(RunnerSettings::from_lookup(lookup(&[("CONFIG_POLL_INTERVAL_MS", "0")])).is_err());
    }

    #[test]
    fn test_diff_separates_live_changes() {
        let old = test_runner_config();
        let mut new = old.clone();
        new.vm.current_cpus = 3;
        new.vm.display.logged_in_user = Some("alice".to_string());

        let diff = diff(&old, &new);
        assert_eq!(
            diff.live,
            vec![LiveChange::Cpus(3), LiveChange::LoggedInUser(Some("alice".to_string()))]
        );
        assert!(!diff.needs_restart);

        let mut restart = old.clone();
        restart.vm.maximum_cpus = 8;
        assert!(diff_needs_restart(&old, &restart));
    }

    fn diff_needs_restart(old: &RunnerConfig, new: &RunnerConfig) -> bool {
        let d = diff(old, new);
        d.live.is_empty() && d.needs_restart
    }

    #[test]
    fn test_load_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let doc = RunnerConfigDocument {
            runner: test_runner_config(),
        };
        std::fs::write(&path, doc.to_yaml().unwrap()).unwrap();
        assert_eq!(load_document(&path).unwrap(), doc.runner);

        std::fs::write(&path, "/Runner: [").unwrap();
        assert!(matches!(load_document(&path), Err(RunnerError::Parse { .. })));
    }
}

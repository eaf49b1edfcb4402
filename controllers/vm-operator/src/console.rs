//! Console access
//!
//! Produces the `virt-viewer` connection file handed to a console client and
//! applies start/stop requests coming from the console. Nothing produced
//! here is stored.

use std::fmt::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cluster_client::{ClusterClientTrait, VmKey};
use crds::{Permission, RequestedState, VirtualMachine, grants};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::config::OperatorConfig;
use crate::display_secret::DisplaySecretManager;
use crate::error::ControllerError;
use crate::pool::{PoolManager, Principal};
use crate::store::VmDirectory;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("unknown VM {0}")]
    UnknownVm(String),

    #[error("{user} may not {action} {vm}")]
    NotPermitted {
        user: String,
        vm: String,
        action: &'static str,
    },

    #[error("{0} has no SPICE display")]
    NoDisplay(String),

    #[error("no console address known for {0}")]
    Unreachable(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

pub struct ConsoleAccess {
    client: Arc<dyn ClusterClientTrait>,
    config: Arc<OperatorConfig>,
    directory: Arc<VmDirectory>,
    pools: Arc<PoolManager>,
    secrets: Arc<DisplaySecretManager>,
}

impl ConsoleAccess {
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        config: Arc<OperatorConfig>,
        directory: Arc<VmDirectory>,
        pools: Arc<PoolManager>,
        secrets: Arc<DisplaySecretManager>,
    ) -> Self {
        Self {
            client,
            config,
            directory,
            pools,
            secrets,
        }
    }

    fn lookup(&self, key: &VmKey) -> Result<Arc<VirtualMachine>, ConsoleError> {
        self.directory
            .get(key)
            .ok_or_else(|| ConsoleError::UnknownVm(key.to_string()))
    }

    /// Direct permission, or console access through an active pool assignment
    fn may(&self, principal: &Principal, key: &VmKey, vm: &VirtualMachine, permission: Permission) -> bool {
        if grants(&vm.spec.permissions, &principal.user, &principal.roles, permission) {
            return true;
        }
        permission == Permission::AccessConsole
            && self.pools.active_user(key).as_deref() == Some(principal.user.as_str())
    }

    fn authorize(
        &self,
        principal: &Principal,
        key: &VmKey,
        permission: Permission,
        action: &'static str,
    ) -> Result<Arc<VirtualMachine>, ConsoleError> {
        let vm = self.lookup(key)?;
        if !self.may(principal, key, &vm, permission) {
            return Err(ConsoleError::NotPermitted {
                user: principal.user.clone(),
                vm: key.to_string(),
                action,
            });
        }
        Ok(vm)
    }

    fn host(&self, key: &VmKey, vm: &VirtualMachine) -> Option<String> {
        if let Some(host) = &self.config.console_host {
            return Some(host.clone());
        }
        if vm.spec.load_balancer_service.is_some() {
            return Some(format!("{}.{}.svc", key.name, key.namespace));
        }
        vm.status.as_ref()?.node_name.clone()
    }

    pub async fn connection_file(&self, principal: &Principal, key: &VmKey) -> Result<String, ConsoleError> {
        self.connection_file_at(principal, key, Utc::now()).await
    }

    /// Render the connection file, rotating an expired display password first
    pub async fn connection_file_at(
        &self,
        principal: &Principal,
        key: &VmKey,
        now: DateTime<Utc>,
    ) -> Result<String, ConsoleError> {
        let vm = self.authorize(principal, key, Permission::AccessConsole, "connect to")?;
        let spice = vm
            .spice()
            .ok_or_else(|| ConsoleError::NoDisplay(key.to_string()))?;
        let host = self
            .host(key, &vm)
            .ok_or_else(|| ConsoleError::Unreachable(key.to_string()))?;
        let credentials = self.secrets.ensure_secret_at(&vm, now).await?;

        let mut file = String::from("[virt-viewer]\n");
        let mut entry = |name: &str, value: &str| {
            let _ = writeln!(file, "{}={}", name, value);
        };
        entry("type", "spice");
        entry("host", &host);
        entry("port", &spice.port.to_string());
        if let Some(credentials) = credentials.filter(|c| !c.expiry.is_expired(now)) {
            entry("password", &credentials.password);
        }
        if let Some(proxy) = spice.proxy_url.as_ref().or(self.config.console_proxy_url.as_ref()) {
            entry("proxy", proxy);
        }
        entry("title", &format!("{}:%d", key.name));
        entry("delete-this-file", "1");

        info!(vm = %key, user = %principal.user, "Issued console connection file");
        Ok(file)
    }

    pub async fn start_vm(&self, principal: &Principal, key: &VmKey) -> Result<(), ConsoleError> {
        self.authorize(principal, key, Permission::Start, "start")?;
        self.request_state(key, RequestedState::Running).await
    }

    pub async fn stop_vm(&self, principal: &Principal, key: &VmKey) -> Result<(), ConsoleError> {
        self.authorize(principal, key, Permission::Stop, "stop")?;
        self.request_state(key, RequestedState::Stopped).await
    }

    async fn request_state(&self, key: &VmKey, state: RequestedState) -> Result<(), ConsoleError> {
        info!(vm = %key, state = ?state, "Requesting VM state");
        self.client
            .patch_vm_spec(key, json!({ "vm": { "state": state } }))
            .await
            .map_err(ControllerError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChangeType;
    use crate::test_utils::*;
    use cluster_client::{MockClusterClient, Verb};
    use crds::PermissionRule;

    struct Fixture {
        mock: MockClusterClient,
        directory: Arc<VmDirectory>,
        pools: Arc<PoolManager>,
        console: ConsoleAccess,
    }

    fn fixture(config: OperatorConfig) -> Fixture {
        let mock = MockClusterClient::new();
        let client: Arc<dyn ClusterClientTrait> = Arc::new(mock.clone());
        let config = Arc::new(config);
        let metrics = test_metrics();
        let directory = Arc::new(VmDirectory::new());
        let pools = Arc::new(PoolManager::new(client.clone(), directory.clone(), metrics.clone()));
        let secrets = Arc::new(DisplaySecretManager::new(client.clone(), config.clone(), metrics));
        let console = ConsoleAccess::new(client, config, directory.clone(), pools.clone(), secrets);
        Fixture {
            mock,
            directory,
            pools,
            console,
        }
    }

    fn owned_vm(name: &str, user: &str, may: Vec<Permission>) -> VirtualMachine {
        let mut vm = create_test_vm(name, "lab");
        vm.spec.permissions = vec![PermissionRule {
            user: Some(user.to_string()),
            role: None,
            may,
        }];
        vm
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[tokio::test]
    async fn test_connection_file_contents() {
        let f = fixture(OperatorConfig {
            console_host: Some("console.example.org".to_string()),
            console_proxy_url: Some("http://proxy:3128".to_string()),
            ..test_config()
        });
        let key = VmKey::new("lab", "vm1");
        f.directory.upsert(key.clone(), owned_vm("vm1", "alice", vec![Permission::AccessConsole]));

        let file = f
            .console
            .connection_file_at(&Principal::new("alice", vec![]), &key, at(0))
            .await
            .unwrap();
        let lines: Vec<&str> = file.lines().collect();
        assert_eq!(lines[0], "[virt-viewer]");
        assert!(lines.contains(&"type=spice"));
        assert!(lines.contains(&"host=console.example.org"));
        assert!(lines.contains(&"port=5910"));
        assert!(lines.contains(&"proxy=http://proxy:3128"));
        assert!(lines.contains(&"delete-this-file=1"));
        let password = lines.iter().find_map(|l| l.strip_prefix("password=")).unwrap();
        assert_eq!(password.len(), 24);
        assert_eq!(f.mock.calls_for(Verb::Create), 1);
    }

    #[tokio::test]
    async fn test_connection_file_requires_permission() {
        let f = fixture(test_config());
        let key = VmKey::new("lab", "vm1");
        f.directory.upsert(key.clone(), owned_vm("vm1", "alice", vec![Permission::Start]));

        let err = f
            .console
            .connection_file(&Principal::new("alice", vec![]), &key)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::NotPermitted { .. }));
        assert!(matches!(
            f.console
                .connection_file(&Principal::new("alice", vec![]), &VmKey::new("lab", "missing"))
                .await,
            Err(ConsoleError::UnknownVm(_))
        ));
        assert_eq!(f.mock.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_pool_assignment_grants_console() {
        let f = fixture(OperatorConfig {
            console_host: Some("console".to_string()),
            ..test_config()
        });
        let key = VmKey::new("lab", "desk-1");
        f.directory.upsert(key.clone(), create_test_pool_member("desk-1", "lab", "desktops"));
        f.pools
            .observe_pool(ChangeType::Added, &create_test_pool("desktops", "lab", "PT1H", false));
        let bob = Principal::new("bob", vec!["students".to_string()]);

        assert!(f.console.connection_file(&bob, &key).await.is_err());
        let assigned = f
            .pools
            .assign(&bob, &crate::pool::PoolKey::new("lab", "desktops"))
            .await
            .unwrap();
        assert_eq!(assigned, key);
        assert!(f.console.connection_file(&bob, &key).await.is_ok());
    }

    #[tokio::test]
    async fn test_ticketless_display_has_no_password() {
        let f = fixture(OperatorConfig {
            console_host: Some("console".to_string()),
            ..test_config()
        });
        let key = VmKey::new("lab", "vm1");
        let mut vm = owned_vm("vm1", "alice", vec![Permission::All]);
        if let Some(spice) = vm
            .spec
            .vm
            .display
            .as_mut()
            .and_then(|d| d.spice.as_mut())
        {
            spice.ticketless = true;
        }
        f.directory.upsert(key.clone(), vm);

        let file = f
            .console
            .connection_file(&Principal::new("alice", vec![]), &key)
            .await
            .unwrap();
        assert!(!file.contains("password="));
        assert_eq!(f.mock.calls_for(Verb::Create), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop_patch_requested_state() {
        let f = fixture(test_config());
        let key = VmKey::new("lab", "vm1");
        f.directory.upsert(key.clone(), owned_vm("vm1", "alice", vec![Permission::Stop]));
        let alice = Principal::new("alice", vec![]);

        f.console.stop_vm(&alice, &key).await.unwrap();
        assert!(matches!(
            f.console.start_vm(&alice, &key).await,
            Err(ConsoleError::NotPermitted { action: "start", .. })
        ));
        let patches = f.mock.spec_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].1["vm"]["state"], "Stopped");
    }
}

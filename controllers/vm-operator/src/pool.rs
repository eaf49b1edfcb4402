//! VM pool manager
//!
//! Assigns interchangeable pool members to users. [`PoolTable`] holds the
//! assignment state and is pure (time is passed in); [`PoolManager`]
//! serializes access to it and persists assignments to
//! `status.assignment` on a best effort basis.
//!
//! Assignments are keyed by VM, so at most one exists per VM at any time.
//! A released assignment keeps the VM reserved for its last user until the
//! pool's retention has elapsed.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_client::{ClusterClientTrait, VmKey};
use crds::{Permission, PoolAssignment, VirtualMachine, VmPool, VmPoolSpec, grants};
use kube::ResourceExt;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{CancelToken, ChangeType, HandlerOutcome, VmChannelEvent, VmEventHandler};
use crate::metrics::Metrics;
use crate::store::{VmDirectory, VmState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no VM available in pool {0}")]
    NoneAvailable(String),

    #[error("unknown pool {0}")]
    UnknownPool(String),

    #[error("{user} may not use pool {pool}")]
    NotPermitted { user: String, pool: String },

    #[error("{vm} is not assigned to {user}")]
    NotAssigned { vm: String, user: String },
}

/// An authenticated console user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn new(user: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            user: user.into(),
            roles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub namespace: String,
    pub name: String,
}

impl PoolKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub pool: PoolKey,
    pub user: String,
    /// Set once released; the VM stays reserved until the retention elapsed
    pub released_at: Option<DateTime<Utc>>,
}

impl Assignment {
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }

    fn held_at(&self, retention: Duration, now: DateTime<Utc>) -> bool {
        match self.released_at {
            None => true,
            Some(released) => match chrono::Duration::from_std(retention) {
                Ok(retention) => now < released + retention,
                Err(_) => true,
            },
        }
    }

    pub fn to_status(&self) -> PoolAssignment {
        PoolAssignment {
            pool: self.pool.name.clone(),
            user: self.user.clone(),
            last_used: self.released_at,
        }
    }
}

fn retention(spec: &VmPoolSpec) -> Duration {
    spec.retention.to_std().unwrap_or_else(|e| {
        warn!("Invalid pool retention, treating it as zero: {}", e);
        Duration::ZERO
    })
}

/// Pool definitions and the assignment of every VM
#[derive(Debug, Default)]
pub struct PoolTable {
    pools: BTreeMap<PoolKey, VmPoolSpec>,
    assignments: BTreeMap<VmKey, Assignment>,
    /// VMs seen at least once since they were last forgotten
    observed: BTreeSet<VmKey>,
}

impl PoolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_pool(&mut self, key: PoolKey, spec: VmPoolSpec) {
        self.pools.insert(key, spec);
    }

    /// Existing assignments stay until they are released and expire
    pub fn remove_pool(&mut self, key: &PoolKey) {
        self.pools.remove(key);
    }

    pub fn pool(&self, key: &PoolKey) -> Option<&VmPoolSpec> {
        self.pools.get(key)
    }

    pub fn assignment(&self, vm: &VmKey) -> Option<&Assignment> {
        self.assignments.get(vm)
    }

    fn retention_of(&self, pool: &PoolKey) -> Duration {
        self.pools.get(pool).map(retention).unwrap_or(Duration::ZERO)
    }

    fn is_held(&self, vm: &VmKey, now: DateTime<Utc>) -> bool {
        self.assignments
            .get(vm)
            .is_some_and(|a| a.held_at(self.retention_of(&a.pool), now))
    }

    /// Assign a member of `pool` to `user`
    ///
    /// The user's own active or still retained VM wins; otherwise the first
    /// free member by name. `members` must list the pool's VMs.
    pub fn assign_at(
        &mut self,
        pool: &PoolKey,
        user: &str,
        members: &[VmKey],
        now: DateTime<Utc>,
    ) -> Result<(VmKey, Assignment), PoolError> {
        if !self.pools.contains_key(pool) {
            return Err(PoolError::UnknownPool(pool.to_string()));
        }

        let own = members.iter().find(|vm| {
            self.assignments
                .get(*vm)
                .is_some_and(|a| a.user == user && a.pool == *pool)
                && self.is_held(vm, now)
        });
        let chosen = match own {
            Some(vm) => vm.clone(),
            None => members
                .iter()
                .find(|vm| !self.is_held(vm, now))
                .cloned()
                .ok_or_else(|| PoolError::NoneAvailable(pool.to_string()))?,
        };

        let assignment = Assignment {
            pool: pool.clone(),
            user: user.to_string(),
            released_at: None,
        };
        self.assignments.insert(chosen.clone(), assignment.clone());
        Ok((chosen, assignment))
    }

    /// Release `vm` held by `user`, starting its retention window
    pub fn release_at(&mut self, vm: &VmKey, user: &str, now: DateTime<Utc>) -> Result<Assignment, PoolError> {
        match self.assignments.get_mut(vm) {
            Some(assignment) if assignment.user == user && assignment.is_active() => {
                assignment.released_at = Some(now);
                Ok(assignment.clone())
            }
            _ => Err(PoolError::NotAssigned {
                vm: vm.to_string(),
                user: user.to_string(),
            }),
        }
    }

    /// Drop released assignments whose retention elapsed, each exactly once
    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) -> Vec<(VmKey, Assignment)> {
        let expired: Vec<VmKey> = self
            .assignments
            .iter()
            .filter(|(_, a)| !a.is_active() && !a.held_at(self.retention_of(&a.pool), now))
            .map(|(vm, _)| vm.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|vm| self.assignments.remove(&vm).map(|a| (vm, a)))
            .collect()
    }

    /// Record that `vm` was seen; true the first time
    pub fn mark_observed(&mut self, vm: &VmKey) -> bool {
        self.observed.insert(vm.clone())
    }

    /// Rebuild an assignment persisted in a VM's status
    pub fn restore(&mut self, vm: &VmKey, persisted: &PoolAssignment) -> bool {
        if self.assignments.contains_key(vm) {
            return false;
        }
        self.assignments.insert(
            vm.clone(),
            Assignment {
                pool: PoolKey::new(vm.namespace.clone(), persisted.pool.clone()),
                user: persisted.user.clone(),
                released_at: persisted.last_used,
            },
        );
        true
    }

    pub fn forget_vm(&mut self, vm: &VmKey) -> Option<Assignment> {
        self.observed.remove(vm);
        self.assignments.remove(vm)
    }
}

pub struct PoolManager {
    client: Arc<dyn ClusterClientTrait>,
    directory: Arc<VmDirectory>,
    metrics: Arc<Metrics>,
    table: Mutex<PoolTable>,
    /// Held from a table change until its status writes are done
    writes: tokio::sync::Mutex<()>,
}

impl PoolManager {
    pub fn new(client: Arc<dyn ClusterClientTrait>, directory: Arc<VmDirectory>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            directory,
            metrics,
            table: Mutex::new(PoolTable::new()),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut PoolTable) -> T) -> T {
        match self.table.lock() {
            Ok(mut table) => f(&mut table),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Track a VmPool seen through the watch
    pub fn observe_pool(&self, change: ChangeType, pool: &VmPool) {
        let key = PoolKey::new(pool.namespace().unwrap_or_default(), pool.name_any());
        match change {
            ChangeType::Added | ChangeType::Modified => {
                debug!(pool = %key, "Pool updated");
                self.with_table(|t| t.upsert_pool(key, pool.spec.clone()));
            }
            ChangeType::Deleted => {
                info!(pool = %key, "Pool removed");
                self.with_table(|t| t.remove_pool(&key));
            }
        }
    }

    /// VMs of `pool`, sorted by name
    pub fn members(&self, pool: &PoolKey) -> Vec<VmKey> {
        self.directory
            .in_namespace(&pool.namespace)
            .into_iter()
            .filter(|(_, vm)| vm.spec.pools.iter().any(|p| *p == pool.name))
            .map(|(key, _)| key)
            .collect()
    }

    /// User currently holding `vm` through an unreleased assignment
    pub fn active_user(&self, vm: &VmKey) -> Option<String> {
        self.with_table(|t| {
            t.assignment(vm)
                .filter(|a| a.is_active())
                .map(|a| a.user.clone())
        })
    }

    pub async fn assign(&self, principal: &Principal, pool: &PoolKey) -> Result<VmKey, PoolError> {
        self.assign_at(principal, pool, Utc::now()).await
    }

    pub async fn assign_at(&self, principal: &Principal, pool: &PoolKey, now: DateTime<Utc>) -> Result<VmKey, PoolError> {
        let members = self.members(pool);
        let _guard = self.writes.lock().await;
        let (vm, assignment, login) = self.with_table(|table| {
            let spec = table
                .pool(pool)
                .ok_or_else(|| PoolError::UnknownPool(pool.to_string()))?;
            if !grants(&spec.permissions, &principal.user, &principal.roles, Permission::AccessConsole) {
                return Err(PoolError::NotPermitted {
                    user: principal.user.clone(),
                    pool: pool.to_string(),
                });
            }
            let login = spec.login_on_assignment;
            let (vm, assignment) = table.assign_at(pool, &principal.user, &members, now)?;
            Ok((vm, assignment, login))
        })?;

        info!(pool = %pool, vm = %vm, user = %principal.user, "Assigned VM");
        self.metrics.pool_assignments.inc();
        self.persist(&vm, Some(&assignment)).await;

        if login {
            let logged_in = self
                .directory
                .get(&vm)
                .and_then(|v| v.spec.vm.display.as_ref()?.logged_in_user.clone());
            if logged_in.as_deref() != Some(principal.user.as_str()) {
                self.set_logged_in_user(&vm, Some(&principal.user)).await;
            }
        }
        Ok(vm)
    }

    pub async fn release(&self, principal: &Principal, vm: &VmKey) -> Result<(), PoolError> {
        self.release_at(principal, vm, Utc::now()).await
    }

    pub async fn release_at(&self, principal: &Principal, vm: &VmKey, now: DateTime<Utc>) -> Result<(), PoolError> {
        let _guard = self.writes.lock().await;
        let assignment = self.with_table(|t| t.release_at(vm, &principal.user, now))?;
        info!(vm = %vm, user = %principal.user, "Released VM");
        self.persist(vm, Some(&assignment)).await;
        Ok(())
    }

    /// Purge expired releases; returns how many were reclaimed
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let _guard = self.writes.lock().await;
        let reclaimed = self.with_table(|t| {
            t.reclaim_expired(now)
                .into_iter()
                .map(|(vm, a)| {
                    let logout = t.pool(&a.pool).is_some_and(|p| p.login_on_assignment);
                    (vm, a, logout)
                })
                .collect::<Vec<_>>()
        });

        for (vm, assignment, logout) in &reclaimed {
            info!(vm = %vm, user = %assignment.user, "Retention expired, VM returned to pool");
            self.persist(vm, None).await;
            if *logout {
                self.set_logged_in_user(vm, None).await;
            }
        }
        reclaimed.len()
    }

    /// Sweep every `interval` until shutdown
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reclaimed = self.sweep().await;
                    if reclaimed > 0 {
                        debug!(reclaimed, "Pool sweep finished");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn persist(&self, vm: &VmKey, assignment: Option<&Assignment>) {
        let status = assignment.map(Assignment::to_status);
        self.metrics.api_call("patch_assignment");
        if let Err(e) = self.client.patch_vm_assignment(vm, status.as_ref()).await {
            warn!(vm = %vm, "Failed to persist pool assignment: {}", e);
        }
    }

    async fn set_logged_in_user(&self, vm: &VmKey, user: Option<&str>) {
        self.metrics.api_call("patch_spec");
        let patch = json!({ "vm": { "display": { "loggedInUser": user } } });
        if let Err(e) = self.client.patch_vm_spec(vm, patch).await {
            warn!(vm = %vm, "Failed to update logged in user: {}", e);
        }
    }

    fn observe_vm(&self, change: ChangeType, key: &VmKey, vm: &VirtualMachine) {
        match change {
            ChangeType::Added | ChangeType::Modified => {
                // Later statuses may predate a reclaim, only the first one is trusted
                let persisted = vm.status.as_ref().and_then(|s| s.assignment.as_ref());
                let restored =
                    self.with_table(|t| t.mark_observed(key) && persisted.is_some_and(|p| t.restore(key, p)));
                if let (true, Some(persisted)) = (restored, persisted) {
                    debug!(vm = %key, user = %persisted.user, "Restored pool assignment");
                }
                self.directory.upsert(key.clone(), vm.clone());
            }
            ChangeType::Deleted => {
                self.directory.remove(key);
                self.with_table(|t| t.forget_vm(key));
            }
        }
    }
}

#[async_trait::async_trait]
impl VmEventHandler for PoolManager {
    async fn handle(&self, state: &mut VmState, event: &VmChannelEvent, _cancel: &CancelToken) -> HandlerOutcome {
        if let VmChannelEvent::Vm { change, vm } = event {
            self.observe_vm(*change, &state.key, vm);
        }
        HandlerOutcome::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use cluster_client::{MockClusterClient, Verb};

    fn t(minutes: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + minutes * 60, 0).unwrap()
    }

    fn table(retention: &str) -> (PoolTable, PoolKey, Vec<VmKey>) {
        let mut table = PoolTable::new();
        let key = PoolKey::new("lab", "desktops");
        table.upsert_pool(key.clone(), create_test_pool("desktops", "lab", retention, false).spec);
        let members = vec![VmKey::new("lab", "desk-1"), VmKey::new("lab", "desk-2")];
        (table, key, members)
    }

    #[test]
    fn test_assignment_is_exclusive() {
        let (mut table, pool, members) = table("PT1H");
        let (a, _) = table.assign_at(&pool, "alice", &members, t(0)).unwrap();
        let (b, _) = table.assign_at(&pool, "bob", &members, t(0)).unwrap();
        assert_ne!(a, b);
        assert_eq!(
            table.assign_at(&pool, "carol", &members, t(0)),
            Err(PoolError::NoneAvailable("lab/desktops".to_string()))
        );
        // Asking again returns the same VM
        assert_eq!(table.assign_at(&pool, "alice", &members, t(1)).unwrap().0, a);
    }

    #[test]
    fn test_retention_window() {
        let (mut table, pool, members) = table("PT1H");
        let single = &members[..1];
        let (vm, _) = table.assign_at(&pool, "alice", single, t(0)).unwrap();
        table.release_at(&vm, "alice", t(10)).unwrap();

        assert!(table.assign_at(&pool, "bob", single, t(69)).is_err());
        assert_eq!(table.assign_at(&pool, "alice", single, t(69)).unwrap().0, vm);

        table.release_at(&vm, "alice", t(70)).unwrap();
        assert_eq!(table.assign_at(&pool, "bob", single, t(130)).unwrap().0, vm);
        assert_eq!(table.assignment(&vm).unwrap().user, "bob");
    }

    #[test]
    fn test_release_requires_holder() {
        let (mut table, pool, members) = table("PT1H");
        let (vm, _) = table.assign_at(&pool, "alice", &members, t(0)).unwrap();
        assert!(matches!(
            table.release_at(&vm, "bob", t(1)),
            Err(PoolError::NotAssigned { .. })
        ));
        table.release_at(&vm, "alice", t(1)).unwrap();
        assert!(table.release_at(&vm, "alice", t(2)).is_err());
    }

    #[test]
    fn test_reclaim_happens_once() {
        let (mut table, pool, members) = table("PT30M");
        let (vm, _) = table.assign_at(&pool, "alice", &members, t(0)).unwrap();
        table.release_at(&vm, "alice", t(0)).unwrap();
        assert!(table.reclaim_expired(t(29)).is_empty());
        assert_eq!(table.reclaim_expired(t(30)).len(), 1);
        assert!(table.reclaim_expired(t(31)).is_empty());
        assert!(table.assignment(&vm).is_none());
    }

    #[test]
    fn test_restore_from_status() {
        let (mut table, pool, members) = table("PT1H");
        let persisted = PoolAssignment {
            pool: "desktops".to_string(),
            user: "alice".to_string(),
            last_used: None,
        };
        assert!(table.restore(&members[0], &persisted));
        assert!(!table.restore(&members[0], &persisted));
        assert_eq!(table.assign_at(&pool, "bob", &members, t(0)).unwrap().0, members[1]);
    }

    fn manager(mock: &MockClusterClient) -> (PoolManager, PoolKey) {
        let directory = Arc::new(VmDirectory::new());
        for name in ["desk-1", "desk-2"] {
            directory.upsert(VmKey::new("lab", name), create_test_pool_member(name, "lab", "desktops"));
        }
        directory.upsert(VmKey::new("lab", "other"), create_test_vm("other", "lab"));
        let manager = PoolManager::new(Arc::new(mock.clone()), directory, test_metrics());
        manager.observe_pool(ChangeType::Added, &create_test_pool("desktops", "lab", "PT1H", true));
        (manager, PoolKey::new("lab", "desktops"))
    }

    #[tokio::test]
    async fn test_stale_status_does_not_restore_reclaimed_assignment() {
        let mock = MockClusterClient::new();
        let (manager, _) = manager(&mock);
        let key = VmKey::new("lab", "desk-1");
        let mut vm = create_test_pool_member("desk-1", "lab", "desktops");
        vm.status = Some(crds::VirtualMachineStatus {
            assignment: Some(PoolAssignment {
                pool: "desktops".to_string(),
                user: "alice".to_string(),
                last_used: Some(t(0)),
            }),
            ..Default::default()
        });

        manager.observe_vm(ChangeType::Added, &key, &vm);
        assert_eq!(manager.sweep_at(t(65)).await, 1);

        // A Modified event still carrying the old status arrives late
        manager.observe_vm(ChangeType::Modified, &key, &vm);
        assert!(manager.with_table(|t| t.assignment(&key).is_none()));
        assert_eq!(manager.sweep_at(t(130)).await, 0);
        assert_eq!(mock.calls_for(Verb::PatchSpec), 1);
    }

    #[tokio::test]
    async fn test_status_writes_follow_table_order() {
        let mock = MockClusterClient::new();
        let (manager, pool) = manager(&mock);
        let alice = student("alice");
        let vm = manager.assign_at(&alice, &pool, t(0)).await.unwrap();

        mock.delay_next(Verb::PatchAssignment, Duration::from_millis(100));
        let (released, reassigned) = tokio::join!(manager.release_at(&alice, &vm, t(5)), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            manager.assign_at(&alice, &pool, t(6)).await
        });
        released.unwrap();
        assert_eq!(reassigned.unwrap(), vm);

        assert_eq!(manager.active_user(&vm).as_deref(), Some("alice"));
        let persisted = mock.assignment(&vm).unwrap().unwrap();
        assert_eq!(persisted.last_used, None);
    }

    fn student(user: &str) -> Principal {
        Principal::new(user, vec!["students".to_string()])
    }

    #[tokio::test]
    async fn test_manager_checks_permissions_and_membership() {
        let mock = MockClusterClient::new();
        let (manager, pool) = manager(&mock);
        assert_eq!(manager.members(&pool).len(), 2);

        let outsider = Principal::new("mallory", vec![]);
        assert!(matches!(
            manager.assign(&outsider, &pool).await,
            Err(PoolError::NotPermitted { .. })
        ));
        assert!(matches!(
            manager.assign(&student("alice"), &PoolKey::new("lab", "missing")).await,
            Err(PoolError::UnknownPool(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_persists_and_logs_in() {
        let mock = MockClusterClient::new();
        let (manager, pool) = manager(&mock);
        let alice = student("alice");

        let vm = manager.assign_at(&alice, &pool, t(0)).await.unwrap();
        assert_eq!(vm, VmKey::new("lab", "desk-1"));
        assert_eq!(mock.assignment(&vm).unwrap().unwrap().user, "alice");
        let patches = mock.spec_patches();
        assert_eq!(patches[0].1["vm"]["display"]["loggedInUser"], "alice");
        assert_eq!(manager.active_user(&vm).as_deref(), Some("alice"));

        manager.release_at(&alice, &vm, t(5)).await.unwrap();
        assert!(mock.assignment(&vm).unwrap().unwrap().last_used.is_some());
        assert_eq!(manager.active_user(&vm), None);

        assert_eq!(manager.sweep_at(t(30)).await, 0);
        assert_eq!(manager.sweep_at(t(65)).await, 1);
        assert_eq!(mock.assignment(&vm), Some(None));
        let patches = mock.spec_patches();
        assert!(patches.last().unwrap().1["vm"]["display"]["loggedInUser"].is_null());
        assert_eq!(manager.sweep_at(t(66)).await, 0);
        assert_eq!(mock.calls_for(Verb::PatchSpec), 2);
    }
}

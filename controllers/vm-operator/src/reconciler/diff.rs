//! Observed vs desired child set comparison

use std::collections::BTreeSet;

use cluster_client::{ChildKind, ManagedObject, ObjectKey};

use crate::store::VmState;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(ManagedObject),
    /// Merge patch, the object carries the observed resourceVersion
    Patch(ManagedObject),
    Delete(ObjectKey),
}

impl Action {
    pub fn key(&self) -> ObjectKey {
        match self {
            Action::Create(o) | Action::Patch(o) => o.key(),
            Action::Delete(k) => k.clone(),
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            Action::Create(_) => "create",
            Action::Patch(_) => "patch",
            Action::Delete(_) => "delete",
        }
    }
}

/// Kinds removed when no longer desired; PVCs and the display secret are not among them
fn is_disposable(kind: ChildKind) -> bool {
    matches!(kind, ChildKind::ConfigMap | ChildKind::Pod | ChildKind::Service)
}

/// Actions that bring the observed children to `desired`
///
/// Objects being deleted are left alone until their Deleted event arrives.
/// A stale Pod is replaced through delete and a later create, since most of
/// a Pod spec is immutable.
pub fn plan(state: &VmState, desired: &[ManagedObject]) -> Vec<Action> {
    let mut actions = Vec::new();
    let mut wanted = BTreeSet::new();

    for object in desired {
        let key = object.key();
        wanted.insert(key.clone());

        if state.is_terminating(&key) {
            continue;
        }
        let Some(observed) = state.observed.get(&key) else {
            actions.push(Action::Create(object.clone()));
            continue;
        };
        if observed.spec_hash().is_some() && observed.spec_hash() == object.spec_hash() {
            continue;
        }
        match key.kind {
            ChildKind::PersistentVolumeClaim | ChildKind::Secret => {}
            ChildKind::Pod => actions.push(Action::Delete(key)),
            ChildKind::ConfigMap | ChildKind::Service => {
                let mut patch = object.clone();
                patch.set_resource_version(observed.resource_version().map(str::to_string));
                actions.push(Action::Patch(patch));
            }
        }
    }

    for (key, _) in state.observed.iter() {
        if is_disposable(key.kind) && !wanted.contains(key) && !state.is_terminating(key) {
            actions.push(Action::Delete(key.clone()));
        }
    }
    actions
}

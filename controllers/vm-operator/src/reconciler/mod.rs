//! VirtualMachine reconciler
//!
//! One pass per channel event: normalize the spec, generate the desired
//! child set, diff it against the cached observed children, apply the
//! difference and publish status. Passes are idempotent; a pass over an
//! unchanged (spec, observed) pair issues no API calls.

pub mod children;
pub mod diff;
pub mod runner_config;
pub mod status;


use std::sync::Arc;

use chrono::Utc;
use cluster_client::{ChildKind, ClusterClientTrait, ClusterError, ManagedObject, ObjectKey};
use crds::VirtualMachine;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::channel::{CancelToken, ChangeType, HandlerOutcome, VmChannelEvent, VmEventHandler};
use crate::config::OperatorConfig;
use crate::display_secret::DisplaySecretManager;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::store::VmState;

use diff::Action;
use runner_config::NormalizedVm;
use status::{EXIT_CLEAN, compute_status, pod_of, runner_exit_code, transition_events};

pub struct Reconciler {
    client: Arc<dyn ClusterClientTrait>,
    config: Arc<OperatorConfig>,
    secrets: Arc<DisplaySecretManager>,
    metrics: Arc<Metrics>,
}

fn spec_message(err: ControllerError) -> String {
    match err {
        ControllerError::InvalidSpec(message) => message,
        other => other.to_string(),
    }
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        config: Arc<OperatorConfig>,
        secrets: Arc<DisplaySecretManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            config,
            secrets,
            metrics,
        }
    }

    /// Bring the VM's children in line with its spec
    pub async fn reconcile(&self, state: &mut VmState, cancel: &CancelToken) -> HandlerOutcome {
        let Some(vm) = state.vm.clone() else {
            return HandlerOutcome::Done;
        };
        let generation = vm.metadata.generation;
        if state.suspended_generation.is_some() && state.suspended_generation == generation {
            debug!(vm = %state.key, ?generation, "Spec is invalid, waiting for a new generation");
            return HandlerOutcome::Done;
        }
        state.suspended_generation = None;
        self.metrics.reconciliations.inc();

        let prepared = NormalizedVm::from_vm(&vm).and_then(|normalized| {
            let desired = children::desired_children(&vm, &normalized, &self.config)?;
            Ok((normalized, desired))
        });
        let (normalized, desired) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.metrics
                    .reconcile_errors
                    .with_label_values(&[e.kind()])
                    .inc();
                let message = spec_message(e);
                warn!(vm = %state.key, ?generation, "Suspending reconciliation: {}", message);
                state.invalid_spec = Some(message);
                state.transient_error = None;
                state.suspended_generation = generation;
                self.publish_status(state, &vm, None).await;
                return HandlerOutcome::Done;
            }
        };
        state.invalid_spec = None;

        let max_attempts = self.config.reconcile_max_attempts;
        let mut backoff = FibonacciBackoff::new(self.config.backoff_min, self.config.backoff_max);
        let mut failure: Option<ControllerError> = None;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                debug!(vm = %state.key, "Reconciliation cancelled");
                return HandlerOutcome::Done;
            }
            match self.converge(state, &vm, &desired).await {
                Ok(()) => {
                    failure = None;
                    break;
                }
                Err(e) => {
                    self.metrics
                        .reconcile_errors
                        .with_label_values(&[e.kind()])
                        .inc();
                    warn!(vm = %state.key, attempt, max_attempts, "Reconciliation attempt failed: {}", e);
                    let retry = e.is_retryable() && attempt < max_attempts;
                    failure = Some(e);
                    if !retry {
                        break;
                    }
                    let delay = backoff.next_backoff();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            info!(vm = %state.key, "VirtualMachine deleted, abandoning retries");
                            return HandlerOutcome::Done;
                        }
                    }
                }
            }
        }

        state.transient_error = failure.as_ref().map(ToString::to_string);
        if failure.is_none() {
            self.stop_after_guest_shutdown(state, &vm).await;
        }
        self.publish_status(state, &vm, Some(&normalized)).await;

        match failure {
            Some(_) => HandlerOutcome::RequeueAfter(backoff.max()),
            None => HandlerOutcome::Done,
        }
    }

    async fn converge(&self, state: &mut VmState, vm: &VirtualMachine, desired: &[ManagedObject]) -> Result<(), ControllerError> {
        self.secrets.ensure_present(vm).await?;

        let actions = diff::plan(state, desired);
        if actions.is_empty() {
            debug!(vm = %state.key, "Children are up to date");
            return Ok(());
        }
        for action in actions {
            self.apply(state, action).await?;
        }
        Ok(())
    }

    async fn apply(&self, state: &mut VmState, action: Action) -> Result<(), ControllerError> {
        let key = action.key();
        info!(vm = %state.key, "{} {}", action.verb(), key);
        self.metrics.api_call(action.verb());

        match action {
            Action::Create(object) => match self.client.create_child(&object).await {
                Ok(created) => {
                    state.remember(created);
                    Ok(())
                }
                Err(e @ ClusterError::AlreadyExists(_)) => {
                    self.refresh(state, &key).await?;
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            },
            Action::Patch(object) => match self.client.patch_child(&object).await {
                Ok(patched) => {
                    state.remember(patched);
                    Ok(())
                }
                Err(e @ ClusterError::Conflict(_)) => {
                    self.refresh(state, &key).await?;
                    Err(e.into())
                }
                Err(e @ ClusterError::NotFound(_)) => {
                    state.forget(&key);
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            },
            Action::Delete(key) => match self.client.delete_child(&key).await {
                Ok(()) => {
                    if key.kind == ChildKind::Pod {
                        state.mark_terminating(&key);
                    } else {
                        state.forget(&key);
                    }
                    Ok(())
                }
                Err(ClusterError::NotFound(_)) => {
                    state.forget(&key);
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Re-read one child after a conflict
    async fn refresh(&self, state: &mut VmState, key: &ObjectKey) -> Result<(), ControllerError> {
        match self.client.get_child(key).await? {
            Some(object) => state.remember(object),
            None => state.forget(key),
        }
        Ok(())
    }

    /// A clean runner exit with `guestShutdownStops` set turns into `state: Stopped`
    async fn stop_after_guest_shutdown(&self, state: &mut VmState, vm: &VirtualMachine) {
        if !vm.spec.guest_shutdown_stops || !vm.wants_running() {
            return;
        }
        if state.stop_requested_generation.is_some() && state.stop_requested_generation == vm.metadata.generation {
            return;
        }
        let shut_down = pod_of(vm, state)
            .and_then(|(pod, _)| pod.as_pod())
            .is_some_and(|pod| runner_exit_code(pod) == Some(EXIT_CLEAN));
        if !shut_down {
            return;
        }

        self.metrics.api_call("patch_spec");
        match self
            .client
            .patch_vm_spec(&state.key, json!({ "vm": { "state": "Stopped" } }))
            .await
        {
            Ok(()) => {
                info!(vm = %state.key, "Guest shut down, requested state set to Stopped");
                state.stop_requested_generation = vm.metadata.generation;
            }
            Err(e) => warn!(vm = %state.key, "Failed to stop VM after guest shutdown: {}", e),
        }
    }

    /// Patch the status when it changed and publish transition events
    async fn publish_status(&self, state: &mut VmState, vm: &VirtualMachine, normalized: Option<&NormalizedVm>) {
        let status = compute_status(vm, state, normalized, Utc::now());
        let previous = vm.status.clone();
        if previous.as_ref() == Some(&status) {
            return;
        }

        self.metrics.api_call("patch_status");
        if let Err(e) = self.client.patch_vm_status(&state.key, &status).await {
            warn!(vm = %state.key, "Failed to update status: {}", e);
            return;
        }
        debug!(vm = %state.key, "Status updated");

        for event in transition_events(previous.as_ref(), &status) {
            if let Err(e) = self.client.record_event(vm, &event).await {
                debug!(vm = %state.key, "Failed to publish event {}: {}", event.reason, e);
            }
        }
        if let Some(cached) = state.vm.as_mut() {
            cached.status = Some(status);
        }
    }
}

#[async_trait::async_trait]
impl VmEventHandler for Reconciler {
    async fn handle(&self, state: &mut VmState, event: &VmChannelEvent, cancel: &CancelToken) -> HandlerOutcome {
        match event {
            VmChannelEvent::Vm {
                change: ChangeType::Deleted,
                ..
            } => {
                info!(vm = %state.key, "VirtualMachine deleted, children are left to garbage collection");
                HandlerOutcome::Done
            }
            _ => self.reconcile(state, cancel).await,
        }
    }
}

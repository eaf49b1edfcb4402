//! Status conditions from the observed child objects

use chrono::{DateTime, Utc};
use cluster_client::{ChildKind, ManagedObject, ObjectKey, VmEvent};
use crds::{ConditionType, VirtualMachine, VirtualMachineStatus, VmCondition};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::reconciler::children::RUNNER_CONTAINER;
use crate::reconciler::runner_config::NormalizedVm;
use crate::store::VmState;

/// Runner exit codes
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_CRASHED: i32 = 1;
pub const EXIT_START_FAILED: i32 = 2;

/// Summary of the runner pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningState {
    pub running: bool,
    pub reason: &'static str,
    pub message: String,
    /// No further change is expected without a spec change
    pub settled: bool,
}

/// Exit code of the runner container once it terminated
pub fn runner_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == RUNNER_CONTAINER)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

pub fn running_state(vm: &VirtualMachine, pod: Option<&Pod>, terminating: bool) -> RunningState {
    let wants = vm.wants_running();
    let state = |running, reason, message: &str, settled| RunningState {
        running,
        reason,
        message: message.to_string(),
        settled,
    };

    let Some(pod) = pod else {
        return if wants {
            state(false, "Pending", "Waiting for the runner pod", false)
        } else {
            state(false, "Stopped", "The VM is stopped", true)
        };
    };
    if terminating {
        return state(false, "Terminating", "The runner pod is shutting down", false);
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");
    match phase {
        "Running" => state(true, "Running", "", wants),
        "Succeeded" | "Failed" => match runner_exit_code(pod) {
            Some(EXIT_CLEAN) if wants => state(false, "Completed", "The runner exited after a guest shutdown", true),
            Some(EXIT_CLEAN) => state(false, "Stopped", "The VM is stopped", false),
            Some(EXIT_START_FAILED) => state(false, "StartFailed", "The hypervisor could not be started", true),
            Some(code) => RunningState {
                running: false,
                reason: "Crashed",
                message: format!("The hypervisor exited unexpectedly (runner exit code {})", code),
                settled: true,
            },
            None => state(false, "Crashed", "The runner terminated without an exit code", true),
        },
        other => RunningState {
            running: false,
            reason: "Pending",
            message: format!("The runner pod is {}", other),
            settled: false,
        },
    }
}

fn condition(
    previous: Option<&VmCondition>,
    type_: ConditionType,
    status: bool,
    reason: &str,
    message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> VmCondition {
    let status = if status { "True" } else { "False" };
    let last_transition_time = match previous {
        Some(p) if p.status == status => p.last_transition_time,
        _ => now,
    };
    VmCondition {
        type_: type_.as_str().to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
        observed_generation: generation,
    }
}

pub fn pod_of<'a>(vm: &VirtualMachine, state: &'a VmState) -> Option<(&'a ManagedObject, bool)> {
    let key = ObjectKey::new(ChildKind::Pod, vm.namespace().unwrap_or_default(), vm.name_any());
    let pod = state.observed.get(&key)?;
    Some((pod, state.is_terminating(&key)))
}

/// Status of `vm` given the cached children
///
/// `assignment` is copied from the current status, it is owned by the pool
/// manager.
pub fn compute_status(
    vm: &VirtualMachine,
    state: &VmState,
    normalized: Option<&NormalizedVm>,
    now: DateTime<Utc>,
) -> VirtualMachineStatus {
    let generation = vm.metadata.generation;
    let previous = |type_: ConditionType| vm.condition(type_);
    let pod = pod_of(vm, state);
    let running = running_state(vm, pod.and_then(|(p, _)| p.as_pod()), pod.is_some_and(|(_, t)| t));

    let ready = running.running && pod.and_then(|(p, _)| p.as_pod()).is_some_and(pod_ready);
    let (ready_reason, ready_message) = if ready {
        ("Ready", "")
    } else if running.running {
        ("NotReady", "The runner is not ready yet")
    } else {
        (running.reason, running.message.as_str())
    };

    let (progressing, progressing_reason, progressing_message) = match (&state.invalid_spec, &state.transient_error) {
        (Some(_), _) => (false, "InvalidSpec", "Reconciliation is suspended until the spec changes"),
        (None, Some(_)) => (true, "Retrying", "Reconciliation will be retried"),
        (None, None) if running.settled => (false, "Converged", ""),
        (None, None) => (true, "Reconciling", "Waiting for the runner to reach the requested state"),
    };

    let conditions = vec![
        condition(
            previous(ConditionType::Running),
            ConditionType::Running,
            running.running,
            running.reason,
            &running.message,
            generation,
            now,
        ),
        condition(
            previous(ConditionType::Ready),
            ConditionType::Ready,
            ready,
            ready_reason,
            ready_message,
            generation,
            now,
        ),
        condition(
            previous(ConditionType::Progressing),
            ConditionType::Progressing,
            progressing,
            progressing_reason,
            progressing_message,
            generation,
            now,
        ),
        match &state.invalid_spec {
            Some(message) => condition(
                previous(ConditionType::InvalidSpec),
                ConditionType::InvalidSpec,
                true,
                "InvalidSpec",
                message,
                generation,
                now,
            ),
            None => condition(
                previous(ConditionType::InvalidSpec),
                ConditionType::InvalidSpec,
                false,
                "Valid",
                "",
                generation,
                now,
            ),
        },
        match &state.transient_error {
            Some(message) => condition(
                previous(ConditionType::TransientError),
                ConditionType::TransientError,
                true,
                "ApiError",
                message,
                generation,
                now,
            ),
            None => condition(
                previous(ConditionType::TransientError),
                ConditionType::TransientError,
                false,
                "NoError",
                "",
                generation,
                now,
            ),
        },
    ];

    let (cpus, ram) = match (running.running, normalized) {
        (true, Some(n)) => (Some(n.current_cpus), Some(crds::format_binary(n.current_ram))),
        _ => (None, None),
    };
    let node_name = pod
        .and_then(|(p, _)| p.as_pod())
        .and_then(|p| p.spec.as_ref())
        .and_then(|s| s.node_name.clone());

    VirtualMachineStatus {
        conditions,
        cpus,
        ram,
        node_name,
        observed_generation: generation,
        assignment: vm.status.as_ref().and_then(|s| s.assignment.clone()),
    }
}

/// Events worth publishing for a status change
pub fn transition_events(previous: Option<&VirtualMachineStatus>, next: &VirtualMachineStatus) -> Vec<VmEvent> {
    let find = |status: Option<&VirtualMachineStatus>, type_: ConditionType| -> Option<VmCondition> {
        status?
            .conditions
            .iter()
            .find(|c| c.type_ == type_.as_str())
            .cloned()
    };
    let mut events = Vec::new();

    if let Some(running) = find(Some(next), ConditionType::Running) {
        let before = find(previous, ConditionType::Running);
        if before.as_ref().map(|c| c.reason.as_str()) != Some(running.reason.as_str()) {
            let note = if running.message.is_empty() {
                format!("VM is {}", running.reason)
            } else {
                running.message.clone()
            };
            events.push(match running.reason.as_str() {
                "Crashed" | "StartFailed" => VmEvent::warning(running.reason.clone(), note),
                _ => VmEvent::normal(running.reason.clone(), note),
            });
        }
    }

    for type_ in [ConditionType::InvalidSpec, ConditionType::TransientError] {
        let Some(now) = find(Some(next), type_) else {
            continue;
        };
        let was_true = find(previous, type_).is_some_and(|c| c.status == "True");
        if now.status == "True" && !was_true {
            events.push(VmEvent::warning(type_.as_str(), now.message.clone()));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use cluster_client::VmKey;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn runner_pod(phase: &str, exit_code: Option<i32>, ready: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("vm1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: exit_code.map(|code| {
                    vec![ContainerStatus {
                        name: RUNNER_CONTAINER.to_string(),
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: code,
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_exit_codes_map_to_reasons() {
        let vm = create_test_vm("vm1", "default");
        assert_eq!(running_state(&vm, Some(&runner_pod("Failed", Some(1), false)), false).reason, "Crashed");
        assert_eq!(running_state(&vm, Some(&runner_pod("Failed", Some(2), false)), false).reason, "StartFailed");
        assert_eq!(running_state(&vm, Some(&runner_pod("Succeeded", Some(0), false)), false).reason, "Completed");
        assert_eq!(running_state(&vm, Some(&runner_pod("Running", None, true)), true).reason, "Terminating");
        assert_eq!(running_state(&vm, None, false).reason, "Pending");
    }

    #[test]
    fn test_running_pod_reports_size_and_node() {
        let vm = create_test_vm("vm1", "default");
        let normalized = NormalizedVm::from_vm(&vm).unwrap();
        let mut state = VmState::new(VmKey::new("default", "vm1"));
        state.remember(runner_pod("Running", None, true).into());

        let status = compute_status(&vm, &state, Some(&normalized), Utc::now());
        assert_eq!(status.cpus, Some(2));
        assert_eq!(status.ram.as_deref(), Some("4Gi"));
        assert_eq!(status.node_name.as_deref(), Some("node-a"));
        let ready = status.conditions.iter().find(|c| c.type_ == "Ready").unwrap();
        assert_eq!(ready.status, "True");
    }

    #[test]
    fn test_transition_time_kept_while_status_unchanged() {
        let mut vm = create_test_vm("vm1", "default");
        let state = VmState::new(VmKey::new("default", "vm1"));
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let first = compute_status(&vm, &state, None, earlier);
        vm.status = Some(first.clone());

        let second = compute_status(&vm, &state, None, Utc::now());
        assert_eq!(first, second);
        assert!(transition_events(Some(&first), &second).is_empty());
    }

    #[test]
    fn test_crash_publishes_warning() {
        let vm = create_test_vm("vm1", "default");
        let mut state = VmState::new(VmKey::new("default", "vm1"));
        let before = compute_status(&vm, &state, None, Utc::now());
        state.remember(runner_pod("Failed", Some(1), false).into());
        let after = compute_status(&vm, &state, None, Utc::now());

        let events = transition_events(Some(&before), &after);
        assert_eq!(events.len(), 1);
        assert!(events[0].warning);
        assert_eq!(events[0].reason, "Crashed");
    }
}

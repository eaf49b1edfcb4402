//! Runner supervisor
//!
//! Owns the hypervisor, its companions and the control channels, and
//! drives them from the power state machine. Everything that can happen
//! (process exit, QMP events, agent replies, signals, config and secret
//! changes, the powerdown deadline) arrives in one select loop.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use crds::runner_config::{DriveType, RunnerConfig};
use crds::{Firmware, RequestedState};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::agent::{AgentLink, AgentSignal};
use crate::command::{RuntimePaths, iso_builder_args, qemu_args, swtpm_args};
use crate::config::{self, LiveChange, RunnerSettings};
use crate::display::DisplaySecretWatcher;
use crate::error::RunnerError;
use crate::process::{ManagedProcess, wait_for_socket};
use crate::qmp::{QmpClient, QmpEvent};
use crate::state::{Effect, Input, Outcome, PowerState, PowerStateMachine};

/// How long stopped companions get before SIGKILL
const COMPANION_GRACE: Duration = Duration::from_secs(5);

const AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long QMP events may trail the hypervisor's exit
const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that happened to the VM of launch `generation`
#[derive(Debug)]
enum Notice {
    HypervisorExited {
        generation: u64,
        status: Option<ExitStatus>,
    },
    Qmp {
        generation: u64,
        event: QmpEvent,
    },
    Agent {
        generation: u64,
        signal: AgentSignal,
    },
}

#[derive(Debug, Default)]
struct RunningVm {
    companions: Vec<ManagedProcess>,
    hypervisor: Option<Arc<ManagedProcess>>,
    qmp: Option<QmpClient>,
    agent: Option<AgentLink>,
}

pub struct Supervisor {
    settings: RunnerSettings,
    config: RunnerConfig,
    machine: PowerStateMachine,
    display: DisplaySecretWatcher,
    notices: mpsc::UnboundedReceiver<Notice>,
    notifier: mpsc::UnboundedSender<Notice>,
    vm: RunningVm,
    generation: u64,
    guest_shutdown: bool,
    powerdown_deadline: Option<Instant>,
}

async fn remove_stale(path: &Path) -> Result<(), RunnerError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn default_meta_data(config: &RunnerConfig) -> String {
    format!("instance-id: {}\nlocal-hostname: {}\n", config.vm.uuid, config.vm.name)
}

impl Supervisor {
    pub fn new(settings: RunnerSettings, config: RunnerConfig) -> Self {
        let (notifier, notices) = mpsc::unbounded_channel();
        let machine = PowerStateMachine::new(
            Duration::from_secs(config.vm.powerdown_timeout),
            config.guest_shutdown_stops,
        );
        let display = DisplaySecretWatcher::new(settings.display_secret_dir.clone());
        Self {
            settings,
            config,
            machine,
            display,
            notices,
            notifier,
            vm: RunningVm::default(),
            generation: 0,
            guest_shutdown: false,
            powerdown_deadline: None,
        }
    }

    pub fn state(&self) -> PowerState {
        self.machine.state()
    }

    /// Run until the state machine finishes
    pub async fn run(mut self) -> Result<Outcome, RunnerError> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut signals_received = 0u32;

        let mut config_poll = tokio::time::interval(self.settings.config_poll_interval);
        config_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut secret_poll = tokio::time::interval(self.settings.config_poll_interval);
        secret_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(vm = %self.config.vm.name, state = ?self.config.vm.state, "Runner started");
        let mut inputs = VecDeque::new();
        if self.config.vm.state == RequestedState::Running {
            inputs.push_back(Input::Start);
        }

        loop {
            while let Some(input) = inputs.pop_front() {
                for effect in self.machine.handle(input) {
                    match self.apply(effect).await {
                        Ok(Some(next)) => inputs.push_back(next),
                        Ok(None) => {}
                        Err(outcome) => {
                            info!(?outcome, code = outcome.exit_code(), "Runner finished");
                            return Ok(outcome);
                        }
                    }
                }
            }

            let deadline = self.powerdown_deadline;
            let input = tokio::select! {
                Some(notice) = self.notices.recv() => self.on_notice(notice).await,
                _ = sigterm.recv() => Some(Self::signal_input(&mut signals_received, "SIGTERM")),
                _ = sigint.recv() => Some(Self::signal_input(&mut signals_received, "SIGINT")),
                _ = config_poll.tick() => self.reload_config().await,
                _ = secret_poll.tick() => {
                    self.sync_display().await;
                    None
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("Guest did not power down in time");
                    self.powerdown_deadline = None;
                    Some(Input::PowerdownTimeout)
                }
            };
            inputs.extend(input);
        }
    }

    fn signal_input(received: &mut u32, name: &str) -> Input {
        *received += 1;
        if *received == 1 {
            info!(signal = name, "Stop requested");
            Input::Stop
        } else {
            warn!(signal = name, "Terminate requested");
            Input::Terminate
        }
    }

    /// Carry out one effect. `Err` ends the run with that outcome.
    async fn apply(&mut self, effect: Effect) -> Result<Option<Input>, Outcome> {
        match effect {
            Effect::Launch => match self.launch().await {
                Ok(()) => Ok(Some(Input::StartSucceeded)),
                Err(e) => {
                    error!("Failed to start VM: {}", e);
                    Ok(Some(Input::StartFailed))
                }
            },
            Effect::Powerdown { timeout } => {
                if let Some(qmp) = self.vm.qmp.as_mut() {
                    if let Err(e) = qmp.system_powerdown().await {
                        warn!("system_powerdown failed: {}", e);
                    }
                }
                info!(timeout = ?timeout, "Powering down");
                self.powerdown_deadline = Some(Instant::now() + timeout);
                Ok(None)
            }
            Effect::SignalTerminate => {
                self.powerdown_deadline = None;
                if let Some(hypervisor) = &self.vm.hypervisor {
                    hypervisor.terminate();
                }
                Ok(None)
            }
            Effect::KillAll => {
                self.powerdown_deadline = None;
                self.teardown().await;
                Ok(None)
            }
            Effect::Finished(outcome) => Err(outcome),
        }
    }

    async fn teardown(&mut self) {
        let vm = std::mem::take(&mut self.vm);
        drop(vm.qmp);
        drop(vm.agent);
        if let Some(hypervisor) = vm.hypervisor {
            if !hypervisor.has_exited() {
                hypervisor.kill();
                hypervisor.wait().await;
            }
        }
        for companion in vm.companions.iter().rev() {
            debug!(process = companion.name(), "Stopping companion");
            companion.stop(COMPANION_GRACE).await;
        }
    }

    async fn prepare_filesystem(&self, paths: &RuntimePaths) -> Result<(), RunnerError> {
        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;
        remove_stale(&paths.monitor_socket).await?;
        remove_stale(&paths.agent_socket).await?;

        let vm = &self.config.vm;
        if vm.firmware != Firmware::Bios && tokio::fs::metadata(&paths.firmware_vars).await.is_err() {
            debug!(from = %self.settings.ovmf_vars.display(), "Copying firmware variables");
            tokio::fs::copy(&self.settings.ovmf_vars, &paths.firmware_vars).await?;
        }

        for drive in vm.drives.iter().filter(|d| d.type_ == DriveType::Disk) {
            let (Some(file), Some(size)) = (&drive.file, drive.size) else {
                continue;
            };
            if tokio::fs::metadata(file).await.is_err() {
                info!(drive = %drive.name, file = %file, size, "Creating disk image");
                let image = tokio::fs::File::create(file).await?;
                image.set_len(size).await?;
            }
        }
        Ok(())
    }

    async fn start_tpm(&mut self, paths: &RuntimePaths) -> Result<(), RunnerError> {
        tokio::fs::create_dir_all(&paths.tpm_state_dir).await?;
        remove_stale(&paths.tpm_socket).await?;
        let swtpm = ManagedProcess::spawn("swtpm", &self.settings.swtpm_binary, &swtpm_args(paths))?;
        let ready = wait_for_socket(&paths.tpm_socket, self.settings.start_timeout).await;
        let exited = swtpm.has_exited();
        self.vm.companions.push(swtpm);
        match ready {
            Ok(()) if !exited => Ok(()),
            Ok(()) => Err(RunnerError::Companion {
                name: "swtpm".to_string(),
                reason: "exited after start".to_string(),
            }),
            Err(e) => Err(RunnerError::Companion {
                name: "swtpm".to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn build_cloud_init(&mut self, paths: &RuntimePaths) -> Result<(), RunnerError> {
        let Some(cloud_init) = &self.config.cloud_init else {
            return Ok(());
        };
        tokio::fs::create_dir_all(&paths.cloud_init_dir).await?;
        let meta_data = cloud_init
            .meta_data
            .clone()
            .unwrap_or_else(|| default_meta_data(&self.config));
        tokio::fs::write(paths.cloud_init_dir.join("meta-data"), meta_data).await?;
        tokio::fs::write(
            paths.cloud_init_dir.join("user-data"),
            cloud_init.user_data.as_deref().unwrap_or("#cloud-config\n"),
        )
        .await?;
        let network_config = paths.cloud_init_dir.join("network-config");
        match &cloud_init.network_config {
            Some(config) => tokio::fs::write(&network_config, config).await?,
            None => remove_stale(&network_config).await?,
        }

        let builder = ManagedProcess::spawn("iso-builder", &self.settings.iso_builder, &iso_builder_args(paths))?;
        let status = builder.wait_timeout(self.settings.start_timeout).await;
        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(RunnerError::Companion {
                name: "iso-builder".to_string(),
                reason: status.to_string(),
            }),
            None => {
                self.vm.companions.push(builder);
                Err(RunnerError::Timeout("cloud-init image".to_string()))
            }
        }
    }

    /// Start companions and the hypervisor and connect the control channels
    async fn launch(&mut self) -> Result<(), RunnerError> {
        self.generation += 1;
        self.guest_shutdown = false;
        self.display.reset();
        let generation = self.generation;
        let paths = RuntimePaths::new(&self.config);
        info!(vm = %self.config.vm.name, generation, "Starting VM");

        self.prepare_filesystem(&paths).await?;
        if self.config.vm.use_tpm {
            self.start_tpm(&paths).await?;
        }
        self.build_cloud_init(&paths).await?;

        let args = qemu_args(&self.config, &self.settings, &paths);
        let hypervisor = Arc::new(ManagedProcess::spawn("qemu", &self.settings.qemu_binary, &args)?);
        self.vm.hypervisor = Some(hypervisor.clone());

        let mut qmp = tokio::select! {
            qmp = QmpClient::connect(&paths.monitor_socket, self.settings.start_timeout) => qmp?,
            status = hypervisor.wait() => {
                return Err(RunnerError::Companion {
                    name: "qemu".to_string(),
                    reason: match status {
                        Some(status) => format!("exited during start ({})", status),
                        None => "exited during start".to_string(),
                    },
                });
            }
        };

        let forwarder = qmp.take_events().map(|mut events| {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if notifier.send(Notice::Qmp { generation, event }).is_err() {
                        break;
                    }
                }
            })
        });
        if self.config.vm.current_ram < self.config.vm.maximum_ram {
            if let Err(e) = qmp.balloon(self.config.vm.current_ram).await {
                warn!("Failed to set initial balloon size: {}", e);
            }
        }
        self.vm.qmp = Some(qmp);

        match AgentLink::connect(&paths.agent_socket, AGENT_CONNECT_TIMEOUT).await {
            Ok((link, mut signals)) => {
                let notifier = self.notifier.clone();
                tokio::spawn(async move {
                    while let Some(signal) = signals.recv().await {
                        if notifier.send(Notice::Agent { generation, signal }).is_err() {
                            break;
                        }
                    }
                });
                self.vm.agent = Some(link);
            }
            Err(e) => warn!("Guest agent channel unavailable: {}", e),
        }

        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let status = hypervisor.wait().await;
            // Events end with the monitor connection; queue them before the exit
            if let Some(forwarder) = forwarder {
                if tokio::time::timeout(EVENT_DRAIN_TIMEOUT, forwarder).await.is_err() {
                    debug!("QMP events still open after hypervisor exit");
                }
            }
            let _ = notifier.send(Notice::HypervisorExited { generation, status });
        });
        info!(vm = %self.config.vm.name, "VM running");
        Ok(())
    }

    async fn on_notice(&mut self, notice: Notice) -> Option<Input> {
        match notice {
            Notice::HypervisorExited { generation, status } if generation == self.generation => {
                let success = status.is_some_and(|s| s.success());
                let guest_shutdown = success && self.guest_shutdown;
                if !guest_shutdown {
                    warn!(status = ?status, "Hypervisor exited");
                }
                self.guest_shutdown = false;
                Some(Input::HypervisorExited { guest_shutdown })
            }
            Notice::Qmp { generation, event } if generation == self.generation => {
                if event.is_guest_shutdown() {
                    info!("Guest initiated shutdown");
                    self.guest_shutdown = true;
                }
                None
            }
            Notice::Agent { generation, signal } if generation == self.generation => {
                match signal {
                    AgentSignal::Ready => {
                        if let Some(user) = self.config.vm.display.logged_in_user.clone() {
                            self.agent_login(Some(user.as_str())).await;
                        }
                    }
                    AgentSignal::LoggedIn => info!("Guest user logged in"),
                    AgentSignal::LoggedOut => info!("Guest user logged out"),
                }
                None
            }
            stale => {
                debug!(?stale, "Ignoring notice from a previous launch");
                None
            }
        }
    }

    async fn agent_login(&mut self, user: Option<&str>) {
        let Some(agent) = self.vm.agent.as_mut() else {
            debug!("No agent channel, login change deferred");
            return;
        };
        let result = match user {
            Some(user) => agent.login(user).await,
            None => agent.logout().await,
        };
        if let Err(e) = result {
            warn!("Agent request failed: {}", e);
        }
    }

    /// Re-read the mounted document and apply what can be applied live
    async fn reload_config(&mut self) -> Option<Input> {
        let new = match config::load_document(&self.settings.config_path) {
            Ok(new) => new,
            Err(e) => {
                warn!("Keeping current configuration: {}", e);
                return None;
            }
        };
        if new == self.config {
            return None;
        }
        let changes = config::diff(&self.config, &new);
        if changes.needs_restart {
            info!("Configuration changed, takes effect on next start");
        }
        self.machine
            .set_powerdown_timeout(Duration::from_secs(new.vm.powerdown_timeout));
        self.config = new;

        let mut input = None;
        for change in changes.live {
            debug!(?change, "Applying live change");
            match change {
                LiveChange::State(RequestedState::Running) => input = Some(Input::Start),
                LiveChange::State(RequestedState::Stopped) => input = Some(Input::Stop),
                LiveChange::Cpus(cpus) => {
                    if let Some(qmp) = self.vm.qmp.as_mut() {
                        match qmp.set_cpus(cpus).await {
                            Ok(changed) => info!(cpus, changed, "vCPU count updated"),
                            Err(e) => warn!(cpus, "Failed to change vCPUs: {}", e),
                        }
                    }
                }
                LiveChange::Ram(bytes) => {
                    if let Some(qmp) = self.vm.qmp.as_mut() {
                        if let Err(e) = qmp.balloon(bytes).await {
                            warn!(bytes, "Failed to change RAM: {}", e);
                        }
                    }
                }
                LiveChange::LoggedInUser(user) => self.agent_login(user.as_deref()).await,
            }
        }
        input
    }

    /// Push changed display credentials to the hypervisor
    async fn sync_display(&mut self) {
        if self.machine.state() != PowerState::Running {
            return;
        }
        let ticketed = self.config.vm.display.spice.as_ref().is_some_and(|s| !s.ticketless);
        let Some(qmp) = self.vm.qmp.as_mut() else {
            return;
        };
        if !ticketed {
            return;
        }
        let credentials = match self.display.poll().await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to read display secret: {}", e);
                return;
            }
        };
        let Some(password) = credentials.password.as_deref() else {
            debug!("No display password yet");
            return;
        };
        let result = match qmp.set_password(password).await {
            Ok(()) => qmp.expire_password(credentials.expire_time()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!(expiry = credentials.expire_time(), "Display password updated"),
            Err(e) => {
                warn!("Failed to update display password: {}", e);
                self.display.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::runner_config::RunnerConfigDocument;
    use serde_json::{Value, json};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Stands in for qemu: runs until `<script>.halt` names an exit code,
    /// logs SIGTERM to `<script>.log` and exits 0 shortly after
    const FAKE_QEMU: &str = r#"#!/bin/sh
trap 'echo term >> "$0.log"; sleep 0.2; exit 0' TERM
touch "$0.started"
while [ ! -e "$0.halt" ]; do sleep 0.02; done
exit "$(cat "$0.halt")"
"#;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Guest {
        ShutsDown,
        Crashes,
        Hangs,
    }

    fn marker(script: &Path, suffix: &str) -> PathBuf {
        PathBuf::from(format!("{}.{}", script.display(), suffix))
    }

    fn halt(script: &Path, code: &str) {
        let staged = marker(script, "halt.tmp");
        std::fs::write(&staged, code).unwrap();
        std::fs::rename(staged, marker(script, "halt")).unwrap();
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// A VM driven by the fake hypervisor, its monitor played by `guest`
    ///
    /// Returns the supervisor inputs and the names of the QMP commands seen.
    fn fake_vm(dir: &Path, guest: Guest) -> (RunnerSettings, RunnerConfig, PathBuf, Arc<Mutex<Vec<String>>>) {
        let script = dir.join("qemu.sh");
        std::fs::write(&script, FAKE_QEMU).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = test_runner_config_in(dir);
        config.vm.firmware = Firmware::Bios;
        config.vm.powerdown_timeout = 1;
        config.vm.display.spice = None;
        config.guest_shutdown_stops = true;
        let mut settings = test_settings(dir);
        settings.qemu_binary = script.display().to_string();
        settings.start_timeout = Duration::from_secs(5);
        let document = RunnerConfigDocument { runner: config.clone() }.to_yaml().unwrap();
        std::fs::write(&settings.config_path, document).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let socket = RuntimePaths::new(&config).monitor_socket;
        let qemu = script.clone();
        tokio::spawn(async move {
            wait_for(|| marker(&qemu, "started").exists()).await;
            let listener = UnixListener::bind(&socket).unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write
                .write_all(b"{\"QMP\": {\"version\": {\"qemu\": {\"major\": 8}}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command: Value = serde_json::from_str(&line).unwrap();
                let name = command["execute"].as_str().unwrap_or_default().to_string();
                log.lock().unwrap().push(name.clone());
                let reply = json!({ "return": {}, "id": command["id"] });
                write.write_all(format!("{}\n", reply).as_bytes()).await.unwrap();
                match (guest, name.as_str()) {
                    (Guest::ShutsDown, "balloon") => {
                        let event = json!({ "event": "SHUTDOWN", "data": { "guest": true, "reason": "guest-shutdown" } });
                        write.write_all(format!("{}\n", event).as_bytes()).await.unwrap();
                        halt(&qemu, "0");
                        break;
                    }
                    (Guest::Crashes, "balloon") => {
                        halt(&qemu, "1");
                        break;
                    }
                    // Real qemu drops the monitor when it exits
                    (Guest::Hangs, "system_powerdown") => {
                        wait_for(|| marker(&qemu, "log").exists()).await;
                        break;
                    }
                    _ => {}
                }
            }
        });
        (settings, config, script, seen)
    }

    #[tokio::test]
    async fn test_guest_shutdown_is_seen_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, config, _, seen) = fake_vm(dir.path(), Guest::ShutsDown);

        let outcome = Supervisor::new(settings, config).run().await.unwrap();
        assert_eq!(outcome, Outcome::Clean);
        assert!(seen.lock().unwrap().contains(&"balloon".to_string()));
    }

    #[tokio::test]
    async fn test_hypervisor_failure_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, config, _, _) = fake_vm(dir.path(), Guest::Crashes);

        let outcome = Supervisor::new(settings, config).run().await.unwrap();
        assert_eq!(outcome, Outcome::Crashed);
        assert_eq!(outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_guest_is_terminated_once_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (settings, mut config, script, seen) = fake_vm(dir.path(), Guest::Hangs);
        let supervisor = Supervisor::new(settings.clone(), config.clone());

        let stop = async {
            wait_for(|| seen.lock().unwrap().iter().any(|c| c == "balloon")).await;
            config.vm.state = RequestedState::Stopped;
            let document = RunnerConfigDocument { runner: config.clone() }.to_yaml().unwrap();
            std::fs::write(&settings.config_path, document).unwrap();
            Instant::now()
        };
        let (outcome, stop_requested) = tokio::join!(supervisor.run(), stop);

        assert_eq!(outcome.unwrap(), Outcome::Clean);
        assert!(stop_requested.elapsed() >= Duration::from_millis(900));
        assert!(seen.lock().unwrap().contains(&"system_powerdown".to_string()));
        let terms = std::fs::read_to_string(marker(&script, "log")).unwrap();
        assert_eq!(terms.lines().collect::<Vec<_>>(), vec!["term"]);
    }

    #[tokio::test]
    async fn test_hypervisor_exiting_during_start_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_runner_config_in(dir.path());
        config.vm.firmware = Firmware::Bios;
        let mut settings = test_settings(dir.path());
        settings.qemu_binary = "false".to_string();

        let outcome = Supervisor::new(settings, config).run().await.unwrap();
        assert_eq!(outcome, Outcome::StartFailed);
        assert_eq!(outcome.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.qemu_binary = dir.path().join("no-such-qemu").display().to_string();
        settings.ovmf_vars = dir.path().join("vars.fd");
        std::fs::write(&settings.ovmf_vars, b"vars").unwrap();

        let config = test_runner_config_in(dir.path());
        let outcome = Supervisor::new(settings, config.clone()).run().await.unwrap();
        assert_eq!(outcome, Outcome::StartFailed);
        // Firmware variables were prepared before the spawn failed
        assert!(RuntimePaths::new(&config).firmware_vars.exists());
    }

    #[tokio::test]
    async fn test_failed_companion_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_runner_config_in(dir.path());
        config.vm.firmware = Firmware::Bios;
        config.cloud_init = Some(crds::CloudInit::default());
        let mut settings = test_settings(dir.path());
        settings.iso_builder = "false".to_string();

        let outcome = Supervisor::new(settings, config.clone()).run().await.unwrap();
        assert_eq!(outcome, Outcome::StartFailed);
        let meta = std::fs::read_to_string(RuntimePaths::new(&config).cloud_init_dir.join("meta-data")).unwrap();
        assert!(meta.contains("local-hostname: test-vm"));
    }

    #[tokio::test]
    async fn test_disk_images_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_runner_config_in(dir.path());
        config.vm.firmware = Firmware::Bios;
        let image = dir.path().join("data").join("scratch.img");
        config.vm.drives[0].device = None;
        config.vm.drives[0].file = Some(image.display().to_string());
        config.vm.drives[0].size = Some(1 << 20);

        let supervisor = Supervisor::new(test_settings(dir.path()), config.clone());
        supervisor
            .prepare_filesystem(&RuntimePaths::new(&config))
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 1 << 20);
    }

    #[tokio::test]
    async fn test_reload_turns_state_change_into_input() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut config = test_runner_config_in(dir.path());
        config.vm.state = RequestedState::Stopped;
        let mut supervisor = Supervisor::new(settings.clone(), config.clone());

        // Unreadable documents keep the current configuration
        assert_eq!(supervisor.reload_config().await, None);

        let mut updated = config.clone();
        updated.vm.state = RequestedState::Running;
        updated.vm.powerdown_timeout = 30;
        let text = RunnerConfigDocument { runner: updated }.to_yaml().unwrap();
        std::fs::write(&settings.config_path, text).unwrap();

        assert_eq!(supervisor.reload_config().await, Some(Input::Start));
        assert_eq!(supervisor.config.vm.powerdown_timeout, 30);
        assert_eq!(supervisor.reload_config().await, None);
        assert_eq!(supervisor.state(), PowerState::Stopped);
    }
}

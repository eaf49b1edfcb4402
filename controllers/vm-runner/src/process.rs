//! Supervised child processes
//!
//! A waiter task owns each child and publishes its exit status, so the
//! supervisor can signal a process while something else awaits its exit.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::RunnerError;

#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl ManagedProcess {
    pub fn spawn(name: &str, binary: &str, args: &[String]) -> Result<Self, RunnerError> {
        debug!(process = name, binary, ?args, "Spawning");
        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                binary: binary.to_string(),
                source,
            })?;
        let pid = child.id();
        info!(process = name, ?pid, "Started");

        let (sender, exit) = watch::channel(None);
        let process = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    info!(process = %process, %status, "Exited");
                    let _ = sender.send(Some(status));
                }
                Err(e) => warn!(process = %process, "Failed to wait for process: {}", e),
            }
        });

        Ok(Self {
            name: name.to_string(),
            pid,
            exit,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Resolves with the exit status once the process is gone
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut exit = self.exit.clone();
        let status = match exit.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status
    }

    /// Wait at most `timeout` for the process to exit
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(timeout, self.wait()).await.ok().flatten()
    }

    /// Send `signal` unless the process was already reaped
    #[allow(unsafe_code)]
    pub fn signal(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return false;
        };
        if self.has_exited() {
            return false;
        }
        // SAFETY: kill(2) has no memory safety requirements. The pid belongs
        // to our unreaped child, so it cannot have been reused.
        let result = unsafe { libc::kill(pid, signal) };
        if result != 0 {
            warn!(process = %self.name, pid, signal, "kill failed: {}", std::io::Error::last_os_error());
        }
        result == 0
    }

    pub fn terminate(&self) -> bool {
        debug!(process = %self.name, "Sending SIGTERM");
        self.signal(libc::SIGTERM)
    }

    pub fn kill(&self) -> bool {
        self.signal(libc::SIGKILL)
    }

    /// SIGTERM, then SIGKILL if the process outlives `grace`
    pub async fn stop(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        self.terminate();
        if self.wait_timeout(grace).await.is_none() {
            warn!(process = %self.name, "Did not exit after SIGTERM, killing");
            self.kill();
            self.wait().await;
        }
    }
}

/// Poll until a Unix socket accepts connections
pub async fn wait_for_socket(path: &Path, timeout: Duration) -> Result<(), RunnerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if UnixStream::connect(path).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RunnerError::Timeout(path.display().to_string()));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

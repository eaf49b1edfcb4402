//! Power state machine
//!
//! Pure transition logic. The supervisor feeds it inputs and carries out
//! the effects it returns, so every transition can be tested without
//! processes or sockets.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Stopped,
    Starting,
    Running,
    PoweringDown,
    Terminating,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How the runner ends, reported upstream through its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    Crashed,
    StartFailed,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Clean => 0,
            Outcome::Crashed => 1,
            Outcome::StartFailed => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Start,
    StartSucceeded,
    StartFailed,
    Stop,
    PowerdownTimeout,
    /// `guest_shutdown` is set when the guest powered itself off
    HypervisorExited { guest_shutdown: bool },
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Start companions and the hypervisor
    Launch,
    /// Ask the guest to shut down and arm the deadline
    Powerdown { timeout: Duration },
    /// SIGTERM the hypervisor
    SignalTerminate,
    /// Stop whatever processes are left
    KillAll,
    Finished(Outcome),
}

#[derive(Debug)]
pub struct PowerStateMachine {
    state: PowerState,
    powerdown_timeout: Duration,
    guest_shutdown_stops: bool,
    stop_pending: bool,
    terminate_sent: bool,
}

impl PowerStateMachine {
    pub fn new(powerdown_timeout: Duration, guest_shutdown_stops: bool) -> Self {
        Self {
            state: PowerState::Stopped,
            powerdown_timeout,
            guest_shutdown_stops,
            stop_pending: false,
            terminate_sent: false,
        }
    }

    pub fn state(&self) -> PowerState {
        self.state
    }

    pub fn set_powerdown_timeout(&mut self, timeout: Duration) {
        self.powerdown_timeout = timeout;
    }

    fn enter(&mut self, state: PowerState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Power state changed");
            self.state = state;
        }
    }

    fn finish(&mut self, outcome: Outcome) -> Vec<Effect> {
        self.enter(PowerState::Stopped);
        vec![Effect::KillAll, Effect::Finished(outcome)]
    }

    fn terminate(&mut self) -> Vec<Effect> {
        self.enter(PowerState::Terminating);
        if self.terminate_sent {
            return Vec::new();
        }
        self.terminate_sent = true;
        vec![Effect::SignalTerminate]
    }

    fn powerdown(&mut self) -> Vec<Effect> {
        self.enter(PowerState::PoweringDown);
        vec![Effect::Powerdown {
            timeout: self.powerdown_timeout,
        }]
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        use PowerState::*;

        debug!(state = %self.state, ?input, "Power input");
        match (self.state, input) {
            (Stopped, Input::Start) => {
                self.stop_pending = false;
                self.terminate_sent = false;
                self.enter(Starting);
                vec![Effect::Launch]
            }
            (Stopped, Input::Stop | Input::Terminate) => vec![Effect::Finished(Outcome::Clean)],

            (Starting, Input::StartSucceeded) => {
                self.enter(Running);
                if self.stop_pending {
                    self.powerdown()
                } else {
                    Vec::new()
                }
            }
            // Stopping a half-started hypervisor waits until it can be asked politely
            (Starting, Input::Stop) => {
                self.stop_pending = true;
                Vec::new()
            }
            (Starting, Input::StartFailed | Input::HypervisorExited { .. }) => self.finish(Outcome::StartFailed),
            (Starting, Input::Terminate) => self.finish(Outcome::Clean),

            (Running, Input::Stop) => self.powerdown(),
            (Running, Input::Terminate) => self.terminate(),
            (Running, Input::HypervisorExited { guest_shutdown: true }) if !self.guest_shutdown_stops => {
                info!("Guest shut down, restarting");
                self.terminate_sent = false;
                self.enter(Starting);
                vec![Effect::KillAll, Effect::Launch]
            }
            (Running, Input::HypervisorExited { guest_shutdown }) => {
                self.finish(if guest_shutdown { Outcome::Clean } else { Outcome::Crashed })
            }

            (PoweringDown, Input::PowerdownTimeout | Input::Terminate) => self.terminate(),
            (PoweringDown | Terminating, Input::HypervisorExited { .. }) => self.finish(Outcome::Clean),

            // A second terminate request escalates instead of repeating SIGTERM
            (Terminating, Input::Terminate) => vec![Effect::KillAll],

            (state, input) => {
                debug!(%state, ?input, "Input ignored");
                Vec::new()
            }
        }
    }
}

//! Guest agent channel
//!
//! Line oriented. The runner sends `login <user>` or `logout`; the agent
//! answers with a three digit code whose first digit is the severity.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RunnerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// The replies the runner acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    Ready,
    LoggedIn,
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub code: u16,
    pub text: String,
}

impl AgentReply {
    pub fn parse(line: &str) -> Result<Self, RunnerError> {
        let line = line.trim_end();
        let digits = line.get(..3).filter(|d| d.bytes().all(|b| b.is_ascii_digit()));
        let rest = line.get(3..).unwrap_or_default();
        let (Some(digits), true) = (digits, rest.is_empty() || rest.starts_with([' ', '-'])) else {
            return Err(RunnerError::Agent(format!("malformed reply {:?}", line)));
        };
        let code: u16 = digits
            .parse()
            .map_err(|_| RunnerError::Agent(format!("malformed reply {:?}", line)))?;
        let reply = Self {
            code,
            text: rest.get(1..).unwrap_or_default().trim().to_string(),
        };
        match reply.severity() {
            Some(_) => Ok(reply),
            None => Err(RunnerError::Agent(format!("unknown severity in {:?}", line))),
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self.code / 100 {
            1 => Some(Severity::Info),
            2 => Some(Severity::Success),
            4 | 5 => Some(Severity::Error),
            _ => None,
        }
    }

    pub fn signal(&self) -> Option<AgentSignal> {
        match self.code {
            220 => Some(AgentSignal::Ready),
            201 => Some(AgentSignal::LoggedIn),
            202 => Some(AgentSignal::LoggedOut),
            _ => None,
        }
    }
}

/// Interpret one line from the agent, logging anything not acted upon
pub fn interpret(line: &str) -> Option<AgentSignal> {
    match AgentReply::parse(line) {
        Ok(reply) => {
            let signal = reply.signal();
            match (signal, reply.severity()) {
                (Some(_), _) => debug!(code = reply.code, text = %reply.text, "Agent reply"),
                (None, Some(Severity::Error)) => warn!(code = reply.code, text = %reply.text, "Agent reported an error"),
                (None, _) => info!(code = reply.code, text = %reply.text, "Agent reply ignored"),
            }
            signal
        }
        Err(e) => {
            warn!("Ignoring agent output: {}", e);
            None
        }
    }
}

#[derive(Debug)]
pub struct AgentLink {
    writer: OwnedWriteHalf,
}

impl AgentLink {
    /// Connect to the host end of the agent port
    pub async fn connect(
        path: &Path,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AgentSignal>), RunnerError> {
        crate::process::wait_for_socket(path, timeout).await?;
        let stream = UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(signal) = interpret(&line) {
                    if tx.send(signal).is_err() {
                        break;
                    }
                }
            }
            debug!("Agent channel closed");
        });
        Ok((Self { writer }, rx))
    }

    async fn send(&mut self, command: &str) -> Result<(), RunnerError> {
        self.writer.write_all(format!("{}\n", command).as_bytes()).await?;
        Ok(())
    }

    pub async fn login(&mut self, user: &str) -> Result<(), RunnerError> {
        if user.is_empty() || user.contains(char::is_whitespace) {
            return Err(RunnerError::Agent(format!("invalid user name {:?}", user)));
        }
        info!(user, "Requesting guest login");
        self.send(&format!("login {}", user)).await
    }

    pub async fn logout(&mut self) -> Result<(), RunnerError> {
        info!("Requesting guest logout");
        self.send("logout").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[test]
    fn test_parse_codes() {
        let ready = AgentReply::parse("220 agent ready\n").unwrap();
        assert_eq!(ready.code, 220);
        assert_eq!(ready.text, "agent ready");
        assert_eq!(ready.severity(), Some(Severity::Success));
        assert_eq!(ready.signal(), Some(AgentSignal::Ready));

        assert_eq!(AgentReply::parse("201").unwrap().signal(), Some(AgentSignal::LoggedIn));
        assert_eq!(AgentReply::parse("202 bye").unwrap().signal(), Some(AgentSignal::LoggedOut));
        assert_eq!(AgentReply::parse("101 working").unwrap().severity(), Some(Severity::Info));
        assert_eq!(AgentReply::parse("503 no such user").unwrap().severity(), Some(Severity::Error));
        assert_eq!(AgentReply::parse("200 ok").unwrap().signal(), None);
    }

    #[test]
    fn test_malformed_replies_are_ignored() {
        for line in ["", "ok", "22", "2200 ready", "x20 ready", "320 odd", "220ready"] {
            assert!(AgentReply::parse(line).is_err(), "{:?}", line);
            assert_eq!(interpret(line), None);
        }
    }

    #[tokio::test]
    async fn test_link_login_and_signals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let guest = tokio::spawn(async move {
            // The readiness probe connects first
            let (probe, _) = listener.accept().await.unwrap();
            drop(probe);
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(b"220 ready\ngarbage\n").await.unwrap();
            let mut lines = BufReader::new(read).lines();
            let command = lines.next_line().await.unwrap().unwrap();
            write.write_all(b"201 logged in\n").await.unwrap();
            command
        });

        let (mut link, mut signals) = AgentLink::connect(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(signals.recv().await, Some(AgentSignal::Ready));
        link.login("alice").await.unwrap();
        assert_eq!(signals.recv().await, Some(AgentSignal::LoggedIn));
        assert_eq!(guest.await.unwrap(), "login alice");
        assert!(link.login("two words").await.is_err());
    }
}

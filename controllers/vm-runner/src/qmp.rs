//! QEMU machine protocol client
//!
//! One JSON object per line in both directions. After the greeting the
//! client negotiates capabilities; from then on each command gets exactly
//! one `return` or `error` reply, interleaved with asynchronous events. A
//! reader task splits the two so events are delivered even while no
//! command is pending.
//!
//! Commands carry an `id` that QEMU echoes back. A reply that arrives after
//! its command timed out has a stale id and is dropped.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::cpu_device_id;
use crate::error::RunnerError;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct QmpEvent {
    pub name: String,
    pub data: Value,
}

impl QmpEvent {
    /// A SHUTDOWN initiated from inside the guest
    pub fn is_guest_shutdown(&self) -> bool {
        self.name == "SHUTDOWN" && self.data.get("guest").and_then(Value::as_bool) == Some(true)
    }
}

/// One entry of `query-hotpluggable-cpus`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HotpluggableCpu {
    #[serde(rename = "type")]
    pub driver: String,
    #[serde(rename = "vcpus-count", default)]
    pub vcpus_count: u32,
    #[serde(default)]
    pub props: BTreeMap<String, Value>,
    /// Present when the slot is populated
    #[serde(rename = "qom-path", default)]
    pub qom_path: Option<String>,
}

impl HotpluggableCpu {
    fn prop(&self, name: &str) -> i64 {
        self.props.get(name).and_then(Value::as_i64).unwrap_or(0)
    }

    fn slot(&self) -> (i64, i64, i64) {
        (self.prop("socket-id"), self.prop("core-id"), self.prop("thread-id"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpuChange {
    Add { driver: String, id: String, props: BTreeMap<String, Value> },
    Remove { id: String },
}

/// Device changes that bring the number of populated vCPU slots to `target`
///
/// Slots fill in ascending order. Only vCPUs plugged at runtime can be
/// removed, highest slot first.
pub fn plan_cpu_changes(cpus: &[HotpluggableCpu], target: u32) -> Vec<CpuChange> {
    let target = target as usize;
    let mut plugged: Vec<&HotpluggableCpu> = cpus.iter().filter(|c| c.qom_path.is_some()).collect();
    let mut free: Vec<&HotpluggableCpu> = cpus.iter().filter(|c| c.qom_path.is_none()).collect();
    plugged.sort_by_key(|c| c.slot());
    free.sort_by_key(|c| c.slot());

    if target > plugged.len() {
        free.into_iter()
            .take(target - plugged.len())
            .map(|cpu| CpuChange::Add {
                driver: cpu.driver.clone(),
                id: cpu_device_id(cpu.prop("core-id").max(0) as usize),
                props: cpu.props.clone(),
            })
            .collect()
    } else {
        plugged
            .iter()
            .rev()
            .filter_map(|cpu| {
                let path = cpu.qom_path.as_deref()?;
                path.contains("/peripheral/")
                    .then(|| path.rsplit('/').next())
                    .flatten()
                    .map(|id| CpuChange::Remove { id: id.to_string() })
            })
            .take(plugged.len() - target)
            .collect()
    }
}

#[derive(Debug)]
pub struct QmpClient {
    writer: OwnedWriteHalf,
    responses: mpsc::UnboundedReceiver<Value>,
    events: Option<mpsc::UnboundedReceiver<QmpEvent>>,
    next_id: u64,
    command_timeout: Duration,
}

async fn connect_with_retry(path: &Path, timeout: Duration) -> Result<UnixStream, RunnerError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match UnixStream::connect(path).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() >= deadline => {
                return Err(RunnerError::Timeout(format!("monitor socket {}: {}", path.display(), e)));
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

impl QmpClient {
    /// Connect to the monitor socket and negotiate capabilities within `timeout`
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, RunnerError> {
        let stream = connect_with_retry(path, timeout).await?;
        let (read, writer) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let greeting = tokio::time::timeout(timeout, lines.next_line())
            .await
            .map_err(|_| RunnerError::Timeout("QMP greeting".to_string()))??
            .ok_or_else(|| RunnerError::Qmp("connection closed before greeting".to_string()))?;
        let greeting: Value = serde_json::from_str(&greeting)?;
        if greeting.get("QMP").is_none() {
            return Err(RunnerError::Qmp(format!("unexpected greeting: {}", greeting)));
        }
        debug!(version = %greeting["QMP"]["version"]["qemu"], "QMP greeting received");

        let (response_tx, responses) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                let message: Value = match serde_json::from_str(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Ignoring malformed QMP message: {}", e);
                        continue;
                    }
                };
                if let Some(name) = message.get("event").and_then(Value::as_str) {
                    let event = QmpEvent {
                        name: name.to_string(),
                        data: message.get("data").cloned().unwrap_or(Value::Null),
                    };
                    match event.name.as_str() {
                        "SHUTDOWN" | "POWERDOWN" => info!(event = %event.name, data = %event.data, "QMP event"),
                        _ => debug!(event = %event.name, "QMP event"),
                    }
                    let _ = event_tx.send(event);
                } else if response_tx.send(message).is_err() {
                    break;
                }
            }
            debug!("QMP connection closed");
        });

        let mut client = Self {
            writer,
            responses,
            events: Some(events),
            next_id: 0,
            command_timeout: COMMAND_TIMEOUT,
        };
        client.execute("qmp_capabilities", None).await?;
        Ok(client)
    }

    /// Asynchronous events; can be taken once
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<QmpEvent>> {
        self.events.take()
    }

    #[cfg(test)]
    fn set_command_timeout(&mut self, timeout: Duration) {
        self.command_timeout = timeout;
    }

    pub async fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value, RunnerError> {
        self.next_id += 1;
        let id = self.next_id;
        let mut message = json!({ "execute": command, "id": id });
        if let Some(arguments) = arguments {
            message["arguments"] = arguments;
        }
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let deadline = tokio::time::Instant::now() + self.command_timeout;
        let reply = loop {
            let reply = tokio::time::timeout_at(deadline, self.responses.recv())
                .await
                .map_err(|_| RunnerError::Timeout(format!("reply to {}", command)))?
                .ok_or_else(|| RunnerError::Qmp("connection closed".to_string()))?;
            // Replies to unparseable input have no id
            match reply.get("id").and_then(Value::as_u64) {
                Some(other) if other != id => debug!(id = other, "Dropping stale QMP reply"),
                _ => break reply,
            }
        };
        if let Some(error) = reply.get("error") {
            let desc = error.get("desc").and_then(Value::as_str).unwrap_or("unknown error");
            return Err(RunnerError::Qmp(format!("{}: {}", command, desc)));
        }
        Ok(reply.get("return").cloned().unwrap_or(Value::Null))
    }

    pub async fn system_powerdown(&mut self) -> Result<(), RunnerError> {
        self.execute("system_powerdown", None).await.map(|_| ())
    }

    /// Set the guest's target memory size in bytes
    pub async fn balloon(&mut self, bytes: u64) -> Result<(), RunnerError> {
        self.execute("balloon", Some(json!({ "value": bytes }))).await.map(|_| ())
    }

    pub async fn set_password(&mut self, password: &str) -> Result<(), RunnerError> {
        self.execute("set_password", Some(json!({ "protocol": "spice", "password": password })))
            .await
            .map(|_| ())
    }

    /// `time` is `never`, `now`, `+seconds` or absolute epoch seconds
    pub async fn expire_password(&mut self, time: &str) -> Result<(), RunnerError> {
        self.execute("expire_password", Some(json!({ "protocol": "spice", "time": time })))
            .await
            .map(|_| ())
    }

    pub async fn hotpluggable_cpus(&mut self) -> Result<Vec<HotpluggableCpu>, RunnerError> {
        let reply = self.execute("query-hotpluggable-cpus", None).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Plug or unplug vCPUs until `target` are present; returns the changes made
    pub async fn set_cpus(&mut self, target: u32) -> Result<usize, RunnerError> {
        let cpus = self.hotpluggable_cpus().await?;
        let changes = plan_cpu_changes(&cpus, target);
        for change in &changes {
            match change {
                CpuChange::Add { driver, id, props } => {
                    let mut arguments = json!({ "driver": driver, "id": id });
                    for (name, value) in props {
                        arguments[name.as_str()] = value.clone();
                    }
                    self.execute("device_add", Some(arguments)).await?;
                }
                CpuChange::Remove { id } => {
                    self.execute("device_del", Some(json!({ "id": id }))).await?;
                }
            }
        }
        Ok(changes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::UnixListener;

    fn cpu(core: i64, plugged: Option<&str>) -> HotpluggableCpu {
        let mut props = BTreeMap::new();
        props.insert("socket-id".to_string(), json!(0));
        props.insert("core-id".to_string(), json!(core));
        props.insert("thread-id".to_string(), json!(0));
        HotpluggableCpu {
            driver: "host-x86_64-cpu".to_string(),
            vcpus_count: 1,
            props,
            qom_path: plugged.map(str::to_string),
        }
    }

    fn slots() -> Vec<HotpluggableCpu> {
        vec![
            cpu(3, None),
            cpu(2, Some("/machine/peripheral/cpu-2")),
            cpu(1, Some("/machine/unattached/device[1]")),
            cpu(0, Some("/machine/unattached/device[0]")),
        ]
    }

    #[test]
    fn test_plan_adds_lowest_free_slot() {
        let changes = plan_cpu_changes(&slots(), 4);
        assert_eq!(changes.len(), 1);
        assert!(matches!(&changes[0], CpuChange::Add { id, .. } if id == "cpu-3"));
        assert!(plan_cpu_changes(&slots(), 3).is_empty());
    }

    #[test]
    fn test_plan_removes_only_hotplugged() {
        assert_eq!(
            plan_cpu_changes(&slots(), 2),
            vec![CpuChange::Remove { id: "cpu-2".to_string() }]
        );
        // Boot vCPUs stay
        assert_eq!(plan_cpu_changes(&slots(), 1).len(), 1);
    }

    #[test]
    fn test_guest_shutdown_event() {
        let guest = QmpEvent {
            name: "SHUTDOWN".to_string(),
            data: json!({ "guest": true, "reason": "guest-shutdown" }),
        };
        let host = QmpEvent {
            name: "SHUTDOWN".to_string(),
            data: json!({ "guest": false, "reason": "host-signal" }),
        };
        assert!(guest.is_guest_shutdown());
        assert!(!host.is_guest_shutdown());
    }

    /// Fake monitor: greets, records commands and answers through `reply`
    ///
    /// Non-event answers without an `id` get the command's.
    fn serve(path: &Path, reply: fn(&Value) -> Vec<Value>) -> Arc<Mutex<Vec<Value>>> {
        let listener = UnixListener::bind(path).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write
                .write_all(b"{\"QMP\": {\"version\": {\"qemu\": {\"major\": 8}}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let command: Value = serde_json::from_str(&line).unwrap();
                let answers = reply(&command);
                log.lock().unwrap().push(command.clone());
                for mut answer in answers {
                    if answer.get("event").is_none() && answer.get("id").is_none() {
                        answer["id"] = command["id"].clone();
                    }
                    write.write_all(format!("{}\n", answer).as_bytes()).await.unwrap();
                }
            }
        });
        seen
    }

    #[tokio::test]
    async fn test_handshake_commands_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        let seen = serve(&path, |command| match command["execute"].as_str() {
            Some("system_powerdown") => vec![
                json!({ "event": "POWERDOWN", "data": {} }),
                json!({ "return": {} }),
            ],
            Some("balloon") => vec![json!({ "error": { "class": "GenericError", "desc": "No balloon device" } })],
            _ => vec![json!({ "return": {} })],
        });

        let mut client = QmpClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        let mut events = client.take_events().unwrap();
        client.system_powerdown().await.unwrap();
        assert_eq!(events.recv().await.unwrap().name, "POWERDOWN");

        let err = client.balloon(1 << 30).await.unwrap_err();
        assert!(err.to_string().contains("No balloon device"));

        client.set_password("secret").await.unwrap();
        let commands = seen.lock().unwrap().clone();
        assert_eq!(commands[0]["execute"], "qmp_capabilities");
        assert_eq!(commands[3]["arguments"], json!({ "protocol": "spice", "password": "secret" }));
    }

    #[tokio::test]
    async fn test_late_reply_is_not_taken_for_the_next_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        serve(&path, |command| match command["execute"].as_str() {
            Some("query-status") => vec![],
            // The reply to the timed out query-status shows up first
            Some("set_password") => vec![
                json!({ "id": command["id"].as_u64().unwrap() - 1,
                        "error": { "class": "GenericError", "desc": "late" } }),
                json!({ "return": {} }),
            ],
            _ => vec![json!({ "return": {} })],
        });

        let mut client = QmpClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        client.set_command_timeout(Duration::from_millis(100));
        let err = client.execute("query-status", None).await.unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
        client.set_password("secret").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_cpus_issues_device_add() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        let seen = serve(&path, |command| match command["execute"].as_str() {
            Some("query-hotpluggable-cpus") => vec![json!({ "return": [
                { "type": "host-x86_64-cpu", "vcpus-count": 1, "props": { "socket-id": 0, "core-id": 1, "thread-id": 0 } },
                { "type": "host-x86_64-cpu", "vcpus-count": 1, "props": { "socket-id": 0, "core-id": 0, "thread-id": 0 },
                  "qom-path": "/machine/unattached/device[0]" }
            ] })],
            _ => vec![json!({ "return": {} })],
        });

        let mut client = QmpClient::connect(&path, Duration::from_secs(2)).await.unwrap();
        assert_eq!(client.set_cpus(2).await.unwrap(), 1);
        let commands = seen.lock().unwrap().clone();
        let add = commands.iter().find(|c| c["execute"] == "device_add").unwrap();
        assert_eq!(add["arguments"]["id"], "cpu-1");
        assert_eq!(add["arguments"]["core-id"], 1);
        assert_eq!(add["arguments"]["driver"], "host-x86_64-cpu");
    }
}

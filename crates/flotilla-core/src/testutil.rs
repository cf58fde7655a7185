//! Shared fixtures for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::domain::{
    Host, OperationId, RunningKwargs, Step, Task, TaskEnvelope, TaskId, TaskStatus, Workflow,
};
use crate::ports::{ExecOutput, RemoteSession, RemoteShell, TransportError};

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

pub fn run(command: &str) -> Step {
    Step::new("run_command", json!({ "command": command }))
}

/// A task in phase `wait` running `echo hi` on `hosts`.
pub fn task_fixture(hosts: &[&str]) -> Task {
    Task {
        id: TaskId::from_ulid(Ulid::new()),
        operation_id: OperationId::from_ulid(Ulid::new()),
        group_id: "g1".to_string(),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        workflow: Workflow::remote("wf", vec![run("echo hi")]),
        operator_id: None,
        running_kwargs: RunningKwargs::new(),
        runner: "tester".to_string(),
        status: TaskStatus::waiting(),
        result: BTreeMap::new(),
        created_at: fixed_time(),
        modified_at: fixed_time(),
        finished_at: None,
    }
}

/// [`task_fixture`] wrapped with bare host records.
pub fn envelope_fixture(hosts: &[&str]) -> TaskEnvelope {
    let targets = hosts.iter().map(|ip| Host::new(*ip)).collect();
    TaskEnvelope::new(task_fixture(hosts), targets)
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[derive(Default)]
struct FakeState {
    unreachable: Mutex<HashSet<String>>,
    executed: Mutex<Vec<(String, String)>>,
    files: Mutex<HashMap<(String, String), String>>,
    uploads: Mutex<usize>,
    closed: Mutex<usize>,
}

/// Scripted remote shell.
///
/// Commands are interpreted, not run:
/// - `exit N` exits with N
/// - `echo TEXT` prints TEXT
/// - `sleep ...` times out
/// - `fault` fails with a transport fault
/// - `panic` panics
/// - anything else exits 0
#[derive(Clone, Default)]
pub struct FakeShell {
    state: Arc<FakeState>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable(self, ip: &str) -> Self {
        self.state.unreachable.lock().unwrap().insert(ip.to_string());
        self
    }

    /// Pretend `path` already exists on `ip` with the given digest.
    pub fn with_remote_file(self, ip: &str, path: &str, digest: &str) -> Self {
        self.state
            .files
            .lock()
            .unwrap()
            .insert((ip.to_string(), path.to_string()), digest.to_string());
        self
    }

    /// `(ip, command)` in execution order.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.state.executed.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> usize {
        *self.state.uploads.lock().unwrap()
    }

    /// Sessions closed so far.
    pub fn closed(&self) -> usize {
        *self.state.closed.lock().unwrap()
    }

    pub fn remote_file(&self, ip: &str, path: &str) -> Option<String> {
        self.state
            .files
            .lock()
            .unwrap()
            .get(&(ip.to_string(), path.to_string()))
            .cloned()
    }
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn connect(&self, host: &Host) -> Result<Box<dyn RemoteSession>, TransportError> {
        if self.state.unreachable.lock().unwrap().contains(&host.ip) {
            return Err(TransportError::Connect {
                host: host.ip.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(FakeSession {
            ip: host.ip.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    ip: String,
    state: Arc<FakeState>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(
        &mut self,
        command: &str,
        _envs: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError> {
        self.state
            .executed
            .lock()
            .unwrap()
            .push((self.ip.clone(), command.to_string()));

        if let Some(code) = command.strip_prefix("exit ") {
            return Ok(ExecOutput {
                exit_code: code.trim().parse().unwrap_or(1),
                stdout: String::new(),
                stderr: format!("exited {code}\n"),
            });
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return Ok(ExecOutput {
                exit_code: 0,
                stdout: format!("{text}\n"),
                stderr: String::new(),
            });
        }
        if command.starts_with("sleep") {
            return Err(TransportError::CommandTimeout {
                timeout,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        if command == "fault" {
            return Err(TransportError::Fault("scripted fault".to_string()));
        }
        if command == "panic" {
            panic!("scripted panic");
        }
        Ok(ExecOutput::default())
    }

    async fn remote_checksum(
        &mut self,
        path: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        Ok(self
            .state
            .files
            .lock()
            .unwrap()
            .get(&(self.ip.clone(), path.to_string()))
            .cloned())
    }

    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        _timeout: Duration,
    ) -> Result<u64, TransportError> {
        let bytes = std::fs::read(local).map_err(|e| TransportError::TransferIo(e.to_string()))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        self.state
            .files
            .lock()
            .unwrap()
            .insert((self.ip.clone(), remote.to_string()), digest);
        *self.state.uploads.lock().unwrap() += 1;
        Ok(bytes.len() as u64)
    }

    async fn close(&mut self) {
        *self.state.closed.lock().unwrap() += 1;
    }
}

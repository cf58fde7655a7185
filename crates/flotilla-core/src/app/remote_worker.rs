//! RemoteWorker: runs one task on one host.
//!
//! # Flow
//! 1. `router -1, running +1`, initial result written (status `running`)
//! 2. compile, then connect
//! 3. units in order, each with its retry budget; every attempt lands in
//!    `history` and the result is re-written after each one
//! 4. finished result written, then `running -1, finish +1, success|failure +1`
//!
//! Nothing escapes `run`: compile errors, connect errors, transport faults and
//! panics all become history entries, and the host is always finalized.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::Instrument;

use crate::compile::{WorkUnit, compile};
use crate::domain::{
    Counter, HostDispatch, HostResult, HostStatus, StatusChange, StepRecord, TaskId, code,
};
use crate::ports::{Clock, RemoteSession, RemoteShell, TaskQueue, TransportError};

const CHUNK_SIZE: usize = 64 * 1024;

pub struct RemoteWorker {
    queue: Arc<dyn TaskQueue>,
    shell: Arc<dyn RemoteShell>,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl RemoteWorker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        shell: Arc<dyn RemoteShell>,
        clock: Arc<dyn Clock>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            shell,
            clock,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute and finalize; returns the final result as written.
    pub async fn run(&self, dispatch: HostDispatch) -> HostResult {
        let span = tracing::info_span!(
            "remote_worker",
            task_id = %dispatch.task_id,
            host = %dispatch.host.ip,
            worker = %self.worker_id,
        );
        self.run_inner(dispatch).instrument(span).await
    }

    async fn run_inner(&self, dispatch: HostDispatch) -> HostResult {
        let task_id = dispatch.task_id;
        let mut result = HostResult::empty(&dispatch.host.ip);
        result.status = Some(HostStatus::Running);
        result.created_at = Some(self.clock.now());
        result.worker_id = Some(self.worker_id.clone());

        self.change_status(
            task_id,
            &[
                StatusChange::Incr(Counter::Router, -1),
                StatusChange::Incr(Counter::Running, 1),
            ],
        )
        .await;
        self.write_result(task_id, &result).await;
        tracing::info!("host run started");

        // Owned out here so a panicking unit still releases the connection.
        let mut session = None;
        let executed = AssertUnwindSafe(self.execute(&dispatch, &mut result, &mut session))
            .catch_unwind()
            .await;
        if let Some(mut session) = session.take() {
            session.close().await;
        }
        if let Err(panic) = executed {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "host run panicked");
            result.history.push(
                StepRecord::new(code::SYSTEM_ERROR, "system error", self.clock.now())
                    .with_stderr(message),
            );
        }

        result.finish(self.clock.now());
        self.write_result(task_id, &result).await;
        let outcome = if result.status == Some(HostStatus::Success) {
            Counter::Success
        } else {
            Counter::Failure
        };
        self.change_status(
            task_id,
            &[
                StatusChange::Incr(Counter::Running, -1),
                StatusChange::Incr(Counter::Finish, 1),
                StatusChange::Incr(outcome, 1),
            ],
        )
        .await;
        tracing::info!(code = ?result.code, status = ?result.status, "host run finished");
        result
    }

    async fn execute(
        &self,
        dispatch: &HostDispatch,
        result: &mut HostResult,
        slot: &mut Option<Box<dyn RemoteSession>>,
    ) {
        let work = match compile(&dispatch.workflow, &dispatch.host, &dispatch.running_kwargs) {
            Ok(work) => work,
            Err(err) => {
                tracing::warn!(error = %err, "workflow does not compile for host");
                result.history.push(
                    StepRecord::new(code::SYSTEM_ERROR, "compile workflow", self.clock.now())
                        .with_stderr(err.to_string()),
                );
                return;
            }
        };

        let session = match self.shell.connect(&dispatch.host).await {
            Ok(session) => slot.insert(session),
            Err(err) => {
                tracing::warn!(error = %err, "connect failed");
                result.history.push(
                    StepRecord::new(
                        err.code(),
                        format!("connect {}", dispatch.host.ip),
                        self.clock.now(),
                    )
                    .with_stderr(err.to_string()),
                );
                return;
            }
        };

        for unit in &work.units {
            let ok = self
                .run_unit(dispatch.task_id, session.as_mut(), unit, &work.envs, result)
                .await;
            if !ok {
                break;
            }
        }
    }

    /// All attempts of one unit. `true` when the last attempt succeeded.
    async fn run_unit(
        &self,
        task_id: TaskId,
        session: &mut dyn RemoteSession,
        unit: &WorkUnit,
        envs: &BTreeMap<String, String>,
        result: &mut HostResult,
    ) -> bool {
        for attempt in 0..=unit.retry() {
            let record = self.attempt(session, unit, envs).await.with_retry(attempt);
            let ok = record.is_ok();
            let fault = record.code == code::SYSTEM_ERROR;
            tracing::debug!(unit = %record.description, attempt, code = record.code, "attempt done");

            result.history.push(record);
            self.write_result(task_id, result).await;

            if ok {
                return true;
            }
            if fault {
                return false;
            }
        }
        false
    }

    async fn attempt(
        &self,
        session: &mut dyn RemoteSession,
        unit: &WorkUnit,
        envs: &BTreeMap<String, String>,
    ) -> StepRecord {
        let description = unit.describe();
        match unit {
            WorkUnit::RunCommand {
                command, timeout, ..
            } => match session.exec(command, envs, *timeout).await {
                Ok(out) => StepRecord::new(out.exit_code, description, self.clock.now())
                    .with_output(out.stdout, out.stderr),
                Err(TransportError::CommandTimeout {
                    timeout,
                    stdout,
                    stderr,
                }) => {
                    tracing::warn!(?timeout, "command timed out");
                    StepRecord::new(code::COMMAND_TIMEOUT, description, self.clock.now())
                        .with_output(stdout, format!("{stderr}command timed out after {timeout:?}\n"))
                }
                Err(err) => self.failed(err, description),
            },
            WorkUnit::CopyFile {
                source,
                destination,
                timeout,
                checksum,
                ..
            } => {
                let local = match checksum {
                    Some(sum) => sum.clone(),
                    None => match sha256_file(Path::new(source)).await {
                        Ok(sum) => sum,
                        Err(err) => {
                            return StepRecord::new(
                                code::TRANSFER_IO_ERROR,
                                description,
                                self.clock.now(),
                            )
                            .with_stderr(format!("cannot read {source}: {err}\n"));
                        }
                    },
                };

                match session.remote_checksum(destination, *timeout).await {
                    Ok(Some(remote)) if remote == local => {
                        tracing::debug!(%destination, "remote file is up to date");
                        return StepRecord::new(code::OK, description, self.clock.now())
                            .with_output("0 bytes sent, checksum matches\n", "");
                    }
                    Ok(_) => {}
                    Err(err) => return self.failed(err, description),
                }

                match session.upload(Path::new(source), destination, *timeout).await {
                    Ok(sent) => StepRecord::new(code::OK, description, self.clock.now())
                        .with_output(format!("{sent} bytes sent\n"), ""),
                    Err(err) => self.failed(err, description),
                }
            }
        }
    }

    fn failed(&self, err: TransportError, description: String) -> StepRecord {
        tracing::warn!(error = %err, unit = %description, "unit failed");
        StepRecord::new(err.code(), description, self.clock.now()).with_stderr(format!("{err}\n"))
    }

    async fn change_status(&self, task_id: TaskId, changes: &[StatusChange]) {
        if let Err(err) = self.queue.change_status(task_id, changes).await {
            tracing::error!(error = %err, "status update lost");
        }
    }

    async fn write_result(&self, task_id: TaskId, result: &HostResult) {
        if let Err(err) = self.queue.write_host_result(task_id, result).await {
            tracing::error!(error = %err, "result write lost");
        }
    }
}

/// Hex SHA-256 of a local file, read in chunks.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Host, RunningKwargs, Step, TaskStatus, Workflow};
    use crate::impls::InMemoryTaskQueue;
    use crate::ports::FixedClock;
    use crate::testutil::{FakeShell, fixed_time, run};
    use serde_json::json;
    use std::io::Write;
    use ulid::Ulid;

    struct Harness {
        queue: Arc<InMemoryTaskQueue>,
        shell: FakeShell,
        worker: RemoteWorker,
    }

    fn harness(shell: FakeShell) -> Harness {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let worker = RemoteWorker::new(
            queue.clone(),
            Arc::new(shell.clone()),
            Arc::new(FixedClock::new(fixed_time())),
            "w-test",
        );
        Harness {
            queue,
            shell,
            worker,
        }
    }

    fn dispatch(ip: &str, steps: Vec<Step>) -> HostDispatch {
        HostDispatch {
            task_id: TaskId::from_ulid(Ulid::new()),
            host: Host::new(ip),
            workflow: Workflow::remote("wf", steps),
            running_kwargs: RunningKwargs::new(),
        }
    }

    async fn routed(queue: &InMemoryTaskQueue, task_id: TaskId) {
        queue
            .change_status(
                task_id,
                &[
                    StatusChange::Set(Counter::Total, 1),
                    StatusChange::Set(Counter::Finish, 0),
                    StatusChange::Set(Counter::Router, 1),
                ],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stops_at_first_failing_unit() {
        let h = harness(FakeShell::new());
        let d = dispatch("10.0.0.1", vec![run("exit 1"), run("echo ok")]);
        let task_id = d.task_id;
        routed(&h.queue, task_id).await;

        let result = h.worker.run(d).await;

        assert_eq!(result.status, Some(HostStatus::Failure));
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.code, Some(1));
        assert_eq!(h.shell.executed().len(), 1);

        let status = h.queue.get_status(task_id).await.unwrap();
        assert_eq!(
            (status.router, status.running, status.finish, status.failure),
            (0, 0, Some(1), 1)
        );
        let stored = h.queue.get_result(task_id).await.unwrap();
        assert_eq!(stored["10.0.0.1"], result);
    }

    #[tokio::test]
    async fn retries_until_budget_is_spent() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let h = harness(FakeShell::new());
        let d = dispatch(
            "10.0.0.1",
            vec![
                Step::new("run_command", json!({"command": "exit 3", "retry": 2})),
                Step::new(
                    "copy_file",
                    json!({"source": tmp.path(), "destination": "/opt/x"}),
                ),
            ],
        );

        let result = h.worker.run(d).await;

        let retries: Vec<_> = result.history.iter().map(|r| r.retry).collect();
        assert_eq!(retries, vec![None, Some(1), Some(2)]);
        assert!(result.history.iter().all(|r| r.code == 3));
        assert_eq!(result.code, Some(3));
        assert_eq!(h.shell.uploads(), 0);
    }

    #[tokio::test]
    async fn success_concatenates_outputs() {
        let h = harness(FakeShell::new());
        let d = dispatch("h", vec![run("echo one"), run("echo two")]);
        let task_id = d.task_id;
        routed(&h.queue, task_id).await;

        let result = h.worker.run(d).await;

        assert_eq!(result.status, Some(HostStatus::Success));
        assert_eq!(result.code, Some(0));
        assert_eq!(result.stdout.as_deref(), Some("one\ntwo\n"));
        assert_eq!(result.history.last().map(|r| r.code), result.code);
        assert_eq!(result.worker_id.as_deref(), Some("w-test"));
        assert!(result.is_finished());

        let status = h.queue.get_status(task_id).await.unwrap();
        assert_eq!((status.success, status.failure), (1, 0));
    }

    #[tokio::test]
    async fn copy_file_is_idempotent() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"payload").unwrap();
        let step = Step::new(
            "copy_file",
            json!({"source": tmp.path(), "destination": "/opt/payload"}),
        );
        let h = harness(FakeShell::new());

        let first = h.worker.run(dispatch("h", vec![step.clone()])).await;
        let second = h.worker.run(dispatch("h", vec![step])).await;

        assert_eq!(first.code, Some(0));
        assert_eq!(second.code, Some(0));
        assert_eq!(h.shell.uploads(), 1);
        assert!(second.history[0].stdout.starts_with("0 bytes"));

        let expected = sha256_file(tmp.path()).await.unwrap();
        assert_eq!(h.shell.remote_file("h", "/opt/payload"), Some(expected));
    }

    #[tokio::test]
    async fn supplied_checksum_skips_local_hashing() {
        let digest = "0".repeat(64);
        let h = harness(FakeShell::new().with_remote_file("h", "/x", &digest));
        let step = Step::new(
            "copy_file",
            json!({"source": "/does/not/exist", "destination": "/x", "checksum": digest}),
        );

        let result = h.worker.run(dispatch("h", vec![step])).await;
        assert_eq!(result.code, Some(code::OK));
        assert_eq!(h.shell.uploads(), 0);
    }

    #[tokio::test]
    async fn missing_local_file_is_a_transfer_error() {
        let h = harness(FakeShell::new());
        let step = Step::new(
            "copy_file",
            json!({"source": "/does/not/exist", "destination": "/x"}),
        );
        let result = h.worker.run(dispatch("h", vec![step])).await;
        assert_eq!(result.code, Some(code::TRANSFER_IO_ERROR));
        assert_eq!(h.shell.uploads(), 0);
    }

    #[tokio::test]
    async fn unreachable_host_records_connection_error() {
        let h = harness(FakeShell::new().unreachable("10.9.9.9"));
        let d = dispatch("10.9.9.9", vec![run("echo hi")]);
        let task_id = d.task_id;
        routed(&h.queue, task_id).await;

        let result = h.worker.run(d).await;

        assert_eq!(result.code, Some(code::CONNECTION_ERROR));
        assert_eq!(result.status, Some(HostStatus::Failure));
        assert_eq!(result.history.len(), 1);
        assert!(h.queue.get_status(task_id).await.unwrap().is_complete());
    }

    #[tokio::test]
    async fn compile_error_is_a_system_error() {
        let h = harness(FakeShell::new());
        let d = dispatch("h", vec![Step::new("format_disk", json!({}))]);
        let result = h.worker.run(d).await;
        assert_eq!(result.code, Some(code::SYSTEM_ERROR));
        assert!(h.shell.executed().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_recorded_and_retried() {
        let h = harness(FakeShell::new());
        let d = dispatch(
            "h",
            vec![Step::new("run_command", json!({"command": "sleep 60", "timeout": 1, "retry": 1}))],
        );
        let result = h.worker.run(d).await;
        assert_eq!(result.history.len(), 2);
        assert_eq!(result.code, Some(code::COMMAND_TIMEOUT));
    }

    #[tokio::test]
    async fn fault_stops_without_retry() {
        let h = harness(FakeShell::new());
        let d = dispatch(
            "h",
            vec![
                Step::new("run_command", json!({"command": "fault", "retry": 5})),
                run("echo never"),
            ],
        );
        let result = h.worker.run(d).await;
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.code, Some(code::SYSTEM_ERROR));
        assert_eq!(h.shell.executed().len(), 1);
    }

    #[tokio::test]
    async fn empty_workflow_succeeds_with_one_entry() {
        let h = harness(FakeShell::new());
        let d = dispatch("h", vec![]);
        routed(&h.queue, d.task_id).await;

        let result = h.worker.run(d).await;

        assert_eq!(result.code, Some(code::OK));
        assert_eq!(result.history.len(), 1);
        assert_eq!(result.history.last().map(|r| r.code), result.code);
        assert_eq!(h.shell.closed(), 1);
    }

    #[tokio::test]
    async fn panic_still_finalizes() {
        let h = harness(FakeShell::new());
        let d = dispatch("h", vec![run("echo before"), run("panic")]);
        let task_id = d.task_id;
        routed(&h.queue, task_id).await;

        let result = h.worker.run(d).await;

        assert_eq!(result.code, Some(code::SYSTEM_ERROR));
        assert_eq!(result.history.len(), 2);
        assert!(result.history[1].stderr.contains("scripted panic"));
        assert_eq!(h.shell.closed(), 1);
        let status: TaskStatus = h.queue.get_status(task_id).await.unwrap();
        assert!(status.is_complete());
        assert_eq!((status.running, status.failure), (0, 1));
    }
}

//! OperatorManager: resolves a task's backend and fans the task out.
//!
//! # Resolution
//! `operator_id` (or `default_operator`) names an entry in the configured
//! operator list. Its `kind` is looked up in a static registry; the backend is
//! built and initialized on first use and cached for the life of the manager.
//!
//! # Fan-out
//! `run_task` moves the counters to `queue = 0, router = N`, then runs one
//! independent dispatch per host. A failed dispatch becomes an `UNKNOWN_ERROR`
//! result so the task can still reach `finish`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::app::remote_worker::RemoteWorker;
use crate::config::{FlotillaConfig, OperatorConfig};
use crate::domain::{
    Counter, HostDispatch, HostResult, StatusChange, StepRecord, TaskEnvelope, TaskId, TaskPhase,
    code,
};
use crate::impls::{InProcessOperator, RedisBroker};
use crate::ports::{Clock, Operator, OperatorError, QueueError, TaskQueue};

/// Tries for the `queue -> router` status write.
const ROUTER_ATTEMPTS: u32 = 3;
const ROUTER_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorKind {
    InProcess,
    RedisBroker,
}

static REGISTRY: &[(&str, OperatorKind)] = &[
    ("in-process", OperatorKind::InProcess),
    ("redis-broker", OperatorKind::RedisBroker),
];

impl OperatorKind {
    pub fn lookup(name: &str) -> Option<OperatorKind> {
        REGISTRY
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, kind)| *kind)
    }

    pub fn name(&self) -> &'static str {
        REGISTRY
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(key, _)| *key)
            .unwrap_or("unknown")
    }
}

pub struct OperatorManager {
    config: Arc<FlotillaConfig>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    worker: Arc<RemoteWorker>,
    operators: Mutex<HashMap<String, Arc<dyn Operator>>>,
}

impl OperatorManager {
    pub fn new(
        config: Arc<FlotillaConfig>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        worker: Arc<RemoteWorker>,
    ) -> Self {
        Self {
            config,
            queue,
            clock,
            worker,
            operators: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize `operator` and cache it under `id`, bypassing the registry.
    pub async fn install(
        &self,
        id: impl Into<String>,
        operator: Arc<dyn Operator>,
    ) -> Result<(), OperatorError> {
        operator.initialize().await?;
        self.operators.lock().await.insert(id.into(), operator);
        Ok(())
    }

    pub async fn resolve(&self, operator_id: Option<&str>) -> Result<Arc<dyn Operator>, OperatorError> {
        let id = operator_id.unwrap_or(&self.config.default_operator);

        // Held across initialize so each id is built once.
        let mut operators = self.operators.lock().await;
        if let Some(operator) = operators.get(id) {
            return Ok(Arc::clone(operator));
        }

        let op_config = self
            .config
            .operator(id)
            .ok_or_else(|| OperatorError::UnknownOperator(id.to_string()))?;
        let operator = self.build(op_config)?;
        operator.initialize().await?;
        tracing::info!(operator = %id, kind = %op_config.kind, "operator initialized");

        operators.insert(id.to_string(), Arc::clone(&operator));
        Ok(operator)
    }

    fn build(&self, op_config: &OperatorConfig) -> Result<Arc<dyn Operator>, OperatorError> {
        let kind = OperatorKind::lookup(&op_config.kind)
            .ok_or_else(|| OperatorError::UnknownOperatorKind(op_config.kind.clone()))?;
        match kind {
            OperatorKind::InProcess => Ok(Arc::new(InProcessOperator::new(Arc::clone(&self.worker)))),
            OperatorKind::RedisBroker => {
                let url = op_config
                    .redis_url
                    .clone()
                    .or_else(|| self.config.queue.redis_url.clone())
                    .ok_or_else(|| OperatorError::Config {
                        id: op_config.id.clone(),
                        reason: "redis-broker needs redis_url or queue.redis_url".to_string(),
                    })?;
                Ok(Arc::new(RedisBroker::new(url, self.config.broker_list(op_config))))
            }
        }
    }

    /// Fan a popped task out to its backend and wait until every host has
    /// been handed over (not until the hosts finish).
    ///
    /// If the `router` transition cannot be written, every host is recorded
    /// as a failed dispatch out of `queue` and the error is returned.
    pub async fn run_task(&self, envelope: TaskEnvelope) -> Result<(), QueueError> {
        let task_id = envelope.task_id();
        let total = envelope.targets.len() as i64;
        if let Err(err) = self.start_routing(task_id, total).await {
            tracing::error!(%task_id, error = %err, "cannot move task to router, failing every host");
            let reason = format!("router transition failed: {err}");
            for dispatch in envelope.dispatches() {
                fail_dispatch(
                    self.queue.as_ref(),
                    self.clock.as_ref(),
                    &dispatch,
                    Counter::Queue,
                    reason.clone(),
                )
                .await;
            }
            return Err(err);
        }

        let operator = self.resolve(envelope.task.operator_id.as_deref()).await;
        if let Err(err) = &operator {
            tracing::error!(%task_id, error = %err, "no operator for task");
        }

        let mut dispatches = JoinSet::new();
        for dispatch in envelope.dispatches() {
            let queue = Arc::clone(&self.queue);
            let clock = Arc::clone(&self.clock);
            let operator = match &operator {
                Ok(operator) => Ok(Arc::clone(operator)),
                Err(err) => Err(err.to_string()),
            };
            dispatches.spawn(async move {
                let ip = dispatch.host.ip.clone();
                let sent = match operator {
                    Ok(operator) => operator
                        .open_task_for_one_host(dispatch.clone())
                        .await
                        .map_err(|e| e.to_string()),
                    Err(reason) => Err(reason),
                };
                if let Err(reason) = sent {
                    tracing::warn!(%task_id, host = %ip, error = %reason, "dispatch failed");
                    fail_dispatch(queue.as_ref(), clock.as_ref(), &dispatch, Counter::Router, reason)
                        .await;
                }
            });
        }
        while let Some(joined) = dispatches.join_next().await {
            if let Err(err) = joined {
                tracing::error!(%task_id, error = %err, "dispatch task aborted");
            }
        }
        tracing::info!(%task_id, hosts = total, "task fanned out");
        Ok(())
    }

    async fn start_routing(&self, task_id: TaskId, total: i64) -> Result<(), QueueError> {
        let changes = [
            StatusChange::Phase(TaskPhase::Running),
            StatusChange::Set(Counter::Queue, 0),
            StatusChange::Set(Counter::Router, total),
        ];
        let mut attempt = 1;
        loop {
            match self.queue.change_status(task_id, &changes).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < ROUTER_ATTEMPTS => {
                    tracing::warn!(%task_id, attempt, error = %err, "router transition failed, retrying");
                    tokio::time::sleep(ROUTER_BACKOFF).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Record a host that never reached its backend as finished and failed.
/// `from` is the counter the host is still counted in.
async fn fail_dispatch(
    queue: &dyn TaskQueue,
    clock: &dyn Clock,
    dispatch: &HostDispatch,
    from: Counter,
    reason: String,
) {
    let now = clock.now();
    let mut result = HostResult::empty(&dispatch.host.ip);
    result.created_at = Some(now);
    result
        .history
        .push(StepRecord::new(code::UNKNOWN_ERROR, "dispatch", now).with_stderr(reason));
    result.finish(now);

    if let Err(err) = queue.write_host_result(dispatch.task_id, &result).await {
        tracing::error!(task_id = %dispatch.task_id, error = %err, "failed to write dispatch failure");
    }
    let changes = [
        StatusChange::Incr(from, -1),
        StatusChange::Incr(Counter::Finish, 1),
        StatusChange::Incr(Counter::Failure, 1),
    ];
    if let Err(err) = queue.change_status(dispatch.task_id, &changes).await {
        tracing::error!(task_id = %dispatch.task_id, error = %err, "failed to count dispatch failure");
    }
}

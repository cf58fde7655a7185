//! TaskQueue port: the queue protocol between the controlling process and
//! the execution backends.
//!
//! # Data held per task
//! - body: the [`TaskEnvelope`], present from `push` until `close_task`
//! - status: phase + integer counters, mutated only through [`StatusChange`]
//! - result: host IP -> [`HostResult`]
//!
//! # Admission
//! - `push` fails with [`QueueError::QueueFull`] once the queue holds
//!   `max_queued` ids, with no side effects.
//! - `pop_or_none` returns `None` while `max_running` tasks are running.
//!
//! Limits live next to the queue, so every process sharing it agrees on them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{HostResult, StatusChange, TaskEnvelope, TaskId, TaskPhase, TaskStatus};

pub const DEFAULT_MAX_QUEUED: usize = 50;
pub const DEFAULT_MAX_RUNNING: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    pub max_queued: usize,
    pub max_running: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_queued: DEFAULT_MAX_QUEUED,
            max_running: DEFAULT_MAX_RUNNING,
        }
    }
}

/// Snapshot of the queue for operators and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub limits: AdmissionLimits,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({queued}/{max_queued})")]
    QueueFull { queued: usize, max_queued: usize },

    #[error("task {task_id} cannot be pushed from phase {phase:?}")]
    InvalidPhase {
        task_id: TaskId,
        phase: Option<TaskPhase>,
    },

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("queue codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Admit a task in phase `wait` and seed its counters.
    async fn push(&self, envelope: &TaskEnvelope) -> Result<(), QueueError>;

    /// Take the head of the queue and mark it running, unless the running
    /// set is at capacity or the queue is empty.
    async fn pop_or_none(&self) -> Result<Option<TaskEnvelope>, QueueError>;

    /// Apply absolute sets and atomic increments to the status hash.
    async fn change_status(
        &self,
        task_id: TaskId,
        changes: &[StatusChange],
    ) -> Result<(), QueueError>;

    async fn write_host_result(
        &self,
        task_id: TaskId,
        result: &HostResult,
    ) -> Result<(), QueueError>;

    async fn get_status(&self, task_id: TaskId) -> Result<TaskStatus, QueueError>;

    async fn get_result(&self, task_id: TaskId)
    -> Result<BTreeMap<String, HostResult>, QueueError>;

    /// Free the running slot and drop the body.
    async fn close_task(&self, task_id: TaskId) -> Result<(), QueueError>;

    /// Drop counters, results and any running-set membership.
    async fn remove(&self, task_id: TaskId) -> Result<(), QueueError>;

    async fn set_limits(&self, limits: AdmissionLimits) -> Result<(), QueueError>;

    async fn limits(&self) -> Result<AdmissionLimits, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

//! Durable stores: tasks, the operation/workflow catalog and host selection.
//!
//! These are the engine's view of the relational layer. Only the operations
//! the dispatch engine needs are modelled.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    Host, HostFilter, HostResult, Operation, OperationCache, OperationId, Task, TaskId, TaskPhase,
    TaskStatus, Workflow, WorkflowId,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    /// Worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => StoreError::NotFound(err.to_string()),
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Backend(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPredicate {
    Id(TaskId),
    Operation(OperationId),
    Phase(TaskPhase),
    All,
}

impl TaskPredicate {
    pub fn matches(&self, task: &Task) -> bool {
        match self {
            TaskPredicate::Id(id) => task.id == *id,
            TaskPredicate::Operation(op) => task.operation_id == *op,
            TaskPredicate::Phase(phase) => task.status.phase == Some(*phase),
            TaskPredicate::All => true,
        }
    }
}

/// Field-wise update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// Applied after `status`, so it wins over the phase inside it.
    pub phase: Option<TaskPhase>,
    pub result: Option<BTreeMap<String, HostResult>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn phase(phase: TaskPhase, at: DateTime<Utc>) -> Self {
        Self {
            phase: Some(phase),
            modified_at: Some(at),
            ..Self::default()
        }
    }

    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = &self.status {
            task.status = status.clone();
        }
        if let Some(phase) = self.phase {
            task.status.phase = Some(phase);
        }
        if let Some(result) = &self.result {
            task.result = result.clone();
        }
        if let Some(finished_at) = self.finished_at {
            task.finished_at = Some(finished_at);
        }
        if let Some(modified_at) = self.modified_at {
            task.modified_at = modified_at;
        }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    async fn get(&self, predicate: &TaskPredicate) -> Result<Vec<Task>, StoreError>;

    /// Number of tasks updated.
    async fn update(
        &self,
        predicate: &TaskPredicate,
        update: &TaskUpdate,
    ) -> Result<usize, StoreError>;

    /// Number of tasks deleted.
    async fn delete(&self, predicate: &TaskPredicate) -> Result<usize, StoreError>;

    async fn count(&self, predicate: &TaskPredicate) -> Result<usize, StoreError>;

    async fn get_by_id(&self, id: TaskId) -> Result<Task, StoreError> {
        self.get(&TaskPredicate::Id(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn operation(&self, id: OperationId) -> Result<Operation, StoreError>;

    async fn workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError>;

    async fn store_operation_cache(
        &self,
        id: OperationId,
        cache: OperationCache,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HostSelector: Send + Sync {
    /// Hosts matching the filter, in a stable order.
    async fn select_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>, StoreError>;
}

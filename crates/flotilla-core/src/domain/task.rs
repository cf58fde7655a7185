use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::host::{Host, HostFilter};
use super::ids::{OperationId, TaskId, WorkflowId};
use super::result::HostResult;
use super::status::{TaskPhase, TaskStatus};
use super::workflow::Workflow;

pub type RunningKwargs = BTreeMap<String, serde_json::Value>;

/// One execution of one operation against a frozen set of hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub operation_id: OperationId,
    pub group_id: String,
    /// Host IPs, frozen at creation.
    pub hosts: Vec<String>,
    /// Full snapshot, not a reference.
    pub workflow: Workflow,
    /// `None` selects the default operator.
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub running_kwargs: RunningKwargs,
    pub runner: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: BTreeMap<String, HostResult>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn phase(&self) -> Option<TaskPhase> {
        self.status.phase
    }

    /// Every host has a finished result.
    pub fn is_terminal(&self) -> bool {
        self.hosts
            .iter()
            .all(|ip| self.result.get(ip).is_some_and(HostResult::is_finished))
    }
}

/// Queue body: the task plus the resolved host records of its targets.
///
/// Backends receive full host records so they never need a host lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: Task,
    pub targets: Vec<Host>,
}

impl TaskEnvelope {
    pub fn new(task: Task, targets: Vec<Host>) -> Self {
        Self { task, targets }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// One dispatch per target host, in target order.
    pub fn dispatches(&self) -> impl Iterator<Item = HostDispatch> + '_ {
        self.targets.iter().map(|host| HostDispatch {
            task_id: self.task.id,
            host: host.clone(),
            workflow: self.task.workflow.clone(),
            running_kwargs: self.task.running_kwargs.clone(),
        })
    }
}

/// Everything a remote worker needs to run one task on one host.
///
/// This is also the message a broker operator puts on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDispatch {
    pub task_id: TaskId,
    pub host: Host,
    pub workflow: Workflow,
    #[serde(default)]
    pub running_kwargs: RunningKwargs,
}

/// Cached hosts and workflow snapshot of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationCache {
    pub hosts: Vec<String>,
    pub workflow: Workflow,
}

/// A named workflow + host filter + operator combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub name: String,
    pub group_id: String,
    pub workflow_id: WorkflowId,
    #[serde(default)]
    pub host_filter: HostFilter,
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub cache: Option<OperationCache>,
}

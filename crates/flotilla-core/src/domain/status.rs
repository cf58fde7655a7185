//! Task lifecycle and the live status counters kept in the queue.
//!
//! # State machine
//! `wait -> queue -> router -> running -> finish`
//!
//! Success and failure are tallied per host; a task itself only has the
//! terminal condition "every host finished" (`finish == total`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Phase of a task as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Wait,
    Queue,
    Router,
    Running,
    Finish,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Wait => "wait",
            TaskPhase::Queue => "queue",
            TaskPhase::Router => "router",
            TaskPhase::Running => "running",
            TaskPhase::Finish => "finish",
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(TaskPhase::Wait),
            "queue" => Ok(TaskPhase::Queue),
            "router" => Ok(TaskPhase::Router),
            "running" => Ok(TaskPhase::Running),
            "finish" => Ok(TaskPhase::Finish),
            other => Err(format!("unknown task phase {other:?}")),
        }
    }
}

/// Name of one integer field in the status hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Total,
    Finish,
    Wait,
    Queue,
    Router,
    Running,
    Success,
    Failure,
}

impl Counter {
    pub const ALL: [Counter; 8] = [
        Counter::Total,
        Counter::Finish,
        Counter::Wait,
        Counter::Queue,
        Counter::Router,
        Counter::Running,
        Counter::Success,
        Counter::Failure,
    ];

    pub fn field(&self) -> &'static str {
        match self {
            Counter::Total => "total",
            Counter::Finish => "finish",
            Counter::Wait => "wait",
            Counter::Queue => "queue",
            Counter::Router => "router",
            Counter::Running => "running",
            Counter::Success => "success",
            Counter::Failure => "failure",
        }
    }

    pub fn from_field(field: &str) -> Option<Counter> {
        Counter::ALL.into_iter().find(|c| c.field() == field)
    }
}

/// Field name of the phase inside the status hash.
pub const PHASE_FIELD: &str = "task_status";

/// One mutation of the status hash.
///
/// `Incr` maps onto an atomic per-field increment, so concurrent writers for
/// different hosts never lose updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Phase(TaskPhase),
    Set(Counter, i64),
    Incr(Counter, i64),
}

/// Point-in-time view of a task's status hash.
///
/// This is also the shape archived into the durable store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    #[serde(rename = "task_status", default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<TaskPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<i64>,
    #[serde(default)]
    pub wait: i64,
    #[serde(default)]
    pub queue: i64,
    #[serde(default)]
    pub router: i64,
    #[serde(default)]
    pub running: i64,
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub failure: i64,
}

impl TaskStatus {
    /// Status of a freshly created task.
    pub fn waiting() -> Self {
        Self {
            phase: Some(TaskPhase::Wait),
            ..Self::default()
        }
    }

    /// Counters seeded by `push`.
    pub fn queued(total: usize) -> Self {
        let total = total as i64;
        Self {
            phase: Some(TaskPhase::Queue),
            total: Some(total),
            finish: Some(0),
            queue: total,
            ..Self::default()
        }
    }

    /// `total` and `finish` are both present and equal.
    pub fn is_complete(&self) -> bool {
        matches!((self.total, self.finish), (Some(t), Some(f)) if t == f)
    }

    pub fn counter(&self, counter: Counter) -> Option<i64> {
        match counter {
            Counter::Total => self.total,
            Counter::Finish => self.finish,
            Counter::Wait => Some(self.wait),
            Counter::Queue => Some(self.queue),
            Counter::Router => Some(self.router),
            Counter::Running => Some(self.running),
            Counter::Success => Some(self.success),
            Counter::Failure => Some(self.failure),
        }
    }

    fn set_counter(&mut self, counter: Counter, value: i64) {
        match counter {
            Counter::Total => self.total = Some(value),
            Counter::Finish => self.finish = Some(value),
            Counter::Wait => self.wait = value,
            Counter::Queue => self.queue = value,
            Counter::Router => self.router = value,
            Counter::Running => self.running = value,
            Counter::Success => self.success = value,
            Counter::Failure => self.failure = value,
        }
    }

    pub fn apply(&mut self, change: StatusChange) {
        match change {
            StatusChange::Phase(phase) => self.phase = Some(phase),
            StatusChange::Set(counter, value) => self.set_counter(counter, value),
            StatusChange::Incr(counter, by) => {
                let current = self.counter(counter).unwrap_or(0);
                self.set_counter(counter, current + by);
            }
        }
    }

    /// Build from raw hash fields. Unknown fields and unparsable values are skipped.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut status = Self::default();
        for (k, v) in fields {
            let (k, v) = (k.as_ref(), v.as_ref());
            if k == PHASE_FIELD {
                status.phase = v.parse().ok();
            } else if let (Some(counter), Ok(value)) = (Counter::from_field(k), v.parse()) {
                status.set_counter(counter, value);
            }
        }
        status
    }

    /// Flatten into hash fields (absent `total`/`finish` are omitted).
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::with_capacity(Counter::ALL.len() + 1);
        if let Some(phase) = self.phase {
            fields.push((PHASE_FIELD, phase.as_str().to_string()));
        }
        for counter in Counter::ALL {
            if let Some(value) = self.counter(counter) {
                fields.push((counter.field(), value.to_string()));
            }
        }
        fields
    }
}

//! InMemoryTaskQueue: the queue protocol behind a single async mutex.
//!
//! Bodies are kept as JSON text, the same as the Redis backend, so a
//! malformed body behaves identically in both.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{HostResult, StatusChange, TaskEnvelope, TaskId, TaskPhase, TaskStatus};
use crate::ports::{AdmissionLimits, QueueError, QueueStats, TaskQueue};

#[derive(Default)]
struct QueueState {
    queue: VecDeque<TaskId>,
    running: HashSet<TaskId>,
    bodies: HashMap<TaskId, String>,
    statuses: HashMap<TaskId, TaskStatus>,
    results: HashMap<TaskId, BTreeMap<String, HostResult>>,
    limits: AdmissionLimits,
}

impl QueueState {
    /// Drop everything held for a task that can never run.
    fn forget(&mut self, task_id: TaskId) {
        self.running.remove(&task_id);
        self.bodies.remove(&task_id);
        self.statuses.remove(&task_id);
        self.results.remove(&task_id);
    }
}

#[derive(Clone, Default)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: AdmissionLimits) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                limits,
                ..QueueState::default()
            })),
        }
    }

    /// Overwrite a stored body with arbitrary text.
    #[cfg(test)]
    pub(crate) async fn put_raw_body(&self, task_id: TaskId, body: &str) {
        self.state.lock().await.bodies.insert(task_id, body.to_string());
    }

    #[cfg(test)]
    pub(crate) async fn drop_body(&self, task_id: TaskId) {
        self.state.lock().await.bodies.remove(&task_id);
    }

    #[cfg(test)]
    pub(crate) async fn has_body(&self, task_id: TaskId) -> bool {
        self.state.lock().await.bodies.contains_key(&task_id)
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, envelope: &TaskEnvelope) -> Result<(), QueueError> {
        let task_id = envelope.task_id();
        let phase = envelope.task.phase();
        if phase != Some(TaskPhase::Wait) {
            return Err(QueueError::InvalidPhase { task_id, phase });
        }
        let body = serde_json::to_string(envelope)?;

        let mut state = self.state.lock().await;
        if state.queue.len() >= state.limits.max_queued {
            return Err(QueueError::QueueFull {
                queued: state.queue.len(),
                max_queued: state.limits.max_queued,
            });
        }
        state.bodies.insert(task_id, body);
        state
            .statuses
            .insert(task_id, TaskStatus::queued(envelope.task.hosts.len()));
        state.queue.push_back(task_id);
        Ok(())
    }

    async fn pop_or_none(&self) -> Result<Option<TaskEnvelope>, QueueError> {
        let mut state = self.state.lock().await;
        if state.running.len() >= state.limits.max_running {
            return Ok(None);
        }
        let Some(task_id) = state.queue.pop_front() else {
            return Ok(None);
        };
        let Some(body) = state.bodies.get(&task_id) else {
            tracing::warn!(%task_id, "popped task has no body, dropping");
            state.forget(task_id);
            return Ok(None);
        };
        match serde_json::from_str::<TaskEnvelope>(body) {
            Ok(envelope) => {
                state.running.insert(task_id);
                Ok(Some(envelope))
            }
            Err(err) => {
                tracing::warn!(%task_id, error = %err, "popped task has a malformed body, dropping");
                state.forget(task_id);
                Ok(None)
            }
        }
    }

    async fn change_status(
        &self,
        task_id: TaskId,
        changes: &[StatusChange],
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let status = state.statuses.entry(task_id).or_default();
        for change in changes {
            status.apply(*change);
        }
        Ok(())
    }

    async fn write_host_result(
        &self,
        task_id: TaskId,
        result: &HostResult,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state
            .results
            .entry(task_id)
            .or_default()
            .insert(result.ip.clone(), result.clone());
        Ok(())
    }

    async fn get_status(&self, task_id: TaskId) -> Result<TaskStatus, QueueError> {
        let state = self.state.lock().await;
        Ok(state.statuses.get(&task_id).cloned().unwrap_or_default())
    }

    async fn get_result(
        &self,
        task_id: TaskId,
    ) -> Result<BTreeMap<String, HostResult>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.results.get(&task_id).cloned().unwrap_or_default())
    }

    async fn close_task(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.running.remove(&task_id);
        state.bodies.remove(&task_id);
        Ok(())
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.running.remove(&task_id);
        state.statuses.remove(&task_id);
        state.results.remove(&task_id);
        Ok(())
    }

    async fn set_limits(&self, limits: AdmissionLimits) -> Result<(), QueueError> {
        self.state.lock().await.limits = limits;
        Ok(())
    }

    async fn limits(&self) -> Result<AdmissionLimits, QueueError> {
        Ok(self.state.lock().await.limits)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            queued: state.queue.len(),
            running: state.running.len(),
            limits: state.limits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Counter, Host};
    use crate::testutil::task_fixture;

    fn envelope(hosts: &[&str]) -> TaskEnvelope {
        let task = task_fixture(hosts);
        let targets = hosts.iter().map(|ip| Host::new(*ip)).collect();
        TaskEnvelope::new(task, targets)
    }

    #[tokio::test]
    async fn push_seeds_counters_and_pop_marks_running() {
        let queue = InMemoryTaskQueue::new();
        let env = envelope(&["10.0.0.1", "10.0.0.2"]);
        let id = env.task_id();

        queue.push(&env).await.unwrap();
        let status = queue.get_status(id).await.unwrap();
        assert_eq!(status, TaskStatus::queued(2));

        let popped = queue.pop_or_none().await.unwrap().unwrap();
        assert_eq!(popped, env);

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.queued, stats.running), (0, 1));
        assert!(queue.pop_or_none().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn push_requires_wait_phase() {
        let queue = InMemoryTaskQueue::new();
        let mut env = envelope(&["h"]);
        env.task.status.phase = Some(TaskPhase::Queue);

        let err = queue.push(&env).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPhase { .. }));
        assert_eq!(queue.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn push_beyond_max_queued_leaves_queue_untouched() {
        let limits = AdmissionLimits {
            max_queued: 2,
            max_running: 10,
        };
        let queue = InMemoryTaskQueue::with_limits(limits);
        let first = envelope(&["a"]);
        queue.push(&first).await.unwrap();
        queue.push(&envelope(&["b"])).await.unwrap();

        let rejected = envelope(&["c"]);
        let err = queue.push(&rejected).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::QueueFull {
                queued: 2,
                max_queued: 2
            }
        ));

        assert_eq!(queue.stats().await.unwrap().queued, 2);
        assert_eq!(
            queue.get_status(rejected.task_id()).await.unwrap(),
            TaskStatus::default()
        );
        assert!(!queue.has_body(rejected.task_id()).await);
        // FIFO order is intact.
        assert_eq!(queue.pop_or_none().await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn pop_at_max_running_returns_none_without_mutation() {
        let limits = AdmissionLimits {
            max_queued: 10,
            max_running: 1,
        };
        let queue = InMemoryTaskQueue::with_limits(limits);
        queue.push(&envelope(&["a"])).await.unwrap();
        queue.push(&envelope(&["b"])).await.unwrap();

        assert!(queue.pop_or_none().await.unwrap().is_some());
        assert!(queue.pop_or_none().await.unwrap().is_none());

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.queued, stats.running), (1, 1));
    }

    #[tokio::test]
    async fn malformed_body_is_dropped() {
        let queue = InMemoryTaskQueue::new();
        let env = envelope(&["a"]);
        queue.push(&env).await.unwrap();
        queue.put_raw_body(env.task_id(), "{not json").await;

        assert!(queue.pop_or_none().await.unwrap().is_none());
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.queued, stats.running), (0, 0));
        assert!(!queue.has_body(env.task_id()).await);
        assert_eq!(queue.get_status(env.task_id()).await.unwrap(), TaskStatus::default());
    }

    #[tokio::test]
    async fn missing_body_drops_status_and_results() {
        let queue = InMemoryTaskQueue::new();
        let env = envelope(&["a"]);
        let id = env.task_id();
        queue.push(&env).await.unwrap();
        queue.write_host_result(id, &HostResult::empty("a")).await.unwrap();
        queue.drop_body(id).await;

        assert!(queue.pop_or_none().await.unwrap().is_none());
        assert_eq!(queue.get_status(id).await.unwrap(), TaskStatus::default());
        assert!(queue.get_result(id).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.unwrap().running, 0);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let queue = InMemoryTaskQueue::new();
        let id = envelope(&["a"]).task_id();

        let mut joins = Vec::new();
        for _ in 0..50 {
            let queue = queue.clone();
            joins.push(tokio::spawn(async move {
                queue
                    .change_status(id, &[StatusChange::Incr(Counter::Finish, 1)])
                    .await
                    .unwrap();
            }));
        }
        for join in joins {
            join.await.unwrap();
        }

        assert_eq!(queue.get_status(id).await.unwrap().finish, Some(50));
    }

    #[tokio::test]
    async fn close_then_remove_clears_everything() {
        let queue = InMemoryTaskQueue::new();
        let env = envelope(&["a"]);
        let id = env.task_id();
        queue.push(&env).await.unwrap();
        queue.pop_or_none().await.unwrap();
        queue
            .write_host_result(id, &HostResult::empty("a"))
            .await
            .unwrap();

        queue.close_task(id).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().running, 0);
        assert!(!queue.has_body(id).await);
        assert_eq!(queue.get_result(id).await.unwrap().len(), 1);

        queue.remove(id).await.unwrap();
        assert!(queue.get_result(id).await.unwrap().is_empty());
        assert_eq!(queue.get_status(id).await.unwrap(), TaskStatus::default());
    }
}

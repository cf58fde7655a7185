//! TaskService: reads, result queries and redo.
//!
//! A task that has not reached `finish` yet lives partly in the queue, so
//! [`TaskService::get`] overlays the live status and results on top of the
//! durable record.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::operation::{check_compiles, enqueue};
use crate::domain::{HostFilter, HostResult, HostStatus, Task, TaskId, TaskPhase, TaskStatus, code};
use crate::error::EngineError;
use crate::ports::{Clock, HostSelector, IdGenerator, TaskQueue, TaskStore};

/// Host-level query over a task's results. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Seconds; keeps hosts that took at least this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_gt: Option<f64>,
    /// Seconds; keeps hosts that took at most this long.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_lt: Option<f64>,
}

impl ResultFilter {
    pub fn failed() -> Self {
        Self {
            failure: Some(true),
            ..Self::default()
        }
    }

    fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Cost filters only make sense for finished hosts.
    fn normalized(&self) -> Result<Self, EngineError> {
        let mut filter = self.clone();
        if filter.cost_gt.is_some() || filter.cost_lt.is_some() {
            if filter.finished == Some(false) {
                return Err(EngineError::InvalidFilter(
                    "cost filters need finished = true".to_string(),
                ));
            }
            filter.finished = Some(true);
        }
        Ok(filter)
    }

    fn matches(&self, result: &HostResult) -> bool {
        if let Some(finished) = self.finished {
            if finished != result.is_finished() {
                return false;
            }
        }
        if let Some(success) = self.success {
            if success != (result.status == Some(HostStatus::Success)) {
                return false;
            }
        }
        if let Some(failure) = self.failure {
            if failure != (result.status == Some(HostStatus::Failure)) {
                return false;
            }
        }
        let cost = result.cost_secs();
        if let Some(gt) = self.cost_gt {
            if cost.is_none_or(|c| c < gt) {
                return false;
            }
        }
        if let Some(lt) = self.cost_lt {
            if cost.is_none_or(|c| c > lt) {
                return false;
            }
        }
        if let Some(code) = self.code {
            if result.code != Some(code) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedResult {
    pub count: usize,
    pub ips: Vec<String>,
    pub details: BTreeMap<String, HostResult>,
}

pub struct TaskService {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn TaskStore>,
    hosts: Arc<dyn HostSelector>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn TaskStore>,
        hosts: Arc<dyn HostSelector>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            store,
            hosts,
            ids,
            clock,
        }
    }

    pub async fn get(&self, task_id: TaskId) -> Result<Task, EngineError> {
        let mut task = self.store.get_by_id(task_id).await?;
        if task.phase() != Some(TaskPhase::Finish) {
            let live = self.queue.get_status(task_id).await?;
            // Nothing in the queue (not pushed yet, or already removed).
            if live != TaskStatus::default() {
                task.status = live;
                task.result = self.queue.get_result(task_id).await?;
            }
        }
        Ok(task)
    }

    pub async fn parse(&self, task_id: TaskId, filter: &ResultFilter) -> Result<ParsedResult, EngineError> {
        let task = self.get(task_id).await?;
        parse_results(&task, filter)
    }

    /// Hosts per result code; hosts without a code count as `UNKNOWN`.
    pub async fn code_map(&self, task_id: TaskId) -> Result<BTreeMap<i64, usize>, EngineError> {
        let task = self.get(task_id).await?;
        let mut map = BTreeMap::new();
        for ip in &task.hosts {
            let code = task
                .result
                .get(ip)
                .and_then(|r| r.code)
                .unwrap_or(code::UNKNOWN);
            *map.entry(code).or_insert(0) += 1;
        }
        Ok(map)
    }

    /// Queue a fresh task re-running `task_id` on the hosts matching `filter`
    /// (every original host when `filter` is `None` or empty).
    pub async fn redo(
        &self,
        task_id: TaskId,
        filter: Option<&ResultFilter>,
        runner: &str,
    ) -> Result<Task, EngineError> {
        let source = self.get(task_id).await?;
        let wanted = match filter {
            Some(filter) if !filter.is_empty() => parse_results(&source, filter)?.ips,
            _ => source.hosts.clone(),
        };

        let found = self.hosts.select_hosts(&HostFilter::ips(wanted.clone())).await?;
        let mut targets = Vec::with_capacity(wanted.len());
        for ip in &wanted {
            match found.iter().find(|h| &h.ip == ip) {
                Some(host) => targets.push(host.clone()),
                None => tracing::warn!(%task_id, host = %ip, "host no longer selectable, skipped in redo"),
            }
        }
        check_compiles(&source.workflow, &targets, &source.running_kwargs)?;

        let now = self.clock.now();
        let task = Task {
            id: self.ids.generate_task_id(),
            hosts: targets.iter().map(|h| h.ip.clone()).collect(),
            runner: runner.to_string(),
            status: TaskStatus::waiting(),
            result: BTreeMap::new(),
            created_at: now,
            modified_at: now,
            finished_at: None,
            ..source
        };
        tracing::info!(%task_id, redo_id = %task.id, hosts = task.hosts.len(), "redoing task");
        enqueue(
            self.store.as_ref(),
            self.queue.as_ref(),
            self.clock.as_ref(),
            task,
            targets,
        )
        .await
    }
}

fn parse_results(task: &Task, filter: &ResultFilter) -> Result<ParsedResult, EngineError> {
    let filter = filter.normalized()?;
    let mut parsed = ParsedResult::default();
    for ip in &task.hosts {
        let result = task
            .result
            .get(ip)
            .cloned()
            .unwrap_or_else(|| HostResult::empty(ip));
        if filter.matches(&result) {
            parsed.count += 1;
            parsed.ips.push(ip.clone());
            parsed.details.insert(ip.clone(), result);
        }
    }
    Ok(parsed)
}

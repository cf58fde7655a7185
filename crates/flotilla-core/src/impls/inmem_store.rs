//! InMemoryStore: task store, catalog and host inventory in one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{
    Host, HostFilter, Operation, OperationCache, OperationId, Task, TaskId, Workflow, WorkflowId,
};
use crate::ports::{Catalog, HostSelector, StoreError, TaskPredicate, TaskStore, TaskUpdate};

#[derive(Default)]
struct StoreState {
    /// Insertion order is kept so listings are stable.
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    operations: HashMap<OperationId, Operation>,
    workflows: HashMap<WorkflowId, Workflow>,
    hosts: Vec<Host>,
}

impl StoreState {
    fn reindex(&mut self) {
        self.index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id, i))
            .collect();
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_host(&self, host: Host) {
        let mut state = self.state.write().await;
        state.hosts.retain(|h| h.ip != host.ip);
        state.hosts.push(host);
    }

    pub async fn add_workflow(&self, id: WorkflowId, mut workflow: Workflow) {
        workflow.id = Some(id);
        self.state.write().await.workflows.insert(id, workflow);
    }

    pub async fn add_operation(&self, operation: Operation) {
        self.state
            .write()
            .await
            .operations
            .insert(operation.id, operation);
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.index.contains_key(&task.id) {
            return Err(StoreError::Conflict(task.id.to_string()));
        }
        let position = state.tasks.len();
        state.index.insert(task.id, position);
        state.tasks.push(task.clone());
        Ok(())
    }

    async fn get(&self, predicate: &TaskPredicate) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read().await;
        if let TaskPredicate::Id(id) = predicate {
            return Ok(state
                .index
                .get(id)
                .map(|&i| vec![state.tasks[i].clone()])
                .unwrap_or_default());
        }
        Ok(state
            .tasks
            .iter()
            .filter(|t| predicate.matches(t))
            .cloned()
            .collect())
    }

    async fn update(
        &self,
        predicate: &TaskPredicate,
        update: &TaskUpdate,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for task in state.tasks.iter_mut().filter(|t| predicate.matches(t)) {
            update.apply(task);
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, predicate: &TaskPredicate) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let before = state.tasks.len();
        state.tasks.retain(|t| !predicate.matches(t));
        let deleted = before - state.tasks.len();
        state.reindex();
        Ok(deleted)
    }

    async fn count(&self, predicate: &TaskPredicate) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state.tasks.iter().filter(|t| predicate.matches(t)).count())
    }
}

#[async_trait]
impl Catalog for InMemoryStore {
    async fn operation(&self, id: OperationId) -> Result<Operation, StoreError> {
        self.state
            .read()
            .await
            .operations
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        self.state
            .read()
            .await
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn store_operation_cache(
        &self,
        id: OperationId,
        cache: OperationCache,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let operation = state
            .operations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        operation.cache = Some(cache);
        Ok(())
    }
}

#[async_trait]
impl HostSelector for InMemoryStore {
    async fn select_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .hosts
            .iter()
            .filter(|h| filter.matches(h))
            .cloned()
            .collect())
    }
}

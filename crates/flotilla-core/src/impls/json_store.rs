//! JsonDirStore: one JSON document per record under a directory.
//!
//! ```text
//! {dir}/tasks/{task_id}.json
//! {dir}/operations/{operation_id}.json
//! {dir}/workflows/{workflow_id}.json
//! {dir}/hosts.json            array of hosts
//! ```
//!
//! Writes go to a temp file and are renamed into place. A single async mutex
//! serializes writers within the process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::domain::{
    Host, HostFilter, Operation, OperationCache, OperationId, Task, TaskId, Workflow, WorkflowId,
};
use crate::ports::{Catalog, HostSelector, StoreError, TaskPredicate, TaskStore, TaskUpdate};

pub struct JsonDirStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["tasks", "operations", "workflows"] {
            tokio::fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_path(&self, id: TaskId) -> PathBuf {
        self.root.join("tasks").join(format!("{id}.json"))
    }

    fn operation_path(&self, id: OperationId) -> PathBuf {
        self.root.join("operations").join(format!("{id}.json"))
    }

    fn workflow_path(&self, id: WorkflowId) -> PathBuf {
        self.root.join("workflows").join(format!("{id}.json"))
    }

    fn hosts_path(&self) -> PathBuf {
        self.root.join("hosts.json")
    }

    pub async fn put_operation(&self, operation: &Operation) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.operation_path(operation.id), operation).await
    }

    pub async fn put_workflow(&self, id: WorkflowId, workflow: &Workflow) -> Result<(), StoreError> {
        let mut workflow = workflow.clone();
        workflow.id = Some(id);
        let _guard = self.write_lock.lock().await;
        write_json(&self.workflow_path(id), &workflow).await
    }

    pub async fn put_hosts(&self, hosts: &[Host]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.hosts_path(), &hosts).await
    }

    async fn all_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut entries = tokio::fs::read_dir(self.root.join("tasks")).await?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                tasks.push(read_json::<Task>(&path).await?);
            }
        }
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn matching(&self, predicate: &TaskPredicate) -> Result<Vec<Task>, StoreError> {
        if let TaskPredicate::Id(id) = predicate {
            return match read_json::<Task>(&self.task_path(*id)).await {
                Ok(task) => Ok(vec![task]),
                Err(StoreError::NotFound(_)) => Ok(Vec::new()),
                Err(err) => Err(err),
            };
        }
        Ok(self
            .all_tasks()
            .await?
            .into_iter()
            .filter(|t| predicate.matches(t))
            .collect())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(path.display().to_string()),
        _ => StoreError::from(e),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl TaskStore for JsonDirStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.task_path(task.id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(task.id.to_string()));
        }
        write_json(&path, task).await
    }

    async fn get(&self, predicate: &TaskPredicate) -> Result<Vec<Task>, StoreError> {
        self.matching(predicate).await
    }

    async fn update(
        &self,
        predicate: &TaskPredicate,
        update: &TaskUpdate,
    ) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let tasks = self.matching(predicate).await?;
        for mut task in tasks.iter().cloned() {
            update.apply(&mut task);
            write_json(&self.task_path(task.id), &task).await?;
        }
        Ok(tasks.len())
    }

    async fn delete(&self, predicate: &TaskPredicate) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let tasks = self.matching(predicate).await?;
        for task in &tasks {
            tokio::fs::remove_file(self.task_path(task.id)).await?;
        }
        Ok(tasks.len())
    }

    async fn count(&self, predicate: &TaskPredicate) -> Result<usize, StoreError> {
        Ok(self.matching(predicate).await?.len())
    }
}

#[async_trait]
impl Catalog for JsonDirStore {
    async fn operation(&self, id: OperationId) -> Result<Operation, StoreError> {
        read_json(&self.operation_path(id)).await
    }

    async fn workflow(&self, id: WorkflowId) -> Result<Workflow, StoreError> {
        read_json(&self.workflow_path(id)).await
    }

    async fn store_operation_cache(
        &self,
        id: OperationId,
        cache: OperationCache,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.operation_path(id);
        let mut operation: Operation = read_json(&path).await?;
        operation.cache = Some(cache);
        write_json(&path, &operation).await
    }
}

#[async_trait]
impl HostSelector for JsonDirStore {
    async fn select_hosts(&self, filter: &HostFilter) -> Result<Vec<Host>, StoreError> {
        let hosts: Vec<Host> = match read_json(&self.hosts_path()).await {
            Ok(hosts) => hosts,
            Err(StoreError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err),
        };
        Ok(hosts.into_iter().filter(|h| filter.matches(h)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Step, TaskPhase};
    use crate::testutil::{fixed_time, task_fixture};
    use serde_json::json;
    use ulid::Ulid;

    #[tokio::test]
    async fn tasks_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_fixture(&["10.0.0.1"]);
        {
            let store = JsonDirStore::open(dir.path()).await.unwrap();
            store.create(&task).await.unwrap();
            store
                .update(
                    &TaskPredicate::Id(task.id),
                    &TaskUpdate::phase(TaskPhase::Queue, fixed_time()),
                )
                .await
                .unwrap();
        }

        let store = JsonDirStore::open(dir.path()).await.unwrap();
        let back = store.get_by_id(task.id).await.unwrap();
        assert_eq!(back.status.phase, Some(TaskPhase::Queue));
        assert_eq!(back.hosts, task.hosts);
        assert_eq!(
            store.count(&TaskPredicate::Phase(TaskPhase::Queue)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn create_twice_conflicts_and_delete_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).await.unwrap();
        let task = task_fixture(&["h"]);

        store.create(&task).await.unwrap();
        assert!(matches!(store.create(&task).await, Err(StoreError::Conflict(_))));

        assert_eq!(store.delete(&TaskPredicate::All).await.unwrap(), 1);
        assert!(store.get(&TaskPredicate::Id(task.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn catalog_roundtrip_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).await.unwrap();

        let wf_id = WorkflowId::from_ulid(Ulid::new());
        let workflow = Workflow::remote(
            "deploy",
            vec![Step::new("run_command", json!({"command": "true"}))],
        );
        store.put_workflow(wf_id, &workflow).await.unwrap();

        let op = Operation {
            id: OperationId::from_ulid(Ulid::new()),
            name: "deploy all".into(),
            group_id: "g1".into(),
            workflow_id: wf_id,
            host_filter: HostFilter::default(),
            operator_id: None,
            cache: None,
        };
        store.put_operation(&op).await.unwrap();

        assert_eq!(store.workflow(wf_id).await.unwrap().id, Some(wf_id));
        store
            .store_operation_cache(
                op.id,
                OperationCache {
                    hosts: vec!["10.0.0.1".into()],
                    workflow,
                },
            )
            .await
            .unwrap();
        let cached = store.operation(op.id).await.unwrap().cache.unwrap();
        assert_eq!(cached.hosts, vec!["10.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn missing_inventory_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::open(dir.path()).await.unwrap();
        assert!(store.select_hosts(&HostFilter::default()).await.unwrap().is_empty());

        store
            .put_hosts(&[Host::new("10.0.0.1"), Host::new("10.0.0.2")])
            .await
            .unwrap();
        let hosts = store
            .select_hosts(&HostFilter::ips(vec!["10.0.0.2".into()]))
            .await
            .unwrap();
        assert_eq!(hosts, vec![Host::new("10.0.0.2")]);
    }
}

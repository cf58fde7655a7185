//! OperationService: turns an operation into a queued task.
//!
//! `run` validates everything before anything is written: the workflow must
//! compile for every selected host. Only then is the task stored (`wait`),
//! pushed through admission and marked `queue`. A rejected push deletes the
//! stored record again.

use std::sync::Arc;

use crate::compile::compile;
use crate::domain::{
    Host, HostFilter, OperationCache, OperationId, RunningKwargs, Task, TaskEnvelope, TaskPhase,
    TaskStatus, Workflow,
};
use crate::error::EngineError;
use crate::ports::{
    Catalog, Clock, HostSelector, IdGenerator, TaskPredicate, TaskQueue, TaskStore, TaskUpdate,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Use the operation's cached hosts and workflow when present.
    pub use_cache: bool,
}

pub struct OperationService {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn Catalog>,
    hosts: Arc<dyn HostSelector>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl OperationService {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn Catalog>,
        hosts: Arc<dyn HostSelector>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            store,
            catalog,
            hosts,
            ids,
            clock,
        }
    }

    pub async fn run(
        &self,
        operation_id: OperationId,
        runner: &str,
        running_kwargs: RunningKwargs,
        options: RunOptions,
    ) -> Result<Task, EngineError> {
        let operation = self.catalog.operation(operation_id).await?;

        let (workflow, targets) = match (&operation.cache, options.use_cache) {
            (Some(cache), true) => {
                let targets = self
                    .hosts
                    .select_hosts(&HostFilter::ips(cache.hosts.clone()))
                    .await?;
                (cache.workflow.clone(), targets)
            }
            _ => {
                if options.use_cache {
                    tracing::debug!(%operation_id, "no operation cache, resolving fresh");
                }
                let workflow = self.catalog.workflow(operation.workflow_id).await?;
                let targets = self.hosts.select_hosts(&operation.host_filter).await?;
                (workflow, targets)
            }
        };

        let running_kwargs = workflow.merge_args(&running_kwargs);
        check_compiles(&workflow, &targets, &running_kwargs)?;

        let now = self.clock.now();
        let task = Task {
            id: self.ids.generate_task_id(),
            operation_id,
            group_id: operation.group_id.clone(),
            hosts: targets.iter().map(|h| h.ip.clone()).collect(),
            workflow,
            operator_id: operation.operator_id.clone(),
            running_kwargs,
            runner: runner.to_string(),
            status: TaskStatus::waiting(),
            result: Default::default(),
            created_at: now,
            modified_at: now,
            finished_at: None,
        };
        tracing::info!(task_id = %task.id, %operation_id, hosts = task.hosts.len(), "running operation");
        enqueue(
            self.store.as_ref(),
            self.queue.as_ref(),
            self.clock.as_ref(),
            task,
            targets,
        )
        .await
    }

    /// Recompute and store the operation's host list and workflow snapshot.
    pub async fn refresh_cache(&self, operation_id: OperationId) -> Result<OperationCache, EngineError> {
        let operation = self.catalog.operation(operation_id).await?;
        let workflow = self.catalog.workflow(operation.workflow_id).await?;
        let hosts = self.hosts.select_hosts(&operation.host_filter).await?;

        let cache = OperationCache {
            hosts: hosts.into_iter().map(|h| h.ip).collect(),
            workflow,
        };
        self.catalog
            .store_operation_cache(operation_id, cache.clone())
            .await?;
        tracing::info!(%operation_id, hosts = cache.hosts.len(), "operation cache refreshed");
        Ok(cache)
    }
}

pub(crate) fn check_compiles(
    workflow: &Workflow,
    targets: &[Host],
    running_kwargs: &RunningKwargs,
) -> Result<(), EngineError> {
    for host in targets {
        compile(workflow, host, running_kwargs).map_err(|source| EngineError::Compile {
            host: host.ip.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Store `task` in phase `wait`, push it, then mark it `queue`.
pub(crate) async fn enqueue(
    store: &dyn TaskStore,
    queue: &dyn TaskQueue,
    clock: &dyn Clock,
    mut task: Task,
    targets: Vec<Host>,
) -> Result<Task, EngineError> {
    store.create(&task).await?;

    let envelope = TaskEnvelope::new(task.clone(), targets);
    if let Err(err) = queue.push(&envelope).await {
        tracing::warn!(task_id = %task.id, error = %err, "push rejected, dropping task record");
        if let Err(cleanup) = store.delete(&TaskPredicate::Id(task.id)).await {
            tracing::error!(task_id = %task.id, error = %cleanup, "failed to drop rejected task");
        }
        return Err(err.into());
    }

    let update = TaskUpdate::phase(TaskPhase::Queue, clock.now());
    store.update(&TaskPredicate::Id(task.id), &update).await?;
    update.apply(&mut task);
    Ok(task)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use ulid::Ulid;

    use super::*;
    use crate::compile::CompileError;
    use crate::domain::{Operation, Step, WorkflowId};
    use crate::impls::{InMemoryStore, InMemoryTaskQueue};
    use crate::ports::{AdmissionLimits, FixedClock, QueueError, UlidGenerator};
    use crate::testutil::{fixed_time, run};

    struct Rig {
        store: InMemoryStore,
        queue: InMemoryTaskQueue,
        service: OperationService,
        operation_id: OperationId,
    }

    async fn rig(steps: Vec<Step>, limits: AdmissionLimits) -> Rig {
        let store = InMemoryStore::new();
        let queue = InMemoryTaskQueue::with_limits(limits);
        for ip in ["10.0.0.1", "10.0.0.2"] {
            store.add_host(Host::new(ip)).await;
        }

        let workflow_id = WorkflowId::from_ulid(Ulid::new());
        let mut workflow = Workflow::remote("deploy", steps);
        workflow.args.insert("release".into(), json!("v1"));
        workflow.args.insert("dry_run".into(), json!(true));
        store.add_workflow(workflow_id, workflow).await;

        let operation_id = OperationId::from_ulid(Ulid::new());
        store
            .add_operation(Operation {
                id: operation_id,
                name: "deploy".into(),
                group_id: "ops".into(),
                workflow_id,
                host_filter: HostFilter::default(),
                operator_id: Some("local".into()),
                cache: None,
            })
            .await;

        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(fixed_time()));
        let service = OperationService::new(
            Arc::new(queue.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        );
        Rig {
            store,
            queue,
            service,
            operation_id,
        }
    }

    #[tokio::test]
    async fn run_stores_pushes_and_marks_queue() {
        let rig = rig(vec![run("deploy.sh")], AdmissionLimits::default()).await;
        let mut kwargs = RunningKwargs::new();
        kwargs.insert("release".into(), json!("v2"));

        let task = rig
            .service
            .run(rig.operation_id, "alice", kwargs, RunOptions::default())
            .await
            .unwrap();

        assert_eq!(task.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(task.phase(), Some(TaskPhase::Queue));
        assert_eq!(task.group_id, "ops");
        assert_eq!(task.operator_id.as_deref(), Some("local"));
        assert_eq!(task.running_kwargs["release"], json!("v2"));
        assert_eq!(task.running_kwargs["dry_run"], json!(true));

        let stored = rig.store.get_by_id(task.id).await.unwrap();
        assert_eq!(stored.phase(), Some(TaskPhase::Queue));
        assert_eq!(rig.queue.get_status(task.id).await.unwrap(), TaskStatus::queued(2));
        assert_eq!(rig.queue.stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn compile_errors_surface_before_anything_is_stored() {
        let rig = rig(
            vec![Step::new("reboot", json!({}))],
            AdmissionLimits::default(),
        )
        .await;

        let err = rig
            .service
            .run(rig.operation_id, "alice", RunningKwargs::new(), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Compile { source: CompileError::StepTypeNotFound(ref kind), .. } if kind == "reboot"
        ));
        assert_eq!(rig.store.count(&TaskPredicate::All).await.unwrap(), 0);
        assert_eq!(rig.queue.stats().await.unwrap().queued, 0);
    }

    #[tokio::test]
    async fn rejected_push_deletes_the_record() {
        let limits = AdmissionLimits {
            max_queued: 1,
            max_running: 1,
        };
        let rig = rig(vec![run("true")], limits).await;
        let op = rig.operation_id;

        rig.service
            .run(op, "alice", RunningKwargs::new(), RunOptions::default())
            .await
            .unwrap();
        let err = rig
            .service
            .run(op, "alice", RunningKwargs::new(), RunOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Queue(QueueError::QueueFull { queued: 1, max_queued: 1 })
        ));
        assert_eq!(rig.store.count(&TaskPredicate::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cache_pins_hosts_and_workflow_until_refreshed() {
        let rig = rig(vec![run("true")], AdmissionLimits::default()).await;
        let op = rig.operation_id;

        let cache = rig.service.refresh_cache(op).await.unwrap();
        assert_eq!(cache.hosts, vec!["10.0.0.1", "10.0.0.2"]);

        rig.store.add_host(Host::new("10.0.0.3")).await;
        let cached = rig
            .service
            .run(op, "bob", RunningKwargs::new(), RunOptions { use_cache: true })
            .await
            .unwrap();
        assert_eq!(cached.hosts.len(), 2);

        let fresh = rig
            .service
            .run(op, "bob", RunningKwargs::new(), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(fresh.hosts.len(), 3);

        rig.service.refresh_cache(op).await.unwrap();
        let recached = rig
            .service
            .run(op, "bob", RunningKwargs::new(), RunOptions { use_cache: true })
            .await
            .unwrap();
        assert_eq!(recached.hosts.len(), 3);
    }
}

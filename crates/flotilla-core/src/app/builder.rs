//! EngineBuilder: wires adapters from configuration.
//!
//! # Defaults
//! - queue: `RedisTaskQueue` when `queue.redis_url` is set, otherwise
//!   `InMemoryTaskQueue`
//! - store: `JsonDirStore` when `store.dir` is set, otherwise `InMemoryStore`
//! - shell: `OpenSshShell` from `[ssh]`
//! - clock: `SystemClock`
//!
//! Any of them can be replaced before `build`.
//!
//! # Fail-fast
//! `build` validates the configuration and rejects operator kinds missing from
//! the registry, so a typo fails at startup rather than on the first task.

use std::sync::Arc;
use std::time::Duration;

use crate::app::operation::OperationService;
use crate::app::operator_manager::{OperatorKind, OperatorManager};
use crate::app::remote_worker::RemoteWorker;
use crate::app::tasks::TaskService;
use crate::app::worker_group::WorkerGroup;
use crate::app::worker_master::WorkerMaster;
use crate::config::FlotillaConfig;
use crate::error::EngineError;
use crate::impls::{InMemoryStore, InMemoryTaskQueue, JsonDirStore, OpenSshShell, RedisBroker, RedisTaskQueue};
use crate::ports::{
    Catalog, Clock, DispatchSource, HostSelector, IdGenerator, OperatorError, RemoteShell,
    SystemClock, TaskQueue, TaskStore, UlidGenerator,
};

struct StoreParts {
    tasks: Arc<dyn TaskStore>,
    catalog: Arc<dyn Catalog>,
    hosts: Arc<dyn HostSelector>,
}

impl StoreParts {
    fn from<S>(store: Arc<S>) -> Self
    where
        S: TaskStore + Catalog + HostSelector + 'static,
    {
        Self {
            tasks: store.clone(),
            catalog: store.clone(),
            hosts: store,
        }
    }
}

pub struct EngineBuilder {
    config: FlotillaConfig,
    queue: Option<Arc<dyn TaskQueue>>,
    store: Option<StoreParts>,
    shell: Option<Arc<dyn RemoteShell>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn new(config: FlotillaConfig) -> Self {
        Self {
            config,
            queue: None,
            store: None,
            shell: None,
            clock: None,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_store<S>(mut self, store: Arc<S>) -> Self
    where
        S: TaskStore + Catalog + HostSelector + 'static,
    {
        self.store = Some(StoreParts::from(store));
        self
    }

    pub fn with_shell(mut self, shell: Arc<dyn RemoteShell>) -> Self {
        self.shell = Some(shell);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> Result<Engine, EngineError> {
        self.config.validate()?;
        for op in &self.config.operators {
            if OperatorKind::lookup(&op.kind).is_none() {
                return Err(OperatorError::UnknownOperatorKind(op.kind.clone()).into());
            }
        }

        let queue: Arc<dyn TaskQueue> = match (self.queue, &self.config.queue.redis_url) {
            (Some(queue), _) => queue,
            (None, Some(url)) => {
                tracing::info!(namespace = %self.config.queue.namespace, "using redis queue");
                let queue = RedisTaskQueue::connect(
                    url,
                    &self.config.queue.namespace,
                    self.config.queue.limits(),
                )
                .await?;
                Arc::new(queue)
            }
            (None, None) => {
                tracing::info!("using in-memory queue");
                Arc::new(InMemoryTaskQueue::with_limits(self.config.queue.limits()))
            }
        };

        let store = match (self.store, &self.config.store.dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => {
                tracing::info!(dir = %dir.display(), "using json store");
                StoreParts::from(Arc::new(JsonDirStore::open(dir.clone()).await?))
            }
            (None, None) => {
                tracing::info!("using in-memory store");
                StoreParts::from(Arc::new(InMemoryStore::new()))
            }
        };

        let shell: Arc<dyn RemoteShell> = match self.shell {
            Some(shell) => shell,
            None => Arc::new(OpenSshShell::new(self.config.ssh.clone())),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));

        Ok(Engine {
            config: Arc::new(self.config),
            queue,
            store: store.tasks,
            catalog: store.catalog,
            hosts: store.hosts,
            shell,
            clock,
            ids,
        })
    }
}

/// Wired adapters plus constructors for the services that use them.
pub struct Engine {
    pub config: Arc<FlotillaConfig>,
    pub queue: Arc<dyn TaskQueue>,
    pub store: Arc<dyn TaskStore>,
    pub catalog: Arc<dyn Catalog>,
    pub hosts: Arc<dyn HostSelector>,
    pub shell: Arc<dyn RemoteShell>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
}

impl Engine {
    pub fn remote_worker(&self, worker_id: impl Into<String>) -> Arc<RemoteWorker> {
        Arc::new(RemoteWorker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.shell),
            Arc::clone(&self.clock),
            worker_id,
        ))
    }

    pub fn operator_manager(&self) -> Arc<OperatorManager> {
        let worker = self.remote_worker(format!("master-{}", std::process::id()));
        Arc::new(OperatorManager::new(
            Arc::clone(&self.config),
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
            worker,
        ))
    }

    pub fn worker_master(&self) -> Arc<WorkerMaster> {
        Arc::new(WorkerMaster::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            self.operator_manager(),
            Arc::clone(&self.clock),
            self.config.master.clone(),
        ))
    }

    pub fn operations(&self) -> OperationService {
        OperationService::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            Arc::clone(&self.hosts),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
        )
    }

    pub fn tasks(&self) -> TaskService {
        TaskService::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.store),
            Arc::clone(&self.hosts),
            Arc::clone(&self.ids),
            Arc::clone(&self.clock),
        )
    }

    /// The pull side of a `redis-broker` operator (`worker.operator`, else
    /// `default_operator`).
    pub fn broker_source(&self, operator_id: Option<&str>) -> Result<Arc<dyn DispatchSource>, EngineError> {
        let id = operator_id
            .or(self.config.worker.operator.as_deref())
            .unwrap_or(&self.config.default_operator);
        let op = self
            .config
            .operator(id)
            .ok_or_else(|| OperatorError::UnknownOperator(id.to_string()))?;
        if OperatorKind::lookup(&op.kind) != Some(OperatorKind::RedisBroker) {
            return Err(OperatorError::Config {
                id: id.to_string(),
                reason: format!("kind {:?} has no broker to consume", op.kind),
            }
            .into());
        }
        let url = op
            .redis_url
            .clone()
            .or_else(|| self.config.queue.redis_url.clone())
            .ok_or_else(|| OperatorError::Config {
                id: id.to_string(),
                reason: "redis-broker needs redis_url or queue.redis_url".to_string(),
            })?;
        Ok(Arc::new(RedisBroker::new(url, self.config.broker_list(op))))
    }

    /// Spawn `worker.concurrency` consumers on `source`.
    pub fn worker_group(&self, source: Arc<dyn DispatchSource>) -> WorkerGroup {
        let worker = self.remote_worker(format!("broker-{}", std::process::id()));
        WorkerGroup::spawn(
            self.config.worker.concurrency,
            source,
            worker,
            Duration::from_secs(self.config.worker.block_timeout_secs),
        )
    }
}

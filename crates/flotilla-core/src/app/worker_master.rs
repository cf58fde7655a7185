//! WorkerMaster: pumps the queue and archives finished tasks.
//!
//! # Loop
//! - `pop_or_none` until it returns `None`, then sleep `poll_interval`
//! - every popped task gets its fan-out and a completion watcher, both
//!   tracked in one `JoinSet`
//!
//! # Completion
//! The watcher polls `get_status` every `hold_interval` until `total` and
//! `finish` agree. It then sets phase `finish`, calls `close_task`, archives
//! status and results into the store (transient store errors are retried up
//! to `archive_attempts`) and calls `remove` only once the archive landed.
//!
//! # Shutdown
//! [`MasterHandle::shutdown_and_join`] stops popping and waits for every
//! in-flight fan-out and watcher.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::app::operator_manager::OperatorManager;
use crate::config::MasterConfig;
use crate::domain::{StatusChange, TaskEnvelope, TaskId, TaskPhase, TaskStatus};
use crate::ports::{Clock, StoreError, TaskPredicate, TaskQueue, TaskStore, TaskUpdate};

pub struct WorkerMaster {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn TaskStore>,
    manager: Arc<OperatorManager>,
    clock: Arc<dyn Clock>,
    settings: MasterConfig,
}

pub struct MasterHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MasterHandle {
    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "worker master task failed");
        }
    }
}

impl WorkerMaster {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn TaskStore>,
        manager: Arc<OperatorManager>,
        clock: Arc<dyn Clock>,
        settings: MasterConfig,
    ) -> Self {
        Self {
            queue,
            store,
            manager,
            clock,
            settings,
        }
    }

    pub fn spawn(self: Arc<Self>) -> MasterHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        MasterHandle { shutdown_tx, join }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            poll_ms = self.settings.poll_interval_ms,
            hold_ms = self.settings.hold_interval_ms,
            "worker master started"
        );
        let mut inflight = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.queue.pop_or_none().await {
                Ok(Some(envelope)) => {
                    inflight.spawn(Arc::clone(&self).handle(envelope));
                    continue;
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "pop failed"),
            }

            while let Some(joined) = inflight.try_join_next() {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "task handler failed");
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }

        tracing::info!(inflight = inflight.len(), "worker master draining");
        while let Some(joined) = inflight.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "task handler failed");
            }
        }
        tracing::info!("worker master stopped");
    }

    async fn handle(self: Arc<Self>, envelope: TaskEnvelope) {
        let task_id = envelope.task_id();
        tracing::info!(%task_id, hosts = envelope.targets.len(), "task popped");

        let fan_out = async {
            if let Err(err) = self.manager.run_task(envelope).await {
                tracing::error!(%task_id, error = %err, "fan-out failed");
            }
        };
        let ((), status) = tokio::join!(fan_out, self.wait_complete(task_id));
        self.complete(task_id, status).await;
    }

    async fn wait_complete(&self, task_id: TaskId) -> TaskStatus {
        loop {
            match self.queue.get_status(task_id).await {
                Ok(status) if status.is_complete() => return status,
                Ok(_) => {}
                Err(err) => tracing::warn!(%task_id, error = %err, "status poll failed"),
            }
            tokio::time::sleep(self.settings.hold_interval()).await;
        }
    }

    async fn complete(&self, task_id: TaskId, mut status: TaskStatus) {
        if let Err(err) = self
            .queue
            .change_status(task_id, &[StatusChange::Phase(TaskPhase::Finish)])
            .await
        {
            tracing::warn!(%task_id, error = %err, "failed to mark finish in queue");
        }
        status.phase = Some(TaskPhase::Finish);

        if let Err(err) = self.queue.close_task(task_id).await {
            tracing::warn!(%task_id, error = %err, "close_task failed");
        }

        let result = match self.queue.get_result(task_id).await {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(%task_id, error = %err, "cannot read results, leaving task in queue");
                return;
            }
        };

        let now = self.clock.now();
        let update = TaskUpdate {
            status: Some(status),
            phase: Some(TaskPhase::Finish),
            result: Some(result),
            finished_at: Some(now),
            modified_at: Some(now),
        };
        if self.archive(task_id, &update).await {
            if let Err(err) = self.queue.remove(task_id).await {
                tracing::warn!(%task_id, error = %err, "remove failed after archive");
            }
            tracing::info!(%task_id, "task archived");
        }
    }

    async fn archive(&self, task_id: TaskId, update: &TaskUpdate) -> bool {
        let attempts = self.settings.archive_attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.update(&TaskPredicate::Id(task_id), update).await {
                Ok(0) => {
                    let err = StoreError::NotFound(task_id.to_string());
                    tracing::error!(%task_id, error = %err, "no durable record to archive into");
                    return false;
                }
                Ok(_) => return true,
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::warn!(%task_id, attempt, error = %err, "archive failed, retrying");
                    tokio::time::sleep(self.settings.archive_backoff()).await;
                }
                Err(err) => {
                    tracing::error!(%task_id, attempt, error = %err, "archive abandoned");
                    return false;
                }
            }
        }
        false
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::app::remote_worker::RemoteWorker;
use crate::ports::DispatchSource;

/// Pause after a broker error before asking again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Broker consumer group handle.
/// - `request_shutdown` stops every consumer from taking new dispatches
/// - `shutdown_and_join` also waits for in-flight host runs
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` consumers pulling from `source`.
    pub fn spawn(
        n: usize,
        source: Arc<dyn DispatchSource>,
        worker: Arc<RemoteWorker>,
        block_timeout: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for consumer in 0..n {
            let source = Arc::clone(&source);
            let worker = Arc::clone(&worker);
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                consume(consumer, source, worker, block_timeout, &mut rx).await;
            });
            joins.push(join);
        }
        tracing::info!(consumers = n, "broker worker group started");

        Self { shutdown_tx, joins }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(err) = join.await {
                tracing::error!(error = %err, "broker consumer failed");
            }
        }
        tracing::info!("broker worker group stopped");
    }
}

async fn consume(
    consumer: usize,
    source: Arc<dyn DispatchSource>,
    worker: Arc<RemoteWorker>,
    block_timeout: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                // a dropped group counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = source.next(block_timeout) => next,
        };

        match next {
            Ok(Some(dispatch)) => {
                tracing::debug!(consumer, task_id = %dispatch.task_id, host = %dispatch.host.ip, "dispatch received");
                worker.run(dispatch).await;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(consumer, error = %err, "broker pull failed");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Counter, StatusChange};
    use crate::impls::{InMemoryBroker, InMemoryTaskQueue};
    use crate::ports::{Operator, SystemClock, TaskQueue};
    use crate::testutil::{FakeShell, envelope_fixture, eventually};

    fn worker(queue: &InMemoryTaskQueue, shell: FakeShell) -> Arc<RemoteWorker> {
        Arc::new(RemoteWorker::new(
            Arc::new(queue.clone()),
            Arc::new(shell),
            Arc::new(SystemClock),
            "broker-1",
        ))
    }

    #[tokio::test]
    async fn consumers_drain_the_broker() {
        let queue = InMemoryTaskQueue::new();
        let broker = Arc::new(InMemoryBroker::new());
        let env = envelope_fixture(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let id = env.task_id();
        queue.push(&env).await.unwrap();
        queue
            .change_status(id, &[StatusChange::Set(Counter::Router, 3)])
            .await
            .unwrap();

        let group = WorkerGroup::spawn(
            2,
            broker.clone(),
            worker(&queue, FakeShell::new()),
            Duration::from_millis(20),
        );
        for dispatch in env.dispatches() {
            broker.open_task_for_one_host(dispatch).await.unwrap();
        }

        let q = &queue;
        assert!(eventually(|| async move { q.get_status(id).await.unwrap().is_complete() }).await);
        group.shutdown_and_join().await;

        let status = queue.get_status(id).await.unwrap();
        assert_eq!((status.success, status.router, status.running), (3, 0, 0));
        let results = queue.get_result(id).await.unwrap();
        assert!(results.values().all(|r| r.worker_id.as_deref() == Some("broker-1")));
    }

    #[tokio::test]
    async fn shutdown_stops_taking_dispatches() {
        let queue = InMemoryTaskQueue::new();
        let broker = Arc::new(InMemoryBroker::new());
        let group = WorkerGroup::spawn(
            1,
            broker.clone(),
            worker(&queue, FakeShell::new()),
            Duration::from_millis(20),
        );
        group.shutdown_and_join().await;

        let env = envelope_fixture(&["10.0.0.1"]);
        for dispatch in env.dispatches() {
            broker.open_task_for_one_host(dispatch).await.unwrap();
        }
        assert_eq!(broker.len().await, 1);
    }
}

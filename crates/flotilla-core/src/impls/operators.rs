//! Dispatch backends.
//!
//! - [`InProcessOperator`]: runs the remote worker on a tokio task of the
//!   calling process.
//! - [`RedisBroker`]: pushes JSON dispatches onto a Redis list; broker workers
//!   pull them back off through [`DispatchSource`].
//! - [`InMemoryBroker`]: the same broker contract inside one process.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, Notify, OnceCell};

use crate::app::remote_worker::RemoteWorker;
use crate::domain::HostDispatch;
use crate::ports::{DispatchSource, Operator, OperatorError};

/// Poll step while a Redis list is empty.
const BROKER_POLL_STEP: Duration = Duration::from_millis(100);

pub struct InProcessOperator {
    worker: Arc<RemoteWorker>,
}

impl InProcessOperator {
    pub fn new(worker: Arc<RemoteWorker>) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Operator for InProcessOperator {
    async fn initialize(&self) -> Result<(), OperatorError> {
        Ok(())
    }

    async fn open_task_for_one_host(&self, dispatch: HostDispatch) -> Result<(), OperatorError> {
        let worker = Arc::clone(&self.worker);
        tokio::spawn(async move {
            worker.run(dispatch).await;
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryBroker {
    items: Mutex<VecDeque<HostDispatch>>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[async_trait]
impl Operator for InMemoryBroker {
    async fn initialize(&self) -> Result<(), OperatorError> {
        Ok(())
    }

    async fn open_task_for_one_host(&self, dispatch: HostDispatch) -> Result<(), OperatorError> {
        self.items.lock().await.push_back(dispatch);
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl DispatchSource for InMemoryBroker {
    async fn next(&self, timeout: Duration) -> Result<Option<HostDispatch>, OperatorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(dispatch) = self.items.lock().await.pop_front() {
                return Ok(Some(dispatch));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

/// A Redis list carrying [`HostDispatch`] JSON.
///
/// The connection is opened by `initialize` and shared afterwards. Pulling
/// uses `LPOP` with a short sleep so a shared multiplexed connection is never
/// held by a blocking command.
pub struct RedisBroker {
    url: String,
    list: String,
    conn: OnceCell<ConnectionManager>,
}

impl RedisBroker {
    pub fn new(url: impl Into<String>, list: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            list: list.into(),
            conn: OnceCell::new(),
        }
    }

    pub fn list(&self) -> &str {
        &self.list
    }

    async fn connection(&self) -> Result<ConnectionManager, OperatorError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.url.as_str())
                    .map_err(|e| OperatorError::Broker(e.to_string()))?;
                ConnectionManager::new(client)
                    .await
                    .map_err(|e| OperatorError::Broker(e.to_string()))
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl Operator for RedisBroker {
    async fn initialize(&self) -> Result<(), OperatorError> {
        self.connection().await.map(|_| ())
    }

    async fn open_task_for_one_host(&self, dispatch: HostDispatch) -> Result<(), OperatorError> {
        let body = serde_json::to_string(&dispatch)?;
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("RPUSH")
            .arg(&self.list)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| OperatorError::Dispatch(e.to_string()))?;
        tracing::debug!(task_id = %dispatch.task_id, host = %dispatch.host.ip, list = %self.list, "dispatch queued on broker");
        Ok(())
    }
}

#[async_trait]
impl DispatchSource for RedisBroker {
    async fn next(&self, timeout: Duration) -> Result<Option<HostDispatch>, OperatorError> {
        let mut conn = self.connection().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let body: Option<String> = redis::cmd("LPOP")
                .arg(&self.list)
                .query_async(&mut conn)
                .await
                .map_err(|e| OperatorError::Broker(e.to_string()))?;
            if let Some(body) = body {
                return Ok(Some(serde_json::from_str(&body)?));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(BROKER_POLL_STEP.min(deadline - now)).await;
        }
    }
}

//! Operator port: a per-host dispatch backend.
//!
//! Broker-style backends also implement [`DispatchSource`], the side a broker
//! worker pulls from.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::HostDispatch;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("unknown operator kind: {0}")]
    UnknownOperatorKind(String),

    #[error("unknown operator id: {0}")]
    UnknownOperator(String),

    #[error("operator {id} is misconfigured: {reason}")]
    Config { id: String, reason: String },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("broker codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait Operator: Send + Sync {
    /// Called once before the first dispatch.
    async fn initialize(&self) -> Result<(), OperatorError>;

    /// Hand one host of one task to the backend.
    ///
    /// Returning `Ok` means the backend took ownership; it must finalize the
    /// host's result and counters itself.
    async fn open_task_for_one_host(&self, dispatch: HostDispatch) -> Result<(), OperatorError>;
}

#[async_trait]
pub trait DispatchSource: Send + Sync {
    /// Next dispatch, or `None` if nothing arrived within `timeout`.
    async fn next(&self, timeout: Duration) -> Result<Option<HostDispatch>, OperatorError>;
}

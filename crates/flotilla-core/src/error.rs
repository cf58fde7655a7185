use thiserror::Error;

use crate::compile::CompileError;
use crate::config::ConfigError;
use crate::ports::{OperatorError, QueueError, StoreError};

/// Errors surfaced by the services in [`crate::app`].
///
/// Per-host execution failures never show up here; they are recorded in the
/// host's result instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow does not compile for host {host}: {source}")]
    Compile {
        host: String,
        #[source]
        source: CompileError,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Operator(#[from] OperatorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid result filter: {0}")]
    InvalidFilter(String),
}

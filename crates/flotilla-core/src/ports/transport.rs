//! RemoteShell port: a connected command/file channel to one host.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Host, code};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("ssh did not answer within {0:?}")]
    SshTimeout(Duration),

    /// Output captured up to the moment the command was killed.
    #[error("command timed out after {timeout:?}")]
    CommandTimeout {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("transfer timed out after {timeout:?} ({sent} bytes sent)")]
    TransferTimeout { timeout: Duration, sent: u64 },

    #[error("transfer failed: {0}")]
    TransferIo(String),

    #[error("transport fault: {0}")]
    Fault(String),
}

impl TransportError {
    /// Return code stored in the host result.
    pub fn code(&self) -> i64 {
        match self {
            TransportError::Connect { .. } => code::CONNECTION_ERROR,
            TransportError::SshTimeout(_) => code::SSH_TIMEOUT,
            TransportError::CommandTimeout { .. } => code::COMMAND_TIMEOUT,
            TransportError::TransferTimeout { .. } => code::TRANSFER_TIMEOUT,
            TransportError::TransferIo(_) => code::TRANSFER_IO_ERROR,
            TransportError::Fault(_) => code::SYSTEM_ERROR,
        }
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Box<dyn RemoteSession>, TransportError>;
}

#[async_trait]
pub trait RemoteSession: Send {
    /// Run `command` with `envs` exported in front of it.
    ///
    /// A non-zero exit is not an error; it comes back in `exit_code`.
    async fn exec(
        &mut self,
        command: &str,
        envs: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<ExecOutput, TransportError>;

    /// Hex SHA-256 of a remote file, `None` when it does not exist.
    async fn remote_checksum(
        &mut self,
        path: &str,
        timeout: Duration,
    ) -> Result<Option<String>, TransportError>;

    /// Stream `local` to `remote`; returns the bytes sent.
    async fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> Result<u64, TransportError>;

    async fn close(&mut self);
}

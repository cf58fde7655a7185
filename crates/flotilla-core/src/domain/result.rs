//! Per-host results and the numeric return-code taxonomy.
//!
//! Codes are stable so downstream result parsing can filter on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod code {
    pub const OK: i64 = 0;
    pub const CONNECTION_ERROR: i64 = -1000;
    pub const SSH_TIMEOUT: i64 = -2000;
    pub const COMMAND_TIMEOUT: i64 = -2101;
    pub const TRANSFER_TIMEOUT: i64 = -2201;
    pub const TRANSFER_IO_ERROR: i64 = -2202;
    pub const UNKNOWN_ERROR: i64 = -3000;
    pub const SYSTEM_ERROR: i64 = -5000;
    /// Used by the code map for hosts without any result.
    pub const UNKNOWN: i64 = -9999;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Running,
    Success,
    Failure,
}

/// Outcome of one attempt of one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub code: i64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,
    /// Retry index; absent on the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
}

impl StepRecord {
    pub fn new(code: i64, description: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: String::new(),
            description: description.into(),
            timestamp,
            retry: None,
        }
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = (retry > 0).then_some(retry);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }
}

/// Result record for one host of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResult {
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HostStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl HostResult {
    /// A record with nothing known yet.
    pub fn empty(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            status: None,
            created_at: None,
            finished_at: None,
            worker_id: None,
            history: Vec::new(),
            code: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Seconds between start and finish, when both are known.
    pub fn cost_secs(&self) -> Option<f64> {
        match (self.created_at, self.finished_at) {
            (Some(c), Some(f)) => Some((f - c).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    /// Close the record: top-level code mirrors the last history entry.
    ///
    /// Execution stops at the first unit whose final attempt fails, so the
    /// host succeeded exactly when the last entry succeeded. On success the
    /// outputs are the concatenation over the history; on failure they mirror
    /// the last entry. A record with no history gets a single `no steps`
    /// entry, so history is never empty once finished.
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        if self.history.is_empty() {
            self.history.push(StepRecord::new(code::OK, "no steps", finished_at));
        }
        let last_code = self.history.last().map(|h| h.code).unwrap_or(code::OK);
        let success = last_code == code::OK;
        if success {
            self.stdout = Some(self.history.iter().map(|h| h.stdout.as_str()).collect());
            self.stderr = Some(self.history.iter().map(|h| h.stderr.as_str()).collect());
            self.status = Some(HostStatus::Success);
        } else {
            if let Some(last) = self.history.last() {
                self.stdout = Some(last.stdout.clone());
                self.stderr = Some(last.stderr.clone());
            }
            self.status = Some(HostStatus::Failure);
        }
        self.code = Some(last_code);
        self.finished_at = Some(finished_at);
    }
}

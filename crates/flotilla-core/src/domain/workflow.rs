//! Workflow definitions: ordered, named steps plus env and argument defaults.
//!
//! A workflow is snapshotted into every task, so a task stays reproducible even
//! if the stored definition is edited afterwards.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::WorkflowId;

/// Where a workflow's steps are meant to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    /// Executed on each target host over the remote shell.
    Remote,
    /// Executed on the controlling server.
    Server,
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowType::Remote => f.write_str("remote"),
            WorkflowType::Server => f.write_str("server"),
        }
    }
}

/// One declarative step: a single-key map `{step_type: step_args}`.
///
/// Kept as the raw map so that shape errors surface at compile time with a
/// typed error instead of at deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(pub BTreeMap<String, serde_json::Value>);

impl Step {
    pub fn new(kind: impl Into<String>, args: serde_json::Value) -> Self {
        let mut map = BTreeMap::new();
        map.insert(kind.into(), args);
        Self(map)
    }

    /// The `(step_type, step_args)` pair, if the map has exactly one key.
    pub fn single(&self) -> Option<(&str, &serde_json::Value)> {
        let mut entries = self.0.iter();
        match (entries.next(), entries.next()) {
            (Some((kind, args)), None) => Some((kind.as_str(), args)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowBasic {
    /// Overall timeout hint in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub creator: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<WorkflowId>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: WorkflowType,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub basic: WorkflowBasic,
    /// Default run-time arguments; caller kwargs are merged over these.
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Workflow {
    pub fn remote(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: WorkflowType::Remote,
            steps,
            envs: BTreeMap::new(),
            basic: WorkflowBasic::default(),
            args: BTreeMap::new(),
            description: None,
        }
    }

    /// `self.args` overridden by `overrides`.
    pub fn merge_args(
        &self,
        overrides: &BTreeMap<String, serde_json::Value>,
    ) -> BTreeMap<String, serde_json::Value> {
        let mut merged = self.args.clone();
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

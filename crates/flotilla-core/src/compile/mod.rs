//! Step compiler: workflow + host + run-time kwargs into concrete work units.
//!
//! # Step registry
//! Step types are a fixed string-keyed table ([`StepKind::lookup`]). Each kind
//! parses its own argument map into a [`WorkUnit`].
//!
//! # Envs
//! `workflow.envs`, then `host.envs`, then the uppercased kwargs; later wins.
//!
//! Compilation is pure: the same input always yields the same output.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::domain::{Host, RunningKwargs, Step, Workflow, WorkflowType};

pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("step type not found: {0}")]
    StepTypeNotFound(String),

    #[error("invalid arguments for step #{index} ({kind}): {reason}")]
    StepArgument {
        index: usize,
        kind: String,
        reason: String,
    },

    #[error("step {kind} cannot run in a {workflow_type} workflow")]
    UnsupportedWorkflowType {
        kind: String,
        workflow_type: WorkflowType,
    },
}

/// One executable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkUnit {
    RunCommand {
        command: String,
        timeout: Duration,
        retry: u32,
    },
    CopyFile {
        source: String,
        destination: String,
        timeout: Duration,
        retry: u32,
        /// Lowercase hex SHA-256 of `source`, when supplied by the workflow.
        checksum: Option<String>,
    },
}

impl WorkUnit {
    pub fn timeout(&self) -> Duration {
        match self {
            WorkUnit::RunCommand { timeout, .. } | WorkUnit::CopyFile { timeout, .. } => *timeout,
        }
    }

    pub fn retry(&self) -> u32 {
        match self {
            WorkUnit::RunCommand { retry, .. } | WorkUnit::CopyFile { retry, .. } => *retry,
        }
    }

    /// Human-readable label stored in each history entry.
    pub fn describe(&self) -> String {
        match self {
            WorkUnit::RunCommand { command, .. } => format!("run_command: {command}"),
            WorkUnit::CopyFile {
                source,
                destination,
                ..
            } => format!("copy_file: {source} -> {destination}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledWork {
    pub units: Vec<WorkUnit>,
    pub envs: BTreeMap<String, String>,
}

/// Registered step types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    RunCommand,
    CopyFile,
}

impl StepKind {
    const REGISTRY: [(&'static str, StepKind); 4] = [
        ("run_command", StepKind::RunCommand),
        ("run_shell", StepKind::RunCommand),
        ("copy_file", StepKind::CopyFile),
        ("scp", StepKind::CopyFile),
    ];

    pub fn lookup(name: &str) -> Option<StepKind> {
        Self::REGISTRY
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, kind)| *kind)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::RunCommand => "run_command",
            StepKind::CopyFile => "copy_file",
        }
    }

    /// Workflow types this step can run in.
    fn supports(&self, workflow_type: WorkflowType) -> bool {
        match self {
            StepKind::RunCommand | StepKind::CopyFile => workflow_type == WorkflowType::Remote,
        }
    }

    fn build(&self, args: &StepArgs<'_>) -> Result<WorkUnit, CompileError> {
        let timeout = args.duration("timeout")?.unwrap_or(DEFAULT_UNIT_TIMEOUT);
        let retry = args.retry()?;
        match self {
            StepKind::RunCommand => Ok(WorkUnit::RunCommand {
                command: args.required_str(&["command", "cmd"])?,
                timeout,
                retry,
            }),
            StepKind::CopyFile => Ok(WorkUnit::CopyFile {
                source: args.required_str(&["source"])?,
                destination: args.required_str(&["destination", "dist"])?,
                timeout,
                retry,
                checksum: args.checksum()?,
            }),
        }
    }
}

/// Argument accessor that tags every error with the step position.
struct StepArgs<'a> {
    index: usize,
    kind: StepKind,
    map: &'a Map<String, Value>,
}

impl StepArgs<'_> {
    fn error(&self, reason: impl Into<String>) -> CompileError {
        CompileError::StepArgument {
            index: self.index,
            kind: self.kind.name().to_string(),
            reason: reason.into(),
        }
    }

    /// First present key among `names` (aliases), as a non-empty string.
    fn required_str(&self, names: &[&str]) -> Result<String, CompileError> {
        let found = names.iter().find_map(|n| self.map.get(*n));
        match found {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(_) => Err(self.error(format!("`{}` must be a non-empty string", names[0]))),
            None => Err(self.error(format!("missing `{}`", names[0]))),
        }
    }

    fn duration(&self, name: &str) -> Result<Option<Duration>, CompileError> {
        match self.map.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => match n.as_f64() {
                Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs)
                    .map(Some)
                    .map_err(|_| self.error(format!("`{name}` is out of range"))),
                _ => Err(self.error(format!("`{name}` must be a positive number of seconds"))),
            },
            Some(_) => Err(self.error(format!("`{name}` must be a number"))),
        }
    }

    fn retry(&self) -> Result<u32, CompileError> {
        match self.map.get("retry") {
            None | Some(Value::Null) => Ok(0),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| self.error("`retry` must be a non-negative integer")),
        }
    }

    /// Only SHA-256 digests are verified; an `md5` argument is refused rather
    /// than ignored.
    fn checksum(&self) -> Result<Option<String>, CompileError> {
        if self.map.contains_key("md5") {
            return Err(self.error("`md5` is not supported, pass a SHA-256 `checksum`"));
        }
        match self.map.get("checksum") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s))
                if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Some(s.to_ascii_lowercase()))
            }
            Some(_) => Err(self.error("`checksum` must be a hex SHA-256 digest")),
        }
    }
}

/// Compile one workflow for one host.
pub fn compile(
    workflow: &Workflow,
    host: &Host,
    running_kwargs: &RunningKwargs,
) -> Result<CompiledWork, CompileError> {
    let mut units = Vec::with_capacity(workflow.steps.len());
    for (index, step) in workflow.steps.iter().enumerate() {
        units.push(compile_step(index, step, workflow.kind)?);
    }

    Ok(CompiledWork {
        units,
        envs: merge_envs(workflow, host, running_kwargs),
    })
}

fn compile_step(
    index: usize,
    step: &Step,
    workflow_type: WorkflowType,
) -> Result<WorkUnit, CompileError> {
    let Some((name, raw_args)) = step.single() else {
        return Err(CompileError::StepArgument {
            index,
            kind: String::new(),
            reason: format!("a step must be a single-key map, got {} keys", step.0.len()),
        });
    };

    let kind =
        StepKind::lookup(name).ok_or_else(|| CompileError::StepTypeNotFound(name.to_string()))?;

    if !kind.supports(workflow_type) {
        return Err(CompileError::UnsupportedWorkflowType {
            kind: kind.name().to_string(),
            workflow_type,
        });
    }

    let empty = Map::new();
    let map = match raw_args {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => {
            return Err(CompileError::StepArgument {
                index,
                kind: kind.name().to_string(),
                reason: "step arguments must be a map".to_string(),
            });
        }
    };

    kind.build(&StepArgs { index, kind, map })
}

fn merge_envs(
    workflow: &Workflow,
    host: &Host,
    running_kwargs: &RunningKwargs,
) -> BTreeMap<String, String> {
    let mut envs = workflow.envs.clone();
    envs.extend(host.envs.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in running_kwargs {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        envs.insert(key.to_uppercase(), rendered);
    }
    envs
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn remote(steps: Vec<Step>) -> Workflow {
        Workflow::remote("wf", steps)
    }

    #[test]
    fn compiles_both_step_kinds_with_defaults() {
        let wf = remote(vec![
            Step::new("run_command", json!({"cmd": "uptime"})),
            Step::new(
                "copy_file",
                json!({"source": "/tmp/a", "dist": "/opt/a", "timeout": 12, "retry": 2}),
            ),
        ]);

        let work = compile(&wf, &Host::new("10.0.0.1"), &RunningKwargs::new()).unwrap();

        assert_eq!(
            work.units,
            vec![
                WorkUnit::RunCommand {
                    command: "uptime".into(),
                    timeout: DEFAULT_UNIT_TIMEOUT,
                    retry: 0,
                },
                WorkUnit::CopyFile {
                    source: "/tmp/a".into(),
                    destination: "/opt/a".into(),
                    timeout: Duration::from_secs(12),
                    retry: 2,
                    checksum: None,
                },
            ]
        );
    }

    #[test]
    fn legacy_step_names_resolve_to_the_same_kinds() {
        let wf = remote(vec![
            Step::new("run_shell", json!({"cmd": "uptime"})),
            Step::new("scp", json!({"source": "/tmp/a", "dist": "/opt/a"})),
        ]);

        let work = compile(&wf, &Host::new("10.0.0.1"), &RunningKwargs::new()).unwrap();
        assert!(matches!(&work.units[0], WorkUnit::RunCommand { command, .. } if command == "uptime"));
        assert!(matches!(&work.units[1], WorkUnit::CopyFile { destination, .. } if destination == "/opt/a"));
        assert_eq!(StepKind::lookup("scp").map(|k| k.name()), Some("copy_file"));
    }

    #[test]
    fn later_env_sources_win() {
        let mut wf = remote(vec![]);
        wf.envs.insert("ARGS_ZONE".into(), "from-workflow".into());
        wf.envs.insert("LANG".into(), "C".into());
        let host = Host::new("h").with_env("zone", "from-host");

        let mut kwargs = RunningKwargs::new();
        kwargs.insert("args_zone".into(), json!("from-kwargs"));
        kwargs.insert("replicas".into(), json!(3));
        kwargs.insert("flags".into(), json!({"fast": true}));

        let envs = compile(&wf, &host, &kwargs).unwrap().envs;
        assert_eq!(envs["ARGS_ZONE"], "from-kwargs");
        assert_eq!(envs["LANG"], "C");
        assert_eq!(envs["REPLICAS"], "3");
        assert_eq!(envs["FLAGS"], r#"{"fast":true}"#);
    }

    #[test]
    fn unknown_step_type() {
        let wf = remote(vec![Step::new("reboot_host", json!({}))]);
        let err = compile(&wf, &Host::new("h"), &RunningKwargs::new()).unwrap_err();
        assert_eq!(err, CompileError::StepTypeNotFound("reboot_host".into()));
    }

    #[test]
    fn server_workflows_are_rejected() {
        let mut wf = remote(vec![Step::new("run_command", json!({"command": "ls"}))]);
        wf.kind = WorkflowType::Server;
        let err = compile(&wf, &Host::new("h"), &RunningKwargs::new()).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedWorkflowType { .. }));
    }

    #[rstest]
    #[case::missing_command(Step::new("run_command", json!({})))]
    #[case::empty_command(Step::new("run_command", json!({"command": ""})))]
    #[case::missing_destination(Step::new("copy_file", json!({"source": "/a"})))]
    #[case::negative_retry(Step::new("run_command", json!({"command": "ls", "retry": -1})))]
    #[case::huge_timeout(Step::new("run_command", json!({"command": "ls", "timeout": 1e30})))]
    #[case::md5_argument(Step::new("copy_file", json!({"source": "/a", "destination": "/b", "md5": "d41d8cd98f00b204e9800998ecf8427e"})))]
    #[case::zero_timeout(Step::new("run_command", json!({"command": "ls", "timeout": 0})))]
    #[case::bad_checksum(Step::new("copy_file", json!({"source": "/a", "destination": "/b", "checksum": "abc"})))]
    #[case::args_not_a_map(Step::new("run_command", json!("ls")))]
    #[case::two_keys(Step(BTreeMap::from([
        ("run_command".to_string(), json!({"command": "ls"})),
        ("copy_file".to_string(), json!({})),
    ])))]
    fn argument_errors(#[case] step: Step) {
        let wf = remote(vec![step]);
        let err = compile(&wf, &Host::new("h"), &RunningKwargs::new()).unwrap_err();
        assert!(matches!(err, CompileError::StepArgument { index: 0, .. }), "{err:?}");
    }

    #[test]
    fn checksum_is_normalised() {
        let digest = "AB".repeat(32);
        let wf = remote(vec![Step::new(
            "copy_file",
            json!({"source": "/a", "destination": "/b", "checksum": digest}),
        )]);
        let work = compile(&wf, &Host::new("h"), &RunningKwargs::new()).unwrap();
        let WorkUnit::CopyFile { checksum, .. } = &work.units[0] else {
            panic!("expected copy_file");
        };
        assert_eq!(checksum.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn compilation_is_deterministic() {
        let wf = remote(vec![Step::new("run_command", json!({"command": "echo $A"}))]);
        let host = Host::new("h").with_env("a", "1");
        let kwargs = RunningKwargs::from([("b".to_string(), json!("2"))]);
        assert_eq!(
            compile(&wf, &host, &kwargs).unwrap(),
            compile(&wf, &host, &kwargs).unwrap()
        );
    }
}

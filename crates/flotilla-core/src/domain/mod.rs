//! Domain model: tasks, workflows, hosts, per-host results and the status
//! counters that tie them together.

pub mod host;
pub mod ids;
pub mod result;
pub mod status;
pub mod task;
pub mod workflow;

pub use host::{Host, HostFilter, HostPredicate, HOST_ENV_PREFIX};
pub use ids::{OperationId, TaskId, WorkflowId};
pub use result::{code, HostResult, HostStatus, StepRecord};
pub use status::{Counter, StatusChange, TaskPhase, TaskStatus};
pub use task::{HostDispatch, Operation, OperationCache, RunningKwargs, Task, TaskEnvelope};
pub use workflow::{Step, Workflow, WorkflowBasic, WorkflowType};

//! App: services built on the ports.
//!
//! # Components
//! - **EngineBuilder / Engine**: adapter wiring from configuration
//! - **RemoteWorker**: one task on one host
//! - **OperatorManager**: backend resolution and per-host fan-out
//! - **WorkerMaster**: queue pump plus completion watchers
//! - **WorkerGroup**: broker consumers
//! - **OperationService / TaskService**: submit, inspect, redo

pub mod builder;
pub mod operation;
pub mod operator_manager;
pub mod remote_worker;
pub mod tasks;
pub mod worker_group;
pub mod worker_master;

pub use self::builder::{Engine, EngineBuilder};
pub use self::operation::{OperationService, RunOptions};
pub use self::operator_manager::{OperatorKind, OperatorManager};
pub use self::remote_worker::RemoteWorker;
pub use self::tasks::{ParsedResult, ResultFilter, TaskService};
pub use self::worker_group::WorkerGroup;
pub use self::worker_master::{MasterHandle, WorkerMaster};

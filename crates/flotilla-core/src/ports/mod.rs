//! Ports: the traits the engine depends on.
//!
//! Each trait hides one external system (Redis, the durable store, SSH, a
//! dispatch backend). Reference adapters live in [`crate::impls`].

pub mod clock;
pub mod id_generator;
pub mod mq;
pub mod operator;
pub mod task_store;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::mq::{AdmissionLimits, QueueError, QueueStats, TaskQueue};
pub use self::operator::{DispatchSource, Operator, OperatorError};
pub use self::task_store::{
    Catalog, HostSelector, StoreError, TaskPredicate, TaskStore, TaskUpdate,
};
pub use self::transport::{ExecOutput, RemoteSession, RemoteShell, TransportError};

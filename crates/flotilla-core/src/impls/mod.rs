//! Adapters for the ports.
//!
//! - queue: [`InMemoryTaskQueue`], [`RedisTaskQueue`]
//! - store: [`InMemoryStore`], [`JsonDirStore`]
//! - transport: [`OpenSshShell`]
//! - dispatch: [`InProcessOperator`], [`RedisBroker`], [`InMemoryBroker`]

pub mod inmem_mq;
pub mod inmem_store;
pub mod json_store;
pub mod operators;
pub mod redis_mq;
pub mod ssh;

pub use self::inmem_mq::InMemoryTaskQueue;
pub use self::inmem_store::InMemoryStore;
pub use self::json_store::JsonDirStore;
pub use self::operators::{InMemoryBroker, InProcessOperator, RedisBroker};
pub use self::redis_mq::RedisTaskQueue;
pub use self::ssh::{OpenSshShell, shell_quote};

//! flotilla-core
//!
//! Task dispatch and remote execution for a host fleet.
//!
//! # Modules
//! - **domain**: tasks, workflows, hosts, per-host results, status counters
//! - **compile**: workflow steps to concrete work units
//! - **ports**: queue, store, catalog, host selection, transport, operators
//! - **impls**: Redis / in-memory / JSON / OpenSSH adapters
//! - **app**: remote worker, operator manager, worker master, services
//! - **config**: `flotilla.toml` loading
//! - **observability**: tracing setup

pub mod app;
pub mod compile;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

#[cfg(test)]
mod testutil;

pub use self::error::EngineError;

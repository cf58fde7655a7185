//! IdGenerator port.
//!
//! IDs are time-ordered ULIDs; the time part comes from the injected
//! [`Clock`] so tests with a [`FixedClock`](super::FixedClock) get
//! predictable prefixes.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::{OperationId, TaskId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_operation_id(&self) -> OperationId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn generate_operation_id(&self) -> OperationId {
        OperationId::from(self.next())
    }
}

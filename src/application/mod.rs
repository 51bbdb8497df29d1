//! Application Layer
//!
//! Use cases wiring the domain to the ports: the instance cache, the task
//! queue, the dispatcher and the gateway façade used by the HTTP adapter.

mod dispatcher;
mod gateway_service;
mod instance_directory;
#[cfg(test)]
pub(crate) mod mocks;
mod task_queue;

pub use dispatcher::{Dispatcher, TaskOutcome, DEFAULT_WORKERS, SHUTDOWN_MESSAGE};
pub use gateway_service::{GatewayService, RegisterInstance, Submission, DEFAULT_INSTANCE_WEIGHT};
pub use instance_directory::{InstanceDirectory, InstanceList};
pub use task_queue::{Admission, RecoveryReport, TaskQueue, DEFAULT_QUEUE_CAPACITY};

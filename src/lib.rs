//! LLM Gateway Library
//!
//! Admission, dispatch and backend-health core of the gateway, exposed for
//! integration tests and as a library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Dispatcher, GatewayService, InstanceDirectory, TaskQueue};
pub use config::load_config;
pub use domain::entities::{ChatRequest, Instance, InstanceRecord, Task};
pub use domain::errors::{GatewayError, StoreError, UpstreamError};
pub use domain::ports::{InstanceRepository, TaskStore, UpstreamClient};
pub use domain::services::LoadBalancer;
pub use domain::value_objects::{ProviderKind, TaskStatus};

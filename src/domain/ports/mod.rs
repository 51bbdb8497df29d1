mod instance_repository;
mod task_store;
mod upstream_client;

pub use instance_repository::InstanceRepository;
pub use task_store::TaskStore;
pub use upstream_client::{ChunkStream, UpstreamClient};

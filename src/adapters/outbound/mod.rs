mod dashmap_task_store;
mod http_upstream;
mod sqlite;
mod sqlite_instance_repo;
mod sqlite_task_store;

pub use dashmap_task_store::DashMapTaskStore;
pub use http_upstream::HttpUpstreamClient;
pub use sqlite::SqliteDb;
pub use sqlite_instance_repo::SqliteInstanceRepository;
pub use sqlite_task_store::SqliteTaskStore;

//! Task Store Port
//!
//! Durable record of admitted tasks and their lifecycle status.
//! Implementations may use SQLite or in-memory storage.

use crate::domain::entities::Task;
use crate::domain::errors::StoreError;
use crate::domain::value_objects::TaskStatus;
use async_trait::async_trait;

/// Repository for chat tasks.
///
/// This is an outbound port. The idempotency key is unique across all
/// tasks; status changes are conditional so concurrent writers cannot
/// move a task backwards.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task.
    ///
    /// Returns [`StoreError::DuplicateKey`] when the idempotency key is taken.
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by its ID.
    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Get the task admitted under an idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError>;

    /// Set `next` only if the current status is `expected`.
    ///
    /// Returns whether the row was updated. Illegal transitions are
    /// reported as `false` without touching the row.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, StoreError>;

    /// All tasks still in PENDING, oldest first.
    async fn find_pending(&self) -> Result<Vec<Task>, StoreError>;
}

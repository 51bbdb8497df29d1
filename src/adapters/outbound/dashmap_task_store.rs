//! DashMap Task Store
//!
//! Implements TaskStore in memory using DashMap. Nothing survives a
//! restart, so recovery only sees tasks admitted by the same process.

use crate::domain::entities::{unix_millis, Task};
use crate::domain::errors::StoreError;
use crate::domain::ports::TaskStore;
use crate::domain::value_objects::TaskStatus;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

struct StoredTask {
    task: Task,
    /// Insertion order, for FIFO recovery
    seq: u64,
}

/// In-memory task store.
///
/// The key index is written while holding its entry lock, so two inserts
/// with the same idempotency key cannot both succeed.
pub struct DashMapTaskStore {
    tasks: DashMap<String, StoredTask>,
    keys: DashMap<String, String>,
    seq: AtomicU64,
}

impl DashMapTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            keys: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for DashMapTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for DashMapTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        match self.keys.entry(task.idempotency_key.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey(task.idempotency_key.clone())),
            Entry::Vacant(slot) => {
                if self.tasks.contains_key(&task.id) {
                    return Err(StoreError::DuplicateKey(task.id.clone()));
                }
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                self.tasks.insert(
                    task.id.clone(),
                    StoredTask {
                        task: task.clone(),
                        seq,
                    },
                );
                slot.insert(task.id.clone());
                Ok(())
            }
        }
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.get(id).map(|s| s.task.clone()))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        let Some(id) = self.keys.get(key).map(|id| id.value().clone()) else {
            return Ok(None);
        };
        self.find_by_id(&id).await
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<bool, StoreError> {
        if !expected.can_transition_to(next) {
            return Ok(false);
        }

        let Some(mut stored) = self.tasks.get_mut(id) else {
            return Ok(false);
        };
        if stored.task.status != expected {
            return Ok(false);
        }
        stored.task.status = next;
        stored.task.updated_at_ms = unix_millis();
        Ok(true)
    }

    async fn find_pending(&self) -> Result<Vec<Task>, StoreError> {
        let mut pending: Vec<(u64, Task)> = self
            .tasks
            .iter()
            .filter(|e| e.task.status == TaskStatus::Pending)
            .map(|e| (e.seq, e.task.clone()))
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        Ok(pending.into_iter().map(|(_, t)| t).collect())
    }
}

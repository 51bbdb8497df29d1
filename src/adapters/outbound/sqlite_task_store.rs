//! SQLite Task Store
//!
//! Implements TaskStore on the `chat_task` table. The unique index on
//! `idempotency_key` and the conditional UPDATE give the store its
//! duplicate-key and compare-and-set semantics.

use super::sqlite::SqliteDb;
use crate::domain::entities::{unix_millis, Task};
use crate::domain::errors::StoreError;
use crate::domain::ports::TaskStore;
use crate::domain::value_objects::TaskStatus;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

const COLUMNS: &str = "id, idempotency_key, model, request_json, status, created_at, updated_at";

pub struct SqliteTaskStore {
    db: SqliteDb,
}

impl SqliteTaskStore {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }

    /// Convert a SQLite row to a Task entity.
    fn row_to_task(row: &Row) -> rusqlite::Result<Task> {
        let status: String = row.get(4)?;
        let status = TaskStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown task status: {}", status).into(),
            )
        })?;

        Ok(Task {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            model: row.get(2)?,
            request_json: row.get(3)?,
            status,
            created_at_ms: row.get::<_, i64>(5)? as u64,
            updated_at_ms: row.get::<_, i64>(6)? as u64,
        })
    }

    async fn find_one(&self, column: &'static str, value: String) -> Result<Option<Task>, StoreError> {
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM chat_task WHERE {} = ?1", COLUMNS, column),
                    params![value],
                    Self::row_to_task,
                )
                .optional()
            })
            .await
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let task = task.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO chat_task (id, idempotency_key, model, request_json, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        task.id,
                        task.idempotency_key,
                        task.model,
                        task.request_json,
                        task.status.as_str(),
                        task.created_at_ms as i64,
                        task.updated_at_ms as i64,
                    ],
                )
            })
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.find_one("id", id.to_string()).await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        self.find_one("idempotency_key", key.to_string()).await
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

        let id = id.to_string();
        let changed = self
            .db
            .call(move |conn| {
                conn.execute(
                    "UPDATE chat_task SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                    params![next.as_str(), unix_millis() as i64, id, expected.as_str()],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn find_pending(&self) -> Result<Vec<Task>, StoreError> {
        self.db
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM chat_task WHERE status = ?1 ORDER BY created_at, rowid",
                    COLUMNS
                ))?;
                let tasks = stmt
                    .query_map(params![TaskStatus::Pending.as_str()], Self::row_to_task)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(tasks)
            })
            .await
    }
}

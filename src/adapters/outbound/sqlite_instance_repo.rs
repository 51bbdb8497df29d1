//! SQLite Instance Repository
//!
//! Implements InstanceRepository on the `provider` and `model_instance`
//! tables.

use super::sqlite::SqliteDb;
use crate::domain::entities::{InstanceRecord, NewInstance};
use crate::domain::errors::StoreError;
use crate::domain::ports::InstanceRepository;
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

const SELECT: &str = "SELECT i.id, i.provider_id, p.name, i.model_name, i.url, i.api_key, i.weight, i.is_active
     FROM model_instance i
     JOIN provider p ON p.id = i.provider_id";

pub struct SqliteInstanceRepository {
    db: SqliteDb,
}

impl SqliteInstanceRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self { db }
    }

    /// Convert a SQLite row to an InstanceRecord.
    fn row_to_record(row: &Row) -> rusqlite::Result<InstanceRecord> {
        Ok(InstanceRecord {
            id: row.get(0)?,
            provider_id: row.get(1)?,
            provider_name: row.get(2)?,
            model_name: row.get(3)?,
            url: row.get(4)?,
            api_key: row.get(5)?,
            weight: row.get::<_, i64>(6)?.max(0) as u32,
            active: row.get::<_, i64>(7)? != 0,
        })
    }

    async fn select(&self, filter: &'static str, model: Option<String>) -> Result<Vec<InstanceRecord>, StoreError> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{} {} ORDER BY i.id", SELECT, filter))?;
                let rows = match model {
                    Some(model) => stmt
                        .query_map(params![model], Self::row_to_record)?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                    None => stmt
                        .query_map([], Self::row_to_record)?
                        .collect::<rusqlite::Result<Vec<_>>>()?,
                };
                Ok(rows)
            })
            .await
    }
}

#[async_trait]
impl InstanceRepository for SqliteInstanceRepository {
    async fn find_by_model(&self, model: &str) -> Result<Vec<InstanceRecord>, StoreError> {
        self.select("WHERE i.model_name = ?1", Some(model.to_string())).await
    }

    async fn find_all(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        self.select("", None).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<InstanceRecord>, StoreError> {
        self.db
            .call(move |conn| {
                conn.query_row(&format!("{} WHERE i.id = ?1", SELECT), params![id], Self::row_to_record)
                    .optional()
            })
            .await
    }

    async fn insert(&self, instance: &NewInstance) -> Result<i64, StoreError> {
        let instance = instance.clone();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO model_instance (provider_id, model_name, url, api_key, weight, is_active)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        instance.provider_id,
                        instance.model_name,
                        instance.url,
                        instance.api_key,
                        instance.weight as i64,
                        instance.active as i64,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    async fn update_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        let changed = self
            .db
            .call(move |conn| {
                conn.execute(
                    "UPDATE model_instance SET is_active = ?1 WHERE id = ?2",
                    params![active as i64, id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn update_weight(&self, id: i64, weight: u32) -> Result<bool, StoreError> {
        let changed = self
            .db
            .call(move |conn| {
                conn.execute(
                    "UPDATE model_instance SET weight = ?1 WHERE id = ?2",
                    params![weight as i64, id],
                )
            })
            .await?;
        Ok(changed == 1)
    }

    async fn find_provider_id_by_name(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                conn.query_row("SELECT id FROM provider WHERE name = ?1", params![name], |row| row.get(0))
                    .optional()
            })
            .await
    }

    async fn insert_provider(&self, name: &str) -> Result<i64, StoreError> {
        let name = name.to_string();
        self.db
            .call(move |conn| {
                conn.execute("INSERT INTO provider (name) VALUES (?1)", params![name])?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }
}

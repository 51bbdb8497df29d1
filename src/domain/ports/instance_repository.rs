//! Instance Repository Port
//!
//! Defines the interface for accessing backend instance configuration.

use crate::domain::entities::{InstanceRecord, NewInstance};
use crate::domain::errors::StoreError;
use async_trait::async_trait;

/// Repository for provider and instance configuration rows.
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Instances configured for a model, active or not, in ID order.
    async fn find_by_model(&self, model: &str) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Every configured instance, across models.
    async fn find_all(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Get an instance by ID, active or not.
    async fn find_by_id(&self, id: i64) -> Result<Option<InstanceRecord>, StoreError>;

    /// Insert an instance and return its ID.
    ///
    /// Returns [`StoreError::DuplicateKey`] when the URL is already registered.
    async fn insert(&self, instance: &NewInstance) -> Result<i64, StoreError>;

    /// Toggle the configuration flag. Returns whether a row was updated.
    async fn update_active(&self, id: i64, active: bool) -> Result<bool, StoreError>;

    /// Change the weight. Returns whether a row was updated.
    async fn update_weight(&self, id: i64, weight: u32) -> Result<bool, StoreError>;

    async fn find_provider_id_by_name(&self, name: &str) -> Result<Option<i64>, StoreError>;

    /// Insert a provider and return its ID.
    async fn insert_provider(&self, name: &str) -> Result<i64, StoreError>;
}

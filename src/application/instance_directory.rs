//! Instance Directory
//!
//! Read-mostly cache of model → instances, reloaded from the instance
//! repository in the background.

use crate::domain::entities::{Instance, InstanceRecord, InstanceRuntime};
use crate::domain::errors::GatewayError;
use crate::domain::ports::InstanceRepository;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Immutable list of instances for one model.
pub type InstanceList = Arc<Vec<Arc<Instance>>>;

/// Cache of configured instances per model.
///
/// Readers get an `Arc` snapshot and never wait on a reload: a refresh
/// builds the new list off to the side and swaps it in. Runtime counters
/// live in a second map keyed by URL and are re-attached on every load,
/// so reloading rows never resets circuit state.
pub struct InstanceDirectory {
    repo: Arc<dyn InstanceRepository>,
    models: DashMap<String, InstanceList>,
    runtimes: DashMap<String, Arc<InstanceRuntime>>,
}

impl InstanceDirectory {
    pub fn new(repo: Arc<dyn InstanceRepository>) -> Self {
        Self {
            repo,
            models: DashMap::new(),
            runtimes: DashMap::new(),
        }
    }

    /// Instances for `model`, loading from the repository on first access.
    pub async fn get_instances(&self, model: &str) -> Result<InstanceList, GatewayError> {
        if let Some(list) = self.models.get(model) {
            return Ok(list.clone());
        }
        self.load(model).await
    }

    /// Reload one model out of band.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self, model: &str) -> Result<usize, GatewayError> {
        let list = self.load(model).await?;
        tracing::info!("directory refreshed, model={} instances={}", model, list.len());
        Ok(list.len())
    }

    /// Reload every model from a single repository query.
    ///
    /// Cached models that no longer have any rows are dropped. Returns the
    /// number of instances loaded.
    pub async fn refresh_all(&self) -> Result<usize, GatewayError> {
        let records = self.repo.find_all().await.map_err(|e| {
            tracing::error!("directory reload failed, keeping cached snapshot: {}", e);
            GatewayError::from(e)
        })?;

        let total = records.len();
        let mut grouped: HashMap<String, Vec<InstanceRecord>> = HashMap::new();
        for record in records {
            grouped.entry(record.model_name.clone()).or_default().push(record);
        }

        let stale: Vec<String> = self
            .models
            .iter()
            .filter(|e| !grouped.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for model in stale {
            self.models.remove(&model);
        }

        for (model, records) in grouped {
            let list = self.build(records);
            self.models.insert(model, list);
        }

        tracing::debug!("directory reload ok, models={} instances={}", self.models.len(), total);
        Ok(total)
    }

    /// Snapshot of every cached model, for monitoring.
    pub fn get_all(&self) -> BTreeMap<String, InstanceList> {
        self.models
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Every cached instance across models.
    pub fn all_instances(&self) -> Vec<Arc<Instance>> {
        self.models
            .iter()
            .flat_map(|e| e.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Start the periodic reload loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_refresh(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        // Failure is logged inside; the next tick retries
                        let _ = self.refresh_all().await;
                    }
                    changed = shutdown.changed() => {
                        let stopped = changed.is_err() || *shutdown.borrow();
                        if stopped {
                            tracing::debug!("directory refresh loop stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Load one model. Models without rows are not cached, since model
    /// names come from clients.
    async fn load(&self, model: &str) -> Result<InstanceList, GatewayError> {
        let records = self.repo.find_by_model(model).await.map_err(|e| {
            tracing::error!("instance load failed, model={}: {}", model, e);
            GatewayError::from(e)
        })?;

        if records.is_empty() {
            self.models.remove(model);
            return Ok(Arc::new(Vec::new()));
        }

        let list = self.build(records);
        self.models.insert(model.to_string(), list.clone());
        Ok(list)
    }

    fn build(&self, records: Vec<InstanceRecord>) -> InstanceList {
        let instances = records
            .into_iter()
            .map(|record| {
                let runtime = self
                    .runtimes
                    .entry(record.url.clone())
                    .or_insert_with(|| Arc::new(InstanceRuntime::new()))
                    .clone();
                Arc::new(Instance::with_runtime(record, runtime))
            })
            .collect();
        Arc::new(instances)
    }
}

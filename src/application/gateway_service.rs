//! Gateway Service - Main application use case
//!
//! Entry point for the inbound adapter: chat submission, task lookup and
//! the administrative operations on the instance configuration.

use crate::application::{Admission, InstanceDirectory, TaskQueue};
use crate::domain::entities::{ChatRequest, InstanceSnapshot, NewInstance, Task};
use crate::domain::errors::GatewayError;
use crate::domain::ports::InstanceRepository;
use crate::infrastructure::{StreamBridge, TaskStream};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Weight given to instances registered without one.
pub const DEFAULT_INSTANCE_WEIGHT: u32 = 10;

/// Result of a chat submission.
#[derive(Debug)]
pub enum Submission {
    /// New task; the stream carries the backend response
    Stream { task_id: String, stream: TaskStream },
    /// Idempotent replay of an earlier task
    Replay(Task),
}

/// Admin request to register a backend instance.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterInstance {
    pub model: String,
    pub url: String,
    #[serde(alias = "apiKey")]
    pub api_key: String,
    pub provider: String,
    #[serde(default)]
    pub weight: Option<u32>,
}

pub struct GatewayService {
    queue: Arc<TaskQueue>,
    directory: Arc<InstanceDirectory>,
    bridge: Arc<StreamBridge>,
    repo: Arc<dyn InstanceRepository>,
}

impl GatewayService {
    pub fn new(
        queue: Arc<TaskQueue>,
        directory: Arc<InstanceDirectory>,
        bridge: Arc<StreamBridge>,
        repo: Arc<dyn InstanceRepository>,
    ) -> Self {
        Self {
            queue,
            directory,
            bridge,
            repo,
        }
    }

    /// Admit a chat request and attach the caller to its output stream.
    ///
    /// The stream is opened before the task is queued so no chunk can be
    /// emitted before the client is listening.
    pub async fn submit(&self, request: ChatRequest) -> Result<Submission, GatewayError> {
        let task = match self.queue.admit(&request).await? {
            Admission::Existing(task) => return Ok(Submission::Replay(task)),
            Admission::Created(task) => task,
        };

        let stream = self.bridge.open(&task.id);
        if let Err(e) = self.queue.enqueue(task.clone()).await {
            self.bridge.discard(&task.id);
            return Err(e);
        }

        Ok(Submission::Stream {
            task_id: task.id,
            stream,
        })
    }

    pub async fn task(&self, id: &str) -> Result<Task, GatewayError> {
        self.queue
            .store()
            .find_by_id(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("task {}", id)))
    }

    /// Live state of every cached instance, grouped by model.
    pub fn monitor(&self) -> BTreeMap<String, Vec<InstanceSnapshot>> {
        self.directory
            .get_all()
            .into_iter()
            .map(|(model, list)| (model, list.iter().map(|i| i.snapshot()).collect()))
            .collect()
    }

    /// Register a new instance and reload its model.
    pub async fn register_instance(&self, req: RegisterInstance) -> Result<i64, GatewayError> {
        for (field, value) in [("model", &req.model), ("url", &req.url), ("provider", &req.provider)] {
            if value.trim().is_empty() {
                return Err(GatewayError::InvalidRequest(format!("{} is required", field)));
            }
        }

        let provider_id = match self.repo.find_provider_id_by_name(&req.provider).await? {
            Some(id) => id,
            None => {
                let id = self.repo.insert_provider(&req.provider).await?;
                tracing::info!("provider registered, name={} id={}", req.provider, id);
                id
            }
        };

        let id = self
            .repo
            .insert(&NewInstance {
                provider_id,
                model_name: req.model.clone(),
                url: req.url.clone(),
                api_key: req.api_key,
                weight: req.weight.unwrap_or(DEFAULT_INSTANCE_WEIGHT),
                active: true,
            })
            .await?;

        tracing::info!("instance registered, id={} model={} url={}", id, req.model, req.url);
        self.directory.refresh(&req.model).await?;
        Ok(id)
    }

    pub async fn set_active(&self, id: i64, active: bool) -> Result<(), GatewayError> {
        let model = self.model_of(id).await?;
        self.repo.update_active(id, active).await?;
        tracing::info!("instance {} active={}", id, active);
        self.directory.refresh(&model).await?;
        Ok(())
    }

    pub async fn set_weight(&self, id: i64, weight: u32) -> Result<(), GatewayError> {
        let model = self.model_of(id).await?;
        self.repo.update_weight(id, weight).await?;
        tracing::info!("instance {} weight={}", id, weight);
        self.directory.refresh(&model).await?;
        Ok(())
    }

    /// Force a reload of one model. Returns the instance count.
    pub async fn refresh_model(&self, model: &str) -> Result<usize, GatewayError> {
        self.directory.refresh(model).await
    }

    /// Number of tasks waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    async fn model_of(&self, id: i64) -> Result<String, GatewayError> {
        self.repo
            .find_by_id(id)
            .await?
            .map(|r| r.model_name)
            .ok_or_else(|| GatewayError::NotFound(format!("instance {}", id)))
    }
}

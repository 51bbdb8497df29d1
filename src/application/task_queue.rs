//! Task Queue
//!
//! Write-ahead admission of chat requests into a bounded FIFO.
//! A task is always persisted as PENDING before it is queued.

use crate::domain::entities::{ChatRequest, Task};
use crate::domain::errors::{GatewayError, StoreError};
use crate::domain::ports::TaskStore;
use crate::domain::value_objects::TaskStatus;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Result of admitting a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// The idempotency key matched an existing task; nothing was created
    Existing(Task),
    /// A new PENDING task was persisted
    Created(Task),
}

impl Admission {
    pub fn task(&self) -> &Task {
        match self {
            Self::Existing(t) | Self::Created(t) => t,
        }
    }
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered: usize,
    /// Left PENDING in the store because the queue was full
    pub skipped: usize,
}

/// Bounded queue of admitted tasks backed by a durable store.
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    tx: mpsc::Sender<Task>,
    rx: Mutex<mpsc::Receiver<Task>>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            store,
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Admit and enqueue a request.
    pub async fn submit(&self, request: &ChatRequest) -> Result<Admission, GatewayError> {
        let admission = self.admit(request).await?;
        if let Admission::Created(task) = &admission {
            self.enqueue(task.clone()).await?;
        }
        Ok(admission)
    }

    /// Persist a request as a PENDING task, or find the task already
    /// admitted under the same idempotency key.
    pub async fn admit(&self, request: &ChatRequest) -> Result<Admission, GatewayError> {
        if request.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("model is required".into()));
        }

        let supplied = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());

        if let Some(key) = supplied {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                tracing::debug!("idempotent replay, key={} task={}", key, existing.id);
                return Ok(Admission::Existing(existing));
            }
        }

        let key = supplied
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let task = Task::pending(
            uuid::Uuid::new_v4().to_string(),
            key,
            request.model.clone(),
            request.upstream_body()?,
        );

        match self.store.insert(&task).await {
            Ok(()) => {
                tracing::debug!("task admitted, id={} model={}", task.id, task.model);
                Ok(Admission::Created(task))
            }
            Err(StoreError::DuplicateKey(detail)) => {
                // Lost an insert race on the same key
                match self.store.find_by_idempotency_key(&task.idempotency_key).await? {
                    Some(winner) => Ok(Admission::Existing(winner)),
                    None => Err(StoreError::DuplicateKey(detail).into()),
                }
            }
            Err(e) => {
                tracing::error!("task insert failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Queue a persisted task.
    ///
    /// When the queue is full the task is moved PENDING -> FAILED so that
    /// recovery never re-admits it, and `SystemBusy` is returned.
    pub async fn enqueue(&self, task: Task) -> Result<(), GatewayError> {
        let Err(err) = self.tx.try_send(task) else {
            return Ok(());
        };

        let task = match err {
            mpsc::error::TrySendError::Full(t) => {
                tracing::warn!("task queue full (capacity={}), rejecting task {}", self.capacity, t.id);
                t
            }
            mpsc::error::TrySendError::Closed(t) => {
                tracing::warn!("task queue closed, rejecting task {}", t.id);
                t
            }
        };

        match self
            .store
            .compare_and_set_status(&task.id, TaskStatus::Pending, TaskStatus::Failed)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("task {} left PENDING state before rejection", task.id),
            Err(e) => tracing::error!("failed to mark rejected task {} FAILED: {}", task.id, e),
        }
        Err(GatewayError::SystemBusy)
    }

    /// Re-queue every PENDING task from the store.
    ///
    /// Tasks that do not fit are left PENDING for a later attempt.
    pub async fn recover(&self) -> Result<RecoveryReport, GatewayError> {
        let pending = self.store.find_pending().await?;
        let mut report = RecoveryReport::default();

        for task in pending {
            let id = task.id.clone();
            match self.tx.try_send(task) {
                Ok(()) => report.recovered += 1,
                Err(_) => {
                    tracing::warn!("queue full during recovery, skipping task {}", id);
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            "recovery done, recovered={} skipped={}",
            report.recovered,
            report.skipped
        );
        Ok(report)
    }

    /// Wait for the next task.
    ///
    /// Returns `None` only if the queue has been closed.
    pub async fn take(&self) -> Option<Task> {
        self.rx.lock().await.recv().await
    }

    /// Stop accepting tasks and hand back everything still queued.
    ///
    /// Returned tasks stay PENDING in the store. Later enqueues fail with
    /// `SystemBusy`.
    pub async fn close(&self) -> Vec<Task> {
        let mut rx = self.rx.lock().await;
        rx.close();

        let mut remaining = Vec::new();
        while let Ok(task) = rx.try_recv() {
            remaining.push(task);
        }
        remaining
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

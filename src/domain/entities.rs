//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the gateway domain.
//! They have no external dependencies and contain only business logic.

use crate::domain::value_objects::{ProviderKind, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Consecutive failures that open an instance's circuit.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 3;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Persisted configuration row of a backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: i64,
    pub provider_id: i64,
    /// Joined from the provider table
    pub provider_name: String,
    pub model_name: String,
    /// Natural identity of the instance
    pub url: String,
    pub api_key: String,
    /// Reserved for a weighted policy, not consulted by selection
    pub weight: u32,
    /// Configuration flag, independent from the circuit breaker
    pub active: bool,
}

/// Instance row to be inserted by the admin path.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub provider_id: i64,
    pub model_name: String,
    pub url: String,
    pub api_key: String,
    pub weight: u32,
    pub active: bool,
}

/// Live health counters of one backend endpoint.
///
/// Kept outside of [`Instance`] so that reloading configuration rows does not
/// reset them. The directory keys these by URL and re-attaches them to every
/// freshly loaded instance.
#[derive(Debug)]
pub struct InstanceRuntime {
    failure_count: AtomicU32,
    request_count: AtomicU64,
    total_latency_ms: AtomicU64,
    last_used_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    circuit_open: AtomicBool,
}

impl InstanceRuntime {
    pub fn new() -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            request_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            last_used_ms: AtomicU64::new(unix_millis()),
            last_failure_ms: AtomicU64::new(0),
            circuit_open: AtomicBool::new(false),
        }
    }
}

impl Default for InstanceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// A backend endpoint serving one model.
///
/// Cloning an instance shares its runtime counters: every clone observes
/// the same failure count and circuit state.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: i64,
    pub provider_id: i64,
    pub provider_name: String,
    pub provider: ProviderKind,
    pub model_name: String,
    pub url: String,
    pub api_key: String,
    pub weight: u32,
    pub active: bool,
    runtime: Arc<InstanceRuntime>,
}

impl Instance {
    /// Build an instance with fresh runtime counters.
    pub fn new(record: InstanceRecord) -> Self {
        Self::with_runtime(record, Arc::new(InstanceRuntime::new()))
    }

    /// Build an instance around existing runtime counters.
    pub fn with_runtime(record: InstanceRecord, runtime: Arc<InstanceRuntime>) -> Self {
        Self {
            id: record.id,
            provider_id: record.provider_id,
            provider: ProviderKind::from_name(&record.provider_name),
            provider_name: record.provider_name,
            model_name: record.model_name,
            url: record.url,
            api_key: record.api_key,
            weight: record.weight,
            active: record.active,
            runtime,
        }
    }

    /// Record a successful call: resets failures and closes the circuit.
    pub fn record_success(&self, latency: Duration) {
        let rt = &self.runtime;
        rt.circuit_open.store(false, Ordering::SeqCst);
        rt.failure_count.store(0, Ordering::SeqCst);
        rt.request_count.fetch_add(1, Ordering::Relaxed);
        rt.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        rt.last_used_ms.store(unix_millis(), Ordering::Relaxed);
    }

    /// Record a failed call. Opens the circuit once the threshold is reached.
    pub fn record_failure(&self) {
        let rt = &self.runtime;
        let failures = rt.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        rt.last_failure_ms.store(unix_millis(), Ordering::Relaxed);
        if failures >= CIRCUIT_FAILURE_THRESHOLD && !rt.circuit_open.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "circuit opened for {} after {} consecutive failures",
                self.url,
                failures
            );
        }
    }

    /// Configured active and circuit closed.
    pub fn is_healthy(&self) -> bool {
        self.active && !self.is_circuit_open()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.runtime.circuit_open.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.runtime.failure_count.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> u64 {
        self.runtime.request_count.load(Ordering::Relaxed)
    }

    pub fn total_latency_ms(&self) -> u64 {
        self.runtime.total_latency_ms.load(Ordering::Relaxed)
    }

    pub fn last_used_ms(&self) -> u64 {
        self.runtime.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn last_failure_ms(&self) -> u64 {
        self.runtime.last_failure_ms.load(Ordering::Relaxed)
    }

    /// Time since the last successful call, relative to `now_ms`.
    pub fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_used_ms()))
    }

    /// Shared runtime counters.
    pub fn runtime(&self) -> &Arc<InstanceRuntime> {
        &self.runtime
    }

    /// Serializable view for monitoring (credential omitted).
    pub fn snapshot(&self) -> InstanceSnapshot {
        let requests = self.request_count();
        let total_latency_ms = self.total_latency_ms();
        InstanceSnapshot {
            id: self.id,
            provider: self.provider_name.clone(),
            model: self.model_name.clone(),
            url: self.url.clone(),
            weight: self.weight,
            active: self.active,
            healthy: self.is_healthy(),
            circuit_open: self.is_circuit_open(),
            failure_count: self.failure_count(),
            request_count: requests,
            total_latency_ms,
            avg_latency_ms: if requests == 0 {
                0
            } else {
                total_latency_ms / requests
            },
            last_used_ms: self.last_used_ms(),
            last_failure_ms: self.last_failure_ms(),
        }
    }
}

/// Monitoring view of an instance and its live counters.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub url: String,
    pub weight: u32,
    pub active: bool,
    pub healthy: bool,
    pub circuit_open: bool,
    pub failure_count: u32,
    pub request_count: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: u64,
    pub last_used_ms: u64,
    pub last_failure_ms: u64,
}

/// One admitted client request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub idempotency_key: String,
    pub model: String,
    /// Upstream request body as stored at admission
    pub request_json: String,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Task {
    /// A freshly admitted task.
    pub fn pending(id: String, idempotency_key: String, model: String, request_json: String) -> Self {
        let now = unix_millis();
        Self {
            id,
            idempotency_key,
            model,
            request_json,
            status: TaskStatus::Pending,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

/// OpenAI-style chat request accepted by the gateway.
///
/// Unknown fields are preserved and forwarded to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Never forwarded upstream
    #[serde(default, alias = "idempotencyKey", skip_serializing)]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            stream: None,
            idempotency_key: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Body sent to the backend. Streaming is on unless the client opted out.
    pub fn upstream_body(&self) -> Result<String, serde_json::Error> {
        let mut body = self.clone();
        body.stream = Some(self.stream.unwrap_or(true));
        serde_json::to_string(&body)
    }
}

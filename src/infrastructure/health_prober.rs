//! Active Health Prober
//!
//! Periodically sends a minimal completion request to instances that are
//! unhealthy or have been idle, so open circuits can close again without
//! live traffic.

use crate::application::InstanceDirectory;
use crate::domain::entities::{unix_millis, Instance};
use crate::domain::ports::UpstreamClient;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Prober configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Interval between probe rounds
    pub interval: Duration,
    /// Healthy instances unused for longer than this are probed
    pub idle_threshold: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_threshold: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    Success { latency_ms: u64 },
    Failure { error: String },
}

/// Background prober over every instance known to the directory.
///
/// A 2xx probe records a success on the instance. Failed probes are only
/// logged; they never add to the failure count.
pub struct HealthProber {
    config: ProbeConfig,
    directory: Arc<InstanceDirectory>,
    upstream: Arc<dyn UpstreamClient>,
}

impl HealthProber {
    pub fn new(
        config: ProbeConfig,
        directory: Arc<InstanceDirectory>,
        upstream: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            config,
            directory,
            upstream,
        }
    }

    /// Start the probe loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.probe_all().await;
                    }
                    changed = shutdown.changed() => {
                        let stopped = changed.is_err() || *shutdown.borrow();
                        if stopped {
                            tracing::debug!("health prober stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Whether an instance is due for a probe at `now_ms`.
    pub fn needs_probe(&self, instance: &Instance, now_ms: u64) -> bool {
        !instance.is_healthy() || instance.idle_for(now_ms) > self.config.idle_threshold
    }

    /// Run one probe round. Returns the number of instances probed.
    pub async fn probe_all(&self) -> usize {
        let now_ms = unix_millis();
        let due: Vec<Arc<Instance>> = self
            .directory
            .all_instances()
            .into_iter()
            .filter(|i| self.needs_probe(i, now_ms))
            .collect();

        let count = due.len();
        join_all(due.iter().map(|i| self.probe(i))).await;
        count
    }

    /// Probe one instance and apply the outcome.
    pub async fn probe(&self, instance: &Instance) -> ProbeResult {
        let body = serde_json::json!({
            "model": instance.model_name,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        })
        .to_string();

        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.timeout, self.upstream.probe(instance, &body)).await {
            Ok(Ok(status)) if (200..300).contains(&status) => ProbeResult::Success {
                latency_ms: start.elapsed().as_millis() as u64,
            },
            Ok(Ok(status)) => ProbeResult::Failure {
                error: format!("unhealthy status: {}", status),
            },
            Ok(Err(e)) => ProbeResult::Failure { error: e.to_string() },
            Err(_) => ProbeResult::Failure {
                error: "probe timeout".to_string(),
            },
        };

        match &result {
            ProbeResult::Success { latency_ms } => {
                let was_healthy = instance.is_healthy();
                instance.record_success(Duration::ZERO);
                if !was_healthy && instance.is_healthy() {
                    tracing::info!("instance {} recovered (probe {}ms)", instance.url, latency_ms);
                }
            }
            ProbeResult::Failure { error } => {
                tracing::warn!("probe failed for {}: {}", instance.url, error);
            }
        }

        result
    }
}

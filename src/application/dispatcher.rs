//! Task Dispatcher
//!
//! Drains the task queue into a bounded worker pool. Each worker claims
//! its task, routes it to an instance, streams the backend response to the
//! client and settles the task and instance state.

use crate::application::{InstanceDirectory, TaskQueue};
use crate::domain::entities::{Instance, Task};
use crate::domain::errors::GatewayError;
use crate::domain::ports::UpstreamClient;
use crate::domain::services::LoadBalancer;
use crate::domain::value_objects::TaskStatus;
use crate::infrastructure::{ConcurrencyLimiter, EmitOutcome, InFlightPermit, ShutdownController, StreamBridge};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 20;

/// Error sent to clients whose task was still queued at shutdown.
pub const SHUTDOWN_MESSAGE: &str = "gateway shutting down";

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Task was not PENDING when claimed
    Skipped,
    Completed,
    Failed(String),
    /// Client went away mid-stream
    Cancelled,
}

pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    directory: Arc<InstanceDirectory>,
    balancer: LoadBalancer,
    limiter: Arc<ConcurrencyLimiter>,
    upstream: Arc<dyn UpstreamClient>,
    bridge: Arc<StreamBridge>,
    workers: usize,
    shutdown: ShutdownController,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        directory: Arc<InstanceDirectory>,
        limiter: Arc<ConcurrencyLimiter>,
        upstream: Arc<dyn UpstreamClient>,
        bridge: Arc<StreamBridge>,
        workers: usize,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            queue,
            directory,
            balancer: LoadBalancer::new(),
            limiter,
            upstream,
            bridge,
            workers: workers.max(1),
            shutdown,
        }
    }

    /// Start the drain loop.
    ///
    /// The loop waits for a free worker before taking the next task, and
    /// stops taking tasks once shutdown begins.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let pool = Arc::new(Semaphore::new(self.workers));
            tracing::info!("dispatcher started, workers={}", self.workers);

            loop {
                let worker = tokio::select! {
                    permit = pool.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                    _ = self.shutdown.wait() => break,
                };

                let task = tokio::select! {
                    task = self.queue.take() => match task {
                        Some(t) => t,
                        None => break,
                    },
                    _ = self.shutdown.wait() => break,
                };

                let guard = self.shutdown.task_guard();
                let this = self.clone();
                tokio::spawn(async move {
                    let _worker = worker;
                    let _guard = guard;
                    this.process(task).await;
                });
            }

            self.abandon_queued().await;
            tracing::info!("dispatcher stopped");
        })
    }

    /// Release the clients of tasks that will not be dispatched.
    ///
    /// The tasks stay PENDING so the next start recovers them.
    async fn abandon_queued(&self) {
        let remaining = self.queue.close().await;
        if remaining.is_empty() {
            return;
        }

        tracing::warn!("shutting down with {} queued tasks left PENDING", remaining.len());
        for task in &remaining {
            self.bridge.error(&task.id, SHUTDOWN_MESSAGE).await;
        }
    }

    /// Run one task to a terminal state.
    pub async fn process(&self, task: Task) -> TaskOutcome {
        let store = self.queue.store();
        match store
            .compare_and_set_status(&task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("task {} already claimed, skipping", task.id);
                return TaskOutcome::Skipped;
            }
            Err(e) => {
                tracing::error!("failed to claim task {}: {}", task.id, e);
                self.bridge.error(&task.id, e.to_string()).await;
                return TaskOutcome::Failed(e.to_string());
            }
        }

        // Pre-flight failures leave the instance counters untouched
        let (instance, permit) = match self.route(&task).await {
            Ok(routed) => routed,
            Err(e) => {
                if e.is_overload() {
                    tracing::warn!("task {} rejected: {}", task.id, e);
                } else {
                    tracing::warn!("task {} failed before dispatch: {}", task.id, e);
                }
                return self.fail(&task, e.to_string()).await;
            }
        };

        let outcome = self.relay(&task, &instance).await;
        drop(permit);
        outcome
    }

    /// Select an instance and take one of its in-flight slots.
    async fn route(&self, task: &Task) -> Result<(Arc<Instance>, InFlightPermit), GatewayError> {
        let _: serde_json::Value = serde_json::from_str(&task.request_json)?;

        let instances = self.directory.get_instances(&task.model).await?;
        let instance = self.balancer.next(&task.model, &instances)?;
        let permit = self
            .limiter
            .try_acquire(&instance.url)
            .ok_or_else(|| GatewayError::ServerBusy(instance.url.clone()))?;

        tracing::debug!("task {} routed to {}", task.id, instance.url);
        Ok((instance, permit))
    }

    /// Stream the backend response for a claimed and routed task.
    async fn relay(&self, task: &Task, instance: &Instance) -> TaskOutcome {
        let started = Instant::now();
        let client_gone = self.bridge.disconnected(&task.id);
        tokio::pin!(client_gone);

        let call = tokio::select! {
            biased;
            _ = &mut client_gone => return self.cancel(task).await,
            call = self.upstream.stream_chat(instance, &task.request_json) => call,
        };

        let mut chunks = match call {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!("upstream {} failed for task {}: {}", instance.url, task.id, e);
                return self.fail_upstream(task, instance, e.to_string()).await;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = &mut client_gone => return self.cancel(task).await,
                next = chunks.next() => match next {
                    Some(Ok(bytes)) => {
                        if self.bridge.emit(&task.id, bytes).await == EmitOutcome::Disconnected {
                            return self.cancel(task).await;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("upstream {} stream broke for task {}: {}", instance.url, task.id, e);
                        return self.fail_upstream(task, instance, e.to_string()).await;
                    }
                    None => {
                        // Counters are updated before the client or store sees the outcome
                        instance.record_success(started.elapsed());
                        self.bridge.complete(&task.id).await;
                        self.settle(task, TaskStatus::Completed).await;
                        tracing::debug!(
                            "task {} completed on {} in {}ms",
                            task.id,
                            instance.url,
                            started.elapsed().as_millis()
                        );
                        return TaskOutcome::Completed;
                    }
                },
            }
        }
    }

    async fn fail(&self, task: &Task, message: String) -> TaskOutcome {
        self.bridge.error(&task.id, message.clone()).await;
        self.settle(task, TaskStatus::Failed).await;
        TaskOutcome::Failed(message)
    }

    async fn fail_upstream(&self, task: &Task, instance: &Instance, message: String) -> TaskOutcome {
        instance.record_failure();
        self.fail(task, message).await
    }

    async fn cancel(&self, task: &Task) -> TaskOutcome {
        tracing::warn!("client disconnected, cancelling task {}", task.id);
        self.bridge.discard(&task.id);
        self.settle(task, TaskStatus::Failed).await;
        TaskOutcome::Cancelled
    }

    async fn settle(&self, task: &Task, status: TaskStatus) {
        match self
            .queue
            .store()
            .compare_and_set_status(&task.id, TaskStatus::Running, status)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!("task {} was no longer RUNNING when settling {}", task.id, status),
            Err(e) => tracing::error!("failed to settle task {} as {}: {}", task.id, status, e),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::DashMapTaskStore;
    use crate::application::mocks::{record, MockInstanceRepository, MockUpstream, Script};
    use crate::domain::entities::{ChatRequest, InstanceRecord};
    use crate::domain::ports::TaskStore;
    use crate::infrastructure::StreamEvent;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        queue: Arc<TaskQueue>,
        store: Arc<DashMapTaskStore>,
        directory: Arc<InstanceDirectory>,
        limiter: Arc<ConcurrencyLimiter>,
        upstream: Arc<MockUpstream>,
        bridge: Arc<StreamBridge>,
    }

    fn harness(rows: Vec<InstanceRecord>, script: Script, max_in_flight: usize) -> Harness {
        harness_with_workers(rows, script, max_in_flight, 4)
    }

    fn harness_with_workers(
        rows: Vec<InstanceRecord>,
        script: Script,
        max_in_flight: usize,
        workers: usize,
    ) -> Harness {
        let store = Arc::new(DashMapTaskStore::new());
        let queue = Arc::new(TaskQueue::new(store.clone(), 100));
        let directory = Arc::new(InstanceDirectory::new(Arc::new(MockInstanceRepository::with_rows(rows))));
        let limiter = Arc::new(ConcurrencyLimiter::new(max_in_flight));
        let upstream = Arc::new(MockUpstream::new(script));
        let bridge = Arc::new(StreamBridge::default());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            directory.clone(),
            limiter.clone(),
            upstream.clone(),
            bridge.clone(),
            workers,
            ShutdownController::new(),
        ));
        Harness {
            dispatcher,
            queue,
            store,
            directory,
            limiter,
            upstream,
            bridge,
        }
    }

    async fn admit(h: &Harness, model: &str) -> Task {
        let req = ChatRequest::new(model, json!([{"role": "user", "content": "hi"}]));
        h.queue.admit(&req).await.unwrap().task().clone()
    }

    async fn status(h: &Harness, id: &str) -> TaskStatus {
        h.store.find_by_id(id).await.unwrap().unwrap().status
    }

    async fn drain(mut stream: crate::infrastructure::TaskStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(e) = stream.next().await {
            events.push(e);
        }
        events
    }

    // ===== Success Path =====

    #[tokio::test]
    async fn test_process_streams_and_completes() {
        let h = harness(
            vec![record(1, "gpt-4", "http://a")],
            Script::Stream(vec!["data: 1\n\n", "data: 2\n\n"]),
            10,
        );
        let task = admit(&h, "gpt-4").await;
        let stream = h.bridge.open(&task.id);

        assert_eq!(h.dispatcher.process(task.clone()).await, TaskOutcome::Completed);

        let events = drain(stream).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk(Bytes::from_static(b"data: 1\n\n")),
                StreamEvent::Chunk(Bytes::from_static(b"data: 2\n\n")),
            ]
        );
        assert_eq!(status(&h, &task.id).await, TaskStatus::Completed);

        let instance = h.directory.get_instances("gpt-4").await.unwrap()[0].clone();
        assert_eq!(instance.request_count(), 1);
        assert_eq!(instance.failure_count(), 0);
        assert_eq!(h.limiter.in_flight("http://a"), 0);
    }

    #[tokio::test]
    async fn test_process_without_client_still_completes() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Stream(vec!["x"]), 10);
        let task = admit(&h, "gpt-4").await;

        assert_eq!(h.dispatcher.process(task.clone()).await, TaskOutcome::Completed);
        assert_eq!(status(&h, &task.id).await, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_process_skips_claimed_task() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Stream(vec![]), 10);
        let task = admit(&h, "gpt-4").await;
        h.store
            .compare_and_set_status(&task.id, TaskStatus::Pending, TaskStatus::Running)
            .await
            .unwrap();

        assert_eq!(h.dispatcher.process(task).await, TaskOutcome::Skipped);
        assert!(h.upstream.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_process_claims_once() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Stream(vec!["x"]), 10);
        let task = admit(&h, "gpt-4").await;

        let (a, b) = tokio::join!(h.dispatcher.process(task.clone()), h.dispatcher.process(task.clone()));
        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|o| **o == TaskOutcome::Completed).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == TaskOutcome::Skipped).count(), 1);
        assert_eq!(h.upstream.calls().len(), 1);
    }

    // ===== Failure Paths =====

    #[tokio::test]
    async fn test_upstream_status_error_fails_task_and_counts_failure() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Status(500), 10);
        let task = admit(&h, "gpt-4").await;
        let stream = h.bridge.open(&task.id);

        let outcome = h.dispatcher.process(task.clone()).await;
        assert!(matches!(outcome, TaskOutcome::Failed(_)));

        let events = drain(stream).await;
        assert!(matches!(events.as_slice(), [StreamEvent::Error(msg)] if msg.contains("500")));
        assert_eq!(status(&h, &task.id).await, TaskStatus::Failed);

        let instance = h.directory.get_instances("gpt-4").await.unwrap()[0].clone();
        assert_eq!(instance.failure_count(), 1);
        assert_eq!(h.limiter.in_flight("http://a"), 0);
    }

    #[tokio::test]
    async fn test_broken_stream_forwards_chunks_then_error() {
        let h = harness(
            vec![record(1, "gpt-4", "http://a")],
            Script::BreakAfter(vec!["data: 1\n\n"]),
            10,
        );
        let task = admit(&h, "gpt-4").await;
        let stream = h.bridge.open(&task.id);

        h.dispatcher.process(task.clone()).await;

        let events = drain(stream).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StreamEvent::Error(_)));
        assert_eq!(status(&h, &task.id).await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_three_upstream_failures_open_circuit() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Status(502), 10);
        for _ in 0..3 {
            let task = admit(&h, "gpt-4").await;
            h.dispatcher.process(task).await;
        }

        let instance = h.directory.get_instances("gpt-4").await.unwrap()[0].clone();
        assert!(instance.is_circuit_open());
    }

    #[tokio::test]
    async fn test_no_instances_fails_without_penalty() {
        let h = harness(vec![], Script::Stream(vec![]), 10);
        let task = admit(&h, "gpt-4").await;
        let stream = h.bridge.open(&task.id);

        let outcome = h.dispatcher.process(task.clone()).await;
        assert_eq!(
            outcome,
            TaskOutcome::Failed("no instances configured for model: gpt-4".into())
        );
        assert_eq!(drain(stream).await.len(), 1);
        assert_eq!(status(&h, &task.id).await, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_saturated_instance_fails_with_server_busy() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Stream(vec![]), 1);
        let _held = h.limiter.try_acquire("http://a").unwrap();
        let task = admit(&h, "gpt-4").await;

        let outcome = h.dispatcher.process(task.clone()).await;
        assert!(matches!(outcome, TaskOutcome::Failed(ref m) if m.contains("server busy")));
        assert!(h.upstream.calls().is_empty());

        let instance = h.directory.get_instances("gpt-4").await.unwrap()[0].clone();
        assert_eq!(instance.failure_count(), 0);
        assert_eq!(h.limiter.in_flight("http://a"), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_only_instance_still_dispatched() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Stream(vec!["x"]), 10);
        let instance = h.directory.get_instances("gpt-4").await.unwrap()[0].clone();
        for _ in 0..3 {
            instance.record_failure();
        }

        let task = admit(&h, "gpt-4").await;
        assert_eq!(h.dispatcher.process(task).await, TaskOutcome::Completed);
        assert!(instance.is_healthy());
    }

    #[tokio::test]
    async fn test_failing_instance_is_routed_around() {
        let h = harness(
            vec![record(1, "gpt-4", "http://a"), record(2, "gpt-4", "http://b")],
            Script::Stream(vec!["x"]),
            10,
        );
        h.upstream.script("http://b", Script::Status(500));

        let mut outcomes = Vec::new();
        for _ in 0..10 {
            let task = admit(&h, "gpt-4").await;
            outcomes.push(h.dispatcher.process(task).await);
        }

        let calls = h.upstream.calls();
        assert_eq!(calls.iter().filter(|u| *u == "http://b").count(), 3);
        assert_eq!(calls.len(), 10);
        assert_eq!(outcomes.iter().filter(|o| **o == TaskOutcome::Completed).count(), 7);
        // Once the circuit is open only the healthy instance is used
        assert!(calls[6..].iter().all(|u| u == "http://a"));

        let list = h.directory.get_instances("gpt-4").await.unwrap();
        assert!(list[1].is_circuit_open());
        assert_eq!(list[0].failure_count(), 0);
    }

    // ===== Cancellation =====

    #[tokio::test]
    async fn test_client_drop_cancels_without_penalty() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Hang, 10);
        let task = admit(&h, "gpt-4").await;
        let stream = h.bridge.open(&task.id);

        let d = h.dispatcher.clone();
        let t = task.clone();
        let worker = tokio::spawn(async move { d.process(t).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.limiter.in_flight("http://a"), 1);
        drop(stream);

        let outcome = tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(status(&h, &task.id).await, TaskStatus::Failed);
        assert_eq!(h.limiter.in_flight("http://a"), 0);
        assert!(h.upstream.hang_dropped());

        let instance = h.directory.get_instances("gpt-4").await.unwrap()[0].clone();
        assert_eq!(instance.failure_count(), 0);
    }

    // ===== Drain Loop =====

    #[tokio::test]
    async fn test_drain_loop_processes_queue() {
        let h = harness(vec![record(1, "gpt-4", "http://a")], Script::Stream(vec!["x"]), 10);
        let req = ChatRequest::new("gpt-4", json!([]));
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(h.queue.submit(&req).await.unwrap().task().id.clone());
        }

        let handle = h.dispatcher.clone().start();

        for id in &ids {
            let mut done = false;
            for _ in 0..100 {
                if status(&h, id).await == TaskStatus::Completed {
                    done = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert!(done, "task {} never completed", id);
        }

        h.dispatcher.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_queued_clients() {
        let h = harness_with_workers(vec![record(1, "gpt-4", "http://a")], Script::Hang, 10, 1);
        let handle = h.dispatcher.clone().start();

        // Occupy the only worker
        let busy = admit(&h, "gpt-4").await;
        let _busy_stream = h.bridge.open(&busy.id);
        h.queue.enqueue(busy.clone()).await.unwrap();
        for _ in 0..100 {
            if status(&h, &busy.id).await == TaskStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status(&h, &busy.id).await, TaskStatus::Running);

        let queued = admit(&h, "gpt-4").await;
        let mut stream = h.bridge.open(&queued.id);
        h.queue.enqueue(queued.clone()).await.unwrap();

        h.dispatcher.shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), stream.next()).await.unwrap();
        assert_eq!(event, Some(StreamEvent::Error(SHUTDOWN_MESSAGE.to_string())));
        assert_eq!(stream.next().await, None);

        // Left for the next start to recover
        assert_eq!(status(&h, &queued.id).await, TaskStatus::Pending);
        assert!(!h.bridge.has_channel(&queued.id));
    }
}

//! llm-gateway - Admission, dispatch and backend health for LLM backends
//!
//! This is the composition root that wires together all the components.

use llm_gateway::adapters::inbound::ApiServer;
use llm_gateway::adapters::outbound::{
    DashMapTaskStore, HttpUpstreamClient, SqliteDb, SqliteInstanceRepository, SqliteTaskStore,
};
use llm_gateway::application::{Dispatcher, GatewayService, InstanceDirectory, TaskQueue};
use llm_gateway::config::{load_config, TaskStoreKind};
use llm_gateway::domain::ports::{InstanceRepository, TaskStore, UpstreamClient};
use llm_gateway::infrastructure::{
    shutdown_signal, ConcurrencyLimiter, HealthProber, ProbeConfig, ShutdownController,
    StreamBridge,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting llm-gateway listen={} db={} store={:?} workers={}",
        cfg.listen_addr,
        cfg.db_path,
        cfg.task_store,
        cfg.workers
    );

    // ===== COMPOSITION ROOT =====
    // Wire up all adapters and services

    let shutdown = ShutdownController::new();

    // 1. Create outbound adapters

    // Shared SQLite database (instances, providers, tasks)
    let db = SqliteDb::open(&cfg.db_path)?;

    // Task store (SQLite or in-memory)
    let task_store: Arc<dyn TaskStore> = match cfg.task_store {
        TaskStoreKind::Sqlite => Arc::new(SqliteTaskStore::new(db.clone())),
        TaskStoreKind::Memory => {
            tracing::warn!("using in-memory task store, pending tasks will not survive restart");
            Arc::new(DashMapTaskStore::new())
        }
    };

    // Instance repository (SQLite)
    let instance_repo: Arc<dyn InstanceRepository> =
        Arc::new(SqliteInstanceRepository::new(db.clone()));

    // Upstream HTTP client
    let upstream: Arc<dyn UpstreamClient> = Arc::new(HttpUpstreamClient::new(
        Duration::from_secs(cfg.connect_timeout_secs),
    )?);

    // 2. Create application state

    // Instance directory, warmed with every model in the repository
    let directory = Arc::new(InstanceDirectory::new(instance_repo.clone()));
    match directory.refresh_all().await {
        Ok(count) => tracing::info!("instance directory loaded, instances={}", count),
        Err(e) => tracing::warn!("instance directory warm-up failed: {}", e),
    }

    // Task queue, re-enqueuing tasks left pending by a previous run
    let queue = Arc::new(TaskQueue::new(task_store, cfg.queue_capacity));
    let report = queue.recover().await?;
    tracing::info!(
        "task queue ready, capacity={} recovered={} skipped={}",
        cfg.queue_capacity,
        report.recovered,
        report.skipped
    );

    let limiter = Arc::new(ConcurrencyLimiter::new(cfg.max_in_flight));
    let bridge = Arc::new(StreamBridge::new(cfg.stream_buffer));

    // 3. Start background workers

    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        directory.clone(),
        limiter,
        upstream.clone(),
        bridge.clone(),
        cfg.workers,
        shutdown.clone(),
    ));
    let dispatcher_handle = dispatcher.start();

    let refresh_handle = directory.clone().start_refresh(
        Duration::from_secs(cfg.directory_refresh_secs),
        shutdown.subscribe(),
    );

    let prober = Arc::new(HealthProber::new(
        ProbeConfig {
            interval: Duration::from_secs(cfg.probe_interval_secs),
            idle_threshold: Duration::from_secs(cfg.probe_idle_secs),
            timeout: Duration::from_secs(cfg.probe_timeout_secs),
        },
        directory.clone(),
        upstream,
    ));
    let prober_handle = prober.start(shutdown.subscribe());

    // 4. Create inbound adapter (HTTP API)

    let service = Arc::new(GatewayService::new(queue, directory, bridge, instance_repo));
    let server = ApiServer::new(cfg.listen_addr.clone(), service);

    // ===== START SERVER =====

    tokio::spawn(shutdown_signal(shutdown.clone()));

    let drain_timeout = Duration::from_secs(cfg.drain_timeout_secs);
    server.run(shutdown.clone(), drain_timeout).await?;

    // Server returned: make sure every loop sees the flag, then drain workers
    shutdown.shutdown();
    let drained = shutdown.wait_for_drain(drain_timeout).await;
    if !drained {
        tracing::warn!(
            "drain timeout reached, in_flight={}",
            shutdown.in_flight()
        );
    }

    let _ = tokio::join!(dispatcher_handle, refresh_handle, prober_handle);
    tracing::info!("llm-gateway stopped");

    Ok(())
}

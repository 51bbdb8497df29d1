use serde::Deserialize;
use std::str::FromStr;

/// Backing store for chat tasks.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStoreKind {
    /// Durable tasks in the SQLite database at `db_path`
    Sqlite,
    /// In-process only; pending tasks are lost on restart
    Memory,
}

impl TaskStoreKind {
    fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" | "dashmap" => Self::Memory,
            _ => Self::Sqlite,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // HTTP surface
    pub listen_addr: String,
    pub debug: bool,

    // Storage
    pub db_path: String,
    pub task_store: TaskStoreKind,

    // Admission and dispatch
    pub queue_capacity: usize,
    pub workers: usize,
    pub max_in_flight: usize,
    pub stream_buffer: usize,

    // Backend health
    pub directory_refresh_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_idle_secs: u64,
    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    // Shutdown
    pub drain_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            debug: false,
            db_path: "gateway.db".to_string(),
            task_store: TaskStoreKind::Sqlite,
            queue_capacity: 10_000,
            workers: 20,
            max_in_flight: 10,
            stream_buffer: 256,
            directory_refresh_secs: 60,
            probe_interval_secs: 30,
            probe_idle_secs: 60,
            probe_timeout_secs: 10,
            connect_timeout_secs: 10,
            drain_timeout_secs: 30,
        }
    }
}

/// Read `key`, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let listen_addr = std::env::var("GATEWAY_LISTEN_ADDR").unwrap_or(defaults.listen_addr);

    let db_path = std::env::var("GATEWAY_DB_PATH").unwrap_or(defaults.db_path);

    let task_store = std::env::var("GATEWAY_TASK_STORE")
        .map(|v| TaskStoreKind::parse(&v))
        .unwrap_or(defaults.task_store);

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        listen_addr,
        debug,
        db_path,
        task_store,
        queue_capacity: env_or("GATEWAY_QUEUE_CAPACITY", defaults.queue_capacity),
        workers: env_or("GATEWAY_WORKERS", defaults.workers),
        max_in_flight: env_or("GATEWAY_MAX_IN_FLIGHT", defaults.max_in_flight),
        stream_buffer: env_or("GATEWAY_STREAM_BUFFER", defaults.stream_buffer),
        directory_refresh_secs: env_or("GATEWAY_DIRECTORY_REFRESH_SECS", defaults.directory_refresh_secs),
        probe_interval_secs: env_or("GATEWAY_PROBE_INTERVAL_SECS", defaults.probe_interval_secs),
        probe_idle_secs: env_or("GATEWAY_PROBE_IDLE_SECS", defaults.probe_idle_secs),
        probe_timeout_secs: env_or("GATEWAY_PROBE_TIMEOUT_SECS", defaults.probe_timeout_secs),
        connect_timeout_secs: env_or("GATEWAY_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
        drain_timeout_secs: env_or("GATEWAY_DRAIN_TIMEOUT_SECS", defaults.drain_timeout_secs),
    })
}

//! Domain Errors
//!
//! Error taxonomy shared by the admission, dispatch and health subsystems.
//! Adapters translate driver errors into these types at the boundary.

/// Errors surfaced by the gateway use cases.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no instances configured for model: {0}")]
    NoInstancesConfigured(String),
    #[error("all instances are down for model: {0}")]
    AllInstancesDown(String),
    #[error("server busy: in-flight limit reached for {0}")]
    ServerBusy(String),
    #[error("system busy: task queue full")]
    SystemBusy,
    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("invalid request payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Overload signals the client is expected to retry.
    pub fn is_overload(&self) -> bool {
        matches!(self, Self::ServerBusy(_) | Self::SystemBusy)
    }

    /// Stable machine-readable error type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoInstancesConfigured(_) => "no_instances_configured",
            Self::AllInstancesDown(_) => "all_instances_down",
            Self::ServerBusy(_) => "server_busy",
            Self::SystemBusy => "system_busy",
            Self::Upstream(_) => "upstream_error",
            Self::InvalidPayload(_) | Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Store(StoreError::DuplicateKey(_)) => "conflict",
            Self::Store(StoreError::Backend(_)) => "store_error",
        }
    }
}

/// Errors from the persistent stores.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Unique constraint on the idempotency key (or instance URL) was hit.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),
    #[error("storage error: {0}")]
    Backend(String),
}

/// Errors from a proxied backend call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    Stream(String),
}

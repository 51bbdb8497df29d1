//! Gateway API Server
//!
//! HTTP surface of the gateway: OpenAI-style chat submission streamed back
//! as server-sent events, task lookup, and the admin endpoints for the
//! instance configuration.

use crate::application::{GatewayService, RegisterInstance, Submission};
use crate::domain::errors::{GatewayError, StoreError};
use crate::domain::entities::ChatRequest;
use crate::infrastructure::{ShutdownController, StreamEvent};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Response header carrying the ID of a newly admitted task.
pub const TASK_ID_HEADER: &str = "x-task-id";

/// API Server state.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<GatewayService>,
}

#[derive(Debug, Deserialize)]
struct ActiveRequest {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct WeightRequest {
    weight: u32,
}

/// Error response in the OpenAI error envelope.
struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::SystemBusy | GatewayError::ServerBusy(_) | GatewayError::AllInstancesDown(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::NoInstancesConfigured(_) | GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidPayload(_) | GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(StoreError::DuplicateKey(_)) => StatusCode::CONFLICT,
            GatewayError::Store(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self.0);
        }
        (status, Json(error_body(&self.0.to_string(), self.0.kind()))).into_response()
    }
}

fn error_body(message: &str, kind: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "message": message,
            "type": kind,
        }
    })
}

/// Wire form of one stream event.
fn sse_frame(event: StreamEvent) -> Bytes {
    match event {
        StreamEvent::Chunk(bytes) => bytes,
        StreamEvent::Error(message) => {
            Bytes::from(format!("data: {}\n\n", error_body(&message, "gateway_error")))
        }
    }
}

/// API Server.
pub struct ApiServer {
    listen_addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: String, service: Arc<GatewayService>) -> Self {
        Self {
            listen_addr,
            state: ApiState { service },
        }
    }

    pub fn state(&self) -> ApiState {
        self.state.clone()
    }

    /// Build the route table.
    pub fn router(state: ApiState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            // Client API
            .route("/v1/chat/completions", post(chat_handler))
            .route("/v1/tasks/:id", get(task_handler))
            // Admin
            .route("/admin/monitor", get(monitor_handler))
            .route("/admin/instances", post(register_handler))
            .route("/admin/instances/:id/active", put(active_handler))
            .route("/admin/instances/:id/weight", put(weight_handler))
            .route("/admin/models/:model/refresh", post(refresh_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until shutdown is initiated.
    ///
    /// Open responses get `grace` to finish once shutdown begins.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController, grace: Duration) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("gateway API listening on {}", self.listen_addr);

        Self::serve(listener, self.state.clone(), shutdown, grace).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(
        listener: TcpListener,
        state: ApiState,
        shutdown: ShutdownController,
        grace: Duration,
    ) -> anyhow::Result<()> {
        let signal = shutdown.clone();
        let server = axum::serve(listener, Self::router(state))
            .with_graceful_shutdown(async move { signal.wait().await })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            res = &mut server => return Ok(res?),
            _ = shutdown.wait() => {}
        }

        match tokio::time::timeout(grace, server).await {
            Ok(res) => res?,
            Err(_) => tracing::warn!("connections still open after {:?}, closing server", grace),
        }
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_depth": state.service.queue_depth(),
    }))
}

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    match state.service.submit(req).await? {
        Submission::Replay(task) => {
            tracing::debug!("replayed task {}", task.id);
            Ok(Json(serde_json::json!({
                "task_id": task.id,
                "status": task.status,
                "replayed": true,
            }))
            .into_response())
        }
        Submission::Stream { task_id, stream } => {
            let body = Body::from_stream(stream.map(|event| Ok::<_, Infallible>(sse_frame(event))));
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/event-stream".to_string()),
                    (header::CACHE_CONTROL, "no-cache".to_string()),
                    (HeaderName::from_static(TASK_ID_HEADER), task_id),
                ],
                body,
            )
                .into_response())
        }
    }
}

async fn task_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.service.task(&id).await?;
    Ok(Json(serde_json::json!({
        "task_id": task.id,
        "idempotency_key": task.idempotency_key,
        "model": task.model,
        "status": task.status,
        "created_at_ms": task.created_at_ms,
        "updated_at_ms": task.updated_at_ms,
    })))
}

async fn monitor_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.monitor())
}

async fn register_handler(
    State(state): State<ApiState>,
    Json(req): Json<RegisterInstance>,
) -> Result<impl IntoResponse, ApiError> {
    let model = req.model.clone();
    let url = req.url.clone();
    let id = state.service.register_instance(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": id,
            "model": model,
            "url": url,
        })),
    ))
}

async fn active_handler(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<ActiveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.set_active(id, req.active).await?;
    Ok(Json(serde_json::json!({ "id": id, "active": req.active })))
}

async fn weight_handler(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<WeightRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.set_weight(id, req.weight).await?;
    Ok(Json(serde_json::json!({ "id": id, "weight": req.weight })))
}

async fn refresh_handler(
    State(state): State<ApiState>,
    Path(model): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instances = state.service.refresh_model(&model).await?;
    Ok(Json(serde_json::json!({ "model": model, "instances": instances })))
}

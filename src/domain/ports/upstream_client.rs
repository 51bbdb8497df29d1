//! Upstream Client Port
//!
//! Outbound HTTP calls to model backends.

use crate::domain::entities::Instance;
use crate::domain::errors::UpstreamError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Raw response body chunks of a streaming backend call.
pub type ChunkStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

/// Client for chat completion backends.
///
/// Implementations resolve the endpoint and credential header from the
/// instance's provider kind.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Start a streaming chat call.
    ///
    /// Resolves once response headers arrive. A non-2xx status or a
    /// connect error is returned as `Err`; errors after that surface as
    /// items of the stream. Dropping the stream aborts the call.
    async fn stream_chat(&self, instance: &Instance, body: &str) -> Result<ChunkStream, UpstreamError>;

    /// Send a small non-streaming request and return the HTTP status.
    async fn probe(&self, instance: &Instance, body: &str) -> Result<u16, UpstreamError>;
}

//! HTTP Upstream Client
//!
//! Implements UpstreamClient with reqwest. The instance's provider kind
//! decides the endpoint path and the credential header.

use crate::domain::entities::Instance;
use crate::domain::errors::UpstreamError;
use crate::domain::ports::{ChunkStream, UpstreamClient};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;

/// Longest error body kept from a failed backend response.
const MAX_ERROR_BODY: usize = 512;

/// reqwest-backed backend client.
///
/// Only the connect phase has a timeout: a streaming completion may run
/// for minutes.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| UpstreamError::Request(format!("client error: {}", e)))?;
        Ok(Self { client })
    }

    fn request(&self, instance: &Instance, body: &str) -> reqwest::RequestBuilder {
        let (header, value) = instance.provider.auth_header(&instance.api_key);
        self.client
            .post(instance.provider.endpoint(&instance.url))
            .header(header, value)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn stream_chat(&self, instance: &Instance, body: &str) -> Result<ChunkStream, UpstreamError> {
        let resp = self
            .request(instance, body)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let mut text = resp.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(resp
            .bytes_stream()
            .map_err(|e| UpstreamError::Stream(e.to_string()))
            .boxed())
    }

    async fn probe(&self, instance: &Instance, body: &str) -> Result<u16, UpstreamError> {
        let resp = self
            .request(instance, body)
            .send()
            .await
            .map_err(|e| UpstreamError::Request(e.to_string()))?;
        Ok(resp.status().as_u16())
    }
}

//! Clients for the two external collaborators.
//!
//! The completion service turns a formatted conversation into a response;
//! the image service turns a response into a base64-encoded picture. Both
//! sit behind traits so the session can be driven by in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::formatter::CompletionRequest;

/// Successful response from the completion service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Response text.
    pub message: String,
    /// Tokens consumed by the request.
    #[serde(default)]
    pub tokens: u64,
}

/// Image fetched for a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArtifact {
    /// Prompt the image was fetched for.
    pub prompt: String,
    /// Base64-encoded PNG payload.
    pub base64: String,
}

impl ImageArtifact {
    /// Inline URL suitable for an `<img src>` or similar.
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.base64)
    }
}

/// Remote service producing a response for a conversation.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ClientError>;
}

/// Remote service producing an image for a prompt.
#[async_trait]
pub trait ImageService: Send + Sync {
    async fn fetch_image(&self, prompt: &str) -> Result<ImageArtifact, ClientError>;
}

/// Completion service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    url: String,
}

impl HttpCompletionClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Share an existing connection pool.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl CompletionService for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ClientError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(ClientError::Decode)
    }
}

/// Image service reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpImageClient {
    client: reqwest::Client,
    url: String,
}

impl HttpImageClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    /// Share an existing connection pool.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ImageService for HttpImageClient {
    async fn fetch_image(&self, prompt: &str) -> Result<ImageArtifact, ClientError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("prompt", prompt)])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let base64 = body.trim();
        if base64.is_empty() {
            return Err(ClientError::EmptyBody);
        }
        Ok(ImageArtifact {
            prompt: prompt.to_string(),
            base64: base64.to_string(),
        })
    }
}

/// Errors talking to an external service.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not the expected JSON.
    #[error("invalid response body: {0}")]
    Decode(#[source] serde_json::Error),

    /// The service answered with an empty body.
    #[error("service returned an empty body")]
    EmptyBody,

    /// No answer within the configured time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

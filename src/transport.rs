use crate::constants::SESSION_ID_HEADER;
use crate::types::{AnswerRequest, CiteflowError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// An opened response: its raw body plus whatever session id the transport
/// layer itself reported.
pub struct TransportResponse {
    pub session_id: Option<String>,
    pub body: ByteStream,
}

impl TransportResponse {
    pub fn new(body: ByteStream) -> Self {
        Self {
            session_id: None,
            body,
        }
    }
}

/// Opens the answer stream for one request. Errors returned here are transport
/// failures (refused, timed out, non-2xx); the engine recovers from them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, request: &AnswerRequest, deadline: Duration) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &AnswerRequest, deadline: Duration) -> Result<TransportResponse> {
        tracing::debug!("[⚙️  -> ☁️ ] POST {}", self.url);
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .timeout(deadline)
            .json(request)
            .send()
            .await
            .map_err(CiteflowError::Network)?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            return Err(CiteflowError::Upstream(status, body).into());
        }

        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let body = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));

        Ok(TransportResponse {
            session_id,
            body: Box::pin(body),
        })
    }
}

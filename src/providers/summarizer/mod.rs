//! AI conversation summarizer collaborator.
//!
//! The interesting part is the seam: callers hand over the last N
//! messages and get a short summary back. The HTTP implementation talks
//! to an external model endpoint through the retry engine with a
//! per-request deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chat::{ConversationId, Message};
use crate::errors::{Result, TetherError};
use crate::retry::Retrier;

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, conversation: ConversationId, messages: &[Message]) -> Result<String>;
}

#[derive(Serialize)]
struct SummaryRequest<'a> {
    conversation_id: ConversationId,
    messages: Vec<MessageLine<'a>>,
}

#[derive(Serialize)]
struct MessageLine<'a> {
    sender: String,
    content: &'a str,
}

#[derive(Deserialize)]
struct SummaryResponse {
    summary: String,
}

pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    retrier: Arc<Retrier>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl HttpSummarizer {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        retrier: Arc<Retrier>,
        cancel: CancellationToken,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            retrier,
            cancel,
            request_timeout,
        }
    }

    async fn attempt(&self, body: &serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(TetherError::RateLimited { retry_after });
        }
        if !(200..300).contains(&status) {
            return Err(TetherError::transient(
                format!("summarizer answered status {}", status),
                Some(status),
            ));
        }

        let parsed: SummaryResponse = response
            .json()
            .await
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("summarizer response: {}", e)))?;
        Ok(parsed.summary)
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, conversation: ConversationId, messages: &[Message]) -> Result<String> {
        if messages.is_empty() {
            return Err(TetherError::validation(
                "messages",
                "nothing to summarize",
            ));
        }
        let request = SummaryRequest {
            conversation_id: conversation,
            messages: messages
                .iter()
                .map(|m| MessageLine {
                    sender: m.sender.to_string(),
                    content: &m.content,
                })
                .collect(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| TetherError::Internal(anyhow::anyhow!("summary request: {}", e)))?;

        debug!(
            "summarizing {} messages in conversation {}",
            messages.len(),
            conversation
        );
        self.retrier
            .run(&self.cancel, |_| self.attempt(&body))
            .await
    }
}

/// Transport-level failures (timeout, connect, reset) are retryable;
/// anything else — TLS setup, malformed URL, body building — is not.
fn classify_reqwest_error(e: reqwest::Error) -> TetherError {
    if e.is_timeout() || e.is_connect() || (e.is_request() && e.status().is_none()) {
        TetherError::transient(e.to_string(), e.status().map(|s| s.as_u16()))
    } else {
        TetherError::Internal(anyhow::anyhow!("summarizer call failed: {}", e))
    }
}

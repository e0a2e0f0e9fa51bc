//! Fallback Router
//!
//! Forwards an [`InboundMessage`] to the configured processor endpoints in
//! priority order. The first well-formed, non-empty reply wins; every
//! remaining endpoint is skipped. When the whole chain fails the user still
//! gets the fixed apology text, never silence.

use crate::error::ProcessorFailure;
use crate::whatsapp::InboundMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reply sent when every processor failed.
pub const DEFAULT_APOLOGY: &str =
    "Sorry, I'm having trouble answering right now. Please try again in a few minutes.";

/// One backend processor. Lower `priority` is tried first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorEndpoint {
    pub name: String,
    pub url: String,
    pub timeout_ms: u64,
    pub priority: u32,
}

impl ProcessorEndpoint {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessorRequest<'a> {
    sender_id: &'a str,
    text: &'a str,
    display_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct ProcessorResponse {
    reply: Option<String>,
}

/// Which endpoint produced the reply, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySource {
    Endpoint(String),
    Apology,
}

#[derive(Debug, Clone)]
pub struct RoutedReply {
    pub text: String,
    pub source: ReplySource,
    /// Endpoints that were called, in order.
    pub attempted: Vec<String>,
}

pub struct FallbackRouter {
    client: reqwest::Client,
    endpoints: Vec<ProcessorEndpoint>,
    apology: String,
}

impl FallbackRouter {
    /// Endpoints are sorted by priority; ties keep their configured order.
    pub fn new(mut endpoints: Vec<ProcessorEndpoint>, apology: impl Into<String>) -> Self {
        endpoints.sort_by_key(|e| e.priority);
        Self {
            client: reqwest::Client::new(),
            endpoints,
            apology: apology.into(),
        }
    }

    pub fn endpoints(&self) -> &[ProcessorEndpoint] {
        &self.endpoints
    }

    /// Walk the chain. Never fails: exhaustion yields the apology text.
    pub async fn route(&self, message: &InboundMessage) -> RoutedReply {
        let mut attempted = Vec::with_capacity(self.endpoints.len());

        for endpoint in &self.endpoints {
            attempted.push(endpoint.name.clone());
            match self.call(endpoint, message).await {
                Ok(reply) => {
                    tracing::info!(
                        "Router: reply for {} from '{}' ({} chars)",
                        message.sender_id,
                        endpoint.name,
                        reply.len()
                    );
                    return RoutedReply {
                        text: reply,
                        source: ReplySource::Endpoint(endpoint.name.clone()),
                        attempted,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        "Router: processor '{}' failed for {}: {}",
                        endpoint.name,
                        message.sender_id,
                        e
                    );
                }
            }
        }

        tracing::error!(
            "Router: all {} processor(s) failed for {}, sending apology",
            self.endpoints.len(),
            message.sender_id
        );
        RoutedReply {
            text: self.apology.clone(),
            source: ReplySource::Apology,
            attempted,
        }
    }

    /// One bounded call, no retries.
    async fn call(
        &self,
        endpoint: &ProcessorEndpoint,
        message: &InboundMessage,
    ) -> Result<String, ProcessorFailure> {
        let body = ProcessorRequest {
            sender_id: &message.sender_id,
            text: &message.text,
            display_name: &message.display_name,
        };

        let request = self
            .client
            .post(&endpoint.url)
            .timeout(endpoint.timeout())
            .json(&body)
            .send();

        // reqwest's timeout covers the body too, but an outer bound keeps
        // slow-drip responses from stretching past the endpoint budget
        let response = tokio::time::timeout(endpoint.timeout(), async {
            let response = request.await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProcessorFailure::Status(status.as_u16()));
            }
            let bytes = response.bytes().await?;
            Ok::<_, ProcessorFailure>(bytes)
        })
        .await
        .map_err(|_| ProcessorFailure::Timeout)??;

        let parsed: ProcessorResponse = serde_json::from_slice(&response)
            .map_err(|e| ProcessorFailure::Malformed(e.to_string()))?;

        match parsed.reply {
            Some(reply) if !reply.trim().is_empty() => Ok(reply),
            Some(_) => Err(ProcessorFailure::EmptyReply),
            None => Err(ProcessorFailure::Malformed("missing 'reply' field".to_string())),
        }
    }
}

//! Model Gateway - invokes a single external model endpoint.
//!
//! The [`ModelGateway`] trait is the seam between the council pipeline and
//! the network. The production implementation talks to OpenRouter
//! ([`openrouter::OpenRouterGateway`]); tests substitute a scripted mock.
//!
//! Error taxonomy: [`GatewayError::Transient`] (rate limits, 5xx,
//! timeouts) is retried inside the gateway with bounded exponential
//! backoff; [`GatewayError::Permanent`] (bad model id, malformed request
//! or reply) is not. Exhausted retries surface as a normal stage-level
//! failure for that one model, isolated from the rest of the fan-out.

pub mod openrouter;

pub use openrouter::OpenRouterGateway;

use async_trait::async_trait;
use std::time::Duration;

/// Provider errors, normalized into retryable and non-retryable classes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Retryable: rate limits, 5xx responses, timeouts, connection failures
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Not retryable: invalid model id, malformed request or response
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// One turn of a chat prompt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

/// A completed model call: response text plus accounting.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    /// Estimated cost in USD, derived from token usage and the pricing table
    pub cost: f64,
    pub latency_ms: u64,
    /// Provider generation id, when one was returned; used to reconcile
    /// the estimate against the provider's billed cost later
    pub generation_id: Option<String>,
}

/// Invokes a single external model endpoint with a prompt.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Send `messages` to `model`, waiting at most `timeout` per attempt.
    ///
    /// Transient failures are retried internally; the returned error is
    /// final for this call.
    async fn invoke(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<ModelReply, GatewayError>;

    /// The provider's billed cost for a finished generation, once it has
    /// been computed. `None` when the provider has no figure (yet); the
    /// caller keeps its estimate in that case.
    async fn actual_cost(&self, _generation_id: &str) -> Result<Option<f64>, GatewayError> {
        Ok(None)
    }
}

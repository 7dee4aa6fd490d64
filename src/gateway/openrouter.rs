//! OpenRouter-backed gateway implementation.
//!
//! Posts to `{base_url}/chat/completions` with usage accounting enabled and
//! derives an estimated cost from the returned token counts and the
//! configured pricing table. Transient failures (429, 5xx, timeouts,
//! connection errors) are retried with bounded exponential backoff before
//! the error is surfaced to the caller.

use super::{ChatMessage, GatewayError, ModelGateway, ModelReply};
use crate::config::{PricingConfig, SharedConfig};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// HTTP client for the OpenRouter chat completions API.
#[derive(Clone)]
pub struct OpenRouterGateway {
    http: reqwest::Client,
    api_key: String,
    config: SharedConfig,
}

/// Relevant subset of the chat completions response.
#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Relevant subset of the generation metadata endpoint.
#[derive(Debug, Deserialize)]
struct GenerationResponse {
    data: GenerationData,
}

#[derive(Debug, Deserialize)]
struct GenerationData {
    #[serde(default)]
    total_cost: Option<f64>,
}

impl OpenRouterGateway {
    /// Create a gateway. The config handle is read per call, so pricing and
    /// endpoint changes apply without rebuilding the gateway.
    pub fn new(api_key: String, config: SharedConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Permanent(format!("could not build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key,
            config,
        })
    }

    /// One request attempt, without retry.
    async fn attempt(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
        base_url: &str,
        pricing: &PricingConfig,
    ) -> Result<ModelReply, GatewayError> {
        let payload = serde_json::json!({
            "model": model,
            "messages": messages,
            "usage": { "include": true },
        });

        let started = Instant::now();
        let response = self
            .http
            .post(format!("{}/chat/completions", base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let summary = format!("{model}: HTTP {status}: {}", truncate(&body, 200));
            return Err(if is_retryable_status(status) {
                GatewayError::Transient(summary)
            } else {
                GatewayError::Permanent(summary)
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Permanent(format!("{model}: malformed response: {e}")))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let text = completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                GatewayError::Permanent(format!("{model}: response contained no message content"))
            })?;

        let usage = completion.usage.unwrap_or_default();
        let cost = estimate_cost(pricing, model, usage.prompt_tokens, usage.completion_tokens);

        Ok(ModelReply {
            text,
            cost,
            latency_ms,
            generation_id: completion.id,
        })
    }
}

#[async_trait]
impl ModelGateway for OpenRouterGateway {
    async fn invoke(
        &self,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<ModelReply, GatewayError> {
        let config = self.config.snapshot();
        let base_url = config.gateway.base_url.clone();
        let max_retries = config.gateway.max_retries;
        let backoff_base = Duration::from_millis(config.gateway.backoff_base_ms);

        let mut attempt_no = 0;
        loop {
            match self
                .attempt(model, messages, timeout, &base_url, &config.pricing)
                .await
            {
                Ok(reply) => {
                    debug!(
                        model = model,
                        latency_ms = reply.latency_ms,
                        cost = reply.cost,
                        "Model call completed"
                    );
                    return Ok(reply);
                }
                Err(e) if e.is_transient() && attempt_no < max_retries => {
                    let delay = backoff_base * 2u32.saturating_pow(attempt_no);
                    warn!(
                        model = model,
                        attempt = attempt_no + 1,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt_no += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One GET against the generation metadata endpoint. The figure is
    /// absent until the provider has finished billing the generation, and
    /// a missing figure is not an error.
    async fn actual_cost(&self, generation_id: &str) -> Result<Option<f64>, GatewayError> {
        let config = self.config.snapshot();
        let base_url = config.gateway.base_url.trim_end_matches('/').to_string();
        let timeout = Duration::from_secs(config.gateway.probe_timeout_secs);

        let response = self
            .http
            .get(format!("{base_url}/generation"))
            .query(&[("id", generation_id)])
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            debug!(
                generation_id = generation_id,
                status = %response.status(),
                "No billed cost available for generation"
            );
            return Ok(None);
        }

        let generation: GenerationResponse = response.json().await.map_err(|e| {
            GatewayError::Permanent(format!("malformed generation response: {e}"))
        })?;
        Ok(generation.data.total_cost.filter(|cost| *cost > 0.0))
    }
}

/// Estimated cost in USD from token counts and per-1M-token rates.
pub fn estimate_cost(
    pricing: &PricingConfig,
    model: &str,
    prompt_tokens: u64,
    completion_tokens: u64,
) -> f64 {
    let rate = pricing.rate_for(model);
    let input_cost = (prompt_tokens as f64 / 1_000_000.0) * rate.input;
    let output_cost = (completion_tokens as f64 / 1_000_000.0) * rate.output;
    input_cost + output_cost
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn classify_reqwest_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() || e.is_connect() {
        GatewayError::Transient(e.to_string())
    } else if e.is_builder() || e.is_request() {
        GatewayError::Permanent(e.to_string())
    } else {
        // Body/decode errors mid-transfer are worth one more try.
        GatewayError::Transient(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

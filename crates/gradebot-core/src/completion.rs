//! Remote completion client.
//!
//! [`CompletionClient`] is the seam the grading pipeline calls through;
//! [`HttpCompletionClient`] implements it against an OpenAI-compatible
//! `/chat/completions` endpoint (OpenRouter in the default
//! configuration). The assembled grading prompt travels as a single
//! user message; sampling knobs map onto the standard request fields,
//! with `max_tokens` truncated to an integer at this boundary.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::config::SamplingParams;
use crate::error::CoreError;

/// One completion call: which model, what prompt, which knobs.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model identifier understood by the remote service.
    pub model: String,

    /// Fully assembled prompt (rubric + submission content).
    pub prompt: String,

    /// Sampling knob values for this call.
    pub params: SamplingParams,
}

/// Performs a completion call against a remote service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run the completion and return the generated text.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::RemoteCall` for transport failures, error
    /// statuses, timeouts, and empty responses.
    async fn complete(&self, request: CompletionRequest) -> Result<String, CoreError>;
}

// ── Wire types (OpenAI-compatible chat completions) ──────────

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

impl<'a> ChatCompletionsRequest<'a> {
    fn from_request(request: &'a CompletionRequest) -> Self {
        let params = &request.params;
        Self {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: params.temperature,
            // Carried as a float everywhere else; the wire wants an
            // integer. Negative or absurd values clamp to zero.
            max_tokens: params.max_tokens.max(0.0) as u32,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

// ── HTTP implementation ──────────────────────────────────────

/// Completion client over an OpenAI-compatible HTTP endpoint.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl HttpCompletionClient {
    /// Create a client for `base_url` (e.g.
    /// `https://openrouter.ai/api/v1`) authenticating with `api_key`.
    /// Every call is bounded by `timeout`.
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    #[instrument(skip_all, fields(model = %request.model, prompt_chars = request.prompt.len()))]
    async fn complete(&self, request: CompletionRequest) -> Result<String, CoreError> {
        let body = ChatCompletionsRequest::from_request(&request);

        debug!(endpoint = %self.endpoint(), "sending completion request");

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "completion request failed");
                if e.is_timeout() {
                    CoreError::RemoteCall(format!(
                        "timed out after {} s",
                        self.timeout.as_secs()
                    ))
                } else {
                    CoreError::RemoteCall(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            error!(status = %status, "completion service returned an error");
            return Err(CoreError::RemoteCall(format!(
                "service returned {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: ChatCompletionsResponse = response
            .json()
            .await
            .map_err(|e| CoreError::RemoteCall(format!("malformed response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| CoreError::RemoteCall("service returned no text".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "qwen/qwen3-235b-a22b:free".to_owned(),
            prompt: "grade this".to_owned(),
            params: SamplingParams::default(),
        }
    }

    #[test]
    fn test_should_serialize_wire_request_shape() {
        let request = request();
        let body = ChatCompletionsRequest::from_request(&request);
        let json = serde_json::to_value(&body).expect("should serialize");

        assert_eq!(json["model"], "qwen/qwen3-235b-a22b:free");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "grade this");
        assert_eq!(json["temperature"], 0.1);
        // max_tokens crosses the wire as an integer.
        assert_eq!(json["max_tokens"], 4000);
        assert_eq!(json["top_p"], 1.0);
        assert_eq!(json["frequency_penalty"], 0.0);
        assert_eq!(json["presence_penalty"], 0.0);
    }

    #[test]
    fn test_should_clamp_negative_max_tokens_to_zero() {
        let mut request = request();
        request.params.max_tokens = -5.0;

        let body = ChatCompletionsRequest::from_request(&request);
        let json = serde_json::to_value(&body).expect("should serialize");
        assert_eq!(json["max_tokens"], 0);
    }

    #[test]
    fn test_should_deserialize_response_content() {
        let json = serde_json::json!({
            "id": "gen-1",
            "choices": [
                {"message": {"role": "assistant", "content": "Score: 85"}}
            ]
        });

        let parsed: ChatCompletionsResponse =
            serde_json::from_value(json).expect("should deserialize");
        assert_eq!(
            parsed.choices[0].message.content.as_deref(),
            Some("Score: 85")
        );
    }

    #[test]
    fn test_should_strip_trailing_slash_from_base_url() {
        let client = HttpCompletionClient::new(
            "key",
            "https://openrouter.ai/api/v1/",
            Duration::from_secs(1),
        );
        assert_eq!(
            client.endpoint(),
            "https://openrouter.ai/api/v1/chat/completions"
        );
    }
}

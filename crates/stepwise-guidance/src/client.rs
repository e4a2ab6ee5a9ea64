use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use stepwise_core::{ModelConfig, StepwiseError};

/// A message in a chat conversation with the model.
///
/// # Examples
///
/// ```
/// use stepwise_guidance::{ChatMessage, Role};
///
/// let msg = ChatMessage {
///     role: Role::User,
///     content: "Rate this change".into(),
/// };
/// assert!(matches!(msg.role, Role::User));
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Text content of the message.
    pub content: String,
}

/// Role in the chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// A chat-completion backend that can answer guidance prompts.
///
/// The production implementation is [`ModelClient`]; tests substitute a
/// scripted fake.
pub trait GuidanceModel: Send + Sync {
    /// Model identifier recorded on produced guidance.
    fn name(&self) -> &str;

    /// Send one system + user prompt pair, returning the raw text reply.
    fn complete(
        &self,
        system: &str,
        user: &str,
    ) -> impl Future<Output = Result<String, StepwiseError>> + Send;
}

/// OpenAI-compatible chat completions client.
///
/// Works with any provider exposing the `/v1/chat/completions` endpoint:
/// OpenAI, Ollama, vLLM, LiteLLM, etc.
///
/// # Examples
///
/// ```
/// use stepwise_core::ModelConfig;
/// use stepwise_guidance::ModelClient;
///
/// let client = ModelClient::new(&ModelConfig::default()).unwrap();
/// assert_eq!(client.model(), "gpt-4o");
/// ```
pub struct ModelClient {
    client: reqwest::Client,
    config: ModelConfig,
}

impl ModelClient {
    /// Create a new model client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::ModelUnavailable`] if the HTTP client
    /// cannot be built.
    pub fn new(config: &ModelConfig) -> Result<Self, StepwiseError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                StepwiseError::ModelUnavailable(format!("failed to create HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Return the model name from the configuration.
    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a chat completion request and return the text response.
    ///
    /// Builds a request to `{base_url}/v1/chat/completions` with the given
    /// messages, temperature 0.1, and JSON response format.
    ///
    /// # Errors
    ///
    /// Returns [`StepwiseError::ModelUnavailable`] on transport errors,
    /// timeouts, non-success statuses, and malformed completion envelopes.
    pub async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, StepwiseError> {
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com");
        let url = format!("{base_url}/v1/chat/completions");

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": 0.1,
            "response_format": { "type": "json_object" },
        });

        let mut request = self.client.post(&url);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }
        request = request.header("Content-Type", "application/json");

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| StepwiseError::ModelUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(StepwiseError::ModelUnavailable(format!(
                "model API error {status}: {body_text}"
            )));
        }

        let response_body: serde_json::Value = response.json().await.map_err(|e| {
            StepwiseError::ModelUnavailable(format!("failed to parse response: {e}"))
        })?;

        let content = response_body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| {
                StepwiseError::ModelUnavailable(format!(
                    "unexpected response structure: {response_body}"
                ))
            })?;

        Ok(content.to_string())
    }
}

impl GuidanceModel for ModelClient {
    fn name(&self) -> &str {
        self.model()
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, StepwiseError> {
        self.chat(vec![
            ChatMessage {
                role: Role::System,
                content: system.to_string(),
            },
            ChatMessage {
                role: Role::User,
                content: user.to_string(),
            },
        ])
        .await
    }
}

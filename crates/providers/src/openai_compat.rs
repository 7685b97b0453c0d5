//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, DeepSeek, Groq, Ollama, vLLM, and any
//! endpoint exposing `/chat/completions` with function calling.
//!
//! Rate limits (429) and server errors (5xx) are retried with exponential
//! backoff before an error is returned to the agent loop.

use async_trait::async_trait;
use nimbot_core::error::ProviderError;
use nimbot_core::message::{Message, Role};
use nimbot_core::provider::{ChatRequest, ChatResponse, Provider, ToolDefinition, Usage};
use nimbot_core::tool::ToolCall;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    max_retries: u32,
    base_delay: Duration,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            client,
        })
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key, model, Duration::from_secs(120))
    }

    /// Override the retry budget and the first backoff delay.
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| {
                let tool_calls = (!m.tool_calls.is_empty()).then(|| {
                    m.tool_calls
                        .iter()
                        .map(|tc| ApiToolCall {
                            id: tc.id.clone(),
                            r#type: "function".into(),
                            function: ApiFunction {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                });
                // Assistant turns that only carry tool calls go out with null content.
                let content = if m.role == Role::Assistant && m.content.is_empty() && tool_calls.is_some() {
                    None
                } else {
                    Some(m.content.clone())
                };
                ApiMessage {
                    role: match m.role {
                        Role::User => "user".into(),
                        Role::Assistant => "assistant".into(),
                        Role::System => "system".into(),
                        Role::Tool => "tool".into(),
                    },
                    content,
                    tool_calls,
                    tool_call_id: m.tool_call_id.clone(),
                    name: if m.role == Role::Tool { m.tool_name.clone() } else { None },
                }
            })
            .collect()
    }

    /// Convert tool definitions to OpenAI API format.
    fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }

    fn build_body(request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
            body["tool_choice"] = serde_json::json!("auto");
        }
        body
    }

    /// Turn a parsed API response into a [`ChatResponse`].
    fn into_chat_response(api_response: ApiResponse) -> Result<ChatResponse, ProviderError> {
        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, parse_arguments(&tc.function.arguments)))
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.filter(|c| !c.is_empty()),
            tool_calls,
            usage: api_response.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            model: api_response.model.unwrap_or_default(),
        })
    }

    /// One HTTP round trip, classified into success / retryable / fatal.
    async fn send_once(&self, body: &serde_json::Value) -> Attempt {
        let url = format!("{}/chat/completions", self.base_url);
        let response = match self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Attempt::Retry(ProviderError::Timeout(e.to_string()), None),
            Err(e) => return Attempt::Retry(ProviderError::Network(e.to_string()), None),
        };

        let status = response.status().as_u16();
        match status {
            200..=299 => match response.json::<ApiResponse>().await {
                Ok(parsed) => Attempt::Done(Self::into_chat_response(parsed)),
                Err(e) => Attempt::Done(Err(ProviderError::InvalidResponse(format!(
                    "Failed to parse response: {e}"
                )))),
            },
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                Attempt::Retry(
                    ProviderError::RateLimited {
                        retry_after_secs: retry_after.unwrap_or(5),
                    },
                    retry_after.map(Duration::from_secs),
                )
            }
            401 | 403 => Attempt::Done(Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ))),
            404 => {
                let error_body = response.text().await.unwrap_or_default();
                Attempt::Done(Err(ProviderError::ModelNotFound(error_body)))
            }
            500..=599 => {
                let error_body = response.text().await.unwrap_or_default();
                Attempt::Retry(
                    ProviderError::ApiError {
                        status_code: status,
                        message: error_body,
                    },
                    None,
                )
            }
            _ => {
                let error_body = response.text().await.unwrap_or_default();
                warn!(status, body = %error_body, "Provider returned error");
                Attempt::Done(Err(ProviderError::ApiError {
                    status_code: status,
                    message: error_body,
                }))
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }
}

enum Attempt {
    Done(Result<ChatResponse, ProviderError>),
    /// Retryable failure, with a server-requested delay if one was given.
    Retry(ProviderError, Option<Duration>),
}

/// Parse tool-call arguments as JSON.
///
/// An empty string means "no arguments". Anything unparseable is kept as a
/// raw string so schema validation rejects it and the model sees why.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn chat(&self, mut request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        if request.model.is_empty() {
            request.model = self.default_model.clone();
        }
        let body = Self::build_body(&request);

        let mut attempt = 0;
        loop {
            debug!(provider = %self.name, model = %request.model, attempt, "Sending chat request");
            match self.send_once(&body).await {
                Attempt::Done(result) => return result,
                Attempt::Retry(err, _) if attempt >= self.max_retries => {
                    warn!(provider = %self.name, error = %err, "Giving up after retries");
                    return Err(err);
                }
                Attempt::Retry(err, requested) => {
                    let delay = requested.unwrap_or_else(|| self.backoff(attempt)).min(MAX_BACKOFF);
                    warn!(
                        provider = %self.name,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying chat request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: ApiFunction,
}

fn function_type() -> String {
    "function".into()
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

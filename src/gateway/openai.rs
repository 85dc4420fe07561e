//! OpenAI adapter for chat completions.
//!
//! Also hosts the direct-completion path for the one model that the unified
//! chat layer cannot serve yet: requests for it go to the legacy completions
//! endpoint with the system prompt folded into the prompt text.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Message, Provider, Role};
use super::ChatClient;

/// Model id that must bypass the unified chat abstraction.
pub const DIRECT_COMPLETION_MODEL: &str = "o1-preview";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenAI API adapter.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var(Provider::OpenAi.key_env_var())
            .map_err(|_| ProviderError::config("OPENAI_API_KEY not set"))?;
        let base_url = std::env::var(Provider::OpenAi.base_url_env_var())
            .unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn chat_completion(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();

        let messages: Vec<ApiMessage> = req.messages.iter().map(ApiMessage::from).collect();
        let api_req = ChatApiRequest {
            model: &req.model_id,
            messages: &messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(error_from_response(status.as_u16(), &body));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(Provider::OpenAi, format!("Invalid JSON: {e}")))?;

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider(Provider::OpenAi, "No choices in response")
            })?;

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }

    /// Legacy completions endpoint for [`DIRECT_COMPLETION_MODEL`].
    ///
    /// No message roles and no response_format here: the system prompt is
    /// prepended to the prompt text, and JSON is requested by instruction only.
    async fn direct_completion(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();

        let prompt = fold_messages(&req.messages);
        let api_req = CompletionApiRequest {
            model: &req.model_id,
            prompt: &prompt,
            max_tokens: req.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/completions", self.base_url))
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(error_from_response(status.as_u16(), &body));
        }

        let parsed: CompletionApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(Provider::OpenAi, format!("Invalid JSON: {e}")))?;

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider(Provider::OpenAi, "No choices in response")
            })?;

        let usage = parsed.usage.unwrap_or_default();

        Ok(ChatResponse {
            content: choice.text.unwrap_or_default(),
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

/// Collapse role-tagged messages into one prompt for the completions endpoint.
fn fold_messages(messages: &[Message]) -> String {
    let mut parts = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::System | Role::User => parts.push(m.content.as_str()),
            Role::Assistant => {}
        }
    }
    parts.join("\n\n")
}

fn error_from_response(status: u16, body: &str) -> ProviderError {
    let ctx = ErrorContext::new().with_status(status);

    let (message, ctx) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => {
            let message = env.error.message.unwrap_or_else(|| format!("HTTP {status}"));
            let ctx = match env.error.code {
                Some(code) => ctx.with_code(code),
                None => ctx,
            };
            (message, ctx)
        }
        Err(_) => (format!("HTTP {status}"), ctx),
    };

    match status {
        429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
        _ => ProviderError::provider_with_context(Provider::OpenAi, message, ctx),
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [ApiMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

impl From<&Message> for ApiMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: match m.role {
                Role::System => "system".to_string(),
                Role::User => "user".to_string(),
                Role::Assistant => "assistant".to_string(),
            },
            content: m.content.clone(),
        }
    }
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Serialize)]
struct CompletionApiRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionApiResponse {
    choices: Option<Vec<CompletionChoice>>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    text: Option<String>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

// =============================================================================
// CHAT CLIENT IMPL
// =============================================================================

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        if req.model_id == DIRECT_COMPLETION_MODEL {
            self.direct_completion(req).await
        } else {
            self.chat_completion(req).await
        }
    }
}

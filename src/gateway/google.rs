//! Google Gemini adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Provider, Role};
use super::ChatClient;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct GoogleClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GoogleClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT)
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var(Provider::Google.key_env_var())
            .map_err(|_| ProviderError::config("GOOGLE_API_KEY not set"))?;
        let base_url = std::env::var(Provider::Google.base_url_env_var())
            .unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self::with_config(api_key, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn generate_url(&self, model_id: &str) -> String {
        format!(
            "{}/{}:generateContent?key={}",
            self.base_url, model_id, self.api_key
        )
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<PartRef<'a>>,
}

#[derive(Serialize)]
struct PartRef<'a> {
    text: &'a str,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}

// =============================================================================
// CHAT CLIENT IMPL
// =============================================================================

#[async_trait]
impl ChatClient for GoogleClient {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();

        let system_instruction = req
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| SystemInstruction {
                parts: vec![PartRef { text: &m.content }],
            });

        let contents: Vec<Content> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| Content {
                role: Some(
                    match m.role {
                        Role::Assistant => "model",
                        _ => "user",
                    }
                    .to_string(),
                ),
                parts: vec![Part {
                    text: m.content.clone(),
                }],
            })
            .collect();

        let api_req = GenerateRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
                response_mime_type: req.json_mode.then_some("application/json"),
            },
        };

        let response = self
            .client
            .post(self.generate_url(&req.model_id))
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let ctx = ErrorContext::new().with_status(status.as_u16());
            let (message, ctx) = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(ErrorEnvelope { error: Some(e) }) => {
                    let message = e.message.unwrap_or_else(|| format!("HTTP {status}"));
                    let ctx = match e.status {
                        Some(s) => ctx.with_code(s),
                        None => ctx,
                    };
                    (message, ctx)
                }
                _ => (format!("HTTP {status}"), ctx),
            };
            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
                _ => ProviderError::provider_with_context(Provider::Google, message, ctx),
            });
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider(Provider::Google, format!("Invalid JSON: {e}")))?;

        let candidate = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| {
                ProviderError::provider(Provider::Google, "No candidates in response")
            })?;

        let content = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = parsed.usage_metadata;

        Ok(ChatResponse {
            content,
            input_tokens: usage
                .as_ref()
                .and_then(|u| u.prompt_token_count)
                .unwrap_or(0),
            output_tokens: usage
                .as_ref()
                .and_then(|u| u.candidates_token_count)
                .unwrap_or(0),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(candidate.finish_reason),
        })
    }
}

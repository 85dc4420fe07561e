//! Provider gateway: one `ChatClient` per provider, resolved through a lookup
//! table rather than conditional branching.

pub mod anthropic;
pub mod error;
pub mod google;
pub mod openai;
pub mod openrouter;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

pub use anthropic::AnthropicClient;
pub use error::{ErrorCategory, ErrorContext, ProviderError};
pub use google::GoogleClient;
pub use openai::{OpenAiClient, DIRECT_COMPLETION_MODEL};
pub use openrouter::OpenRouterClient;
pub use types::{
    ChatRequest, ChatResponse, FinishReason, Message, ModelBinding, Provider, Role,
};

/// Trait for chat completion providers.
#[async_trait::async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

// =============================================================================
// PROVIDER INFERENCE
// =============================================================================

/// Correct an implausible provider declaration from well-known model id shapes.
///
/// This is a heuristic safety net, not a validation gate: an id that matches
/// none of the known patterns keeps its declared provider.
pub fn infer_provider(model_id: &str, declared: Provider) -> Provider {
    // Routed ids like "anthropic/claude-3-5-haiku" belong to OpenRouter
    // regardless of the vendor segment.
    if model_id.contains('/') {
        return Provider::OpenRouter;
    }
    if model_id.starts_with("gpt-")
        || model_id.starts_with("o1")
        || model_id.starts_with("chatgpt-")
    {
        return Provider::OpenAi;
    }
    if model_id.starts_with("claude-") {
        return Provider::Anthropic;
    }
    if model_id.starts_with("gemini-") {
        return Provider::Google;
    }
    declared
}

// =============================================================================
// CLIENT REGISTRY
// =============================================================================

/// A client bound to one (provider, model) pair, ready to call.
///
/// `provider` is the dispatch provider after heuristic correction; callers use
/// it for output identity and persistence.
#[derive(Clone)]
pub struct ResolvedClient {
    pub provider: Provider,
    pub model_id: String,
    client: Arc<dyn ChatClient>,
}

impl ResolvedClient {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.provider, self.model_id)
    }

    /// One-shot completion: system prompt + user content in, text out.
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_content: &str,
        json_mode: bool,
    ) -> Result<ChatResponse, ProviderError> {
        let mut req = ChatRequest::new(
            self.model_id.clone(),
            vec![Message::system(system_prompt), Message::user(user_content)],
        );
        if json_mode {
            req = req.json();
        }
        self.client.chat(&req).await
    }

    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.client.chat(req).await
    }
}

/// Registry of per-provider chat clients.
///
/// Construction never fails: providers whose credentials are absent are simply
/// not registered, and resolving them reports a configuration error for that
/// call only.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<Provider, Arc<dyn ChatClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every provider whose API key is configured.
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        for provider in Provider::ALL {
            let client: Option<Arc<dyn ChatClient>> = match provider {
                Provider::OpenAi => OpenAiClient::from_env().ok().map(|c| Arc::new(c) as _),
                Provider::Anthropic => AnthropicClient::from_env().ok().map(|c| Arc::new(c) as _),
                Provider::Google => GoogleClient::from_env().ok().map(|c| Arc::new(c) as _),
                Provider::OpenRouter => OpenRouterClient::from_env().ok().map(|c| Arc::new(c) as _),
            };
            if let Some(client) = client {
                registry.clients.insert(provider, client);
            }
        }
        registry
    }

    /// Register (or replace) the client for a provider. Used by tests to point
    /// a provider at a mock server.
    pub fn with_client(mut self, provider: Provider, client: Arc<dyn ChatClient>) -> Self {
        self.clients.insert(provider, client);
        self
    }

    pub fn has_provider(&self, provider: Provider) -> bool {
        self.clients.contains_key(&provider)
    }

    /// Resolve a (provider, model) pair to a callable client, correcting the
    /// provider from the model id shape first.
    pub fn resolve(
        &self,
        declared: Provider,
        model_id: &str,
    ) -> Result<ResolvedClient, ProviderError> {
        let provider = infer_provider(model_id, declared);
        if provider != declared {
            tracing::warn!(
                model_id,
                declared = %declared,
                corrected = %provider,
                "Declared provider does not match model id; corrected"
            );
        }

        let client = self.clients.get(&provider).cloned().ok_or_else(|| {
            ProviderError::config(format!(
                "{} not set (needed for {})",
                provider.key_env_var(),
                model_id
            ))
        })?;

        Ok(ResolvedClient {
            provider,
            model_id: model_id.to_string(),
            client,
        })
    }
}

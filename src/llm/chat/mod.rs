pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use log::debug;
use reqwest::Client as HttpClient;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use super::{ LlmConfig, LlmType };
use self::anthropic::AnthropicChatClient;
use self::openai::OpenAIChatClient;
use crate::models::chat::{ ModelReply, Transcript };
use crate::retry::{ with_retry, RetryPolicy, Retryable };
use crate::tools::ToolDescriptor;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("CHAT_API_KEY is not set (required by the {0} chat client)")]
    MissingApiKey(LlmType),
    #[error("Invalid API key format: {0}")]
    InvalidApiKey(String),
    #[error("HTTP request to {provider} failed: {source}")]
    Http {
        provider: LlmType,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider} API returned HTTP {status}: {body}")]
    Api {
        provider: LlmType,
        status: u16,
        body: String,
    },
    #[error("Unexpected {provider} reply: {message}")]
    MalformedReply {
        provider: LlmType,
        message: String,
    },
}

impl Retryable for ChatError {
    fn is_retryable(&self) -> bool {
        match self {
            ChatError::Http { source, .. } => source.is_timeout() || source.is_connect(),
            ChatError::Api { status, .. } => *status == 429 || *status == 529 || (500..600).contains(status),
            _ => false,
        }
    }
}

/// Everything one turn sends to the model.
pub struct TurnRequest<'a> {
    pub system: &'a str,
    pub transcript: &'a Transcript,
    pub tools: &'a [ToolDescriptor],
}

/// A vendor endpoint able to take a transcript and answer with text and/or tool calls.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Posts one turn and returns the vendor's raw reply body.
    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<Value, ChatError>;

    /// Maps a raw reply body onto the vendor-neutral [`ModelReply`].
    fn interpret_reply(&self, raw: &Value) -> Result<ModelReply, ChatError>;

    fn model(&self) -> &str;

    fn provider(&self) -> LlmType;

    async fn complete_turn(&self, request: &TurnRequest<'_>) -> Result<ModelReply, ChatError> {
        let raw = self.send_turn(request).await?;
        debug!("{} raw reply: {}", self.provider(), raw);
        self.interpret_reply(&raw)
    }
}

pub fn new_client(config: &LlmConfig) -> Result<Arc<dyn ChatTransport>, ChatError> {
    let client: Arc<dyn ChatTransport> = match config.llm_type {
        LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::Anthropic => {
            let specific_client = AnthropicChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}

/// Resolves the endpoint from an optional base URL: a full endpoint is used as
/// given, anything else gets `route` appended.
pub(crate) fn endpoint_url(base_url: Option<&str>, default_base: &str, route: &str) -> String {
    let base = base_url.unwrap_or(default_base).trim_end_matches('/');
    let versionless = route.trim_start_matches("/v1");
    if base.ends_with(versionless) {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{}{}", base, versionless)
    } else {
        format!("{}{}", base, route)
    }
}

pub(crate) async fn post_json<B: Serialize + Sync>(
    http: &HttpClient,
    url: &str,
    body: &B,
    provider: LlmType,
    retry: &RetryPolicy
) -> Result<Value, ChatError> {
    with_retry(retry, &format!("{} chat request", provider), move || async move {
        let resp = http
            .post(url)
            .json(body)
            .send().await
            .map_err(|source| ChatError::Http { provider, source })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Api { provider, status: status.as_u16(), body });
        }
        resp.json::<Value>().await.map_err(|source| ChatError::Http { provider, source })
    }).await
}

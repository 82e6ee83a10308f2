use async_trait::async_trait;
use log::info;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use serde_json::Value;

use super::{ endpoint_url, post_json, ChatError, ChatTransport, TurnRequest };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ ModelReply, Role, TokenUsage, ToolCall, Transcript };
use crate::retry::RetryPolicy;
use crate::tools::ToolDescriptor;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const COMPLETIONS_ROUTE: &str = "/v1/chat/completions";

/// Chat-completions client. Works against any OpenAI-compatible endpoint,
/// including self-hosted Llama deployments.
pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct OpenAIMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OpenAIToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<OpenAIFunctionCall>,
}

#[derive(Serialize, Deserialize, Debug)]
struct OpenAIToolCall {
    #[serde(default)]
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: OpenAIFunctionCall,
}

#[derive(Serialize, Deserialize, Debug)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Serialize)]
struct OpenAITool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAIFunction<'a>,
}

#[derive(Serialize)]
struct OpenAIFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: u32,
        temperature: f32,
        retry: RetryPolicy
    ) -> Result<Self, ChatError> {
        let chat_model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let url = endpoint_url(base_url.as_deref(), DEFAULT_BASE_URL, COMPLETIONS_ROUTE);
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                ChatError::InvalidApiKey(e.to_string())
            )?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|source| ChatError::Http { provider: LlmType::OpenAI, source })?;

        info!("OpenAI-compatible chat client: model={}, url={}", chat_model, url);
        Ok(Self {
            http,
            model: chat_model,
            url,
            max_tokens,
            temperature,
            retry,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, ChatError> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ChatError::MissingApiKey(LlmType::OpenAI))?;

        Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            config.max_tokens,
            config.temperature,
            config.retry
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }

    fn build_request<'a>(&'a self, request: &TurnRequest<'a>) -> OpenAIChatRequest<'a> {
        let tools: Vec<OpenAITool<'a>> = request.tools.iter().map(to_openai_tool).collect();
        let tool_choice = if tools.is_empty() { None } else { Some("auto") };
        OpenAIChatRequest {
            model: &self.model,
            messages: to_openai_messages(request.system, request.transcript),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
            tools,
            tool_choice,
        }
    }
}

fn to_openai_tool(descriptor: &ToolDescriptor) -> OpenAITool<'_> {
    OpenAITool {
        tool_type: "function",
        function: OpenAIFunction {
            name: &descriptor.name,
            description: &descriptor.description,
            parameters: &descriptor.input_schema,
        },
    }
}

fn to_openai_messages(system: &str, transcript: &Transcript) -> Vec<OpenAIMessage> {
    let mut messages = Vec::with_capacity(transcript.len() + 1);
    if !system.is_empty() {
        messages.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(system.to_string()),
            ..Default::default()
        });
    }

    for msg in transcript.messages() {
        let converted = match msg.role {
            Role::User =>
                OpenAIMessage {
                    role: "user".to_string(),
                    content: Some(msg.content.clone()),
                    ..Default::default()
                },
            Role::Assistant =>
                OpenAIMessage {
                    role: "assistant".to_string(),
                    // `null` content is only accepted alongside tool calls.
                    content: if msg.content.is_empty() && !msg.tool_calls.is_empty() {
                        None
                    } else {
                        Some(msg.content.clone())
                    },
                    tool_calls: msg.tool_calls
                        .iter()
                        .map(|call| OpenAIToolCall {
                            id: call.id.clone(),
                            call_type: function_type(),
                            function: OpenAIFunctionCall {
                                name: call.name.clone(),
                                arguments: Value::String(encode_arguments(&call.arguments)),
                            },
                        })
                        .collect(),
                    ..Default::default()
                },
            Role::Tool =>
                OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(msg.content.clone()),
                    tool_call_id: msg.tool_call_id.clone(),
                    ..Default::default()
                },
        };
        messages.push(converted);
    }
    messages
}

fn encode_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn decode_arguments(id: String, name: String, arguments: Value) -> ToolCall {
    match arguments {
        Value::String(raw) => ToolCall::from_raw_arguments(id, name, &raw),
        Value::Null => ToolCall::new(id, name, Value::Object(Default::default())),
        other => ToolCall::new(id, name, other),
    }
}

#[async_trait]
impl ChatTransport for OpenAIChatClient {
    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<Value, ChatError> {
        let body = self.build_request(request);
        post_json(&self.http, &self.url, &body, LlmType::OpenAI, &self.retry).await
    }

    fn interpret_reply(&self, raw: &Value) -> Result<ModelReply, ChatError> {
        let resp: OpenAIResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ChatError::MalformedReply { provider: LlmType::OpenAI, message: e.to_string() }
        })?;

        let message = resp.choices
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::MalformedReply {
                provider: LlmType::OpenAI,
                message: "No choices in response".to_string(),
            })?.message;

        let mut tool_calls: Vec<ToolCall> = message.tool_calls
            .into_iter()
            .enumerate()
            .map(|(idx, call)| {
                let id = if call.id.is_empty() { format!("call_{}", idx) } else { call.id };
                decode_arguments(id, call.function.name, call.function.arguments)
            })
            .collect();

        // Older deployments answer with a single `function_call` instead of `tool_calls`.
        if tool_calls.is_empty() {
            if let Some(function_call) = message.function_call {
                tool_calls.push(
                    decode_arguments("call_0".to_string(), function_call.name, function_call.arguments)
                );
            }
        }

        let usage = resp.usage
            .map(|u| TokenUsage { input_tokens: u.prompt_tokens, output_tokens: u.completion_tokens })
            .unwrap_or_default();

        Ok(ModelReply {
            text: message.content.unwrap_or_default().trim().to_string(),
            tool_calls,
            usage,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> LlmType {
        LlmType::OpenAI
    }
}

use async_trait::async_trait;
use log::info;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };
use serde_json::Value;

use super::{ endpoint_url, post_json, ChatError, ChatTransport, TurnRequest };
use crate::llm::{ LlmConfig, LlmType };
use crate::models::chat::{ ModelReply, Role, TokenUsage, ToolCall, Transcript };
use crate::retry::RetryPolicy;
use crate::tools::ToolDescriptor;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const MESSAGES_ROUTE: &str = "/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicChatClient {
    http: HttpClient,
    model: String,
    url: String,
    max_tokens: u32,
    temperature: f32,
    retry: RetryPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Serialize, Debug)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        max_tokens: u32,
        temperature: f32,
        retry: RetryPolicy
    ) -> Result<Self, ChatError> {
        let chat_model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let url = endpoint_url(base_url.as_deref(), DEFAULT_BASE_URL, MESSAGES_ROUTE);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&api_key).map_err(|e| ChatError::InvalidApiKey(e.to_string()))?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|source| ChatError::Http { provider: LlmType::Anthropic, source })?;

        info!("Anthropic chat client: model={}, url={}", chat_model, url);
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
            .ok_or(ChatError::MissingApiKey(LlmType::Anthropic))?;

        Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            config.max_tokens,
            config.temperature,
            config.retry
        )
    }

    fn build_request<'a>(&'a self, request: &TurnRequest<'a>) -> AnthropicRequest<'a> {
        AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: Some(request.system).filter(|s| !s.is_empty()),
            messages: to_anthropic_messages(request.transcript),
            tools: request.tools.iter().map(to_anthropic_tool).collect(),
        }
    }
}

fn to_anthropic_tool(descriptor: &ToolDescriptor) -> AnthropicTool<'_> {
    AnthropicTool {
        name: &descriptor.name,
        description: &descriptor.description,
        input_schema: &descriptor.input_schema,
    }
}

/// Tool results travel as `user` turns, and consecutive turns of the same role
/// are merged so the transcript keeps strict user/assistant alternation.
fn to_anthropic_messages(transcript: &Transcript) -> Vec<AnthropicMessage> {
    let mut messages: Vec<AnthropicMessage> = Vec::new();

    for msg in transcript.messages() {
        let (role, blocks) = match msg.role {
            Role::User => ("user", text_block(&msg.content).into_iter().collect::<Vec<_>>()),
            Role::Assistant => {
                let mut blocks: Vec<ContentBlock> = text_block(&msg.content).into_iter().collect();
                blocks.extend(
                    msg.tool_calls.iter().map(|call| ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    })
                );
                ("assistant", blocks)
            }
            Role::Tool =>
                (
                    "user",
                    vec![ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                        is_error: msg.is_error,
                    }],
                ),
        };

        if blocks.is_empty() {
            continue;
        }

        match messages.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => messages.push(AnthropicMessage { role, content: blocks }),
        }
    }
    messages
}

fn text_block(text: &str) -> Option<ContentBlock> {
    if text.trim().is_empty() {
        None
    } else {
        Some(ContentBlock::Text { text: text.to_string() })
    }
}

#[async_trait]
impl ChatTransport for AnthropicChatClient {
    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<Value, ChatError> {
        let body = self.build_request(request);
        post_json(&self.http, &self.url, &body, LlmType::Anthropic, &self.retry).await
    }

    fn interpret_reply(&self, raw: &Value) -> Result<ModelReply, ChatError> {
        let resp: AnthropicResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            ChatError::MalformedReply { provider: LlmType::Anthropic, message: e.to_string() }
        })?;

        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in resp.content {
            match block {
                ContentBlock::Text { text } => texts.push(text),
                ContentBlock::ToolUse { id, name, input } => {
                    let input = if input.is_null() { Value::Object(Default::default()) } else { input };
                    tool_calls.push(ToolCall::new(id, name, input));
                }
                _ => {}
            }
        }

        let usage = resp.usage
            .map(|u| TokenUsage { input_tokens: u.input_tokens, output_tokens: u.output_tokens })
            .unwrap_or_default();

        Ok(ModelReply {
            text: texts.join("\n").trim().to_string(),
            tool_calls,
            usage,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn provider(&self) -> LlmType {
        LlmType::Anthropic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chat::Message;
    use serde_json::json;

    fn client() -> AnthropicChatClient {
        AnthropicChatClient::new(
            "sk-ant-test".to_string(),
            None,
            None,
            8192,
            0.7,
            RetryPolicy::none()
        ).unwrap()
    }

    #[test]
    fn missing_key_fails_fast() {
        let config = LlmConfig { api_key: Some("  ".to_string()), ..Default::default() };
        let err = AnthropicChatClient::from_config(&config).err().unwrap();
        assert_eq!(err.to_string(), "CHAT_API_KEY is not set (required by the anthropic chat client)");
    }

    #[test]
    fn tool_results_are_grouped_into_one_user_turn() {
        let mut transcript = Transcript::new();
        transcript.push(Message::user("question"));
        transcript.push(
            Message::assistant(
                "Let me look.",
                vec![
                    ToolCall::new("tu_1", "call_gbq_function", json!({"query": "SELECT 1"})),
                    ToolCall::new("tu_2", "validate_json", json!({"json_str": "{}"}))
                ]
            )
        );
        transcript.push(Message::tool_result("tu_1", "[]", false));
        transcript.push(Message::tool_result("tu_2", "Invalid JSON", true));

        let messages = to_anthropic_messages(&transcript);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content.len(), 3);
        assert_eq!(messages[2].role, "user");
        assert_eq!(
            messages[2].content[1],
            ContentBlock::ToolResult {
                tool_use_id: "tu_2".to_string(),
                content: "Invalid JSON".to_string(),
                is_error: true,
            }
        );
    }

    #[test]
    fn empty_assistant_text_is_dropped_and_user_turns_merge() {
        let mut transcript = Transcript::new();
        transcript.push(Message::user("first"));
        transcript.push(Message::assistant("   ", vec![]));
        transcript.push(Message::user("second"));
        let messages = to_anthropic_messages(&transcript);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content.len(), 2);
    }

    #[test]
    fn request_serializes_system_and_tools() {
        let client = client();
        let mut transcript = Transcript::new();
        transcript.push(Message::user("hi"));
        let tools = vec![ToolDescriptor::new("validate_json", "Validates JSON", json!({"type": "object"}))];
        let turn = TurnRequest { system: "<instructions/>", transcript: &transcript, tools: &tools };
        let body = serde_json::to_value(client.build_request(&turn)).unwrap();

        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["max_tokens"], 8192);
        assert_eq!(body["system"], "<instructions/>");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
    }

    #[test]
    fn interprets_tool_use_blocks() {
        let raw = json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [
                { "type": "text", "text": "Querying the database." },
                { "type": "tool_use", "id": "toolu_1", "name": "call_gbq_function", "input": { "query": "SELECT 1" } }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 100, "output_tokens": 20 }
        });
        let reply = client().interpret_reply(&raw).unwrap();
        assert_eq!(reply.text, "Querying the database.");
        assert_eq!(reply.tool_calls, vec![ToolCall::new("toolu_1", "call_gbq_function", json!({"query": "SELECT 1"}))]);
        assert_eq!(reply.usage.input_tokens, 100);
    }

    #[test]
    fn unknown_blocks_are_ignored() {
        let raw = json!({
            "content": [
                { "type": "thinking", "thinking": "..." },
                { "type": "text", "text": "# Report" }
            ]
        });
        let reply = client().interpret_reply(&raw).unwrap();
        assert_eq!(reply.text, "# Report");
        assert!(!reply.requests_tools());
    }
}

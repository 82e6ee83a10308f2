#![allow(dead_code)]

use async_trait::async_trait;
use intel_report::llm::chat::{ ChatError, ChatTransport, TurnRequest };
use intel_report::llm::LlmType;
use intel_report::models::chat::{ ModelReply, TokenUsage, ToolCall, Transcript };
use serde_json::{ json, Value };
use std::collections::VecDeque;
use std::sync::Mutex;

/// Replays canned replies in order and records every transcript it was sent.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Value>>,
    seen: Mutex<Vec<Transcript>>,
    repeat_last: bool,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Value>) -> Self {
        Self { replies: Mutex::new(replies.into()), seen: Mutex::new(Vec::new()), repeat_last: false }
    }

    /// Keeps answering with the final scripted reply once the script runs out.
    pub fn repeating(reply: Value) -> Self {
        Self { repeat_last: true, ..Self::new(vec![reply]) }
    }

    pub fn turns(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn transcript(&self, turn: usize) -> Transcript {
        self.seen.lock().unwrap()[turn].clone()
    }
}

pub fn text_reply(text: &str) -> Value {
    json!({ "text": text, "tool_calls": [] })
}

pub fn tool_reply(text: &str, calls: Vec<ToolCall>) -> Value {
    json!({ "text": text, "tool_calls": calls, "usage": { "input_tokens": 10, "output_tokens": 5 } })
}

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn send_turn(&self, request: &TurnRequest<'_>) -> Result<Value, ChatError> {
        self.seen.lock().unwrap().push(request.transcript.clone());
        let mut replies = self.replies.lock().unwrap();
        let next = if self.repeat_last && replies.len() == 1 { replies.front().cloned() } else { replies.pop_front() };
        next.ok_or_else(|| ChatError::MalformedReply {
            provider: LlmType::OpenAI,
            message: "script exhausted".to_string(),
        })
    }

    fn interpret_reply(&self, raw: &Value) -> Result<ModelReply, ChatError> {
        let tool_calls: Vec<ToolCall> = serde_json::from_value(raw["tool_calls"].clone()).unwrap_or_default();
        let usage: TokenUsage = serde_json::from_value(raw["usage"].clone()).unwrap_or_default();
        Ok(ModelReply {
            text: raw["text"].as_str().unwrap_or_default().to_string(),
            tool_calls,
            usage,
        })
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn provider(&self) -> LlmType {
        LlmType::OpenAI
    }
}

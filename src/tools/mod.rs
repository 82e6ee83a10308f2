pub mod literal;
pub mod scrape;
pub mod search;
pub mod validate;
pub mod warehouse;

use async_trait::async_trait;
use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::agent::LoopError;
use crate::models::chat::ToolCall;
use self::scrape::ScrapeError;
use self::search::SearchError;
use self::validate::{ ValidateJsonTool, ValidationError };
use self::warehouse::WarehouseError;

/// What the model is told about a tool: its name, purpose and JSON-schema input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self { name: name.into(), description: description.into(), input_schema }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] ValidationError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Loop(#[from] LoopError),
    #[error("Failed to encode tool result: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError>;
}

/// Adapts a plain synchronous function into a [`ToolHandler`].
pub struct FnTool<F>(pub F);

impl<F> FnTool<F> where F: Fn(&Value) -> Result<String, ToolError> + Send + Sync {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ToolHandler for FnTool<F> where F: Fn(&Value) -> Result<String, ToolError> + Send + Sync {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError> {
        (self.0)(arguments)
    }
}

/// Result text fed back into the transcript for one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

/// Name-to-handler dispatch table handed to the tool loop for one run.
/// Always contains `validate_json`.
#[derive(Clone)]
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut registry = Self { descriptors: Vec::new(), handlers: HashMap::new() };
        registry.register(validate::descriptor(), Arc::new(ValidateJsonTool));
        registry
    }

    /// Adds a tool, replacing any earlier one with the same name.
    pub fn register(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        if let Some(existing) = self.descriptors.iter_mut().find(|d| d.name == descriptor.name) {
            *existing = descriptor.clone();
        } else {
            self.descriptors.push(descriptor.clone());
        }
        self.handlers.insert(descriptor.name, handler);
    }

    pub fn with_tool(mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(descriptor, handler);
        self
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Runs the named handler. Never fails: errors become the result text with
    /// `is_error` set so the model can correct itself.
    pub async fn dispatch(&self, call: &ToolCall) -> ToolOutcome {
        let Some(handler) = self.handlers.get(&call.name) else {
            warn!("Model requested unknown tool '{}'", call.name);
            return ToolOutcome {
                content: format!(
                    "Unknown function: {}, available functions are: {}",
                    call.name,
                    self.names().join(", ")
                ),
                is_error: true,
            };
        };

        info!("Calling tool {}", call.name);
        match handler.call(&call.arguments).await {
            Ok(content) => ToolOutcome { content, is_error: false },
            Err(e) => {
                warn!("Tool {} failed: {}", call.name, e);
                ToolOutcome { content: e.to_string(), is_error: true }
            }
        }
    }
}

/// Pulls a required string argument out of a tool's JSON input.
pub fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    if !arguments.is_object() {
        return Err(
            ToolError::InvalidArguments(format!("arguments must be a JSON object, got {}", arguments))
        );
    }
    match arguments.get(key) {
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(other) => Err(ToolError::InvalidArguments(format!("'{}' must be a string, got {}", key, other))),
        None => Err(ToolError::InvalidArguments(format!("missing required argument '{}'", key))),
    }
}

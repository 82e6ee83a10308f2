use async_trait::async_trait;
use serde_json::{ json, Value };
use thiserror::Error;

use super::literal::parse_literal;
use super::{ ToolDescriptor, ToolError, ToolHandler };

pub const VALIDATE_JSON: &str = "validate_json";

#[derive(Debug, Error, Clone, PartialEq)]
#[error("strict JSON parse failed with error: {strict}. literal parse failed with error: {permissive}")]
pub struct ValidationError {
    pub strict: String,
    pub permissive: String,
}

/// Strict JSON first, then Python-style literal syntax.
pub fn load_json(text: &str) -> Result<Value, ValidationError> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => Ok(value),
        Err(strict) =>
            parse_literal(text).map_err(|permissive| ValidationError {
                strict: strict.to_string(),
                permissive: permissive.to_string(),
            }),
    }
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        VALIDATE_JSON,
        "Validates if a string is valid JSON. Use this when you need to check if a string is valid JSON format.",
        json!({
            "type": "object",
            "properties": {
                "json_str": {
                    "type": "string",
                    "description": "The JSON string to validate"
                }
            },
            "required": ["json_str"]
        })
    )
}

pub struct ValidateJsonTool;

#[async_trait]
impl ToolHandler for ValidateJsonTool {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError> {
        let result = match arguments.get("json_str") {
            Some(Value::String(text)) => load_json(text)?,
            // Some models send the structure itself instead of its text.
            Some(structured @ (Value::Object(_) | Value::Array(_))) => structured.clone(),
            Some(other) => {
                return Err(
                    ToolError::InvalidArguments(format!("'json_str' must be a string, got {}", other))
                );
            }
            None => {
                return Err(ToolError::InvalidArguments("missing required argument 'json_str'".to_string()));
            }
        };
        Ok(json!({ "success": true, "result": result }).to_string())
    }
}

/// The decoded value carried by a successful `validate_json` result.
pub fn validated_value(content: &str) -> Option<Value> {
    let mut parsed: Value = serde_json::from_str(content).ok()?;
    if parsed.get("success").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    parsed.get_mut("result").map(Value::take)
}

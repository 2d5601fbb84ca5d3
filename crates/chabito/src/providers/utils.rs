use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::errors::AgentError;
use crate::models::content::{Content, ImageContent};
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

/// Placeholder function name for requests the model sent malformed; they still need a
/// matching entry so the error tool result that answers them is accepted by the API.
const INVALID_TOOL_CALL_NAME: &str = "invalid_tool_call";

/// Convert internal Message format to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::System => "system",
            Role::Human => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let mut converted = json!({ "role": role });
        let mut parts: Vec<Value> = Vec::new();
        let mut has_image = false;

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        parts.push(json!({"type": "text", "text": text.text}));
                    }
                }
                MessageContent::Image(image) => {
                    has_image = true;
                    parts.push(convert_image(image));
                }
                MessageContent::ToolRequest(request) => {
                    let (name, arguments) = match &request.tool_call {
                        Ok(tool_call) => (
                            sanitize_function_name(&tool_call.name),
                            tool_call.arguments.to_string(),
                        ),
                        Err(_) => (INVALID_TOOL_CALL_NAME.to_string(), "{}".to_string()),
                    };
                    if let Some(object) = converted.as_object_mut() {
                        let tool_calls = object.entry("tool_calls").or_insert(json!([]));
                        if let Some(array) = tool_calls.as_array_mut() {
                            array.push(json!({
                                "id": request.id,
                                "type": "function",
                                "function": {
                                    "name": name,
                                    "arguments": arguments,
                                }
                            }));
                        }
                    }
                }
                MessageContent::ToolResponse(response) => {
                    converted["tool_call_id"] = json!(response.id);
                    let text = match &response.tool_result {
                        Ok(contents) => tool_result_text(contents),
                        // Shown as output so the model can react to the error
                        Err(e) => format!("The tool call returned the following error:\n{}", e),
                    };
                    parts.push(json!({"type": "text", "text": text}));
                }
            }
        }

        if has_image {
            converted["content"] = json!(parts);
        } else if !parts.is_empty() {
            let text: Vec<&str> = parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect();
            converted["content"] = json!(text.join("\n"));
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            messages_spec.push(converted);
        }
    }

    messages_spec
}

fn tool_result_text(contents: &[Content]) -> String {
    contents
        .iter()
        .map(|content| match content {
            Content::Text(text) => text.text.clone(),
            Content::Image(image) => format!("[image result: {}]", image.mime_type),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn convert_image(image: &ImageContent) -> Value {
    json!({
        "type": "image_url",
        "image_url": {
            "url": format!("data:{};base64,{}", image.mime_type, image.data)
        }
    })
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        }));
    }

    Ok(result)
}

/// Convert OpenAI's API response to internal Message format
pub fn openai_response_to_message(response: &Value) -> Result<Message> {
    let original = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("No message in response: {}", response))?;

    let mut message = Message::assistant();

    if let Some(text) = original.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for tool_call in tool_calls {
            let id = tool_call["id"].as_str().unwrap_or_default().to_string();
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default();

            let parsed = parse_tool_call(&id, &function_name, arguments);
            message = message.with_tool_request(id.clone(), parsed);
        }
    }

    Ok(message)
}

/// Build a ToolCall from the raw name and JSON-encoded arguments the model produced
pub fn parse_tool_call(id: &str, name: &str, arguments: &str) -> Result<ToolCall, AgentError> {
    if !is_valid_function_name(name) {
        return Err(AgentError::InvalidParameters(format!(
            "The provided function name '{}' had invalid characters, \
             it must match this regex [a-zA-Z0-9_-]+",
            name
        )));
    }
    // Some models send an empty string for functions that take no arguments
    let arguments = if arguments.trim().is_empty() {
        "{}"
    } else {
        arguments
    };
    serde_json::from_str::<Value>(arguments)
        .map(|params| ToolCall::new(name, params))
        .map_err(|e| {
            AgentError::InvalidParameters(format!(
                "Could not interpret tool use parameters for id {}: {}",
                id, e
            ))
        })
}

fn invalid_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex"))
}

pub fn sanitize_function_name(name: &str) -> String {
    invalid_chars().replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty() && !invalid_chars().is_match(name)
}

#[derive(Debug, thiserror::Error)]
#[error("Context length exceeded. Message: {0}")]
pub struct ContextLengthExceededError(String);

pub fn check_openai_context_length_error(error: &Value) -> Option<ContextLengthExceededError> {
    let code = error.get("code")?.as_str()?;
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error")
            .to_string();
        Some(ContextLengthExceededError(message))
    } else {
        None
    }
}

//! Google Gemini provider, speaking the `generateContent` API

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::base::{Provider, Usage};
use super::configs::GoogleProviderConfig;
use super::utils::parse_tool_call;
use crate::models::content::Content;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::Tool;

pub const GOOGLE_HOST: &str = "https://generativelanguage.googleapis.com";
pub const GOOGLE_MODEL: &str = "gemini-2.0-flash";

pub struct GoogleProvider {
    client: Client,
    config: GoogleProviderConfig,
}

impl GoogleProvider {
    pub fn new(config: GoogleProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.host.trim_end_matches('/'),
            self.config.model
        )
    }

    fn translate_request(&self, messages: &[Message], tools: &[Tool]) -> GeminiRequest {
        let mut system_texts = Vec::new();
        let mut contents = Vec::new();
        // Gemini answers function calls by name, not by id
        let mut call_names: HashMap<&str, String> = HashMap::new();

        for message in messages {
            if message.role == Role::System {
                system_texts.push(message.text());
                continue;
            }

            let mut parts = Vec::new();
            for content in &message.content {
                match content {
                    MessageContent::Text(text) if !text.text.is_empty() => {
                        parts.push(GeminiPart::Text {
                            text: text.text.clone(),
                        });
                    }
                    MessageContent::Text(_) => {}
                    MessageContent::Image(image) => parts.push(GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: image.mime_type.clone(),
                            data: image.data.clone(),
                        },
                    }),
                    MessageContent::ToolRequest(request) => {
                        // Malformed calls were never executed by Gemini's standards; the error
                        // response below is sent as plain text instead.
                        if let Ok(call) = &request.tool_call {
                            call_names.insert(request.id.as_str(), call.name.clone());
                            parts.push(GeminiPart::FunctionCall {
                                function_call: GeminiFunctionCall {
                                    name: call.name.clone(),
                                    args: call.arguments.clone(),
                                },
                            });
                        }
                    }
                    MessageContent::ToolResponse(response) => {
                        let name = call_names.get(response.id.as_str()).cloned();
                        let payload = match &response.tool_result {
                            Ok(contents) => json!({ "result": contents_text(contents) }),
                            Err(e) => json!({ "error": e.to_string() }),
                        };
                        match name {
                            Some(name) => parts.push(GeminiPart::FunctionResponse {
                                function_response: GeminiFunctionResponse {
                                    name,
                                    response: payload,
                                },
                            }),
                            None => parts.push(GeminiPart::Text {
                                text: format!(
                                    "The tool call returned the following error:\n{}",
                                    payload
                                ),
                            }),
                        }
                    }
                }
            }

            if !parts.is_empty() {
                let role = match message.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                contents.push(GeminiContent {
                    role: Some(role.to_string()),
                    parts,
                });
            }
        }

        let system_instruction = if system_texts.is_empty() {
            None
        } else {
            Some(GeminiContent {
                role: None,
                parts: vec![GeminiPart::Text {
                    text: system_texts.join("\n\n"),
                }],
            })
        };

        let tools = if tools.is_empty() {
            None
        } else {
            Some(vec![GeminiTool {
                function_declarations: tools
                    .iter()
                    .map(|t| GeminiFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: declared_parameters(&t.parameters),
                    })
                    .collect(),
            }])
        };

        GeminiRequest {
            contents,
            system_instruction,
            tools,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            }),
        }
    }

    fn normalize_response(response: GeminiResponse) -> Result<(Message, Usage)> {
        let candidate = response
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No candidates in Gemini response"))?;

        let mut message = Message::assistant();
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            match part {
                GeminiPart::Text { text } if !text.is_empty() => {
                    message = message.with_text(text);
                }
                GeminiPart::FunctionCall { function_call } => {
                    let id = format!("call_{}", Uuid::new_v4().simple());
                    let arguments = if function_call.args.is_null() {
                        "{}".to_string()
                    } else {
                        function_call.args.to_string()
                    };
                    let tool_call = parse_tool_call(&id, &function_call.name, &arguments);
                    message = message.with_tool_request(id, tool_call);
                }
                _ => {}
            }
        }

        let usage = response
            .usage_metadata
            .map(|u| {
                Usage::new(
                    u.prompt_token_count,
                    u.candidates_token_count,
                    u.total_token_count,
                )
            })
            .unwrap_or_default();

        Ok((message, usage))
    }
}

fn contents_text(contents: &[Content]) -> String {
    contents
        .iter()
        .filter_map(Content::as_text)
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Provider for GoogleProvider {
    async fn complete(&self, messages: &[Message], tools: &[Tool]) -> Result<(Message, Usage)> {
        let request = self.translate_request(messages, tools);

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiErrorResponse>(&body) {
                return Err(anyhow!("Gemini API error ({}): {}", status, error.error.message));
            }
            return Err(anyhow!("Request failed: {}\nResponse: {}", status, body));
        }

        let response: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| anyhow!("Failed to parse Gemini response: {} - body: {}", e, body))?;

        Self::normalize_response(response)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
    Other(Value),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

/// Gemini rejects object schemas with empty `properties`, so argument-less tools omit them
fn declared_parameters(parameters: &Value) -> Option<Value> {
    let has_properties = parameters
        .get("properties")
        .and_then(Value::as_object)
        .is_some_and(|properties| !properties.is_empty());
    has_properties.then(|| parameters.clone())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    prompt_token_count: Option<i32>,
    candidates_token_count: Option<i32>,
    total_token_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

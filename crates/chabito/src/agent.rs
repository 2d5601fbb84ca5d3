use std::time::Duration;
use tokio::time::timeout;

use crate::conversation::Conversation;
use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::message::{Message, ToolRequest};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::providers::base::Provider;
use crate::tools::{validate_arguments, ToolRegistry};

pub const DEFAULT_MAX_ROUNDS: usize = 8;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentSettings {
    /// Tool-call rounds allowed in one turn before giving up
    pub max_rounds: usize,
    /// Bound applied to every single model or tool invocation
    pub call_timeout: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Agent integrates a foundational LLM with the capabilities it may call
pub struct Agent {
    provider: Box<dyn Provider>,
    registry: ToolRegistry,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        provider: Box<dyn Provider>,
        registry: ToolRegistry,
        settings: AgentSettings,
    ) -> Self {
        Self {
            provider,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run one turn: append the human message, call the model, answer every tool
    /// request and call the model again until it replies without tool requests.
    ///
    /// The turn is staged on top of the committed history and only committed to
    /// `conversation` once the final reply arrives. On error the conversation is
    /// left exactly as it was before the call.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        human: Message,
    ) -> AgentResult<Message> {
        if human.role != Role::Human {
            return Err(AgentError::Internal(format!(
                "A turn must start with a human message, got {}",
                human.role
            )));
        }

        let committed = conversation.len();
        let mut working = conversation.messages().to_vec();
        let tools = self.registry.tools();

        working.push(human);
        let mut reply = self.invoke_model(&working, &tools).await?;
        working.push(reply.clone());

        let mut rounds = 0;
        while reply.has_tool_requests() {
            if rounds >= self.settings.max_rounds {
                tracing::warn!(
                    conversation_id = conversation.id(),
                    max_rounds = self.settings.max_rounds,
                    "model kept requesting tools, abandoning turn"
                );
                return Err(AgentError::LoopExceeded(self.settings.max_rounds));
            }
            rounds += 1;

            // Answer in the order the model emitted the requests, one result per request
            for request in reply.tool_requests() {
                let result = self.dispatch_tool_call(request).await?;
                working.push(Message::tool().with_tool_response(request.id.clone(), result));
            }

            reply = self.invoke_model(&working, &tools).await?;
            working.push(reply.clone());
        }

        tracing::info!(
            conversation_id = conversation.id(),
            rounds,
            appended = working.len() - committed,
            "turn completed"
        );
        conversation.extend(working.drain(committed..));
        Ok(reply)
    }

    async fn invoke_model(&self, messages: &[Message], tools: &[Tool]) -> AgentResult<Message> {
        let after = self.settings.call_timeout;
        let (reply, usage) = timeout(after, self.provider.complete(messages, tools))
            .await
            .map_err(|_| AgentError::Timeout {
                operation: "model invocation".to_string(),
                after,
            })?
            .map_err(|e| AgentError::ModelInvocation(format!("{:#}", e)))?;

        if reply.role != Role::Assistant {
            return Err(AgentError::ModelInvocation(format!(
                "expected an assistant reply, got {}",
                reply.role
            )));
        }
        tracing::debug!(
            tool_requests = reply.tool_requests().len(),
            total_tokens = usage.total_tokens,
            "model replied"
        );
        Ok(reply)
    }

    /// Execute one tool request.
    ///
    /// The outer result aborts the turn (unknown tool, timeout). The inner result
    /// is recorded as the tool response so the model can react to it.
    async fn dispatch_tool_call(
        &self,
        request: &ToolRequest,
    ) -> AgentResult<AgentResult<Vec<Content>>> {
        let call = match &request.tool_call {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "malformed tool request");
                return Ok(Err(e.clone()));
            }
        };

        let capability = self
            .registry
            .resolve(&call.name)
            .ok_or_else(|| AgentError::UnknownTool(call.name.clone()))?;

        if let Err(e) = validate_arguments(capability.tool(), &call.arguments) {
            tracing::warn!(tool = %call.name, error = %e, "rejected tool arguments");
            return Ok(Err(e));
        }

        tracing::info!(tool = %call.name, request_id = %request.id, "calling tool");
        let after = self.settings.call_timeout;
        let result = timeout(after, capability.call(call.arguments.clone()))
            .await
            .map_err(|_| AgentError::Timeout {
                operation: format!("tool call {}", call.name),
                after,
            })?;

        if let Err(e) = &result {
            tracing::warn!(tool = %call.name, error = %e, "tool call failed");
        }
        Ok(result)
    }
}

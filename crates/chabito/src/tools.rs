//! Capability registry: the tools a model may request by name.
//!
//! The registry is populated at startup and shared read-only with the agent
//! loop afterwards.
pub mod datetime;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::{AgentError, AgentResult};
use crate::models::content::Content;
use crate::models::tool::Tool;

/// A unit of work the model can invoke with structured arguments
#[async_trait]
pub trait Capability: Send + Sync {
    /// Name, description and argument schema advertised to the model
    fn tool(&self) -> &Tool;

    /// Invoke the capability. Arguments have already passed [`validate_arguments`].
    async fn call(&self, arguments: Value) -> AgentResult<Vec<Content>>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its tool name. Names must be unique.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> AgentResult<()> {
        let name = capability.tool().name.clone();
        if self.capabilities.contains_key(&name) {
            return Err(AgentError::Internal(format!(
                "A tool named '{}' is already registered",
                name
            )));
        }
        self.capabilities.insert(name, capability);
        Ok(())
    }

    pub fn with(mut self, capability: Arc<dyn Capability>) -> AgentResult<Self> {
        self.register(capability)?;
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Tools sorted by name so the advertised list is stable between calls
    pub fn tools(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self
            .capabilities
            .values()
            .map(|capability| capability.tool().clone())
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Build a capability by its configured name
pub fn builtin(name: &str) -> Option<Arc<dyn Capability>> {
    match name {
        datetime::CURRENT_DATETIME => Some(Arc::new(datetime::CurrentDateTime::new())),
        _ => None,
    }
}

/// Check the arguments against the tool schema before invocation.
///
/// Only the shape the model is most likely to get wrong is checked: the
/// arguments must be an object and carry every `required` property.
pub fn validate_arguments(tool: &Tool, arguments: &Value) -> AgentResult<()> {
    let object = arguments.as_object().ok_or_else(|| {
        AgentError::InvalidParameters(format!(
            "Arguments for '{}' must be a JSON object, got {}",
            tool.name, arguments
        ))
    })?;

    let missing: Vec<&str> = tool
        .required_arguments()
        .into_iter()
        .filter(|name| !object.contains_key(*name))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AgentError::InvalidParameters(format!(
            "Missing required arguments for '{}': {}",
            tool.name,
            missing.join(", ")
        )))
    }
}

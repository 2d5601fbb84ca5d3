use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use super::Capability;
use crate::errors::AgentResult;
use crate::models::content::Content;
use crate::models::tool::Tool;

pub const CURRENT_DATETIME: &str = "current_datetime";

/// Reports the current UTC date and time
pub struct CurrentDateTime {
    tool: Tool,
}

impl Default for CurrentDateTime {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentDateTime {
    pub fn new() -> Self {
        Self {
            tool: Tool::new(
                CURRENT_DATETIME,
                "Returns the current date and time in UTC, formatted as RFC 3339",
                json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                }),
            ),
        }
    }
}

#[async_trait]
impl Capability for CurrentDateTime {
    fn tool(&self) -> &Tool {
        &self.tool
    }

    async fn call(&self, _arguments: Value) -> AgentResult<Vec<Content>> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        Ok(vec![Content::text(now)])
    }
}

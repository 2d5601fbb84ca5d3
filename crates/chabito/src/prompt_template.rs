use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tera::{Context, Error as TeraError, Tera};

use crate::models::tool::Tool;

/// Seed instructions used when no template is configured
pub const DEFAULT_SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");

pub fn load_prompt<T: Serialize>(template: &str, context_data: &T) -> Result<String, TeraError> {
    let mut tera = Tera::default();
    tera.add_raw_template("inline_template", template)?;
    let context = Context::from_serialize(context_data)?;
    tera.render("inline_template", &context)
}

pub fn load_prompt_file<T: Serialize>(
    template_file: impl Into<PathBuf>,
    context_data: &T,
) -> Result<String, TeraError> {
    let template_content = fs::read_to_string(template_file.into())
        .map_err(|e| TeraError::chain("Failed to read template file", e))?;
    load_prompt(&template_content, context_data)
}

#[derive(Serialize)]
struct SystemPromptContext<'a> {
    assistant_name: &'a str,
    tools: &'a [Tool],
}

/// Render the seed system message once at startup.
///
/// `template` overrides [`DEFAULT_SYSTEM_TEMPLATE`]; it may reference
/// `assistant_name` and `tools`.
pub fn render_system_prompt(
    template: Option<&str>,
    assistant_name: &str,
    tools: &[Tool],
) -> Result<String, TeraError> {
    let context = SystemPromptContext {
        assistant_name,
        tools,
    };
    let rendered = load_prompt(template.unwrap_or(DEFAULT_SYSTEM_TEMPLATE), &context)?;
    Ok(rendered.trim().to_string())
}

/// Same as [`render_system_prompt`] with the template read from disk
pub fn render_system_prompt_file(
    template_file: impl Into<PathBuf>,
    assistant_name: &str,
    tools: &[Tool],
) -> Result<String, TeraError> {
    let context = SystemPromptContext {
        assistant_name,
        tools,
    };
    let rendered = load_prompt_file(template_file, &context)?;
    Ok(rendered.trim().to_string())
}

mod configuration;
mod error;
mod payload;
mod routes;
mod state;

use anyhow::{anyhow, Context};
use chabito::{
    agent::Agent,
    chat::ChatService,
    conversation::ConversationStore,
    db::Database,
    prompt_template::{render_system_prompt, render_system_prompt_file},
    providers::factory,
    tools::{self, ToolRegistry},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::configuration::Settings;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::new()?;
    let addr = settings.server.socket_addr()?;
    let state = AppState::new(build_chat_service(settings).await?);

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Wire the provider, capabilities, seed prompt and optional audit log together
async fn build_chat_service(settings: Settings) -> anyhow::Result<ChatService> {
    let registry = build_registry(&settings.agent.tools)?;
    let tools = registry.tools();
    let seed = match &settings.agent.system_prompt_file {
        Some(path) => render_system_prompt_file(path, &settings.agent.assistant_name, &tools)
            .with_context(|| {
                format!("failed to render the system prompt from {}", path.display())
            })?,
        None => render_system_prompt(
            settings.agent.system_prompt.as_deref(),
            &settings.agent.assistant_name,
            &tools,
        )
        .context("failed to render the system prompt")?,
    };

    info!(
        provider = ?settings.provider.provider_type(),
        tools = registry.len(),
        max_rounds = settings.agent.max_rounds,
        "starting agent"
    );
    let agent_settings = settings.agent.settings();
    let provider = factory::get_provider(settings.provider.into_config())?;
    let agent = Agent::new(provider, registry, agent_settings);
    let service = ChatService::new(ConversationStore::new(seed), agent);

    match settings.database.url {
        Some(url) => {
            let database = Database::connect(&url).await?;
            database.migrate().await?;
            Ok(service.with_audit(database))
        }
        None => {
            info!("no database configured, conversations are not audited");
            Ok(service)
        }
    }
}

fn build_registry(names: &[String]) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for name in names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
    {
        let capability = tools::builtin(name)
            .ok_or_else(|| anyhow!("unknown tool '{}' in agent.tools", name))?;
        registry.register(capability)?;
    }
    Ok(registry)
}

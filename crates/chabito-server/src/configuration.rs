use crate::error::{to_env_var, ConfigError};
use chabito::agent::{AgentSettings, DEFAULT_MAX_ROUNDS};
use chabito::providers::{
    configs::{GoogleProviderConfig, OpenAiProviderConfig, ProviderConfig},
    factory::ProviderType,
    google, openai,
};
use chabito::tools::datetime::CURRENT_DATETIME;
use config::{Config, Environment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ProviderSettings {
    OpenAi {
        #[serde(default = "default_openai_host")]
        host: String,
        api_key: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    Google {
        #[serde(default = "default_google_host")]
        host: String,
        api_key: String,
        #[serde(default = "default_google_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
}

impl ProviderSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderSettings::OpenAi { .. } => ProviderType::OpenAi,
            ProviderSettings::Google { .. } => ProviderType::Google,
        }
    }

    pub fn into_config(self) -> ProviderConfig {
        match self {
            ProviderSettings::OpenAi {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::OpenAi(OpenAiProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
            ProviderSettings::Google {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::Google(GoogleProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    /// Tera template replacing the bundled system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Same as `system_prompt`, read from a file; takes precedence when both are set
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Names of the built-in capabilities to register
    #[serde(default = "default_tools")]
    pub tools: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            system_prompt: None,
            system_prompt_file: None,
            max_rounds: default_max_rounds(),
            call_timeout_secs: default_call_timeout_secs(),
            tools: default_tools(),
        }
    }
}

impl AgentConfig {
    pub fn settings(&self) -> AgentSettings {
        AgentSettings {
            max_rounds: self.max_rounds,
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite url for the audit log; auditing is off when unset
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .add_source(
                Environment::with_prefix("CHABITO")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("agent.tools")
                    .try_parsing(true),
            )
            .build()?;

        let result: Result<Self, config::ConfigError> = config.try_deserialize();

        match result {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);

                // Extract the field name from "missing field `api_key`"
                let error_str = err.to_string();
                if let Some(rest) = error_str.strip_prefix("missing field `") {
                    let field = rest.split('`').next().unwrap_or(rest);
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(ConfigError::Other(err))
                }
            }
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_openai_host() -> String {
    openai::OPENAI_HOST.to_string()
}

fn default_openai_model() -> String {
    openai::OPENAI_MODEL.to_string()
}

fn default_google_host() -> String {
    google::GOOGLE_HOST.to_string()
}

fn default_google_model() -> String {
    google::GOOGLE_MODEL.to_string()
}

fn default_assistant_name() -> String {
    "chabito".to_string()
}

fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_tools() -> Vec<String> {
    vec![CURRENT_DATETIME.to_string()]
}

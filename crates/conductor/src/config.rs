use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::conversation::Pricing;
use crate::providers::configs::{
    AnthropicProviderConfig, OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig,
    ANTHROPIC_HOST, ANTHROPIC_MODEL, OLLAMA_HOST, OLLAMA_MODEL, OPENAI_HOST, OPENAI_MODEL,
};
use crate::providers::factory::ProviderType;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "CONDUCTOR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration, set {env_var}")]
    MissingEnvVar { env_var: String },

    #[error(transparent)]
    Other(#[from] config::ConfigError),
}

/// Environment variable that sets a dotted configuration key
pub fn to_env_var(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.replace('.', "__").to_uppercase())
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
        max_tokens: Option<u32>,
        #[serde(default)]
        pricing: Option<Pricing>,
    },
    Anthropic {
        #[serde(default = "default_anthropic_host")]
        host: String,
        api_key: String,
        #[serde(default = "default_anthropic_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<u32>,
        #[serde(default)]
        pricing: Option<Pricing>,
    },
    Ollama {
        #[serde(default = "default_ollama_host")]
        host: String,
        #[serde(default = "default_ollama_model")]
        model: String,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
}

impl ProviderSettings {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderSettings::OpenAi { .. } => ProviderType::OpenAi,
            ProviderSettings::Anthropic { .. } => ProviderType::Anthropic,
            ProviderSettings::Ollama { .. } => ProviderType::Ollama,
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
                pricing,
            } => ProviderConfig::OpenAi(OpenAiProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
                pricing,
            }),
            ProviderSettings::Anthropic {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
                pricing,
            } => ProviderConfig::Anthropic(AnthropicProviderConfig {
                host,
                api_key,
                model,
                temperature,
                max_tokens,
                pricing,
            }),
            ProviderSettings::Ollama {
                host,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::Ollama(OllamaProviderConfig {
                host,
                model,
                temperature,
                max_tokens,
            }),
        }
    }
}

/// Turn loop settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub system_prompt: String,
    /// Per tool call bound, in seconds
    pub tool_timeout_secs: u64,
    /// Rounds allowed for one user turn before it fails
    pub max_rounds: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            tool_timeout_secs: 60,
            max_rounds: 25,
            retry: RetryPolicy::default(),
        }
    }
}

/// A tool server started as a child process and spoken to over stdio
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StdioServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl StdioServerConfig {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// A tool server reached over an HTTP session
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub stdio: Vec<StdioServerConfig>,
    pub http: Vec<HttpServerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub provider: ProviderSettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
}

impl Settings {
    /// Load from `<config dir>/conductor/config.toml` when present, then the environment
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(default_config_path())
    }

    /// Load from the given TOML file, then the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load(Some(path.as_ref().to_path_buf()))
    }

    fn load(file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            tracing::debug!(path = %path.display(), "reading configuration file");
            builder = builder.add_source(File::from(path).required(false));
        }
        let config = builder
            // Layer on the environment variables
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);
                Err(missing_field(err))
            }
        }
    }
}

/// Required fields only live in the provider section, so a missing one is
/// reported as the variable that would supply it.
fn missing_field(err: config::ConfigError) -> ConfigError {
    let message = err.to_string();
    let field = message
        .split("missing field `")
        .nth(1)
        .and_then(|rest| rest.split('`').next());

    match field {
        Some("provider") | Some("type") => ConfigError::MissingEnvVar {
            env_var: to_env_var("provider.type"),
        },
        Some("api_key") => ConfigError::MissingEnvVar {
            env_var: to_env_var("provider.api_key"),
        },
        _ => match err {
            config::ConfigError::NotFound(key) => ConfigError::MissingEnvVar {
                env_var: to_env_var(&key),
            },
            other => ConfigError::Other(other),
        },
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("conductor").join("config.toml"))
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_openai_model() -> String {
    OPENAI_MODEL.to_string()
}

fn default_anthropic_host() -> String {
    ANTHROPIC_HOST.to_string()
}

fn default_anthropic_model() -> String {
    ANTHROPIC_MODEL.to_string()
}

fn default_ollama_host() -> String {
    OLLAMA_HOST.to_string()
}

fn default_ollama_model() -> String {
    OLLAMA_MODEL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::io::Write;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("CONDUCTOR_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    fn test_to_env_var() {
        assert_eq!(to_env_var("provider.api_key"), "CONDUCTOR_PROVIDER__API_KEY");
        assert_eq!(to_env_var("engine"), "CONDUCTOR_ENGINE");
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "openai");
        env::set_var("CONDUCTOR_PROVIDER__API_KEY", "test-key");

        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.engine, EngineSettings::default());
        assert_eq!(settings.engine.tool_timeout_secs, 60);
        assert_eq!(settings.engine.max_rounds, 25);
        assert_eq!(settings.remote, RemoteSettings::default());

        if let ProviderSettings::OpenAi {
            host,
            api_key,
            model,
            temperature,
            max_tokens,
            pricing,
        } = settings.provider
        {
            assert_eq!(host, "https://api.openai.com");
            assert_eq!(api_key, "test-key");
            assert_eq!(model, "gpt-4o");
            assert_eq!(temperature, None);
            assert_eq!(max_tokens, None);
            assert_eq!(pricing, None);
        } else {
            panic!("Expected OpenAI provider");
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_anthropic_settings() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "anthropic");
        env::set_var("CONDUCTOR_PROVIDER__API_KEY", "sk-ant");
        env::set_var("CONDUCTOR_PROVIDER__TEMPERATURE", "0.7");
        env::set_var("CONDUCTOR_PROVIDER__MAX_TOKENS", "2000");
        env::set_var("CONDUCTOR_PROVIDER__PRICING__INPUT_PER_MILLION", "3");
        env::set_var("CONDUCTOR_PROVIDER__PRICING__OUTPUT_PER_MILLION", "15");

        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.provider.provider_type(), ProviderType::Anthropic);
        match settings.provider.into_config() {
            ProviderConfig::Anthropic(config) => {
                assert_eq!(config.host, ANTHROPIC_HOST);
                assert_eq!(config.model, ANTHROPIC_MODEL);
                assert_eq!(config.temperature, Some(0.7));
                assert_eq!(config.max_tokens, Some(2000));
                assert_eq!(config.pricing, Some(Pricing::new(3.0, 15.0)));
            }
            other => panic!("Expected Anthropic config, got {other:?}"),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_api_key_names_env_var() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "openai");

        match Settings::load(None) {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "CONDUCTOR_PROVIDER__API_KEY")
            }
            other => panic!("unexpected {other:?}"),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_provider_names_env_var() {
        clean_env();

        match Settings::load(None) {
            Err(ConfigError::MissingEnvVar { env_var }) => {
                assert_eq!(env_var, "CONDUCTOR_PROVIDER__TYPE")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_file_with_environment_override() {
        clean_env();
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[provider]
type = "ollama"
model = "llama3.1"

[engine]
system_prompt = "Be terse."
tool_timeout_secs = 5

[engine.retry]
max_attempts = 5

[[remote.stdio]]
name = "files"
command = "~/bin/file-server"
args = ["--root", "/tmp"]

[[remote.http]]
name = "search"
url = "http://localhost:8931/mcp"
"#
        )
        .unwrap();
        env::set_var("CONDUCTOR_ENGINE__MAX_ROUNDS", "3");

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.provider.provider_type(), ProviderType::Ollama);
        assert_eq!(settings.engine.system_prompt, "Be terse.");
        assert_eq!(settings.engine.tool_timeout_secs, 5);
        assert_eq!(settings.engine.max_rounds, 3);
        assert_eq!(settings.engine.retry.max_attempts, 5);
        assert_eq!(settings.engine.retry.initial_delay_ms, 1_000);
        assert_eq!(
            settings.remote.stdio,
            vec![StdioServerConfig::new("files", "~/bin/file-server").with_args(["--root", "/tmp"])]
        );
        assert_eq!(settings.remote.http[0].url, "http://localhost:8931/mcp");
        assert_eq!(settings.remote.http[0].bearer_token, None);

        match settings.provider.into_config() {
            ProviderConfig::Ollama(config) => {
                assert_eq!(config.host, OLLAMA_HOST);
                assert_eq!(config.model, "llama3.1");
            }
            other => panic!("Expected Ollama config, got {other:?}"),
        }

        clean_env();
    }

    #[test]
    #[serial]
    fn test_missing_file_is_not_an_error() {
        clean_env();
        env::set_var("CONDUCTOR_PROVIDER__TYPE", "ollama");
        let dir = tempfile::tempdir().unwrap();

        let settings = Settings::from_file(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.provider.provider_type(), ProviderType::Ollama);

        clean_env();
    }
}

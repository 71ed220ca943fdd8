use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::factory::ProviderType;
use crate::conversation::Pricing;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const OPENAI_MODEL: &str = "gpt-4o";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-latest";
pub const OLLAMA_HOST: &str = "http://localhost:11434";
pub const OLLAMA_MODEL: &str = "qwen2.5";

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Ollama(OllamaProviderConfig),
}

impl ProviderConfig {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            ProviderConfig::OpenAi(_) => ProviderType::OpenAi,
            ProviderConfig::Anthropic(_) => ProviderType::Anthropic,
            ProviderConfig::Ollama(_) => ProviderType::Ollama,
        }
    }

    /// Load the configuration for a provider type from its environment variables
    pub fn from_env(provider_type: ProviderType) -> Result<Self> {
        Ok(match provider_type {
            ProviderType::OpenAi => ProviderConfig::OpenAi(OpenAiProviderConfig::from_env()?),
            ProviderType::Anthropic => {
                ProviderConfig::Anthropic(AnthropicProviderConfig::from_env()?)
            }
            ProviderType::Ollama => ProviderConfig::Ollama(OllamaProviderConfig::from_env()?),
        })
    }
}

/// Construction of a provider configuration from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self>;

    fn get_env(key: &str, required: bool, default: Option<String>) -> Result<Option<String>> {
        match std::env::var(key) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            _ if default.is_some() => Ok(default),
            _ if required => Err(anyhow!("Environment variable {} must be set", key)),
            _ => Ok(None),
        }
    }

    fn get_parsed_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
        match Self::get_env(key, false, None)? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| anyhow!("Environment variable {} has an invalid value", key)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub pricing: Option<Pricing>,
}

impl FromEnv for OpenAiProviderConfig {
    fn from_env() -> Result<Self> {
        let api_key = Self::get_env("OPENAI_API_KEY", true, None)?
            .ok_or_else(|| anyhow!("OpenAI API key must be set"))?;
        let host = Self::get_env("OPENAI_HOST", false, Some(OPENAI_HOST.to_string()))?
            .unwrap_or_else(|| OPENAI_HOST.to_string());
        let model = Self::get_env("OPENAI_MODEL", false, Some(OPENAI_MODEL.to_string()))?
            .unwrap_or_else(|| OPENAI_MODEL.to_string());

        Ok(Self {
            host,
            api_key,
            model,
            temperature: Self::get_parsed_env("OPENAI_TEMPERATURE")?,
            max_tokens: Self::get_parsed_env("OPENAI_MAX_TOKENS")?,
            pricing: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub pricing: Option<Pricing>,
}

impl FromEnv for AnthropicProviderConfig {
    fn from_env() -> Result<Self> {
        let api_key = Self::get_env("ANTHROPIC_API_KEY", true, None)?
            .ok_or_else(|| anyhow!("Anthropic API key must be set"))?;
        let host = Self::get_env("ANTHROPIC_HOST", false, Some(ANTHROPIC_HOST.to_string()))?
            .unwrap_or_else(|| ANTHROPIC_HOST.to_string());
        let model = Self::get_env("ANTHROPIC_MODEL", false, Some(ANTHROPIC_MODEL.to_string()))?
            .unwrap_or_else(|| ANTHROPIC_MODEL.to_string());

        Ok(Self {
            host,
            api_key,
            model,
            temperature: Self::get_parsed_env("ANTHROPIC_TEMPERATURE")?,
            max_tokens: Self::get_parsed_env("ANTHROPIC_MAX_TOKENS")?,
            pricing: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaProviderConfig {
    pub host: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl FromEnv for OllamaProviderConfig {
    fn from_env() -> Result<Self> {
        let host = Self::get_env("OLLAMA_HOST", false, Some(OLLAMA_HOST.to_string()))?
            .unwrap_or_else(|| OLLAMA_HOST.to_string());
        let model = Self::get_env("OLLAMA_MODEL", false, Some(OLLAMA_MODEL.to_string()))?
            .unwrap_or_else(|| OLLAMA_MODEL.to_string());

        Ok(Self {
            host,
            model,
            temperature: Self::get_parsed_env("OLLAMA_TEMPERATURE")?,
            max_tokens: Self::get_parsed_env("OLLAMA_MAX_TOKENS")?,
        })
    }
}

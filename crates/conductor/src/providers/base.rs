use anyhow::Result;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::Pricing;
use crate::errors::StreamError;
use crate::models::tool::{Tool, ToolCallRequest};
use crate::models::turn::Turn;

/// Token counts exactly as the backend reported them; `None` means not reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl Usage {
    pub fn new(input_tokens: Option<u64>, output_tokens: Option<u64>) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Combine with a later report; reported values win over missing ones
    pub fn merge(self, later: Usage) -> Usage {
        Usage {
            input_tokens: later.input_tokens.or(self.input_tokens),
            output_tokens: later.output_tokens.or(self.output_tokens),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }

    pub fn total_tokens(&self) -> Option<u64> {
        match (self.input_tokens, self.output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallFragment {
    Name(String),
    Arguments(String),
}

/// The normalized events every provider stream is translated into.
///
/// A well-formed stream ends with exactly one `End` or `Error`. Every call
/// announced through `ToolCallDelta` is followed by a `ToolCallComplete` with
/// the same id before `End`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallDelta { id: String, fragment: ToolCallFragment },
    ToolCallComplete(ToolCallRequest),
    Usage(Usage),
    End,
    Error(StreamError),
}

/// Per-request generation parameters, overriding the provider's configured defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<Tool>,
    pub generation: GenerationConfig,
}

/// Base trait for AI providers (OpenAI, Anthropic, etc)
pub trait Provider: Send + Sync {
    /// Short backend name, such as "openai"
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Translate the tool catalog into the backend's native schema
    fn tools_spec(&self, tools: &[Tool]) -> Result<Vec<Value>>;

    /// Start a streaming completion.
    ///
    /// The request is sent when the stream is first polled. Transport and HTTP
    /// failures arrive as a final `StreamEvent::Error` rather than a Rust error,
    /// and dropping the stream stops reading from the network.
    fn stream(&self, request: CompletionRequest) -> BoxStream<'static, StreamEvent>;

    /// Pricing used for cost estimates, when configured
    fn pricing(&self) -> Option<Pricing> {
        None
    }
}

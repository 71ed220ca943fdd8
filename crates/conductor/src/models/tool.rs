use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::errors::ToolError;

/// A tool as advertised to a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    /// The name of the tool
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// A JSON Schema object describing the accepted arguments
    pub input_schema: Value,
}

impl Tool {
    /// Create a new tool with the given name and description
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool call requested by the model.
///
/// Arguments are kept in the backend's encoding (a JSON document as text) until
/// the dispatcher decodes them against the tool's declared parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    /// Backend assigned id, unique within a round
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new<I, N, A>(id: I, name: N, arguments: A) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        A: Into<String>,
    {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// The arguments as a JSON value, treating an empty payload as `{}`.
    ///
    /// Used when echoing a call back to a backend that wants structured input.
    pub fn arguments_value(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(Default::default());
        }
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// The outcome of exactly one tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub output: Result<Value, ToolError>,
    /// Wall-clock time from dispatch to completion
    pub duration: Duration,
}

impl ToolResult {
    pub fn success<S: Into<String>>(call_id: S, output: Value, duration: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            output: Ok(output),
            duration,
        }
    }

    pub fn failure<S: Into<String>>(call_id: S, error: ToolError, duration: Duration) -> Self {
        Self {
            call_id: call_id.into(),
            output: Err(error),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.output.is_ok()
    }

    pub fn error(&self) -> Option<&ToolError> {
        self.output.as_ref().err()
    }

    /// Render the output as the text sent back to a model.
    ///
    /// Errors are shown as output so the model can interpret them.
    pub fn content_text(&self) -> String {
        match &self.output {
            Ok(Value::String(text)) => text.clone(),
            Ok(value) => value.to_string(),
            Err(error) => format!(
                "The tool call returned the following error ({}):\n{}",
                error.kind(),
                error
            ),
        }
    }
}

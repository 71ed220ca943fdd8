use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::models::role::Role;

/// Failures of a single tool invocation.
///
/// These never abort a round: the dispatcher turns each of them into a
/// tool result the model can read and react to.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tool call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Remote transport disconnected: {0}")]
    RemoteTransportDisconnected(String),

    #[error("Tool call cancelled")]
    Cancelled,
}

impl ToolError {
    /// Stable tag for display and for matching in consumers
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::ExecutionFailed(_) => "tool_execution_failed",
            ToolError::Timeout { .. } => "timeout",
            ToolError::RemoteTransportDisconnected(_) => "remote_transport_disconnected",
            ToolError::Cancelled => "cancelled",
        }
    }

    pub fn timeout(after: Duration) -> Self {
        ToolError::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorKind {
    Network,
    RateLimited,
    Server,
    Authentication,
    InvalidRequest,
    ContextLengthExceeded,
    Decode,
    ProtocolViolation,
}

impl StreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamErrorKind::Network => "network",
            StreamErrorKind::RateLimited => "rate_limited",
            StreamErrorKind::Server => "server",
            StreamErrorKind::Authentication => "authentication",
            StreamErrorKind::InvalidRequest => "invalid_request",
            StreamErrorKind::ContextLengthExceeded => "context_length_exceeded",
            StreamErrorKind::Decode => "decode",
            StreamErrorKind::ProtocolViolation => "protocol_violation",
        }
    }

    /// Transient conditions worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamErrorKind::Network | StreamErrorKind::RateLimited | StreamErrorKind::Server
        )
    }
}

impl fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by a provider stream.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error: {message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Server-supplied hint for how long to wait before retrying
    pub retry_after: Option<Duration>,
}

impl StreamError {
    pub fn new<S: Into<String>>(kind: StreamErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
            retry_after: None,
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::Network, message)
    }

    pub fn server<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::Server, message)
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::RateLimited, message)
    }

    pub fn authentication<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::Authentication, message)
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::InvalidRequest, message)
    }

    pub fn decode<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::Decode, message)
    }

    pub fn protocol_violation<S: Into<String>>(message: S) -> Self {
        Self::new(StreamErrorKind::ProtocolViolation, message)
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Violations of the turn ordering rules of a conversation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversationError {
    #[error("Tool result for call '{0}' does not answer a pending tool call")]
    OrphanToolResult(String),

    #[error("Tool turn must carry exactly one tool result, found {0}")]
    MalformedToolTurn(usize),

    #[error("Cannot append a {role:?} turn while {pending} tool call(s) await results")]
    UnansweredToolCalls { role: Role, pending: usize },

    #[error("Tool call id '{0}' appears more than once in one assistant turn")]
    DuplicateCallId(String),
}

/// Failures that end the current user turn.
///
/// The conversation up to the failure point is preserved, so the engine can
/// accept the next user turn afterwards.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Provider stream failed: {0}")]
    Stream(StreamError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: StreamError },

    #[error("No final answer after {0} rounds")]
    RoundLimitExceeded(u32),

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Stream(_) => "stream_error",
            EngineError::ProtocolViolation(_) => "protocol_violation",
            EngineError::RetriesExhausted { .. } => "retries_exhausted",
            EngineError::RoundLimitExceeded(_) => "round_limit_exceeded",
            EngineError::Conversation(_) => "conversation",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A tool named '{0}' is already registered")]
    DuplicateName(String),

    #[error("Invalid tool name '{0}': names must match [a-zA-Z0-9_-] and be at most 64 characters")]
    InvalidName(String),

    #[error("Tool '{0}' has no handler")]
    MissingHandler(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_error_serialization_is_tagged() {
        let error = ToolError::timeout(Duration::from_secs(2));
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value, json!({"kind": "timeout", "detail": {"after_ms": 2000}}));

        let back: ToolError = serde_json::from_value(value).unwrap();
        assert_eq!(back, error);
        assert_eq!(back.kind(), "timeout");
    }

    #[test]
    fn test_stream_error_retryable_defaults() {
        assert!(StreamError::network("reset").retryable);
        assert!(StreamError::rate_limited("slow down").retryable);
        assert!(StreamError::server("502").retryable);
        assert!(!StreamError::authentication("bad key").retryable);
        assert!(!StreamError::protocol_violation("dangling call").retryable);
        assert_eq!(
            StreamError::server("boom").to_string(),
            "server error: boom"
        );
    }

    #[test]
    fn test_engine_error_kinds() {
        let err = EngineError::RetriesExhausted {
            attempts: 3,
            last: StreamError::server("503"),
        };
        assert_eq!(err.kind(), "retries_exhausted");
        assert!(err.to_string().contains("3 attempts"));
    }
}

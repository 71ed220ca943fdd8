use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::role::Role;
use super::tool::{ToolCallRequest, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

/// Content carried inside a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text(TextContent),
    ToolRequest(ToolCallRequest),
    ToolResult(ToolResult),
}

impl MessageContent {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MessageContent::Text(TextContent { text: text.into() })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    pub fn as_tool_request(&self) -> Option<&ToolCallRequest> {
        match self {
            MessageContent::ToolRequest(request) => Some(request),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResult> {
        match self {
            MessageContent::ToolResult(result) => Some(result),
            _ => None,
        }
    }
}

/// One entry of the conversation history.
///
/// The index is assigned when the turn is appended to a conversation; turns
/// built with the constructors below carry index 0 until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub role: Role,
    pub created: i64,
    pub content: Vec<MessageContent>,
    /// Set on assistant turns cut short by cancellation
    #[serde(default)]
    pub truncated: bool,
}

impl Turn {
    fn new(role: Role) -> Self {
        Turn {
            index: 0,
            role,
            created: Utc::now().timestamp(),
            content: Vec::new(),
            truncated: false,
        }
    }

    pub fn user() -> Self {
        Self::new(Role::User)
    }

    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    /// A tool turn answering a single call
    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(Role::Tool).with_content(MessageContent::ToolResult(result))
    }

    pub fn with_content(mut self, content: MessageContent) -> Self {
        self.content.push(content);
        self
    }

    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        self.with_content(MessageContent::text(text))
    }

    pub fn with_tool_request(self, request: ToolCallRequest) -> Self {
        self.with_content(MessageContent::ToolRequest(request))
    }

    pub fn truncated(mut self) -> Self {
        self.truncated = true;
        self
    }

    /// Concatenated text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_requests(&self) -> impl Iterator<Item = &ToolCallRequest> {
        self.content.iter().filter_map(MessageContent::as_tool_request)
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(MessageContent::as_tool_result)
    }

    pub fn has_tool_requests(&self) -> bool {
        self.tool_requests().next().is_some()
    }
}

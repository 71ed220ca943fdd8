use anyhow::{anyhow, Result};
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::Duration;

use crate::errors::{StreamError, StreamErrorKind};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::models::turn::{MessageContent, Turn};

/// Convert turns to OpenAI's chat message specification, system message first
pub fn messages_to_openai_spec(system: &str, turns: &[Turn]) -> Vec<Value> {
    let mut messages_spec = Vec::new();
    if !system.is_empty() {
        messages_spec.push(json!({"role": "system", "content": system}));
    }

    for turn in turns {
        match turn.role {
            Role::User => {
                messages_spec.push(json!({"role": "user", "content": turn.text()}));
            }
            Role::Assistant => {
                let mut converted = json!({"role": "assistant"});
                let text = turn.text();
                converted["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text)
                };

                let tool_calls: Vec<Value> = turn
                    .tool_requests()
                    .map(|request| {
                        json!({
                            "id": request.id,
                            "type": "function",
                            "function": {
                                "name": request.name,
                                "arguments": if request.arguments.trim().is_empty() {
                                    "{}"
                                } else {
                                    request.arguments.as_str()
                                },
                            }
                        })
                    })
                    .collect();
                if !tool_calls.is_empty() {
                    converted["tool_calls"] = json!(tool_calls);
                } else if text.is_empty() {
                    continue;
                }
                messages_spec.push(converted);
            }
            Role::Tool => {
                for content in &turn.content {
                    if let MessageContent::ToolResult(result) = content {
                        messages_spec.push(json!({
                            "role": "tool",
                            "tool_call_id": result.call_id,
                            "content": result.content_text(),
                        }));
                    }
                }
            }
        }
    }

    messages_spec
}

/// Convert the tool catalog to OpenAI's function tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    Ok(result)
}

fn retry_hint_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)try again in\s+(\d+(?:\.\d+)?)\s*(ms|s)\b").ok())
        .as_ref()
}

/// Extract a "try again in 20s" style hint from an error message
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let captures = retry_hint_pattern()?.captures(message)?;
    let amount: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2)?.as_str().to_ascii_lowercase();
    let seconds = if unit == "ms" { amount / 1000.0 } else { amount };
    seconds_to_duration(seconds)
}

/// Negative, non-finite and out-of-range values carry no usable hint
fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// The human readable part of a JSON error body, or the body itself
pub fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.trim().to_string();
    };
    let error = value.get("error").unwrap_or(&value);
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string())
}

pub fn is_context_length_error(error: &Value) -> bool {
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if code == "context_length_exceeded" || code == "string_above_max_length" {
        return true;
    }
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    message.contains("context length") || message.contains("prompt is too long")
}

/// Classify a non-success HTTP response from a provider.
///
/// 429 and 5xx are transient and may carry a retry hint. 401 and 403 are
/// authentication failures. Other 4xx are invalid requests, with context
/// overflows singled out.
pub fn classify_http_error(status: StatusCode, headers: &HeaderMap, body: &str) -> StreamError {
    let message = format!("{}: {}", status, error_message(body));
    let header_hint = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .and_then(seconds_to_duration);
    let hint = header_hint.or_else(|| parse_retry_hint(body));

    match status {
        StatusCode::TOO_MANY_REQUESTS => StreamError::rate_limited(message).with_retry_after(hint),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StreamError::authentication(message),
        status if status.is_server_error() || status.as_u16() == 529 => {
            StreamError::server(message).with_retry_after(hint)
        }
        _ => {
            let error = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|value| value.get("error").cloned());
            if error.as_ref().is_some_and(is_context_length_error) {
                StreamError::new(StreamErrorKind::ContextLengthExceeded, message)
            } else {
                StreamError::invalid_request(message)
            }
        }
    }
}

/// Transport failures before or during a response are transient
pub fn network_error(error: &reqwest::Error) -> StreamError {
    StreamError::network(format!("request failed: {error}"))
}

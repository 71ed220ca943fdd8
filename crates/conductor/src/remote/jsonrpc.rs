//! JSON-RPC 2.0 framing and the MCP messages the transports exchange.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::future::Future;
use tracing::warn;

use super::{RemoteToolInfo, TransportError};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

pub fn request(id: &str, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

/// An inbound message, sorted by shape
#[derive(Debug)]
pub enum Incoming {
    Response {
        id: String,
        outcome: Result<Value, TransportError>,
    },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Invalid(Value),
}

/// Request ids are matched as strings, whether the peer echoes them as strings or numbers
pub fn response_key(id: &Value) -> Option<String> {
    match id {
        Value::String(value) => Some(value.clone()),
        Value::Number(num) => Some(num.to_string()),
        _ => None,
    }
}

pub fn classify(mut message: Value) -> Incoming {
    let method = message
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let params = message.get_mut("params").map(Value::take).unwrap_or(Value::Null);

    match (message.get("id").cloned(), method) {
        (Some(id), Some(method)) => Incoming::Request { id, method, params },
        (None, Some(method)) => Incoming::Notification { method, params },
        (Some(id), None) => {
            let Some(key) = response_key(&id) else {
                return Incoming::Invalid(message);
            };
            let outcome = match message.get("error") {
                Some(error) => Err(TransportError::Rpc {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                }),
                None => Ok(message.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
            };
            Incoming::Response { id: key, outcome }
        }
        (None, None) => Incoming::Invalid(message),
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

pub fn tool_call_params(name: &str, arguments: Value) -> Value {
    json!({
        "name": name,
        "arguments": match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        },
    })
}

/// Parse one page of a `tools/list` result, returning the cursor of the next page
pub fn parse_tool_list(
    result: &Value,
) -> Result<(Vec<RemoteToolInfo>, Option<String>), TransportError> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| TransportError::Protocol("tools/list result has no tools array".into()))?;

    let tools = tools
        .iter()
        .filter_map(|tool| {
            let name = tool.get("name").and_then(Value::as_str)?;
            Some(RemoteToolInfo {
                name: name.to_string(),
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input_schema: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
        })
        .collect();

    let cursor = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string);
    Ok((tools, cursor))
}

/// Collect every page of `tools/list`. A repeated cursor ends the walk.
pub async fn list_all_tools<F, Fut>(
    connection: &str,
    mut fetch: F,
) -> Result<Vec<RemoteToolInfo>, TransportError>
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = Result<Value, TransportError>>,
{
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    let mut seen = HashSet::new();
    loop {
        let params = match &cursor {
            Some(cursor) => json!({"cursor": cursor}),
            None => json!({}),
        };
        let (page, next) = parse_tool_list(&fetch(params).await?)?;
        tools.extend(page);
        match next {
            Some(next) if seen.insert(next.clone()) => cursor = Some(next),
            Some(next) => {
                warn!(connection, cursor = %next, "tool list cursor repeated, stopping");
                break;
            }
            None => break,
        }
    }
    Ok(tools)
}

/// Map a `tools/call` result to a tool output.
///
/// `isError` results fail with their text. Structured content wins over
/// content blocks; all-text content is joined into one string and anything
/// else is returned as the raw block list.
pub fn tool_call_output(mut result: Value) -> Result<Value, TransportError> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let content = result.get_mut("content").map(Value::take);
    let text = content.as_ref().and_then(joined_text);

    if is_error {
        let detail = text.unwrap_or_else(|| content.map(|c| c.to_string()).unwrap_or_default());
        return Err(TransportError::ToolFailed(detail));
    }
    if let Some(structured) = result.get_mut("structuredContent").map(Value::take) {
        if !structured.is_null() {
            return Ok(structured);
        }
    }
    match (text, content) {
        (Some(text), _) => Ok(Value::String(text)),
        (None, Some(content)) => Ok(content),
        (None, None) => Ok(result),
    }
}

fn joined_text(content: &Value) -> Option<String> {
    let blocks = content.as_array()?;
    let texts: Option<Vec<&str>> = blocks
        .iter()
        .map(|block| match block.get("type").and_then(Value::as_str) {
            Some("text") => block.get("text").and_then(Value::as_str),
            _ => None,
        })
        .collect();
    texts.map(|texts| texts.join("\n"))
}

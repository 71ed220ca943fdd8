use anyhow::{anyhow, Result};
use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, trace};

use super::assembler::ToolCallAssembler;
use super::base::{CompletionRequest, Provider, StreamEvent, Usage};
use super::configs::AnthropicProviderConfig;
use super::utils::{classify_http_error, network_error, parse_retry_hint};
use crate::conversation::Pricing;
use crate::errors::{StreamError, StreamErrorKind};
use crate::models::role::Role;
use crate::models::tool::Tool;
use crate::models::turn::{MessageContent, Turn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    /// Convert turns to Anthropic messages.
    ///
    /// Tool results travel inside user messages, so consecutive tool turns are
    /// merged into one user message of `tool_result` blocks.
    pub fn messages_to_anthropic_spec(turns: &[Turn]) -> Vec<Value> {
        let mut messages: Vec<Value> = Vec::new();
        let mut tool_results: Vec<Value> = Vec::new();

        for turn in turns {
            if turn.role != Role::Tool && !tool_results.is_empty() {
                let content = std::mem::take(&mut tool_results);
                messages.push(json!({"role": "user", "content": content}));
            }

            match turn.role {
                Role::User => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{"type": "text", "text": turn.text()}],
                    }));
                }
                Role::Assistant => {
                    let mut content = Vec::new();
                    for item in &turn.content {
                        match item {
                            MessageContent::Text(text) if !text.text.is_empty() => {
                                content.push(json!({"type": "text", "text": text.text}));
                            }
                            MessageContent::ToolRequest(request) => {
                                content.push(json!({
                                    "type": "tool_use",
                                    "id": request.id,
                                    "name": request.name,
                                    "input": request.arguments_value(),
                                }));
                            }
                            _ => {}
                        }
                    }
                    if !content.is_empty() {
                        messages.push(json!({"role": "assistant", "content": content}));
                    }
                }
                Role::Tool => {
                    for result in turn.tool_results() {
                        tool_results.push(json!({
                            "type": "tool_result",
                            "tool_use_id": result.call_id,
                            "content": result.content_text(),
                            "is_error": !result.is_success(),
                        }));
                    }
                }
            }
        }

        if !tool_results.is_empty() {
            messages.push(json!({"role": "user", "content": tool_results}));
        }
        messages
    }

    fn build_payload(&self, request: &CompletionRequest) -> Result<Value> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": Self::messages_to_anthropic_spec(&request.turns),
            "max_tokens": request
                .generation
                .max_tokens
                .or(self.config.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });

        if !request.system.is_empty() {
            payload["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(self.tools_spec(&request.tools)?);
        }
        if let Some(temperature) = request.generation.temperature.or(self.config.temperature) {
            payload["temperature"] = json!(temperature);
        }

        Ok(payload)
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn tools_spec(&self, tools: &[Tool]) -> Result<Vec<Value>> {
        let mut names = HashSet::new();
        tools
            .iter()
            .map(|tool| {
                if !names.insert(&tool.name) {
                    return Err(anyhow!("Duplicate tool name: {}", tool.name));
                }
                Ok(json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                }))
            })
            .collect()
    }

    fn pricing(&self) -> Option<Pricing> {
        self.config.pricing
    }

    fn stream(&self, request: CompletionRequest) -> BoxStream<'static, StreamEvent> {
        let payload = match self.build_payload(&request) {
            Ok(payload) => payload,
            Err(e) => {
                let error = StreamError::invalid_request(e.to_string());
                return stream::once(async move { StreamEvent::Error(error) }).boxed();
            }
        };

        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));
        let builder = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload);
        let model = self.config.model.clone();

        Box::pin(stream! {
            debug!(provider = "anthropic", %model, "starting completion stream");
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    yield StreamEvent::Error(network_error(&e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                yield StreamEvent::Error(classify_http_error(status, &headers, &body));
                return;
            }

            let mut decoder = AnthropicStreamDecoder::new();
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        trace!(event = %event.event, "anthropic SSE");
                        for decoded in decoder.decode(&event.event, &event.data) {
                            yield decoded;
                        }
                    }
                    Err(e) => {
                        yield StreamEvent::Error(StreamError::network(format!("SSE error: {e}")));
                        return;
                    }
                }
                if decoder.is_done() {
                    return;
                }
            }
            if let Some(event) = decoder.finish() {
                yield event;
            }
        })
    }
}

/// Translates Anthropic message stream events into stream events.
///
/// Tool-use blocks complete on `content_block_stop`. Usage from
/// `message_start` and `message_delta` is merged and reported before `End`.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    assembler: ToolCallAssembler,
    usage: Usage,
    done: bool,
}

impl AnthropicStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn decode(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(_) if event_type == "ping" => return Vec::new(),
            Err(e) => {
                self.done = true;
                return vec![StreamEvent::Error(StreamError::decode(format!(
                    "invalid {event_type} event: {e}"
                )))];
            }
        };
        // The event name is repeated in the payload; fall back to it when the SSE field is absent
        let event_type = if event_type.is_empty() || event_type == "message" {
            value.get("type").and_then(Value::as_str).unwrap_or_default()
        } else {
            event_type
        };

        match event_type {
            "message_start" => {
                let usage = &value["message"]["usage"];
                self.record_usage(usage);
                Vec::new()
            }
            "content_block_start" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or_default();
                let block = &value["content_block"];
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => self.assembler.push(
                        index,
                        block.get("id").and_then(Value::as_str),
                        block.get("name").and_then(Value::as_str),
                        None,
                    ),
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|text| !text.is_empty())
                        .map(|text| vec![StreamEvent::TextDelta(text.to_string())])
                        .unwrap_or_default(),
                    _ => Vec::new(),
                }
            }
            "content_block_delta" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or_default();
                let delta = &value["delta"];
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => delta
                        .get("text")
                        .and_then(Value::as_str)
                        .filter(|text| !text.is_empty())
                        .map(|text| vec![StreamEvent::TextDelta(text.to_string())])
                        .unwrap_or_default(),
                    Some("input_json_delta") if self.assembler.contains(index) => {
                        let fragment = delta.get("partial_json").and_then(Value::as_str);
                        self.assembler.push(index, None, None, fragment)
                    }
                    Some("input_json_delta") => {
                        self.done = true;
                        vec![StreamEvent::Error(StreamError::protocol_violation(format!(
                            "input_json_delta for block {index} without a tool_use start"
                        )))]
                    }
                    _ => Vec::new(),
                }
            }
            "content_block_stop" => {
                let index = value.get("index").and_then(Value::as_u64).unwrap_or_default();
                self.assembler.complete(index).into_iter().collect()
            }
            "message_delta" => {
                self.record_usage(&value["usage"]);
                Vec::new()
            }
            "message_stop" => {
                self.done = true;
                let mut events = Vec::new();
                if !self.usage.is_empty() {
                    events.push(StreamEvent::Usage(self.usage));
                }
                events.push(StreamEvent::End);
                events
            }
            "error" => {
                self.done = true;
                vec![StreamEvent::Error(stream_error_from_event(&value["error"]))]
            }
            _ => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(StreamEvent::Error(StreamError::network(
            "stream closed before response completed",
        )))
    }

    fn record_usage(&mut self, usage: &Value) {
        self.usage = self.usage.merge(Usage::new(
            usage.get("input_tokens").and_then(Value::as_u64),
            usage.get("output_tokens").and_then(Value::as_u64),
        ));
    }
}

fn stream_error_from_event(error: &Value) -> StreamError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    match error.get("type").and_then(Value::as_str) {
        Some("overloaded_error") | Some("api_error") => {
            let hint = parse_retry_hint(&message);
            StreamError::server(message).with_retry_after(hint)
        }
        Some("rate_limit_error") => {
            let hint = parse_retry_hint(&message);
            StreamError::rate_limited(message).with_retry_after(hint)
        }
        Some("authentication_error") | Some("permission_error") => {
            StreamError::authentication(message)
        }
        Some("invalid_request_error") if message.contains("prompt is too long") => {
            StreamError::new(StreamErrorKind::ContextLengthExceeded, message)
        }
        _ => StreamError::invalid_request(message),
    }
}

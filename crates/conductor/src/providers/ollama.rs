use anyhow::Result;
use async_stream::stream;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::base::{CompletionRequest, Provider, StreamEvent, ToolCallFragment, Usage};
use super::configs::OllamaProviderConfig;
use super::utils::{classify_http_error, tools_to_openai_spec};
use crate::errors::StreamError;
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCallRequest};
use crate::models::turn::Turn;

pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    /// Ollama's chat messages carry tool arguments as objects and name the
    /// tool on each result instead of referencing a call id.
    pub fn messages_to_ollama_spec(system: &str, turns: &[Turn]) -> Vec<Value> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(json!({"role": "system", "content": system}));
        }

        let mut call_names: HashMap<&str, &str> = HashMap::new();
        for turn in turns {
            match turn.role {
                Role::User => messages.push(json!({"role": "user", "content": turn.text()})),
                Role::Assistant => {
                    let tool_calls: Vec<Value> = turn
                        .tool_requests()
                        .map(|request| {
                            call_names.insert(request.id.as_str(), request.name.as_str());
                            json!({
                                "function": {
                                    "name": request.name,
                                    "arguments": request.arguments_value(),
                                }
                            })
                        })
                        .collect();
                    let mut message = json!({"role": "assistant", "content": turn.text()});
                    if !tool_calls.is_empty() {
                        message["tool_calls"] = json!(tool_calls);
                    }
                    messages.push(message);
                }
                Role::Tool => {
                    for result in turn.tool_results() {
                        let mut message = json!({"role": "tool", "content": result.content_text()});
                        if let Some(name) = call_names.get(result.call_id.as_str()) {
                            message["tool_name"] = json!(name);
                        }
                        messages.push(message);
                    }
                }
            }
        }
        messages
    }

    fn build_payload(&self, request: &CompletionRequest) -> Result<Value> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": Self::messages_to_ollama_spec(&request.system, &request.turns),
            "stream": true,
        });

        if !request.tools.is_empty() {
            payload["tools"] = json!(self.tools_spec(&request.tools)?);
        }
        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.generation.temperature.or(self.config.temperature) {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(tokens) = request.generation.max_tokens.or(self.config.max_tokens) {
            options.insert("num_predict".into(), json!(tokens));
        }
        if !options.is_empty() {
            payload["options"] = Value::Object(options);
        }

        Ok(payload)
    }
}

impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn tools_spec(&self, tools: &[Tool]) -> Result<Vec<Value>> {
        tools_to_openai_spec(tools)
    }

    fn stream(&self, request: CompletionRequest) -> BoxStream<'static, StreamEvent> {
        let payload = match self.build_payload(&request) {
            Ok(payload) => payload,
            Err(e) => {
                let error = StreamError::invalid_request(e.to_string());
                return stream::once(async move { StreamEvent::Error(error) }).boxed();
            }
        };

        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));
        let builder = self.client.post(url).json(&payload);
        let model = self.config.model.clone();

        Box::pin(stream! {
            debug!(provider = "ollama", %model, "starting completion stream");
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    // Usually means the local server is not running
                    yield StreamEvent::Error(StreamError::network(format!(
                        "could not reach ollama: {e}"
                    )));
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

            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)))
                .boxed();
            let mut lines = StreamReader::new(body).lines();
            let mut decoder = OllamaStreamDecoder::new();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        for decoded in decoder.decode_line(&line) {
                            yield decoded;
                        }
                        if decoder.is_done() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield StreamEvent::Error(StreamError::network(format!("read failed: {e}")));
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                yield event;
            }
        })
    }
}

/// Translates Ollama's newline-delimited chat chunks into stream events.
///
/// Ollama sends each tool call whole, so every call produces its name and
/// argument deltas followed immediately by its completion.
#[derive(Debug, Default)]
pub struct OllamaStreamDecoder {
    next_call: usize,
    done: bool,
}

impl OllamaStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn decode_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let line = line.trim();
        if line.is_empty() || self.done {
            return Vec::new();
        }
        let chunk: Value = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.done = true;
                return vec![StreamEvent::Error(StreamError::decode(format!(
                    "invalid chunk: {e}"
                )))];
            }
        };

        if let Some(error) = chunk.get("error") {
            self.done = true;
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return vec![StreamEvent::Error(StreamError::invalid_request(message))];
        }

        let mut events = Vec::new();
        let message = &chunk["message"];
        if let Some(text) = message
            .get("content")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            events.push(StreamEvent::TextDelta(text.to_string()));
        }

        for call in message
            .get("tool_calls")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let function = &call["function"];
            let Some(name) = function.get("name").and_then(Value::as_str) else {
                self.done = true;
                events.push(StreamEvent::Error(StreamError::protocol_violation(
                    "tool call without a name",
                )));
                return events;
            };
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", self.next_call));
            self.next_call += 1;
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) => raw.clone(),
                Some(value) if !value.is_null() => value.to_string(),
                _ => String::new(),
            };

            events.push(StreamEvent::ToolCallDelta {
                id: id.clone(),
                fragment: ToolCallFragment::Name(name.to_string()),
            });
            if !arguments.is_empty() {
                events.push(StreamEvent::ToolCallDelta {
                    id: id.clone(),
                    fragment: ToolCallFragment::Arguments(arguments.clone()),
                });
            }
            events.push(StreamEvent::ToolCallComplete(ToolCallRequest::new(
                id, name, arguments,
            )));
        }

        if chunk.get("done").and_then(Value::as_bool).unwrap_or(false) {
            self.done = true;
            let usage = Usage::new(
                chunk.get("prompt_eval_count").and_then(Value::as_u64),
                chunk.get("eval_count").and_then(Value::as_u64),
            );
            if !usage.is_empty() {
                events.push(StreamEvent::Usage(usage));
            }
            events.push(StreamEvent::End);
        }
        events
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
}

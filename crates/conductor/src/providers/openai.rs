use anyhow::Result;
use async_stream::stream;
use eventsource_stream::Eventsource;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::assembler::ToolCallAssembler;
use super::base::{CompletionRequest, Provider, StreamEvent, Usage};
use super::configs::OpenAiProviderConfig;
use super::utils::{
    classify_http_error, is_context_length_error, messages_to_openai_spec, network_error,
    parse_retry_hint, tools_to_openai_spec,
};
use crate::conversation::Pricing;
use crate::errors::{StreamError, StreamErrorKind};
use crate::models::tool::Tool;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn build_payload(&self, request: &CompletionRequest) -> Result<Value> {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_to_openai_spec(&request.system, &request.turns),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if !request.tools.is_empty() {
            payload["tools"] = json!(self.tools_spec(&request.tools)?);
        }
        if let Some(temperature) = request.generation.temperature.or(self.config.temperature) {
            payload["temperature"] = json!(temperature);
        }
        if let Some(tokens) = request.generation.max_tokens.or(self.config.max_tokens) {
            payload["max_tokens"] = json!(tokens);
        }

        Ok(payload)
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn tools_spec(&self, tools: &[Tool]) -> Result<Vec<Value>> {
        tools_to_openai_spec(tools)
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

        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );
        let builder = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&payload);
        let model = self.config.model.clone();

        Box::pin(stream! {
            debug!(provider = "openai", %model, "starting completion stream");
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

            let mut decoder = OpenAiStreamDecoder::new();
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        for decoded in decoder.decode(&event.data) {
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

/// Translates chat completion chunks into stream events.
///
/// Tool calls are completed when a chunk carries a `finish_reason`; usage is
/// reported just before `End`.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    assembler: ToolCallAssembler,
    usage: Usage,
    done: bool,
}

impl OpenAiStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode the data field of one server-sent event
    pub fn decode(&mut self, data: &str) -> Vec<StreamEvent> {
        let data = data.trim();
        if self.done || data.is_empty() {
            return Vec::new();
        }

        if data == "[DONE]" {
            self.done = true;
            let mut events = Vec::new();
            if !self.usage.is_empty() {
                events.push(StreamEvent::Usage(self.usage));
            }
            events.push(StreamEvent::End);
            return events;
        }

        let chunk: Value = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.done = true;
                return vec![StreamEvent::Error(StreamError::decode(format!(
                    "invalid completion chunk: {e}"
                )))];
            }
        };

        if let Some(error) = chunk.get("error").filter(|error| !error.is_null()) {
            self.done = true;
            return vec![StreamEvent::Error(stream_error_from_body(error))];
        }

        if let Some(usage) = chunk.get("usage").filter(|usage| !usage.is_null()) {
            self.usage = self.usage.merge(Usage::new(
                usage.get("prompt_tokens").and_then(Value::as_u64),
                usage.get("completion_tokens").and_then(Value::as_u64),
            ));
        }

        let mut events = Vec::new();
        let Some(choice) = chunk.get("choices").and_then(|choices| choices.get(0)) else {
            return events;
        };

        let delta = &choice["delta"];
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta(text.to_string()));
            }
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for (position, call) in tool_calls.iter().enumerate() {
                let index = call
                    .get("index")
                    .and_then(Value::as_u64)
                    .unwrap_or(position as u64);
                let function = &call["function"];
                events.extend(self.assembler.push(
                    index,
                    call.get("id").and_then(Value::as_str),
                    function.get("name").and_then(Value::as_str),
                    function.get("arguments").and_then(Value::as_str),
                ));
            }
        }

        if choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .is_some()
        {
            events.extend(self.assembler.complete_all());
        }

        events
    }

    /// Called when the byte stream ends; a stream without `[DONE]` was cut short
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

fn stream_error_from_body(error: &Value) -> StreamError {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    if is_context_length_error(error) {
        return StreamError::new(StreamErrorKind::ContextLengthExceeded, message);
    }
    match error.get("type").and_then(Value::as_str) {
        Some("invalid_request_error") => StreamError::invalid_request(message),
        _ => {
            let hint = parse_retry_hint(&message);
            StreamError::server(message).with_retry_after(hint)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::ToolCallRequest;
    use crate::models::turn::Turn;
    use crate::providers::base::{GenerationConfig, ToolCallFragment};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(chunks: &[Value]) -> String {
        let mut body: String = chunks.iter().map(|c| format!("data: {c}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn request(tools: Vec<Tool>) -> CompletionRequest {
        CompletionRequest {
            system: "You are a helpful assistant.".into(),
            turns: vec![Turn::user().with_text("Hello?")],
            tools,
            generation: GenerationConfig::default(),
        }
    }

    async fn _setup_mock_server(response: ResponseTemplate) -> (MockServer, OpenAiProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test_api_key"))
            .respond_with(response)
            .mount(&mock_server)
            .await;

        // Create the OpenAiProvider with the mock server's URL as the host
        let config = OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
            model: "gpt-4o".to_string(),
            temperature: Some(0.7),
            max_tokens: None,
            pricing: None,
        };

        let provider = OpenAiProvider::new(config).unwrap();
        (mock_server, provider)
    }

    #[test]
    fn test_decoder_text_and_usage() {
        let mut decoder = OpenAiStreamDecoder::new();
        let mut events = Vec::new();
        for chunk in [
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "Hel"}}]}),
            json!({"choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 2}}),
        ] {
            events.extend(decoder.decode(&chunk.to_string()));
        }
        events.extend(decoder.decode("[DONE]"));

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hel".into()),
                StreamEvent::TextDelta("lo".into()),
                StreamEvent::Usage(Usage::new(Some(12), Some(2))),
                StreamEvent::End,
            ]
        );
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_assembles_parallel_tool_calls() {
        let mut decoder = OpenAiStreamDecoder::new();
        let mut events = Vec::new();
        for chunk in [
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "function", "function": {"name": "list_files", "arguments": ""}},
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "{\"pattern\":"}},
                {"index": 1, "id": "call_b", "function": {"name": "read_file", "arguments": "{}"}},
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"*.txt\"}"}},
            ]}, "finish_reason": "tool_calls"}]}),
        ] {
            events.extend(decoder.decode(&chunk.to_string()));
        }

        let completed: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::ToolCallComplete(call) => Some(call.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            completed,
            vec![
                ToolCallRequest::new("call_a", "list_files", "{\"pattern\":\"*.txt\"}"),
                ToolCallRequest::new("call_b", "read_file", "{}"),
            ]
        );
        assert_eq!(
            events[0],
            StreamEvent::ToolCallDelta {
                id: "call_a".into(),
                fragment: ToolCallFragment::Name("list_files".into()),
            }
        );
    }

    #[test]
    fn test_decoder_errors() {
        let mut decoder = OpenAiStreamDecoder::new();
        decoder.decode(&json!({"choices": [{"delta": {"content": "partial"}}]}).to_string());
        match decoder.finish() {
            Some(StreamEvent::Error(error)) => {
                assert_eq!(error.kind, StreamErrorKind::Network);
                assert!(error.retryable);
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut decoder = OpenAiStreamDecoder::new();
        let events = decoder.decode(
            &json!({"error": {"message": "The server had an error. Please try again in 2s", "type": "server_error"}})
                .to_string(),
        );
        match &events[..] {
            [StreamEvent::Error(error)] => {
                assert_eq!(error.kind, StreamErrorKind::Server);
                assert_eq!(error.retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(decoder.decode("[DONE]").is_empty());

        let mut decoder = OpenAiStreamDecoder::new();
        match &decoder.decode("{not json")[..] {
            [StreamEvent::Error(error)] => assert_eq!(error.kind, StreamErrorKind::Decode),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_basic() -> Result<()> {
        let body = sse(&[
            json!({"choices": [{"index": 0, "delta": {"content": "Hello! How can I assist you today?"}, "finish_reason": "stop"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 15, "total_tokens": 27}}),
        ]);
        let (_server, provider) =
            _setup_mock_server(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
                .await;

        let events: Vec<StreamEvent> = provider.stream(request(vec![])).collect().await;

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hello! How can I assist you today?".into()),
                StreamEvent::Usage(Usage::new(Some(12), Some(15))),
                StreamEvent::End,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_sends_tools_and_generation() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({
                "model": "gpt-4o",
                "stream": true,
                "temperature": 0.5,
                "tools": [{"type": "function", "function": {"name": "get_weather"}}],
                "messages": [{"role": "system"}, {"role": "user", "content": "Hello?"}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse(&[]), "text/event-stream"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let provider = OpenAiProvider::new(OpenAiProviderConfig {
            host: mock_server.uri(),
            api_key: "k".into(),
            model: "gpt-4o".into(),
            temperature: Some(0.9),
            max_tokens: None,
            pricing: None,
        })?;
        let mut req = request(vec![Tool::new(
            "get_weather",
            "Gets the current weather for a location",
            json!({"type": "object", "properties": {"location": {"type": "string"}}, "required": ["location"]}),
        )]);
        req.generation.temperature = Some(0.5);

        let events: Vec<StreamEvent> = provider.stream(req).collect().await;
        assert_eq!(events, vec![StreamEvent::End]);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_rate_limited() -> Result<()> {
        let (_server, provider) = _setup_mock_server(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "7")
                .set_body_json(json!({"error": {"message": "Rate limit reached"}})),
        )
        .await;

        let events: Vec<StreamEvent> = provider.stream(request(vec![])).collect().await;
        match &events[..] {
            [StreamEvent::Error(error)] => {
                assert_eq!(error.kind, StreamErrorKind::RateLimited);
                assert!(error.retryable);
                assert_eq!(error.retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_connection_refused_is_retryable() {
        let provider = OpenAiProvider::new(OpenAiProviderConfig {
            host: "http://127.0.0.1:9".into(),
            api_key: "k".into(),
            model: "gpt-4o".into(),
            temperature: None,
            max_tokens: None,
            pricing: None,
        })
        .unwrap();

        let events: Vec<StreamEvent> = provider.stream(request(vec![])).collect().await;
        match &events[..] {
            [StreamEvent::Error(error)] => assert_eq!(error.kind, StreamErrorKind::Network),
            other => panic!("unexpected {other:?}"),
        }
    }
}

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jsonrpc::{self, Incoming};
use super::{RemoteConnection, RemoteToolInfo, TransportError};
use crate::config::HttpServerConfig;

const SESSION_HEADER: &str = "Mcp-Session-Id";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// A tool server reached over HTTP. Every JSON-RPC message is one POST; the
/// answer comes back either as a JSON body or on a short event stream.
pub struct HttpConnection {
    id: String,
    url: String,
    client: Client,
    headers: HeaderMap,
    session: Mutex<Option<String>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    tools_changed: Arc<Notify>,
}

impl HttpConnection {
    pub async fn connect(config: &HttpServerConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Protocol(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::Protocol(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.insert(header, value);
        }
        if let Some(token) = &config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Protocol(format!("invalid bearer token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let connection = Self {
            id: config.name.clone(),
            url: config.url.clone(),
            client,
            headers,
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            tools_changed: Arc::new(Notify::new()),
        };

        match tokio::time::timeout(INITIALIZE_TIMEOUT, connection.initialize()).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(error)) => {
                connection.closed.cancel();
                Err(error)
            }
            Err(_) => {
                connection.closed.cancel();
                Err(TransportError::Timeout(INITIALIZE_TIMEOUT))
            }
        }
    }

    /// The session id the server assigned at initialize, if any
    pub fn session_id(&self) -> Option<String> {
        self.session_slot().clone()
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let result = self
            .request("initialize", jsonrpc::initialize_params())
            .await?;
        info!(
            server = %self.id,
            name = result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
            protocol = result["protocolVersion"].as_str().unwrap_or("unknown"),
            session = ?self.session_id(),
            "initialized HTTP tool server"
        );
        self.post(&jsonrpc::notification("notifications/initialized", json!({})))
            .await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let response = self.post(&jsonrpc::request(&id, method, params)).await?;

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        if is_event_stream {
            return self.read_event_stream(response, &id).await;
        }

        let body = response.bytes().await.map_err(|e| self.lost(e))?;
        let message: Value = serde_json::from_slice(&body)?;
        let messages = match message {
            Value::Array(batch) => batch,
            single => vec![single],
        };
        let mut answer = None;
        for message in messages {
            if let Some(outcome) = self.handle_message(message, &id) {
                answer = Some(outcome);
            }
        }
        answer.unwrap_or_else(|| {
            Err(TransportError::Protocol(format!(
                "response did not answer request {id}"
            )))
        })
    }

    async fn read_event_stream(
        &self,
        response: Response,
        id: &str,
    ) -> Result<Value, TransportError> {
        let mut events = response.bytes_stream().eventsource();
        loop {
            let event = tokio::select! {
                _ = self.closed.cancelled() => return Err(self.disconnected()),
                event = events.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    let message: Value = serde_json::from_str(&event.data)?;
                    if let Some(outcome) = self.handle_message(message, id) {
                        return outcome;
                    }
                }
                Some(Err(e)) => return Err(self.lost(e)),
                None => {
                    return Err(TransportError::Protocol(format!(
                        "event stream ended before answering request {id}"
                    )))
                }
            }
        }
    }

    /// Returns the outcome when `message` answers request `id`
    fn handle_message(&self, message: Value, id: &str) -> Option<Result<Value, TransportError>> {
        match jsonrpc::classify(message) {
            Incoming::Response { id: answered, outcome } if answered == id => Some(outcome),
            Incoming::Response { id: answered, .. } => {
                debug!(server = %self.id, response_id = %answered, "response for another request");
                None
            }
            Incoming::Notification { method, .. } => {
                debug!(server = %self.id, %method, "received notification from server");
                if method == "notifications/tools/list_changed" {
                    self.tools_changed.notify_one();
                }
                None
            }
            Incoming::Request { method, .. } => {
                debug!(server = %self.id, %method, "ignoring server request on a response stream");
                None
            }
            Incoming::Invalid(message) => {
                debug!(server = %self.id, %message, "ignoring message without id or method");
                None
            }
        }
    }

    async fn post(&self, message: &Value) -> Result<Response, TransportError> {
        if self.closed.is_cancelled() {
            return Err(self.disconnected());
        }

        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }

        let sent = tokio::select! {
            _ = self.closed.cancelled() => return Err(self.disconnected()),
            sent = request.send() => sent,
        };
        let response = sent.map_err(|e| self.lost(e))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_slot() = Some(session.to_string());
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session_id().is_some() {
            return Err(self.lost("session expired"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("{status}: {body}")));
        }
        Ok(response)
    }

    /// The server is unreachable: close the connection so its tools are withdrawn
    fn lost(&self, reason: impl Display) -> TransportError {
        if !self.closed.is_cancelled() {
            warn!(server = %self.id, %reason, "lost HTTP tool server");
            self.closed.cancel();
        }
        TransportError::Disconnected(format!("'{}': {reason}", self.id))
    }

    fn disconnected(&self) -> TransportError {
        TransportError::Disconnected(format!("connection '{}' is closed", self.id))
    }

    fn session_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteConnection for HttpConnection {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, TransportError> {
        jsonrpc::list_all_tools(&self.id, |params| self.request("tools/list", params)).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        let result = self
            .request("tools/call", jsonrpc::tool_call_params(name, arguments))
            .await?;
        jsonrpc::tool_call_output(result)
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    fn tools_changed(&self) -> Arc<Notify> {
        Arc::clone(&self.tools_changed)
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let Some(session) = self.session_slot().take() else {
            return;
        };
        let ended = self
            .client
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await;
        match ended {
            Ok(response) => {
                debug!(server = %self.id, status = %response.status(), "ended HTTP session")
            }
            Err(e) => debug!(server = %self.id, error = %e, "could not end HTTP session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolError;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> HttpServerConfig {
        HttpServerConfig {
            name: "web".to_string(),
            url: format!("{}/mcp", server.uri()),
            bearer_token: Some("secret".to_string()),
            headers: [("X-Team".to_string(), "tools".to_string())].into_iter().collect(),
        }
    }

    fn answer(id: &str, result: Value) -> Value {
        jsonrpc::response(json!(id), result)
    }

    async fn _setup_mock_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("authorization", "Bearer secret"))
            .and(header("x-team", "tools"))
            .and(body_partial_json(json!({"method": "initialize"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "sess-1")
                    .set_body_json(answer(
                        "req-1",
                        json!({
                            "protocolVersion": jsonrpc::PROTOCOL_VERSION,
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "web", "version": "1.0.0"}
                        }),
                    )),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-1"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_session_is_replayed() {
        let server = _setup_mock_server().await;
        Mock::given(method("POST"))
            .and(header("mcp-session-id", "sess-1"))
            .and(body_partial_json(json!({"id": "req-2", "method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer(
                "req-2",
                json!({"tools": [{"name": "fetch", "description": "Fetch a URL"}]}),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let connection = HttpConnection::connect(&config(&server)).await.unwrap();
        assert_eq!(connection.session_id().as_deref(), Some("sess-1"));

        let tools = connection.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "fetch");
    }

    #[tokio::test]
    async fn test_event_stream_response() {
        let server = _setup_mock_server().await;
        let body = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            jsonrpc::notification("notifications/tools/list_changed", json!({})),
            answer("req-2", json!({"content": [{"type": "text", "text": "fetched"}]})),
        );
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/call", "params": {"name": "fetch"}})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let connection = HttpConnection::connect(&config(&server)).await.unwrap();
        let changed = connection.tools_changed();
        let output = connection
            .call_tool("fetch", json!({"url": "https://example.com"}))
            .await
            .unwrap();
        assert_eq!(output, json!("fetched"));
        tokio::time::timeout(Duration::from_secs(1), changed.notified())
            .await
            .expect("list_changed was not forwarded");
    }

    #[tokio::test]
    async fn test_tool_error_and_http_status() {
        let server = _setup_mock_server().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "broken"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer(
                "req-2",
                json!({"isError": true, "content": [{"type": "text", "text": "404 upstream"}]}),
            )))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"params": {"name": "overloaded"}})))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let connection = HttpConnection::connect(&config(&server)).await.unwrap();
        let error = connection.call_tool("broken", json!({})).await.unwrap_err();
        assert_eq!(ToolError::from(error), ToolError::ExecutionFailed("404 upstream".into()));

        let error = connection.call_tool("overloaded", json!({})).await.unwrap_err();
        assert!(matches!(error, TransportError::Http(ref detail) if detail.contains("503")));
        // A failing status is not a lost connection
        assert!(!connection.closed().is_cancelled());
    }

    #[tokio::test]
    async fn test_unreachable_server_closes_connection() {
        let server = _setup_mock_server().await;
        let connection = HttpConnection::connect(&config(&server)).await.unwrap();
        drop(server);

        let error = connection.call_tool("after_drop", json!({})).await.unwrap_err();
        assert!(matches!(
            ToolError::from(error),
            ToolError::RemoteTransportDisconnected(_)
        ));
        assert!(connection.closed().is_cancelled());
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let server = _setup_mock_server().await;
        Mock::given(method("DELETE"))
            .and(path("/mcp"))
            .and(header("mcp-session-id", "sess-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let connection = HttpConnection::connect(&config(&server)).await.unwrap();
        connection.close().await;
        connection.close().await;
        assert!(connection.closed().is_cancelled());
        assert!(matches!(
            connection.list_tools().await,
            Err(TransportError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        match HttpConnection::connect(&config(&server)).await {
            Err(TransportError::Http(detail)) => assert!(detail.contains("401")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("connected without credentials"),
        }
    }
}

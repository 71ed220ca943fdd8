//! Tools hosted outside the process.
//!
//! A [`RemoteConnection`] discovers and invokes the tools of one server. The
//! [`RemoteToolHost`] publishes them into a [`ToolRegistry`], keeps them in
//! sync when the server announces changes, and removes them when the
//! connection drops.

pub mod jsonrpc;
pub mod stdio;

#[cfg(feature = "remote-http")]
pub mod http;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{HttpServerConfig, RemoteSettings, StdioServerConfig};
use crate::errors::{RegistryError, ToolError};
use crate::registry::{ToolHandler, ToolRegistry, ToolSpec};

pub use stdio::StdioConnection;

#[cfg(feature = "remote-http")]
pub use http::HttpConnection;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("{0}")]
    ToolFailed(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection closed: {0}")]
    Disconnected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No response after {0:?}")]
    Timeout(Duration),

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

impl From<TransportError> for ToolError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Disconnected(reason) => ToolError::RemoteTransportDisconnected(reason),
            TransportError::Io(e) => ToolError::RemoteTransportDisconnected(e.to_string()),
            TransportError::Rpc { code, message } if code == jsonrpc::INVALID_PARAMS => {
                ToolError::InvalidArguments(message)
            }
            TransportError::ToolFailed(detail) => ToolError::ExecutionFailed(detail),
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}

/// A tool as described by a remote server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One live connection to a tool server
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Name the connection's tools are registered under
    fn id(&self) -> &str;

    /// The server's full tool list, following pagination
    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, TransportError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError>;

    /// Cancelled once the connection is gone, for whatever reason
    fn closed(&self) -> CancellationToken;

    /// Notified when the server announces that its tool list changed
    fn tools_changed(&self) -> Arc<Notify>;

    async fn close(&self);
}

/// Forwards invocations of one remote tool over its connection
pub struct RemoteToolHandler {
    connection: Arc<dyn RemoteConnection>,
    tool: String,
}

impl RemoteToolHandler {
    pub fn new<S: Into<String>>(connection: Arc<dyn RemoteConnection>, tool: S) -> Self {
        Self {
            connection,
            tool: tool.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for RemoteToolHandler {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        if self.connection.closed().is_cancelled() {
            return Err(ToolError::RemoteTransportDisconnected(format!(
                "connection '{}' is closed",
                self.connection.id()
            )));
        }
        self.connection
            .call_tool(&self.tool, arguments)
            .await
            .map_err(ToolError::from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    Connected,
    ConnectFailed,
    /// A published tool was refused by the registry
    Rejected,
    Disconnected,
    RefreshFailed,
    Unavailable,
}

/// A non-fatal report about a remote connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub connection: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// What happened when a connection was attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionReport {
    pub connection: String,
    pub registered: Vec<String>,
    pub rejected: Vec<String>,
    pub error: Option<String>,
}

impl ConnectionReport {
    pub fn is_connected(&self) -> bool {
        self.error.is_none()
    }

    fn failed<S: Into<String>>(connection: S, error: String) -> Self {
        Self {
            connection: connection.into(),
            error: Some(error),
            ..Default::default()
        }
    }
}

struct Attached {
    connection: Arc<dyn RemoteConnection>,
    watcher: JoinHandle<()>,
}

/// Publishes the tools of remote connections into a registry
pub struct RemoteToolHost {
    registry: ToolRegistry,
    diagnostics: UnboundedSender<Diagnostic>,
    attached: Mutex<Vec<Attached>>,
}

impl RemoteToolHost {
    pub fn new(registry: ToolRegistry) -> (Self, UnboundedReceiver<Diagnostic>) {
        let (diagnostics, rx) = mpsc::unbounded_channel();
        let host = Self {
            registry,
            diagnostics,
            attached: Mutex::new(Vec::new()),
        };
        (host, rx)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Start every configured server. Failures are reported, never fatal.
    pub async fn connect_all(&self, settings: &RemoteSettings) -> Vec<ConnectionReport> {
        let mut reports = Vec::new();
        for config in &settings.stdio {
            reports.push(self.connect_stdio(config).await);
        }
        for config in &settings.http {
            reports.push(self.connect_http(config).await);
        }
        reports
    }

    pub async fn connect_stdio(&self, config: &StdioServerConfig) -> ConnectionReport {
        match StdioConnection::spawn(config).await {
            Ok(connection) => self.attach(Arc::new(connection)).await,
            Err(error) => self.connect_failed(&config.name, error),
        }
    }

    #[cfg(feature = "remote-http")]
    pub async fn connect_http(&self, config: &HttpServerConfig) -> ConnectionReport {
        match HttpConnection::connect(config).await {
            Ok(connection) => self.attach(Arc::new(connection)).await,
            Err(error) => self.connect_failed(&config.name, error),
        }
    }

    /// Without HTTP support this registers nothing and reports it once per process
    #[cfg(not(feature = "remote-http"))]
    pub async fn connect_http(&self, config: &HttpServerConfig) -> ConnectionReport {
        static REPORTED: std::sync::Once = std::sync::Once::new();
        let message = "built without the remote-http feature".to_string();
        REPORTED.call_once(|| {
            warn!(connection = %config.name, "HTTP tool servers are disabled: {message}");
            self.report(&config.name, DiagnosticKind::Unavailable, message.clone());
        });
        ConnectionReport::failed(&config.name, TransportError::Unavailable(message).to_string())
    }

    /// Publish a connection's tools and watch it for changes and disconnection
    pub async fn attach(&self, connection: Arc<dyn RemoteConnection>) -> ConnectionReport {
        let id = connection.id().to_string();
        let tools = match connection.list_tools().await {
            Ok(tools) => tools,
            Err(error) => {
                connection.close().await;
                return self.connect_failed(&id, error);
            }
        };

        let (registered, rejected) =
            publish(&self.registry, &connection, tools, &self.diagnostics);
        info!(connection = %id, tools = registered.len(), "remote tools connected");
        self.report(
            &id,
            DiagnosticKind::Connected,
            format!("{} tools registered", registered.len()),
        );

        let watcher = tokio::spawn(watch(
            self.registry.clone(),
            Arc::clone(&connection),
            self.diagnostics.clone(),
        ));
        self.attached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Attached { connection, watcher });

        ConnectionReport {
            connection: id,
            registered,
            rejected,
            error: None,
        }
    }

    /// Close every connection and wait for its tools to be withdrawn
    pub async fn shutdown(&self) {
        let mut guard = self.attached.lock().unwrap_or_else(PoisonError::into_inner);
        let attached = std::mem::take(&mut *guard);
        drop(guard);
        for Attached { connection, watcher } in attached {
            connection.close().await;
            if let Err(e) = watcher.await {
                warn!(connection = connection.id(), error = %e, "remote watcher ended abnormally");
            }
        }
    }

    fn connect_failed(&self, id: &str, error: TransportError) -> ConnectionReport {
        warn!(connection = %id, %error, "failed to connect to tool server");
        self.report(id, DiagnosticKind::ConnectFailed, error.to_string());
        ConnectionReport::failed(id, error.to_string())
    }

    fn report(&self, connection: &str, kind: DiagnosticKind, message: String) {
        let _ = self.diagnostics.send(Diagnostic {
            connection: connection.to_string(),
            kind,
            message,
        });
    }
}

fn publish(
    registry: &ToolRegistry,
    connection: &Arc<dyn RemoteConnection>,
    tools: Vec<RemoteToolInfo>,
    diagnostics: &UnboundedSender<Diagnostic>,
) -> (Vec<String>, Vec<String>) {
    let id = connection.id();
    let mut registered = Vec::new();
    let mut rejected = Vec::new();

    for tool in tools {
        let handler: Arc<dyn ToolHandler> =
            Arc::new(RemoteToolHandler::new(Arc::clone(connection), &tool.name));
        let outcome = ToolSpec::remote(&tool.name, tool.description, tool.input_schema, id, handler)
            .and_then(|spec| registry.register(spec));
        match outcome {
            Ok(()) => registered.push(tool.name),
            Err(error) => {
                let message = match &error {
                    RegistryError::DuplicateName(_) => {
                        format!("'{}' is already registered, keeping the existing tool", tool.name)
                    }
                    other => other.to_string(),
                };
                warn!(connection = %id, tool = %tool.name, %message, "remote tool rejected");
                let _ = diagnostics.send(Diagnostic {
                    connection: id.to_string(),
                    kind: DiagnosticKind::Rejected,
                    message,
                });
                rejected.push(tool.name);
            }
        }
    }
    (registered, rejected)
}

/// Bring the registry in line with a fresh tool list: withdraw what the
/// server dropped, publish what it added.
fn resync(
    registry: &ToolRegistry,
    connection: &Arc<dyn RemoteConnection>,
    tools: Vec<RemoteToolInfo>,
    diagnostics: &UnboundedSender<Diagnostic>,
) {
    let id = connection.id();
    let current: HashSet<String> = registry.names_from(id).into_iter().collect();
    let offered: HashSet<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();

    for name in current.iter().filter(|name| !offered.contains(name.as_str())) {
        registry.unregister(name);
    }
    let added: Vec<RemoteToolInfo> = tools
        .into_iter()
        .filter(|tool| !current.contains(&tool.name))
        .collect();
    let (registered, _) = publish(registry, connection, added, diagnostics);
    info!(connection = %id, added = registered.len(), "remote tool list refreshed");
}

async fn watch(
    registry: ToolRegistry,
    connection: Arc<dyn RemoteConnection>,
    diagnostics: UnboundedSender<Diagnostic>,
) {
    let closed = connection.closed();
    let changed = connection.tools_changed();
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            _ = changed.notified() => match connection.list_tools().await {
                Ok(tools) => resync(&registry, &connection, tools, &diagnostics),
                Err(error) => {
                    warn!(connection = connection.id(), %error, "failed to refresh remote tools");
                    let _ = diagnostics.send(Diagnostic {
                        connection: connection.id().to_string(),
                        kind: DiagnosticKind::RefreshFailed,
                        message: error.to_string(),
                    });
                }
            },
        }
    }

    let removed = registry.unregister_source(connection.id());
    warn!(connection = connection.id(), removed = ?removed, "remote connection closed");
    let _ = diagnostics.send(Diagnostic {
        connection: connection.id().to_string(),
        kind: DiagnosticKind::Disconnected,
        message: format!("withdrew {} tools", removed.len()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// An in-memory connection whose tool list and liveness the test controls
    struct FakeConnection {
        id: String,
        tools: Mutex<Vec<RemoteToolInfo>>,
        closed: CancellationToken,
        changed: Arc<Notify>,
        fail_listing: AtomicBool,
    }

    impl FakeConnection {
        fn new(id: &str, names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                tools: Mutex::new(names.iter().map(|name| info(name)).collect()),
                closed: CancellationToken::new(),
                changed: Arc::new(Notify::new()),
                fail_listing: AtomicBool::new(false),
            })
        }

        fn set_tools(&self, names: &[&str]) {
            *self.tools.lock().unwrap() = names.iter().map(|name| info(name)).collect();
            self.changed.notify_one();
        }
    }

    fn info(name: &str) -> RemoteToolInfo {
        RemoteToolInfo {
            name: name.to_string(),
            description: format!("remote {name}"),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[async_trait]
    impl RemoteConnection for FakeConnection {
        fn id(&self) -> &str {
            &self.id
        }

        async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, TransportError> {
            if self.fail_listing.load(Ordering::SeqCst) {
                return Err(TransportError::Disconnected("listing refused".into()));
            }
            Ok(self.tools.lock().unwrap().clone())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
            match name {
                "fail" => Err(TransportError::ToolFailed("it broke".into())),
                "bad_args" => Err(TransportError::Rpc {
                    code: jsonrpc::INVALID_PARAMS,
                    message: "missing path".into(),
                }),
                _ => Ok(json!({"tool": name, "arguments": arguments})),
            }
        }

        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }

        fn tools_changed(&self) -> Arc<Notify> {
            Arc::clone(&self.changed)
        }

        async fn close(&self) {
            self.closed.cancel();
        }
    }

    async fn next_of_kind(
        rx: &mut UnboundedReceiver<Diagnostic>,
        kind: DiagnosticKind,
    ) -> Diagnostic {
        loop {
            let diagnostic = rx.recv().await.expect("diagnostic channel closed");
            if diagnostic.kind == kind {
                return diagnostic;
            }
        }
    }

    #[test]
    fn test_transport_errors_map_to_tool_errors() {
        assert!(matches!(
            ToolError::from(TransportError::Disconnected("eof".into())),
            ToolError::RemoteTransportDisconnected(_)
        ));
        assert!(matches!(
            ToolError::from(TransportError::Rpc { code: -32602, message: "bad".into() }),
            ToolError::InvalidArguments(_)
        ));
        assert_eq!(
            ToolError::from(TransportError::ToolFailed("no such file".into())),
            ToolError::ExecutionFailed("no such file".into())
        );
        assert!(matches!(
            ToolError::from(TransportError::Rpc { code: -32000, message: "x".into() }),
            ToolError::ExecutionFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_attach_publishes_and_reports_collisions() {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::builder("read_file")
                    .handler(|_: Value| async { Ok(json!("local")) })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let (host, mut diagnostics) = RemoteToolHost::new(registry.clone());

        let report = host
            .attach(FakeConnection::new("files", &["read_file", "write_file", "bad name"]))
            .await;
        assert!(report.is_connected());
        assert_eq!(report.registered, vec!["write_file"]);
        assert_eq!(report.rejected, vec!["read_file", "bad name"]);
        assert_eq!(
            next_of_kind(&mut diagnostics, DiagnosticKind::Rejected).await.message,
            "'read_file' is already registered, keeping the existing tool"
        );

        // The local tool is untouched
        let output = registry.lookup("read_file").unwrap().invoke(json!({})).await;
        assert_eq!(output, Ok(json!("local")));
        let output = registry
            .lookup("write_file")
            .unwrap()
            .invoke(json!({"path": "a"}))
            .await
            .unwrap();
        assert_eq!(output["tool"], "write_file");
    }

    #[tokio::test]
    async fn test_remote_failures_become_tool_errors() {
        let registry = ToolRegistry::new();
        let (host, _diagnostics) = RemoteToolHost::new(registry.clone());
        host.attach(FakeConnection::new("svc", &["fail", "bad_args"])).await;

        let fail = registry.lookup("fail").unwrap().invoke(json!({})).await;
        assert_eq!(fail, Err(ToolError::ExecutionFailed("it broke".into())));
        let bad = registry.lookup("bad_args").unwrap().invoke(json!({})).await;
        assert!(matches!(bad, Err(ToolError::InvalidArguments(_))));
    }

    #[tokio::test]
    async fn test_disconnect_withdraws_tools() {
        let registry = ToolRegistry::new();
        let (host, mut diagnostics) = RemoteToolHost::new(registry.clone());
        let connection = FakeConnection::new("files", &["x_tool", "y_tool"]);
        host.attach(connection.clone()).await;
        let stale = registry.lookup("x_tool").unwrap();
        assert_eq!(registry.names_from("files"), vec!["x_tool", "y_tool"]);

        connection.closed.cancel();
        let diagnostic = next_of_kind(&mut diagnostics, DiagnosticKind::Disconnected).await;
        assert_eq!(diagnostic.connection, "files");
        assert!(registry.is_empty());

        // A handle taken before the drop fails on its own
        let output = stale.invoke(json!({})).await;
        assert!(matches!(output, Err(ToolError::RemoteTransportDisconnected(_))));
    }

    #[tokio::test]
    async fn test_list_changed_resyncs() {
        let registry = ToolRegistry::new();
        let (host, mut diagnostics) = RemoteToolHost::new(registry.clone());
        let connection = FakeConnection::new("svc", &["alpha", "beta"]);
        host.attach(connection.clone()).await;
        next_of_kind(&mut diagnostics, DiagnosticKind::Connected).await;

        connection.set_tools(&["beta", "gamma"]);
        for _ in 0..100 {
            if registry.names_from("svc") == vec!["beta", "gamma"] {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.names_from("svc"), vec!["beta", "gamma"]);

        connection.fail_listing.store(true, Ordering::SeqCst);
        connection.changed.notify_one();
        next_of_kind(&mut diagnostics, DiagnosticKind::RefreshFailed).await;
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_listing_reports_and_closes() {
        let registry = ToolRegistry::new();
        let (host, mut diagnostics) = RemoteToolHost::new(registry.clone());
        let connection = FakeConnection::new("broken", &["alpha"]);
        connection.fail_listing.store(true, Ordering::SeqCst);

        let report = host.attach(connection.clone()).await;
        assert!(!report.is_connected());
        assert!(registry.is_empty());
        assert!(connection.closed.is_cancelled());
        next_of_kind(&mut diagnostics, DiagnosticKind::ConnectFailed).await;
    }

    #[tokio::test]
    async fn test_shutdown_withdraws_everything() {
        let registry = ToolRegistry::new();
        let (host, _diagnostics) = RemoteToolHost::new(registry.clone());
        host.attach(FakeConnection::new("a", &["one"])).await;
        host.attach(FakeConnection::new("b", &["two"])).await;
        assert_eq!(registry.len(), 2);

        host.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let registry = ToolRegistry::new();
        let (host, mut diagnostics) = RemoteToolHost::new(registry);
        let report = host
            .connect_stdio(&StdioServerConfig::new(
                "missing",
                "/nonexistent/conductor-test-server",
            ))
            .await;
        assert!(!report.is_connected());
        let diagnostic = next_of_kind(&mut diagnostics, DiagnosticKind::ConnectFailed).await;
        assert_eq!(diagnostic.connection, "missing");
    }
}

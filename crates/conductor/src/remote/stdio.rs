use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jsonrpc::{self, Incoming};
use super::{RemoteConnection, RemoteToolInfo, TransportError};
use crate::config::StdioServerConfig;

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Responder = oneshot::Sender<Result<Value, TransportError>>;

/// A tool server speaking newline-delimited JSON-RPC over a pipe pair,
/// usually a child process's stdin and stdout.
///
/// Requests are multiplexed by id, so responses may arrive in any order.
pub struct StdioConnection {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    writer: AsyncMutex<Option<Writer>>,
    pending: Mutex<HashMap<String, Responder>>,
    next_id: AtomicU64,
    closed: CancellationToken,
    tools_changed: Arc<Notify>,
    child: AsyncMutex<Option<Child>>,
}

impl StdioConnection {
    /// Start the configured server and complete the initialize handshake
    pub async fn spawn(config: &StdioServerConfig) -> Result<Self, TransportError> {
        let program = expand(&config.command)?;
        let args = config
            .args
            .iter()
            .map(|arg| expand(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: program.clone(),
            source,
        })?;
        debug!(server = %config.name, command = %program, pid = ?child.id(), "spawned tool server");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("failed to capture server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("failed to capture server stdout".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let name = config.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "{line}");
                }
            });
        }

        Self::start(config.name.clone(), stdout, stdin, Some(child)).await
    }

    /// Speak to a server over an existing reader and writer
    pub async fn from_io<S, R, W>(id: S, reader: R, writer: W) -> Result<Self, TransportError>
    where
        S: Into<String>,
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(id.into(), reader, writer, None).await
    }

    async fn start<R, W>(
        id: String,
        reader: R,
        writer: W,
        child: Option<Child>,
    ) -> Result<Self, TransportError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = Arc::new(Inner {
            id,
            writer: AsyncMutex::new(Some(Box::new(writer))),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
            tools_changed: Arc::new(Notify::new()),
            child: AsyncMutex::new(child),
        });
        tokio::spawn(Arc::clone(&inner).reader_loop(reader));

        match tokio::time::timeout(INITIALIZE_TIMEOUT, inner.initialize()).await {
            Ok(Ok(())) => Ok(Self { inner }),
            Ok(Err(error)) => {
                inner.terminate("initialize failed").await;
                Err(error)
            }
            Err(_) => {
                inner.terminate("initialize timed out").await;
                Err(TransportError::Timeout(INITIALIZE_TIMEOUT))
            }
        }
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        // The reader loop notices and tears the rest down
        self.inner.closed.cancel();
    }
}

#[async_trait]
impl RemoteConnection for StdioConnection {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, TransportError> {
        jsonrpc::list_all_tools(&self.inner.id, |params| self.inner.request("tools/list", params))
            .await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        let result = self
            .inner
            .request("tools/call", jsonrpc::tool_call_params(name, arguments))
            .await?;
        jsonrpc::tool_call_output(result)
    }

    fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    fn tools_changed(&self) -> Arc<Notify> {
        Arc::clone(&self.inner.tools_changed)
    }

    async fn close(&self) {
        self.inner.terminate("closed by client").await;
    }
}

/// Removes an abandoned request from the pending map and tells the server
/// to stop working on it
struct PendingGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let abandoned = self.inner.pending_map().remove(&self.id).is_some();
        if !abandoned || self.inner.closed.is_cancelled() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let id = std::mem::take(&mut self.id);
        runtime.spawn(async move {
            let notice = jsonrpc::notification(
                "notifications/cancelled",
                json!({"requestId": id, "reason": "request abandoned by client"}),
            );
            if let Err(error) = inner.write(&notice).await {
                debug!(server = %inner.id, %error, "could not send cancellation");
            }
        });
    }
}

impl Inner {
    async fn initialize(self: &Arc<Self>) -> Result<(), TransportError> {
        let result = self
            .request("initialize", jsonrpc::initialize_params())
            .await?;
        info!(
            server = %self.id,
            name = result["serverInfo"]["name"].as_str().unwrap_or("unknown"),
            protocol = result["protocolVersion"].as_str().unwrap_or("unknown"),
            "initialized tool server"
        );
        self.write(&jsonrpc::notification("notifications/initialized", json!({})))
            .await
    }

    async fn request(
        self: &Arc<Self>,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(id.clone(), tx);
        let guard = PendingGuard {
            inner: Arc::clone(self),
            id: id.clone(),
        };
        // A teardown that drained the map before the insert would never answer
        if self.closed.is_cancelled() {
            return Err(self.disconnected());
        }

        self.write(&jsonrpc::request(&id, method, params)).await?;
        let outcome = rx.await;
        drop(guard);
        match outcome {
            Ok(result) => result,
            Err(_) => Err(self.disconnected()),
        }
    }

    async fn write(&self, message: &Value) -> Result<(), TransportError> {
        let encoded = serde_json::to_string(message)?;
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| self.disconnected())?;
        stream.write_all(encoded.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    async fn reader_loop<R: AsyncRead + Send + Unpin + 'static>(self: Arc<Self>, reader: R) {
        let mut lines = BufReader::new(reader).lines();
        let reason = loop {
            let line = tokio::select! {
                _ = self.closed.cancelled() => break "connection closed".to_string(),
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => self.handle_line(&line),
                Ok(None) => break "server closed its output".to_string(),
                Err(e) => break format!("read failed: {e}"),
            }
        };
        self.terminate(&reason).await;
    }

    fn handle_line(self: &Arc<Self>, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        if !trimmed.starts_with('{') {
            debug!(server = %self.id, line = trimmed, "skipping non-JSON line from tool server");
            return;
        }
        let message: Value = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(source) => {
                warn!(
                    server = %self.id,
                    line = trimmed,
                    %source,
                    "received invalid JSON from tool server"
                );
                return;
            }
        };

        match jsonrpc::classify(message) {
            Incoming::Response { id, outcome } => match self.pending_map().remove(&id) {
                Some(responder) => {
                    let _ = responder.send(outcome);
                }
                None => {
                    debug!(server = %self.id, response_id = %id, "response for unknown request")
                }
            },
            Incoming::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    jsonrpc::response(id, json!({}))
                } else {
                    warn!(server = %self.id, %method, "server sent unsupported request");
                    jsonrpc::error_response(
                        id,
                        jsonrpc::METHOD_NOT_FOUND,
                        &format!("client does not implement method '{method}'"),
                    )
                };
                // Replies go out on their own task so a full pipe never stalls reading
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(error) = inner.write(&reply).await {
                        debug!(server = %inner.id, %error, "could not answer server request");
                    }
                });
            }
            Incoming::Notification { method, .. } => {
                debug!(server = %self.id, %method, "received notification from server");
                if method == "notifications/tools/list_changed" {
                    self.tools_changed.notify_one();
                }
            }
            Incoming::Invalid(message) => {
                debug!(server = %self.id, %message, "ignoring message without id or method");
            }
        }
    }

    /// Close the connection and fail every in-flight request. Safe to call more than once.
    async fn terminate(&self, reason: &str) {
        let first = !self.closed.is_cancelled();
        self.closed.cancel();

        let responders: Vec<Responder> = self.pending_map().drain().map(|(_, tx)| tx).collect();
        for responder in responders {
            let _ = responder.send(Err(TransportError::Disconnected(format!(
                "'{}': {reason}",
                self.id
            ))));
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.start_kill() {
                debug!(server = %self.id, %err, "failed to kill tool server, it may have exited");
            }
            let _ = child.wait().await;
        }
        self.writer.lock().await.take();

        if first {
            info!(server = %self.id, reason, "tool server connection closed");
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Responder>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disconnected(&self) -> TransportError {
        TransportError::Disconnected(format!("connection '{}' is closed", self.id))
    }
}

fn expand(value: &str) -> Result<String, TransportError> {
    shellexpand::full(value)
        .map(|expanded| expanded.into_owned())
        .map_err(|e| TransportError::Spawn {
            command: value.to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e.to_string()),
        })
}

use futures::future::join_all;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ToolError;
use crate::models::tool::{ToolCallRequest, ToolResult};
use crate::registry::RegistrySnapshot;

/// Runs the tool calls of one round.
///
/// Every call runs in its own task under its own timeout. `dispatch` returns
/// once all of them have produced a result, in the order they were requested.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl Dispatcher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn dispatch(
        &self,
        tools: &RegistrySnapshot,
        calls: &[ToolCallRequest],
        cancel: &CancellationToken,
    ) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.dispatch_one(tools, call, cancel))).await
    }

    async fn dispatch_one(
        &self,
        tools: &RegistrySnapshot,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let started = Instant::now();

        let Some(spec) = tools.lookup(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "model requested an unknown tool");
            return ToolResult::failure(
                &call.id,
                ToolError::UnknownTool(call.name.clone()),
                started.elapsed(),
            );
        };

        let arguments = match spec.decode_arguments(&call.arguments) {
            Ok(arguments) => arguments,
            Err(error) => {
                warn!(tool = %call.name, call_id = %call.id, %error, "rejected tool arguments");
                return ToolResult::failure(&call.id, error, started.elapsed());
            }
        };

        if cancel.is_cancelled() {
            return ToolResult::failure(&call.id, ToolError::Cancelled, started.elapsed());
        }

        let spec = spec.clone();
        let task = tokio::spawn(async move { spec.invoke(arguments).await });
        let abort = task.abort_handle();

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                Err(ToolError::Cancelled)
            }
            joined = tokio::time::timeout(self.timeout, task) => match joined {
                Err(_) => {
                    abort.abort();
                    Err(ToolError::timeout(self.timeout))
                }
                Ok(Err(join_error)) if join_error.is_panic() => {
                    Err(ToolError::ExecutionFailed("tool panicked".to_string()))
                }
                Ok(Err(join_error)) => Err(ToolError::ExecutionFailed(join_error.to_string())),
                Ok(Ok(output)) => output,
            }
        };

        let elapsed = started.elapsed();
        match &output {
            Ok(_) => debug!(
                tool = %call.name,
                call_id = %call.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "tool call succeeded"
            ),
            Err(error) => warn!(
                tool = %call.name,
                call_id = %call.id,
                elapsed_ms = elapsed.as_millis() as u64,
                kind = error.kind(),
                %error,
                "tool call failed"
            ),
        }

        ToolResult {
            call_id: call.id.clone(),
            output,
            duration: elapsed,
        }
    }
}

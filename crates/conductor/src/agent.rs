use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::conversation::{ConversationSnapshot, ConversationState, UsageLedger};
use crate::dispatch::Dispatcher;
use crate::errors::{EngineError, StreamError, StreamErrorKind};
use crate::models::tool::{ToolCallRequest, ToolResult};
use crate::models::turn::Turn;
use crate::providers::base::{
    CompletionRequest, GenerationConfig, Provider, StreamEvent, ToolCallFragment, Usage,
};
use crate::registry::ToolRegistry;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    Resolving,
    Failed,
}

/// Events emitted while the engine works through a user turn
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    RoundStarted { round: u32 },
    TextDelta(String),
    ToolCallDelta { id: String, fragment: ToolCallFragment },
    ToolCallRequested(ToolCallRequest),
    ToolResult(ToolResult),
    Usage(Usage),
    /// The current attempt failed and will be retried. Anything streamed by
    /// the failed attempt is void.
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        error: StreamError,
    },
    StateChanged(EngineState),
    RoundComplete { round: u32, tool_calls: usize },
    Error(EngineError),
    Finished(TurnOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { rounds: u32 },
    Cancelled { rounds: u32 },
}

/// What one provider stream produced
enum Attempt {
    Finished {
        text: String,
        calls: Vec<ToolCallRequest>,
        usage: Option<Usage>,
    },
    Cancelled {
        text: String,
    },
    Failed(StreamError),
}

/// The settled result of a round's streaming phase, after retries
enum Streamed {
    Finished {
        text: String,
        calls: Vec<ToolCallRequest>,
        usage: Option<Usage>,
    },
    Cancelled {
        text: String,
    },
}

enum Step {
    Event(AgentEvent),
    Done(Result<TurnOutcome, EngineError>),
}

fn emit(events: &UnboundedSender<AgentEvent>, event: AgentEvent) {
    // The consumer may have stopped listening; the turn still runs to a consistent state
    let _ = events.send(event);
}

/// AgentEngine drives a conversation between the user, a provider and the registered tools
pub struct AgentEngine {
    provider: Box<dyn Provider>,
    registry: ToolRegistry,
    dispatcher: Dispatcher,
    retry: RetryPolicy,
    max_rounds: u32,
    system_prompt: String,
    generation: GenerationConfig,
    conversation: ConversationState,
    state: EngineState,
}

impl AgentEngine {
    pub fn new(provider: Box<dyn Provider>, registry: ToolRegistry) -> Self {
        let defaults = EngineSettings::default();
        Self {
            provider,
            registry,
            dispatcher: Dispatcher::default(),
            retry: defaults.retry,
            max_rounds: defaults.max_rounds,
            system_prompt: defaults.system_prompt,
            generation: GenerationConfig::default(),
            conversation: ConversationState::new(),
            state: EngineState::Idle,
        }
    }

    pub fn with_settings(mut self, settings: &EngineSettings) -> Self {
        self.dispatcher = Dispatcher::new(Duration::from_secs(settings.tool_timeout_secs));
        self.retry = settings.retry.clone();
        self.max_rounds = settings.max_rounds.max(1);
        self.system_prompt = settings.system_prompt.clone();
        self
    }

    pub fn with_system_prompt<S: Into<String>>(mut self, system_prompt: S) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    /// Replace the provider session. The conversation carries over to the new backend.
    pub fn set_provider(&mut self, provider: Box<dyn Provider>) {
        info!(
            from = self.provider.name(),
            to = provider.name(),
            model = provider.model(),
            "switching provider"
        );
        self.provider = provider;
    }

    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn usage(&self) -> &UsageLedger {
        self.conversation.usage()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.conversation.snapshot()
    }

    /// Create a stream that yields each event as the engine produces it, ending
    /// with `Finished` or `Error`.
    pub fn reply<'a>(
        &'a mut self,
        text: &str,
        cancel: CancellationToken,
    ) -> BoxStream<'a, AgentEvent> {
        let text = text.to_string();
        Box::pin(stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let outcome = {
                let run = self.run_turn(&text, &tx, &cancel);
                tokio::pin!(run);
                loop {
                    let step = tokio::select! {
                        biased;
                        Some(event) = rx.recv() => Step::Event(event),
                        result = &mut run => Step::Done(result),
                    };
                    match step {
                        Step::Event(event) => yield event,
                        Step::Done(result) => break result,
                    }
                }
            };
            while let Ok(event) = rx.try_recv() {
                yield event;
            }
            match outcome {
                Ok(outcome) => yield AgentEvent::Finished(outcome),
                Err(error) => yield AgentEvent::Error(error),
            }
        })
    }

    /// Run one user turn to completion: stream, resolve tool calls, repeat
    /// until the model answers without calling tools.
    ///
    /// On error the conversation keeps every turn appended before the failure
    /// and the engine accepts the next user turn.
    pub async fn run_turn(
        &mut self,
        text: &str,
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        if self.state == EngineState::Failed {
            self.set_state(EngineState::Idle, events);
        }
        if let Err(error) = self.conversation.append(Turn::user().with_text(text)) {
            return Err(self.fail(error.into(), events));
        }

        let mut rounds = 0;
        loop {
            rounds += 1;
            let round = self.conversation.begin_round();
            emit(events, AgentEvent::RoundStarted { round });
            self.set_state(EngineState::Streaming, events);

            // Catalog is fixed for the round; tools published meanwhile show up next round
            let tools = self.registry.snapshot();
            let request = CompletionRequest {
                system: self.system_prompt.clone(),
                turns: self.conversation.turns().to_vec(),
                tools: tools.catalog(),
                generation: self.generation,
            };

            let (text, calls, usage) = match self.stream_round(request, events, cancel).await {
                Ok(Streamed::Finished { text, calls, usage }) => (text, calls, usage),
                Ok(Streamed::Cancelled { text }) => {
                    if !text.is_empty() {
                        let turn = Turn::assistant().with_text(text).truncated();
                        if let Err(error) = self.conversation.append(turn) {
                            return Err(self.fail(error.into(), events));
                        }
                    }
                    info!(round, "turn cancelled while streaming");
                    self.set_state(EngineState::Idle, events);
                    return Ok(TurnOutcome::Cancelled { rounds });
                }
                Err(error) => return Err(self.fail(error, events)),
            };

            let pricing = self.provider.pricing();
            self.conversation.record_usage(usage.as_ref(), pricing.as_ref());

            let mut turn = Turn::assistant();
            if !text.is_empty() {
                turn = turn.with_text(text);
            }
            for call in &calls {
                turn = turn.with_tool_request(call.clone());
            }
            if let Err(error) = self.conversation.append(turn) {
                return Err(self.fail(error.into(), events));
            }

            if calls.is_empty() {
                emit(events, AgentEvent::RoundComplete { round, tool_calls: 0 });
                self.set_state(EngineState::Idle, events);
                return Ok(TurnOutcome::Completed { rounds });
            }

            self.set_state(EngineState::Resolving, events);
            debug!(round, calls = calls.len(), "dispatching tool calls");
            let results = self.dispatcher.dispatch(&tools, &calls, cancel).await;
            for result in results {
                emit(events, AgentEvent::ToolResult(result.clone()));
                if let Err(error) = self.conversation.append(Turn::tool_result(result)) {
                    return Err(self.fail(error.into(), events));
                }
            }
            emit(
                events,
                AgentEvent::RoundComplete {
                    round,
                    tool_calls: calls.len(),
                },
            );

            if cancel.is_cancelled() {
                info!(round, "turn cancelled while resolving tools");
                self.set_state(EngineState::Idle, events);
                return Ok(TurnOutcome::Cancelled { rounds });
            }
            if rounds >= self.max_rounds {
                return Err(self.fail(EngineError::RoundLimitExceeded(rounds), events));
            }
        }
    }

    /// Stream one round, retrying transient failures with backoff.
    /// Every attempt sends the same request, so failed attempts leave no trace
    /// in the conversation.
    async fn stream_round(
        &self,
        request: CompletionRequest,
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Result<Streamed, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.stream_attempt(request.clone(), events, cancel).await {
                Attempt::Finished { text, calls, usage } => {
                    return Ok(Streamed::Finished { text, calls, usage })
                }
                Attempt::Cancelled { text } => return Ok(Streamed::Cancelled { text }),
                Attempt::Failed(error) => error,
            };

            if error.kind == StreamErrorKind::ProtocolViolation {
                return Err(EngineError::ProtocolViolation(error.message));
            }
            if !error.retryable {
                return Err(EngineError::Stream(error));
            }
            if attempt >= self.retry.max_attempts {
                return Err(EngineError::RetriesExhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.retry.delay_for(attempt, error.retry_after);
            warn!(
                provider = self.provider.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = error.kind.as_str(),
                %error,
                "retrying provider stream"
            );
            emit(
                events,
                AgentEvent::RetryScheduled {
                    attempt,
                    delay,
                    error,
                },
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Streamed::Cancelled { text: String::new() }),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_attempt(
        &self,
        request: CompletionRequest,
        events: &UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Attempt {
        let mut stream = self.provider.stream(request);
        let mut text = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        let mut open: Vec<String> = Vec::new();
        let mut usage: Option<Usage> = None;

        loop {
            // Dropping the stream on cancel stops reading from the network
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled { text },
                event = stream.next() => event,
            };

            match event {
                Some(StreamEvent::TextDelta(delta)) => {
                    text.push_str(&delta);
                    emit(events, AgentEvent::TextDelta(delta));
                }
                Some(StreamEvent::ToolCallDelta { id, fragment }) => {
                    if !open.contains(&id) {
                        open.push(id.clone());
                    }
                    emit(events, AgentEvent::ToolCallDelta { id, fragment });
                }
                Some(StreamEvent::ToolCallComplete(call)) => {
                    if calls.iter().any(|existing| existing.id == call.id) {
                        return Attempt::Failed(StreamError::protocol_violation(format!(
                            "tool call id '{}' was used twice in one response",
                            call.id
                        )));
                    }
                    open.retain(|id| id != &call.id);
                    emit(events, AgentEvent::ToolCallRequested(call.clone()));
                    calls.push(call);
                }
                Some(StreamEvent::Usage(reported)) => {
                    usage = Some(usage.unwrap_or_default().merge(reported));
                    emit(events, AgentEvent::Usage(reported));
                }
                Some(StreamEvent::End) => {
                    if !open.is_empty() {
                        return Attempt::Failed(StreamError::protocol_violation(format!(
                            "stream ended with unterminated tool calls: {}",
                            open.join(", ")
                        )));
                    }
                    return Attempt::Finished { text, calls, usage };
                }
                Some(StreamEvent::Error(error)) => return Attempt::Failed(error),
                None => {
                    return Attempt::Failed(StreamError::network(
                        "stream closed before completion",
                    ))
                }
            }
        }
    }

    fn set_state(&mut self, state: EngineState, events: &UnboundedSender<AgentEvent>) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "engine state");
            self.state = state;
            emit(events, AgentEvent::StateChanged(state));
        }
    }

    fn fail(&mut self, error: EngineError, events: &UnboundedSender<AgentEvent>) -> EngineError {
        warn!(kind = error.kind(), %error, "turn failed");
        self.set_state(EngineState::Failed, events);
        error
    }
}

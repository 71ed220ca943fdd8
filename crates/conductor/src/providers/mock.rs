use anyhow::Result;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::conversation::Pricing;
use crate::models::tool::{Tool, ToolCallRequest};
use crate::providers::base::{CompletionRequest, Provider, StreamEvent, ToolCallFragment, Usage};
use crate::providers::utils::tools_to_openai_spec;

/// One scripted response. A stalled round never ends after its events.
#[derive(Debug, Clone)]
pub struct MockRound {
    pub events: Vec<StreamEvent>,
    pub stall: bool,
}

impl From<Vec<StreamEvent>> for MockRound {
    fn from(events: Vec<StreamEvent>) -> Self {
        Self {
            events,
            stall: false,
        }
    }
}

/// A mock provider that replays pre-configured streams for testing
#[derive(Clone)]
pub struct MockProvider {
    rounds: Arc<Mutex<VecDeque<MockRound>>>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
    pricing: Option<Pricing>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of streamed responses
    pub fn new<R: Into<MockRound>>(rounds: Vec<R>) -> Self {
        Self {
            rounds: Arc::new(Mutex::new(rounds.into_iter().map(Into::into).collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
            pricing: None,
        }
    }

    pub fn with_pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Text split into deltas, then usage and end
    pub fn text_round(chunks: &[&str], usage: Option<Usage>) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = chunks
            .iter()
            .map(|chunk| StreamEvent::TextDelta(chunk.to_string()))
            .collect();
        events.extend(usage.map(StreamEvent::Usage));
        events.push(StreamEvent::End);
        events
    }

    /// Streamed and completed tool calls, then end
    pub fn tool_round(calls: &[(&str, &str, Value)]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for (id, name, arguments) in calls {
            let arguments = arguments.to_string();
            events.push(StreamEvent::ToolCallDelta {
                id: id.to_string(),
                fragment: ToolCallFragment::Name(name.to_string()),
            });
            events.push(StreamEvent::ToolCallDelta {
                id: id.to_string(),
                fragment: ToolCallFragment::Arguments(arguments.clone()),
            });
            events.push(StreamEvent::ToolCallComplete(ToolCallRequest::new(
                *id, *name, arguments,
            )));
        }
        events.push(StreamEvent::End);
        events
    }
}

impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn tools_spec(&self, tools: &[Tool]) -> Result<Vec<Value>> {
        tools_to_openai_spec(tools)
    }

    fn pricing(&self) -> Option<Pricing> {
        self.pricing
    }

    fn stream(&self, request: CompletionRequest) -> BoxStream<'static, StreamEvent> {
        self.requests.lock().unwrap().push(request);
        // Return a bare end if no more pre-configured responses
        let round = self
            .rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![StreamEvent::End].into());

        let events = stream::iter(round.events);
        if round.stall {
            events.chain(stream::pending()).boxed()
        } else {
            events.boxed()
        }
    }
}

use std::collections::BTreeMap;

use super::base::{StreamEvent, ToolCallFragment};
use crate::errors::StreamError;
use crate::models::tool::ToolCallRequest;

#[derive(Debug)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed tool-call fragments, keyed by the backend's block index.
///
/// The id is fixed when the call is first seen; backends that never send one
/// get `call_<index>`.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    calls: BTreeMap<u64, PartialCall>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment and return the delta events it produces
    pub fn push(
        &mut self,
        index: u64,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Vec<StreamEvent> {
        let call = self.calls.entry(index).or_insert_with(|| PartialCall {
            id: id
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{index}")),
            name: String::new(),
            arguments: String::new(),
        });

        let mut events = Vec::new();
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            call.name.push_str(name);
            events.push(StreamEvent::ToolCallDelta {
                id: call.id.clone(),
                fragment: ToolCallFragment::Name(name.to_string()),
            });
        }
        if let Some(arguments) = arguments.filter(|arguments| !arguments.is_empty()) {
            call.arguments.push_str(arguments);
            events.push(StreamEvent::ToolCallDelta {
                id: call.id.clone(),
                fragment: ToolCallFragment::Arguments(arguments.to_string()),
            });
        }
        events
    }

    pub fn contains(&self, index: u64) -> bool {
        self.calls.contains_key(&index)
    }

    /// Finish one call. A call that never received a name is a protocol violation.
    pub fn complete(&mut self, index: u64) -> Option<StreamEvent> {
        self.calls.remove(&index).map(Self::finish)
    }

    /// Finish every open call, in index order
    pub fn complete_all(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(Self::finish)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn finish(call: PartialCall) -> StreamEvent {
        if call.name.is_empty() {
            return StreamEvent::Error(StreamError::protocol_violation(format!(
                "tool call '{}' finished without a name",
                call.id
            )));
        }
        StreamEvent::ToolCallComplete(ToolCallRequest::new(call.id, call.name, call.arguments))
    }
}

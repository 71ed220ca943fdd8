//! Conversation history and its bookkeeping.
//!
//! Turns are append-only. Appending enforces the tool-call pairing rules: every
//! tool turn answers one call from the latest assistant turn, and no user or
//! assistant turn may be appended while calls are still unanswered.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::ConversationError;
use crate::models::role::Role;
use crate::models::turn::Turn;
use crate::providers::base::Usage;

/// Price of a model, in USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// A session total that may be missing some or all of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Tally<T> {
    /// Every round reported a value
    Exact(T),
    /// Some rounds did not report; the value is a lower bound
    Partial(T),
    /// No round reported a value
    Unknown,
}

impl<T: Copy> Tally<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Tally::Exact(v) | Tally::Partial(v) => Some(*v),
            Tally::Unknown => None,
        }
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, Tally::Exact(_))
    }
}

impl<T: fmt::Display> fmt::Display for Tally<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tally::Exact(v) => write!(f, "{v}"),
            Tally::Partial(v) => write!(f, "at least {v}"),
            Tally::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
struct Counter<T> {
    known: T,
    known_rounds: u32,
    unknown_rounds: u32,
}

impl<T: Copy + std::ops::AddAssign> Counter<T> {
    fn record(&mut self, value: Option<T>) {
        match value {
            Some(v) => {
                self.known += v;
                self.known_rounds += 1;
            }
            None => self.unknown_rounds += 1,
        }
    }

    fn tally(&self) -> Tally<T> {
        match (self.known_rounds, self.unknown_rounds) {
            (_, 0) => Tally::Exact(self.known),
            (0, _) => Tally::Unknown,
            _ => Tally::Partial(self.known),
        }
    }
}

/// Token and cost totals across the rounds of a session.
///
/// Backend-reported values are summed verbatim. A round that did not report a
/// value is counted as unknown rather than zero, which turns the total into a
/// partial one.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageLedger {
    input: Counter<u64>,
    output: Counter<u64>,
    cost: Counter<f64>,
    rounds: u32,
}

impl UsageLedger {
    pub fn record(&mut self, usage: Option<&Usage>, pricing: Option<&Pricing>) {
        let input = usage.and_then(|u| u.input_tokens);
        let output = usage.and_then(|u| u.output_tokens);
        self.input.record(input);
        self.output.record(output);

        let cost = match (pricing, input, output) {
            (Some(pricing), Some(input), Some(output)) => Some(pricing.cost(input, output)),
            _ => None,
        };
        self.cost.record(cost);
        self.rounds += 1;
    }

    pub fn input_tokens(&self) -> Tally<u64> {
        self.input.tally()
    }

    pub fn output_tokens(&self) -> Tally<u64> {
        self.output.tally()
    }

    /// Estimated cost in USD
    pub fn cost(&self) -> Tally<f64> {
        self.cost.tally()
    }

    /// Rounds recorded so far
    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

/// Read-only copy of a conversation, for export
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    pub id: Uuid,
    pub round: u32,
    pub turns: Vec<Turn>,
    pub usage: UsageLedger,
}

#[derive(Debug, Clone)]
pub struct ConversationState {
    id: Uuid,
    turns: Vec<Turn>,
    pending: Vec<String>,
    round: u32,
    usage: UsageLedger,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            turns: Vec::new(),
            pending: Vec::new(),
            round: 0,
            usage: UsageLedger::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Append a turn, assigning its sequence index.
    pub fn append(&mut self, mut turn: Turn) -> Result<&Turn, ConversationError> {
        match turn.role {
            Role::User | Role::Assistant => {
                if !self.pending.is_empty() {
                    return Err(ConversationError::UnansweredToolCalls {
                        role: turn.role,
                        pending: self.pending.len(),
                    });
                }
                if turn.role == Role::Assistant {
                    let mut ids: Vec<String> = Vec::new();
                    for request in turn.tool_requests() {
                        if ids.contains(&request.id) {
                            return Err(ConversationError::DuplicateCallId(request.id.clone()));
                        }
                        ids.push(request.id.clone());
                    }
                    self.pending = ids;
                }
            }
            Role::Tool => {
                let results: Vec<_> = turn.tool_results().collect();
                if results.len() != 1 || turn.content.len() != 1 {
                    return Err(ConversationError::MalformedToolTurn(turn.content.len()));
                }
                let call_id = &results[0].call_id;
                let position = self
                    .pending
                    .iter()
                    .position(|id| id == call_id)
                    .ok_or_else(|| ConversationError::OrphanToolResult(call_id.clone()))?;
                self.pending.remove(position);
            }
        }

        turn.index = self.turns.len() as u64;
        self.turns.push(turn);
        Ok(&self.turns[self.turns.len() - 1])
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Call ids from the latest assistant turn that have no result yet, in request order
    pub fn pending_calls(&self) -> &[String] {
        &self.pending
    }

    /// Start a new round and return its number (1-based)
    pub fn begin_round(&mut self) -> u32 {
        self.round += 1;
        self.round
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn record_usage(&mut self, usage: Option<&Usage>, pricing: Option<&Pricing>) {
        self.usage.record(usage, pricing);
    }

    pub fn usage(&self) -> &UsageLedger {
        &self.usage
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.id,
            round: self.round,
            turns: self.turns.clone(),
            usage: self.usage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolError;
    use crate::models::tool::{ToolCallRequest, ToolResult};
    use serde_json::json;
    use std::time::Duration;

    fn result(id: &str) -> Turn {
        Turn::tool_result(ToolResult::success(id, json!("ok"), Duration::ZERO))
    }

    #[test]
    fn test_append_assigns_indices() {
        let mut conversation = ConversationState::new();
        conversation.append(Turn::user().with_text("hi")).unwrap();
        conversation
            .append(Turn::assistant().with_text("hello"))
            .unwrap();

        let indices: Vec<u64> = conversation.turns().iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn test_tool_results_must_match_pending_calls() {
        let mut conversation = ConversationState::new();
        conversation.append(Turn::user().with_text("go")).unwrap();

        let err = conversation.append(result("call_0")).unwrap_err();
        assert_eq!(err, ConversationError::OrphanToolResult("call_0".into()));

        conversation
            .append(
                Turn::assistant()
                    .with_tool_request(ToolCallRequest::new("a", "first", "{}"))
                    .with_tool_request(ToolCallRequest::new("b", "second", "{}")),
            )
            .unwrap();
        assert_eq!(conversation.pending_calls(), &["a".to_string(), "b".to_string()]);

        // No new user turn while calls are outstanding
        let err = conversation
            .append(Turn::user().with_text("again"))
            .unwrap_err();
        assert!(matches!(
            err,
            ConversationError::UnansweredToolCalls { pending: 2, .. }
        ));

        conversation.append(result("a")).unwrap();
        // A call is answered once only
        assert!(conversation.append(result("a")).is_err());
        conversation.append(result("b")).unwrap();
        assert!(conversation.pending_calls().is_empty());
        conversation.append(Turn::user().with_text("thanks")).unwrap();
        assert_eq!(conversation.len(), 5);
    }

    #[test]
    fn test_duplicate_call_ids_rejected() {
        let mut conversation = ConversationState::new();
        let err = conversation
            .append(
                Turn::assistant()
                    .with_tool_request(ToolCallRequest::new("a", "first", "{}"))
                    .with_tool_request(ToolCallRequest::new("a", "first", "{}")),
            )
            .unwrap_err();
        assert_eq!(err, ConversationError::DuplicateCallId("a".into()));
        assert!(conversation.is_empty());
    }

    #[test]
    fn test_malformed_tool_turn() {
        let mut conversation = ConversationState::new();
        conversation
            .append(Turn::assistant().with_tool_request(ToolCallRequest::new("a", "t", "{}")))
            .unwrap();
        let turn = result("a").with_text("extra");
        assert_eq!(
            conversation.append(turn).unwrap_err(),
            ConversationError::MalformedToolTurn(2)
        );

        let failed = Turn::tool_result(ToolResult::failure(
            "a",
            ToolError::Cancelled,
            Duration::ZERO,
        ));
        conversation.append(failed).unwrap();
    }

    #[test]
    fn test_usage_ledger_marks_missing_rounds() {
        let mut ledger = UsageLedger::default();
        assert_eq!(ledger.input_tokens(), Tally::Exact(0));

        let pricing = Pricing::new(2.0, 10.0);
        ledger.record(Some(&Usage::new(Some(1_000), Some(100))), Some(&pricing));
        assert_eq!(ledger.input_tokens(), Tally::Exact(1_000));
        assert_eq!(ledger.cost(), Tally::Exact(0.003));

        ledger.record(None, Some(&pricing));
        assert_eq!(ledger.input_tokens(), Tally::Partial(1_000));
        assert_eq!(ledger.output_tokens(), Tally::Partial(100));
        assert_eq!(ledger.cost(), Tally::Partial(0.003));
        assert_eq!(ledger.input_tokens().to_string(), "at least 1000");
        assert_eq!(ledger.rounds(), 2);
    }

    #[test]
    fn test_usage_ledger_never_invents_cost() {
        let mut ledger = UsageLedger::default();
        ledger.record(Some(&Usage::new(None, Some(40))), Some(&Pricing::new(1.0, 1.0)));
        ledger.record(Some(&Usage::new(Some(10), Some(40))), None);

        assert_eq!(ledger.input_tokens(), Tally::Partial(10));
        assert_eq!(ledger.output_tokens(), Tally::Exact(80));
        assert_eq!(ledger.cost(), Tally::Unknown);
        assert_eq!(ledger.cost().value(), None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut conversation = ConversationState::new();
        conversation.append(Turn::user().with_text("hi")).unwrap();
        let snapshot = conversation.snapshot();
        conversation
            .append(Turn::assistant().with_text("hello"))
            .unwrap();

        assert_eq!(snapshot.turns.len(), 1);
        assert_eq!(snapshot.id, conversation.id());
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["turns"][0]["role"], "user");
    }
}

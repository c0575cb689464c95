// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Where the session loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    WaitingForInput,
    LlmCalling,
    ToolExecuting,
    ApprovalPending,
    EscalationPending,
    UserInputPending,
    Compacting,
    WaitingForAgents,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::WaitingForInput => "waiting_for_input",
            Phase::LlmCalling => "llm_calling",
            Phase::ToolExecuting => "tool_executing",
            Phase::ApprovalPending => "approval_pending",
            Phase::EscalationPending => "escalation_pending",
            Phase::UserInputPending => "user_input_pending",
            Phase::Compacting => "compacting",
            Phase::WaitingForAgents => "waiting_for_agents",
        }
    }
}

/// Single-consumer response slot.
///
/// Each blocking wait (approval, escalation, user-input question) has a
/// handler deliver exactly one value; the workflow's single-threaded
/// scheduling replaces any need for a channel.
#[derive(Debug, Default)]
pub struct ResponseSlot<T> {
    ready: bool,
    value: Option<T>,
}

impl<T> ResponseSlot<T> {
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn deliver(&mut self, value: T) {
        self.ready = true;
        self.value = Some(value);
    }

    pub fn take(&mut self) -> Option<T> {
        self.ready = false;
        self.value.take()
    }

    pub fn clear(&mut self) {
        self.ready = false;
        self.value = None;
    }
}

/// One call held for user approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: String,
}

/// One sandbox-denied call held for escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: String,
    pub failure: String,
}

/// The user's verdict on a pending approval or escalation batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalDecision {
    #[serde(default)]
    pub approved: Vec<String>,
    #[serde(default)]
    pub denied: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQuestion {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Questions the model asked the user via `request_user_input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInputRequest {
    pub id: String,
    pub questions: Vec<UserQuestion>,
}

/// Transient per-run coordination state.
///
/// Never serialized: continue-as-new resets this to its zero value and the
/// loop re-derives everything observable from [`crate::SessionState`].
#[derive(Debug, Default)]
pub struct LoopControl {
    pub phase: Phase,
    pub turn_id: Option<String>,
    /// A `TurnStarted` is unmatched; interrupt/shutdown must close it.
    pub turn_open: bool,
    pub tools_in_flight: Vec<String>,
    pub pending_approvals: Vec<ApprovalRequest>,
    pub pending_escalations: Vec<EscalationRequest>,
    pub pending_question: Option<UserInputRequest>,
    pub suggestion: Option<String>,
    pub approval_slot: ResponseSlot<ApprovalDecision>,
    pub escalation_slot: ResponseSlot<ApprovalDecision>,
    pub question_slot: ResponseSlot<HashMap<String, String>>,
    /// Turn ids opened by user input but not yet driven by the loop.
    /// Input arriving mid-turn queues here.
    pub pending_turns: VecDeque<String>,
    pub pending_input: bool,
    pub interrupted: bool,
    pub shutdown_requested: bool,
    pub compact_requested: bool,
    pub draining: bool,
    pub compacted_this_turn: bool,
    /// Bumped on every observable mutation; drives long-poll wakeups.
    pub state_version: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_delivers_once() {
        let mut slot: ResponseSlot<u32> = ResponseSlot::default();
        assert!(!slot.is_ready());
        slot.deliver(7);
        assert!(slot.is_ready());
        assert_eq!(slot.take(), Some(7));
        assert!(!slot.is_ready());
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn clear_discards_pending_value() {
        let mut slot: ResponseSlot<&str> = ResponseSlot::default();
        slot.deliver("stale");
        slot.clear();
        assert!(!slot.is_ready());
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn control_zero_value_is_idle() {
        let c = LoopControl::default();
        assert_eq!(c.phase, Phase::WaitingForInput);
        assert!(!c.turn_open);
        assert!(!c.pending_input);
        assert_eq!(c.state_version, 0);
    }

    #[test]
    fn phase_wire_values() {
        assert_eq!(
            serde_json::to_string(&Phase::ApprovalPending).unwrap(),
            "\"approval_pending\""
        );
        assert_eq!(Phase::WaitingForAgents.as_str(), "waiting_for_agents");
    }
}

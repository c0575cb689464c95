// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable agentic session core.
//!
//! The session workflow drives a deterministic loop of LLM calls, approval
//! gating and parallel tool execution, with coordination handlers racing it:
//! new input, interrupts, approvals, escalations, questions, long-polls
//! and sub-agent spawns.  Long-lived sessions continue-as-new with a
//! serialized [`SessionState`]; the harness workflow owns the sessions of
//! one directory and starts them on demand.

mod activities;
mod agents;
mod compact;
mod control;
mod executor;
mod handlers;
mod harness;
mod history;
mod session;
mod state;
mod turn;


pub use activities::{
    core_worker_builder, CompactActivity, InstructionsActivity, LlmCallActivity,
    SuggestionActivity, ToolRouterActivity,
};
pub use agents::{AgentControl, AgentInfo, AgentRole, AgentStatus, MAX_AGENT_DEPTH};
pub use control::{
    ApprovalDecision, ApprovalRequest, EscalationRequest, LoopControl, Phase, ResponseSlot,
    UserInputRequest, UserQuestion,
};
pub use handlers::handler_names;
pub use harness::{
    harness_workflow, HarnessInput, HarnessState, SessionEntry, HARNESS_WORKFLOW,
};
pub use history::HistoryStore;
pub use session::{
    default_tool_specs, session_workflow, SessionWorkflowInput, StartSessionInput,
    SESSION_WORKFLOW,
};
pub use state::{PlanStep, SessionState};

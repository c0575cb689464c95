// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

use otto_config::SessionConfig;
use otto_model::{resolve_profile, ResolvedProfile, ToolSpec};
use otto_tools::ExecPolicy;

use crate::agents::AgentControl;
use crate::history::HistoryStore;

/// One step of the LLM-maintained plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: String,
    pub status: String,
}

/// Everything a session carries across continue-as-new.
///
/// Serialized as the workflow's state snapshot; transient coordination
/// state lives in [`crate::LoopControl`] instead and is reset on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub conversation_id: String,
    pub history: HistoryStore,
    pub tool_specs: Vec<ToolSpec>,
    pub config: SessionConfig,
    pub resolved_profile: ResolvedProfile,
    /// Completed LLM passes within the current turn.
    pub iteration_count: u32,
    pub max_iterations: u32,
    /// Cumulative across turns; crossing the configured budget triggers
    /// continue-as-new.
    pub total_iterations: u32,
    /// Provider response-chain token; presence enables incremental sends.
    pub last_response_id: Option<String>,
    pub last_sent_history_len: usize,
    pub exec_policy_text: String,
    pub compaction_count: u32,
    pub previous_model: Option<String>,
    pub previous_context_window: Option<u32>,
    /// Armed by `update_model`; the next turn injects a model-switch item.
    pub model_switched: bool,
    pub total_tokens: u64,
    pub total_cached_tokens: u64,
    /// Names of tools executed, in dispatch order.
    pub tool_calls_executed: Vec<String>,
    pub plan: Vec<PlanStep>,
    pub agent_control: AgentControl,
}

impl SessionState {
    pub fn new(
        conversation_id: impl Into<String>,
        config: SessionConfig,
        tool_specs: Vec<ToolSpec>,
        parent_depth: u32,
    ) -> Self {
        let resolved_profile = resolve_profile(&config.model);
        let max_iterations = config.max_iterations;
        Self {
            conversation_id: conversation_id.into(),
            history: HistoryStore::new(),
            tool_specs,
            config,
            resolved_profile,
            iteration_count: 0,
            max_iterations,
            total_iterations: 0,
            last_response_id: None,
            last_sent_history_len: 0,
            exec_policy_text: String::new(),
            compaction_count: 0,
            previous_model: None,
            previous_context_window: None,
            model_switched: false,
            total_tokens: 0,
            total_cached_tokens: 0,
            tool_calls_executed: Vec::new(),
            plan: Vec::new(),
            agent_control: AgentControl::new(parent_depth),
        }
    }

    /// Token count at which proactive compaction fires:
    /// `min(auto_compact_token_limit, 0.9 * context_window)`.
    pub fn effective_compact_limit(&self) -> u64 {
        let window_limit = (f64::from(self.resolved_profile.context_window) * 0.9) as u64;
        match self.config.auto_compact_token_limit {
            Some(limit) => limit.min(window_limit),
            None => window_limit,
        }
    }

    pub fn exec_policy(&self) -> ExecPolicy {
        ExecPolicy::parse(&self.exec_policy_text)
    }

    pub fn find_spec(&self, name: &str) -> Option<&ToolSpec> {
        self.tool_specs.iter().find(|s| s.name == name)
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn restore(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_config::ModelSettings;
    use otto_model::{ConversationItem, ItemPayload};

    fn state() -> SessionState {
        let config = SessionConfig {
            model: ModelSettings {
                provider: "mock".into(),
                name: "mock-model".into(),
                ..ModelSettings::default()
            },
            ..SessionConfig::default()
        };
        SessionState::new("conv-1", config, otto_tools::builtin_specs(), 0)
    }

    #[test]
    fn snapshot_roundtrip_preserves_everything() {
        let mut st = state();
        st.history
            .append(ConversationItem::with_turn(ItemPayload::TurnStarted, "t1"));
        st.history.append(ConversationItem::user_message("hi", "t1"));
        st.total_tokens = 123;
        st.total_cached_tokens = 45;
        st.compaction_count = 2;
        st.total_iterations = 17;
        st.tool_calls_executed.push("shell".into());
        st.plan.push(PlanStep {
            step: "write tests".into(),
            status: "in_progress".into(),
        });
        let back = SessionState::restore(st.snapshot()).unwrap();
        assert_eq!(back.conversation_id, "conv-1");
        assert_eq!(back.history.len(), 2);
        assert_eq!(back.history.items()[1].as_text(), Some("hi"));
        assert_eq!(back.total_tokens, 123);
        assert_eq!(back.total_cached_tokens, 45);
        assert_eq!(back.compaction_count, 2);
        assert_eq!(back.total_iterations, 17);
        assert_eq!(back.tool_calls_executed, vec!["shell".to_string()]);
        assert_eq!(back.plan.len(), 1);
    }

    #[test]
    fn effective_limit_is_min_of_config_and_window() {
        let mut st = state();
        // mock profile: 32k window → 28_800 at 90%
        assert_eq!(st.effective_compact_limit(), 28_800);
        st.config.auto_compact_token_limit = Some(10_000);
        assert_eq!(st.effective_compact_limit(), 10_000);
        st.config.auto_compact_token_limit = Some(1_000_000);
        assert_eq!(st.effective_compact_limit(), 28_800);
    }

    #[test]
    fn new_state_resolves_profile() {
        let st = state();
        assert_eq!(st.resolved_profile.provider, "mock");
        assert_eq!(st.resolved_profile.context_window, 32_000);
        assert_eq!(st.max_iterations, otto_config::DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn find_spec_by_name() {
        let st = state();
        assert!(st.find_spec("shell").is_some());
        assert!(st.find_spec("no_such_tool").is_none());
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed inputs and outputs of the activities the session workflow consumes.
//!
//! Each contract is serializable because activity payloads are persisted in
//! the workflow event history.  The error side travels as
//! `otto_workflow::ActivityError` with the stable kind strings defined by
//! each activity implementation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::items::ConversationItem;
use crate::profiles::ResolvedProfile;

/// Wire names of the activities consumed by the workflows.
pub mod activity_names {
    pub const EXECUTE_LLM_CALL: &str = "execute_llm_call";
    pub const EXECUTE_COMPACT: &str = "execute_compact";
    pub const GENERATE_SUGGESTIONS: &str = "generate_suggestions";
    pub const EXECUTE_TOOL: &str = "execute_tool";
    pub const LOAD_WORKER_INSTRUCTIONS: &str = "load_worker_instructions";
    pub const LOAD_PERSONAL_INSTRUCTIONS: &str = "load_personal_instructions";
    pub const LOAD_EXEC_POLICY: &str = "load_exec_policy";
    pub const INITIALIZE_MCP_SERVERS: &str = "initialize_mcp_servers";
}

/// Declarative description of one tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_ms: Option<u64>,
    /// True for tools that mutate the workspace.
    #[serde(default)]
    pub writes: bool,
    /// True for the sub-agent collaboration tools, which are dispatched
    /// inside the workflow and never go through approval.
    #[serde(default)]
    pub collaboration: bool,
}

/// Provider-reported token usage for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    #[serde(default)]
    pub cached: u64,
    #[serde(default)]
    pub cache_creation: u64,
}

/// Why the model stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
}

/// Input of `execute_llm_call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallInput {
    /// Incremental or full history, depending on response chaining.
    pub history: Vec<ConversationItem>,
    pub model: ResolvedProfile,
    pub tool_specs: Vec<ToolSpec>,
    #[serde(default)]
    pub base_instructions: String,
    #[serde(default)]
    pub developer_instructions: String,
    #[serde(default)]
    pub user_instructions: String,
    /// Response-chain token from the previous call, when sending a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

/// Output of `execute_llm_call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallOutput {
    pub items: Vec<ConversationItem>,
    pub finish_reason: FinishReason,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

/// Input of `execute_compact`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactInput {
    pub model: ResolvedProfile,
    pub input: Vec<ConversationItem>,
    #[serde(default)]
    pub instructions: String,
}

/// Output of `execute_compact`: the items that replace the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactOutput {
    pub items: Vec<ConversationItem>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

/// Input of `generate_suggestions` (best-effort, no retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionInput {
    pub user_message: String,
    pub assistant_message: String,
    #[serde(default)]
    pub tool_summaries: Vec<String>,
    pub model: ResolvedProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestionOutput {
    pub suggestion: String,
}

/// Input of `execute_tool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    /// Raw JSON arguments string from the model.
    pub arguments: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub sandbox_disabled: bool,
    #[serde(default)]
    pub timeout_ms: u64,
}

/// Output of `execute_tool`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub content: String,
    pub success: bool,
}

/// Input of the instruction/policy loading activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionsInput {
    #[serde(default)]
    pub cwd: String,
}

/// Output of the instruction/policy loading activities (fail-soft: a
/// missing file yields empty content).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstructionsOutput {
    pub content: String,
}

/// Output of `initialize_mcp_servers`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpInitOutput {
    pub tool_specs: Vec<ToolSpec>,
    /// Tool-name → server-name lookup for dispatch.
    #[serde(default)]
    pub servers_by_tool: std::collections::HashMap<String, String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_wire_values() {
        assert_eq!(
            serde_json::to_string(&FinishReason::Stop).unwrap(),
            "\"stop\""
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::ToolCalls).unwrap(),
            "\"tool_calls\""
        );
        assert_eq!(
            serde_json::to_string(&FinishReason::ContentFilter).unwrap(),
            "\"content_filter\""
        );
    }

    #[test]
    fn llm_input_roundtrips() {
        let input = LlmCallInput {
            history: vec![ConversationItem::assistant_message("hello")],
            model: ResolvedProfile::default(),
            tool_specs: vec![],
            base_instructions: "be terse".into(),
            developer_instructions: String::new(),
            user_instructions: String::new(),
            previous_response_id: Some("resp-1".into()),
        };
        let v = serde_json::to_value(&input).unwrap();
        let back: LlmCallInput = serde_json::from_value(v).unwrap();
        assert_eq!(back.previous_response_id.as_deref(), Some("resp-1"));
        assert_eq!(back.history.len(), 1);
    }

    #[test]
    fn tool_spec_defaults() {
        let spec: ToolSpec = serde_json::from_value(serde_json::json!({
            "name": "read_file",
            "description": "read a file",
            "parameters": {"type": "object"},
        }))
        .unwrap();
        assert!(!spec.writes);
        assert!(!spec.collaboration);
        assert_eq!(spec.default_timeout_ms, None);
    }
}

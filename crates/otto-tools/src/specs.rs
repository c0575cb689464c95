// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::json;

use otto_model::ToolSpec;

/// Canonical tool names referenced across the crate.
pub mod tool_names {
    pub const SHELL: &str = "shell";
    pub const READ_FILE: &str = "read_file";
    pub const WRITE_FILE: &str = "write_file";
    pub const LIST_DIR: &str = "list_dir";
    pub const GREP_FILES: &str = "grep_files";
    pub const APPLY_PATCH: &str = "apply_patch";
    pub const WRITE_STDIN: &str = "write_stdin";

    // Workflow-intercepted tools (handled inline, never dispatched).
    pub const REQUEST_USER_INPUT: &str = "request_user_input";
    pub const UPDATE_PLAN: &str = "update_plan";

    // Sub-agent collaboration tools.
    pub const SPAWN_AGENT: &str = "spawn_agent";
    pub const SEND_INPUT: &str = "send_input";
    pub const WAIT: &str = "wait";
    pub const CLOSE_AGENT: &str = "close_agent";
    pub const RESUME_AGENT: &str = "resume_agent";
}

/// True for tools the workflow dispatches inline instead of executing as
/// activities (includes the collaboration set).
pub fn is_intercepted_tool(name: &str) -> bool {
    matches!(
        name,
        tool_names::REQUEST_USER_INPUT | tool_names::UPDATE_PLAN
    ) || is_collaboration_tool(name)
}

pub fn is_collaboration_tool(name: &str) -> bool {
    matches!(
        name,
        tool_names::SPAWN_AGENT
            | tool_names::SEND_INPUT
            | tool_names::WAIT
            | tool_names::CLOSE_AGENT
            | tool_names::RESUME_AGENT
    )
}

/// Specs for the built-in workspace tools.
pub fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: tool_names::SHELL.into(),
            description: "Execute a shell command in the session working directory. \
                          Pass session_id to continue an interactive session."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "The shell command to execute" },
                    "session_id": { "type": "integer", "description": "Existing exec session to reuse" },
                    "timeout_ms": { "type": "integer", "description": "Execution timeout in milliseconds" }
                },
                "required": ["command"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(30_000),
            writes: true,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::READ_FILE.into(),
            description: "Read a file and return its contents.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "offset": { "type": "integer" },
                    "limit": { "type": "integer" }
                },
                "required": ["path"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(10_000),
            writes: false,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::WRITE_FILE.into(),
            description: "Create or overwrite a file with the given contents.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(10_000),
            writes: true,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::LIST_DIR.into(),
            description: "List the entries of a directory.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(10_000),
            writes: false,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::GREP_FILES.into(),
            description: "Search file contents for a regular expression.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" }
                },
                "required": ["pattern"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(20_000),
            writes: false,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::APPLY_PATCH.into(),
            description: "Apply a patch to the workspace.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "patch": { "type": "string" } },
                "required": ["patch"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(20_000),
            writes: true,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::WRITE_STDIN.into(),
            description: "Write to the stdin of an interactive exec session started by shell."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "session_id": { "type": "integer" },
                    "data": { "type": "string" }
                },
                "required": ["session_id", "data"],
                "additionalProperties": false
            }),
            default_timeout_ms: Some(10_000),
            writes: true,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::REQUEST_USER_INPUT.into(),
            description: "Ask the user one or more questions and wait for answers. \
                          Use for decisions only the user can make."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": { "type": "string" },
                                "prompt": { "type": "string" },
                                "options": { "type": "array", "items": { "type": "string" } }
                            },
                            "required": ["id", "prompt"]
                        }
                    }
                },
                "required": ["questions"],
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: false,
        },
        ToolSpec {
            name: tool_names::UPDATE_PLAN.into(),
            description: "Replace the current step-by-step plan shown to the user.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "step": { "type": "string" },
                                "status": { "type": "string", "enum": ["pending", "in_progress", "completed"] }
                            },
                            "required": ["step", "status"]
                        }
                    }
                },
                "required": ["steps"],
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: false,
        },
    ]
}

/// Specs for the sub-agent collaboration tools.
pub fn collaboration_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: tool_names::SPAWN_AGENT.into(),
            description: "Spawn a sub-agent with its own session to work on a scoped task. \
                          Roles: default, worker, explorer, orchestrator, planner."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Task description for the sub-agent" },
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "type": { "type": "string" },
                                "text": { "type": "string" }
                            }
                        },
                        "description": "Alternative to message: content items whose text entries are concatenated"
                    },
                    "agent_type": { "type": "string", "enum": ["default", "worker", "explorer", "orchestrator", "planner"] }
                },
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: true,
        },
        ToolSpec {
            name: tool_names::SEND_INPUT.into(),
            description: "Send a message to a running sub-agent, optionally interrupting its current turn.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string" },
                    "message": { "type": "string" },
                    "items": { "type": "array", "items": { "type": "object" } },
                    "interrupt": { "type": "boolean" }
                },
                "required": ["id"],
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: true,
        },
        ToolSpec {
            name: tool_names::WAIT.into(),
            description: "Wait until any of the given sub-agents reaches a terminal state.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "ids": { "type": "array", "items": { "type": "string" } },
                    "timeout_ms": { "type": "integer" }
                },
                "required": ["ids"],
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: true,
        },
        ToolSpec {
            name: tool_names::CLOSE_AGENT.into(),
            description: "Shut a sub-agent down and wait briefly for it to finish.".into(),
            parameters: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"],
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: true,
        },
        ToolSpec {
            name: tool_names::RESUME_AGENT.into(),
            description: "Resume a closed sub-agent (not currently supported).".into(),
            parameters: json!({
                "type": "object",
                "properties": { "id": { "type": "string" } },
                "required": ["id"],
                "additionalProperties": false
            }),
            default_timeout_ms: None,
            writes: false,
            collaboration: true,
        },
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaboration_tools_are_intercepted() {
        for spec in collaboration_specs() {
            assert!(is_intercepted_tool(&spec.name), "{}", spec.name);
            assert!(spec.collaboration);
        }
    }

    #[test]
    fn plan_and_question_tools_are_intercepted() {
        assert!(is_intercepted_tool(tool_names::UPDATE_PLAN));
        assert!(is_intercepted_tool(tool_names::REQUEST_USER_INPUT));
        assert!(!is_intercepted_tool(tool_names::SHELL));
    }

    #[test]
    fn write_tools_are_marked() {
        let specs = builtin_specs();
        let writes: Vec<&str> = specs
            .iter()
            .filter(|s| s.writes)
            .map(|s| s.name.as_str())
            .collect();
        assert!(writes.contains(&tool_names::SHELL));
        assert!(writes.contains(&tool_names::WRITE_FILE));
        assert!(writes.contains(&tool_names::APPLY_PATCH));
        assert!(!writes.contains(&tool_names::READ_FILE));
    }

    #[test]
    fn shell_spec_has_default_timeout() {
        let specs = builtin_specs();
        let shell = specs.iter().find(|s| s.name == tool_names::SHELL).unwrap();
        assert_eq!(shell.default_timeout_ms, Some(30_000));
    }
}

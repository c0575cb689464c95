// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

use otto_config::ApprovalMode;
use otto_model::ToolSpec;

use crate::policy::{ExecPolicy, PolicyDecision};
use crate::specs::{is_intercepted_tool, tool_names};

/// Content of the synthesized output for a user-denied call.
pub const DENIAL_MESSAGE: &str = "Tool call denied by user";

/// Bounds applied to the model-supplied `timeout_ms` argument.
pub const MIN_TOOL_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TOOL_TIMEOUT_MS: u64 = 600_000;
/// Fallback when neither the call nor the tool spec names a timeout.
pub const GLOBAL_TOOL_TIMEOUT_MS: u64 = 60_000;

/// Outcome of classifying one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallDisposition {
    /// Dispatch without asking.
    Skip,
    /// Hold for the user's decision.
    NeedsApproval,
    /// Never dispatched; `reason` becomes the synthesized failure output.
    Forbidden { reason: String },
}

/// Tools that never mutate anything and are safe in every mode.
const READ_ONLY_TOOLS: &[&str] = &[
    tool_names::READ_FILE,
    tool_names::LIST_DIR,
    tool_names::GREP_FILES,
];

/// Shell commands considered read-only by their first token.
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "cat", "pwd", "echo", "head", "tail", "wc", "which", "rg", "find", "grep", "date",
    "whoami", "env", "true",
];

/// Two-token read-only commands (`git status`, not bare `git`).
const READ_ONLY_COMMAND_PAIRS: &[(&str, &str)] = &[
    ("git", "status"),
    ("git", "diff"),
    ("git", "log"),
    ("git", "show"),
    ("git", "branch"),
];

/// Classify one tool call per the approval mode, the exec policy and the
/// static safety tables.  `arguments` is the raw JSON string from the model.
pub fn classify_call(
    name: &str,
    arguments: &str,
    mode: ApprovalMode,
    policy: &ExecPolicy,
) -> CallDisposition {
    let args: Option<Value> = serde_json::from_str(arguments).ok();
    let command = shell_command(name, args.as_ref());

    // Policy rules come first: forbidden commands are never dispatched,
    // trusted ones skip approval in every mode.
    if let Some(subject) = command.as_deref().or(Some(name)) {
        if let Some(rule) = policy.evaluate(subject) {
            match rule.decision {
                PolicyDecision::Forbidden => {
                    let reason = match &rule.justification {
                        Some(why) => format!("Blocked by exec policy: {why}"),
                        None => format!("Blocked by exec policy rule `{}`", rule.prefix),
                    };
                    return CallDisposition::Forbidden { reason };
                }
                PolicyDecision::Trusted => return CallDisposition::Skip,
            }
        }
    }

    // Intercepted and collaboration tools are handled inside the workflow
    // and never go through approval.
    if is_intercepted_tool(name) {
        return CallDisposition::Skip;
    }

    if mode == ApprovalMode::Never {
        return CallDisposition::Skip;
    }

    // unless_trusted / on_failure: static table.
    if READ_ONLY_TOOLS.contains(&name) {
        return CallDisposition::Skip;
    }
    if name == tool_names::SHELL {
        return match command {
            Some(cmd) if is_read_only_command(&cmd) => CallDisposition::Skip,
            // Malformed or missing command argument: ask.
            _ => CallDisposition::NeedsApproval,
        };
    }
    // Everything else mutates or is unknown: ask.
    CallDisposition::NeedsApproval
}

/// The command string of a shell call, when present and well-formed.
fn shell_command(name: &str, args: Option<&Value>) -> Option<String> {
    if name != tool_names::SHELL {
        return None;
    }
    args?
        .get("command")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn is_read_only_command(command: &str) -> bool {
    let mut tokens = command.split_whitespace();
    let first = match tokens.next() {
        Some(t) => t,
        None => return false,
    };
    if READ_ONLY_COMMANDS.contains(&first) {
        return true;
    }
    if let Some(second) = tokens.next() {
        return READ_ONLY_COMMAND_PAIRS.contains(&(first, second));
    }
    false
}

/// Resolve the effective tool timeout: the model's `timeout_ms` argument
/// (clamped to a sane range), else the spec's default, else the global
/// fallback.
pub fn resolve_timeout_ms(arguments: &str, spec: Option<&ToolSpec>) -> u64 {
    let from_args = serde_json::from_str::<Value>(arguments)
        .ok()
        .and_then(|v| v.get("timeout_ms").and_then(Value::as_u64));
    match from_args {
        Some(ms) => ms.clamp(MIN_TOOL_TIMEOUT_MS, MAX_TOOL_TIMEOUT_MS),
        None => spec
            .and_then(|s| s.default_timeout_ms)
            .unwrap_or(GLOBAL_TOOL_TIMEOUT_MS),
    }
}

/// Keywords that identify a sandbox denial in a failed tool output
/// (case-insensitive substring match).  Drives escalation in `on_failure`
/// mode.
const SANDBOX_DENIAL_KEYWORDS: &[&str] = &[
    "operation not permitted",
    "permission denied",
    "read-only file system",
    "seccomp",
    "sandbox",
    "landlock",
    "failed to write file",
];

pub fn is_sandbox_denial(content: &str) -> bool {
    let lowered = content.to_lowercase();
    SANDBOX_DENIAL_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::builtin_specs;

    fn classify(name: &str, arguments: &str, mode: ApprovalMode) -> CallDisposition {
        classify_call(name, arguments, mode, &ExecPolicy::default())
    }

    // ── Mode: never ───────────────────────────────────────────────────────────

    #[test]
    fn never_mode_skips_everything() {
        assert_eq!(
            classify("shell", r#"{"command":"rm -rf /tmp/x"}"#, ApprovalMode::Never),
            CallDisposition::Skip
        );
        assert_eq!(
            classify("write_file", r#"{"path":"a","content":"b"}"#, ApprovalMode::Never),
            CallDisposition::Skip
        );
    }

    // ── Mode: unless_trusted ──────────────────────────────────────────────────

    #[test]
    fn read_tools_are_safe() {
        for tool in ["read_file", "list_dir", "grep_files"] {
            assert_eq!(
                classify(tool, "{}", ApprovalMode::UnlessTrusted),
                CallDisposition::Skip,
                "{tool}"
            );
        }
    }

    #[test]
    fn read_only_shell_commands_are_safe() {
        for cmd in ["ls -la", "cat README.md", "git status", "git log -5"] {
            let args = format!(r#"{{"command":{}}}"#, serde_json::json!(cmd));
            assert_eq!(
                classify("shell", &args, ApprovalMode::UnlessTrusted),
                CallDisposition::Skip,
                "{cmd}"
            );
        }
    }

    #[test]
    fn mutating_shell_commands_need_approval() {
        for cmd in ["rm -rf /tmp/x", "git push", "cargo build", "mkdir out"] {
            let args = format!(r#"{{"command":{}}}"#, serde_json::json!(cmd));
            assert_eq!(
                classify("shell", &args, ApprovalMode::UnlessTrusted),
                CallDisposition::NeedsApproval,
                "{cmd}"
            );
        }
    }

    #[test]
    fn write_tools_need_approval() {
        assert_eq!(
            classify("write_file", r#"{"path":"a","content":"b"}"#, ApprovalMode::UnlessTrusted),
            CallDisposition::NeedsApproval
        );
        assert_eq!(
            classify("apply_patch", r#"{"patch":"..."}"#, ApprovalMode::UnlessTrusted),
            CallDisposition::NeedsApproval
        );
    }

    #[test]
    fn malformed_arguments_need_approval() {
        assert_eq!(
            classify("shell", "not json", ApprovalMode::UnlessTrusted),
            CallDisposition::NeedsApproval
        );
        assert_eq!(
            classify("shell", r#"{"cmd":"ls"}"#, ApprovalMode::UnlessTrusted),
            CallDisposition::NeedsApproval
        );
    }

    #[test]
    fn collaboration_tools_always_skip() {
        for tool in ["spawn_agent", "send_input", "wait", "close_agent", "update_plan"] {
            assert_eq!(
                classify(tool, "{}", ApprovalMode::UnlessTrusted),
                CallDisposition::Skip,
                "{tool}"
            );
        }
    }

    // ── Exec policy interaction ───────────────────────────────────────────────

    #[test]
    fn forbidden_rule_blocks_in_any_mode() {
        let policy = ExecPolicy::parse("forbidden git push -- protected\n");
        let args = r#"{"command":"git push origin main"}"#;
        let d = classify_call("shell", args, ApprovalMode::Never, &policy);
        match d {
            CallDisposition::Forbidden { reason } => assert!(reason.contains("protected")),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[test]
    fn trusted_rule_skips_approval() {
        let policy = ExecPolicy::parse("trusted cargo build\n");
        let args = r#"{"command":"cargo build --release"}"#;
        let d = classify_call("shell", args, ApprovalMode::UnlessTrusted, &policy);
        assert_eq!(d, CallDisposition::Skip);
    }

    // ── Timeout resolution ────────────────────────────────────────────────────

    #[test]
    fn explicit_timeout_is_clamped() {
        assert_eq!(resolve_timeout_ms(r#"{"timeout_ms": 50}"#, None), 1_000);
        assert_eq!(
            resolve_timeout_ms(r#"{"timeout_ms": 99999999}"#, None),
            600_000
        );
        assert_eq!(resolve_timeout_ms(r#"{"timeout_ms": 5000}"#, None), 5_000);
    }

    #[test]
    fn spec_default_applies_without_argument() {
        let specs = builtin_specs();
        let shell = specs.iter().find(|s| s.name == "shell");
        assert_eq!(resolve_timeout_ms("{}", shell), 30_000);
    }

    #[test]
    fn global_fallback_without_spec() {
        assert_eq!(resolve_timeout_ms("{}", None), GLOBAL_TOOL_TIMEOUT_MS);
    }

    // ── Sandbox denial matching ───────────────────────────────────────────────

    #[test]
    fn sandbox_denials_match_case_insensitively() {
        assert!(is_sandbox_denial("sh: Permission Denied"));
        assert!(is_sandbox_denial("write failed: Read-only file system"));
        assert!(is_sandbox_denial("blocked by Landlock ruleset"));
        assert!(!is_sandbox_denial("command not found"));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Iteration cap for a single turn (LLM call + tool pass).
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;
/// Cumulative iterations after which the session continues-as-new.
pub const DEFAULT_MAX_TOTAL_ITERATIONS: u32 = 100;
/// Idle time after which the session loop continues-as-new to bound history.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 3600;

/// When the user must confirm tool calls.
///
/// The legacy wire value `""` (from configs written before the mode existed)
/// deserializes as [`ApprovalMode::Never`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalMode {
    /// Every call runs without confirmation.
    #[default]
    Never,
    /// Calls outside the trusted set need confirmation before dispatch.
    UnlessTrusted,
    /// Calls run sandboxed first; sandbox denials escalate for confirmation.
    OnFailure,
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalMode::Never => "never",
            ApprovalMode::UnlessTrusted => "unless_trusted",
            ApprovalMode::OnFailure => "on_failure",
        }
    }
}

impl std::str::FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "never" => Ok(ApprovalMode::Never),
            "unless_trusted" => Ok(ApprovalMode::UnlessTrusted),
            "on_failure" => Ok(ApprovalMode::OnFailure),
            other => Err(format!("unknown approval mode: {other:?}")),
        }
    }
}

impl Serialize for ApprovalMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ApprovalMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What the sandbox allows a tool process to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPolicy {
    /// Reads anywhere, writes only under the session cwd.
    #[default]
    WorkspaceWrite,
    /// No writes at all.
    ReadOnly,
    /// Sandbox disabled entirely.
    DangerFullAccess,
}

/// Model selection plus per-session sampling overrides.
///
/// `context_window`, `max_tokens` and `temperature` are overrides: when
/// absent, the resolved model profile supplies the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub provider: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            temperature: None,
            context_window: None,
            max_tokens: None,
        }
    }
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_max_total_iterations() -> u32 {
    DEFAULT_MAX_TOTAL_ITERATIONS
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

/// Full per-session configuration, serialized inside the state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub sandbox_policy: SandboxPolicy,
    /// Working directory tools execute in.
    #[serde(default)]
    pub cwd: String,
    /// Stable system-level instructions.
    #[serde(default)]
    pub base_instructions: String,
    /// Project / worker instructions (loaded by the harness or an activity).
    #[serde(default)]
    pub developer_instructions: String,
    /// Personal instructions of the user.
    #[serde(default)]
    pub user_instructions: String,
    /// Routes tool activities to a dedicated worker pool when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_task_queue: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_total_iterations")]
    pub max_total_iterations: u32,
    /// Token count that triggers proactive compaction.  The effective limit
    /// is `min(auto_compact_token_limit, 0.9 * context_window)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_compact_token_limit: Option<u64>,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// MCP tool-spec initialization is only attempted when enabled.
    #[serde(default)]
    pub mcp_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: ModelSettings::default(),
            approval_mode: ApprovalMode::default(),
            sandbox_policy: SandboxPolicy::default(),
            cwd: String::new(),
            base_instructions: String::new(),
            developer_instructions: String::new(),
            user_instructions: String::new(),
            session_task_queue: None,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_total_iterations: DEFAULT_MAX_TOTAL_ITERATIONS,
            auto_compact_token_limit: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            mcp_enabled: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── ApprovalMode wire format ──────────────────────────────────────────────

    #[test]
    fn approval_mode_roundtrip() {
        for mode in [
            ApprovalMode::Never,
            ApprovalMode::UnlessTrusted,
            ApprovalMode::OnFailure,
        ] {
            let json = serde_json::to_string(&mode).unwrap();
            let back: ApprovalMode = serde_json::from_str(&json).unwrap();
            assert_eq!(mode, back);
        }
    }

    #[test]
    fn legacy_empty_string_is_never() {
        let mode: ApprovalMode = serde_json::from_str("\"\"").unwrap();
        assert_eq!(mode, ApprovalMode::Never);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(serde_json::from_str::<ApprovalMode>("\"sometimes\"").is_err());
    }

    // ── SessionConfig defaults ────────────────────────────────────────────────

    #[test]
    fn empty_document_gets_defaults() {
        let cfg: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(cfg.max_total_iterations, DEFAULT_MAX_TOTAL_ITERATIONS);
        assert_eq!(cfg.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
        assert_eq!(cfg.approval_mode, ApprovalMode::Never);
        assert!(!cfg.mcp_enabled);
    }

    #[test]
    fn constructed_default_matches_wire_default() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(cfg.max_total_iterations, DEFAULT_MAX_TOTAL_ITERATIONS);
        assert_eq!(cfg.idle_timeout_secs, DEFAULT_IDLE_TIMEOUT_SECS);
    }

    #[test]
    fn yaml_config_parses() {
        let yaml = "
model:
  provider: openai
  name: gpt-4o
approval_mode: unless_trusted
cwd: /work/project
max_iterations: 5
";
        let cfg: SessionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.model.provider, "openai");
        assert_eq!(cfg.approval_mode, ApprovalMode::UnlessTrusted);
        assert_eq!(cfg.max_iterations, 5);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let mut cfg = SessionConfig::default();
        cfg.session_task_queue = Some("otto-dir-7".into());
        cfg.auto_compact_token_limit = Some(120_000);
        let v = serde_json::to_value(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back.session_task_queue.as_deref(), Some("otto-dir-7"));
        assert_eq!(back.auto_compact_token_limit, Some(120_000));
    }
}

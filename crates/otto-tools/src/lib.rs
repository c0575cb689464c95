// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool specs, the approval gate, and textual exec-policy rules.
//!
//! The gate classifies each model-requested tool call into auto-approved,
//! needs-approval or forbidden before anything is dispatched; classification
//! combines a static mutating-command table, a read-only shell allowlist,
//! the session's exec-policy rules and the configured approval mode.

mod approval;
mod policy;
mod specs;

pub use approval::{
    classify_call, is_sandbox_denial, resolve_timeout_ms, CallDisposition, DENIAL_MESSAGE,
    GLOBAL_TOOL_TIMEOUT_MS, MAX_TOOL_TIMEOUT_MS, MIN_TOOL_TIMEOUT_MS,
};
pub use policy::{ExecPolicy, ExecPolicyRule, PolicyDecision};
pub use specs::{
    builtin_specs, collaboration_specs, is_collaboration_tool, is_intercepted_tool, tool_names,
};

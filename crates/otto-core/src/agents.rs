// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent orchestration: spawn/signal/wait/close child sessions.
//!
//! The registry ([`AgentControl`]) is serialized state; child workflow
//! handles are transient and re-derived by workflow id after
//! continue-as-new.  Watcher coroutines record a child's final message and
//! terminal status as soon as it completes, so later runs usually only
//! read the registry.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use otto_config::SessionConfig;
use otto_model::{FunctionCallOutputPayload, ToolSpec};
use otto_workflow::{RunStatus, WorkflowHandle};

use crate::session::{SessionShared, SessionWorkflowInput, StartSessionInput, SESSION_WORKFLOW};
use crate::state::SessionState;
use crate::turn::TurnEnd;

/// Parents are depth 0; spawned children are depth 1.  No grandchildren.
pub const MAX_AGENT_DEPTH: u32 = 1;

const WAIT_MIN_MS: u64 = 10_000;
const WAIT_MAX_MS: u64 = 300_000;
const WAIT_DEFAULT_MS: u64 = 30_000;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

const ORCHESTRATOR_PROMPT: &str = "You are an orchestrator agent. Break the task into focused \
sub-tasks, delegate them, and integrate the results. You cannot modify files yourself; work \
through careful reading and precise instructions.";

const PLANNER_PROMPT: &str = "You are a planning agent. Study the task and the workspace, then \
produce a concrete step-by-step plan. Do not modify anything; your output is the plan itself.";

/// Role assigned to a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    #[default]
    Default,
    Worker,
    Explorer,
    Orchestrator,
    Planner,
}

impl AgentRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "default" => Some(AgentRole::Default),
            "worker" => Some(AgentRole::Worker),
            "explorer" => Some(AgentRole::Explorer),
            "orchestrator" => Some(AgentRole::Orchestrator),
            "planner" => Some(AgentRole::Planner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    PendingInit,
    Running,
    Completed,
    Errored,
    Shutdown,
    NotFound,
}

impl AgentStatus {
    /// `NotFound` also counts: there is nothing left to wait for.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::PendingInit | AgentStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub workflow_id: String,
    pub run_id: String,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub final_output: Option<String>,
    pub task_message: String,
}

/// Per-parent sub-agent registry, serialized across continue-as-new.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentControl {
    pub parent_depth: u32,
    pub agents: BTreeMap<String, AgentInfo>,
}

impl AgentControl {
    pub fn new(parent_depth: u32) -> Self {
        Self {
            parent_depth,
            agents: BTreeMap::new(),
        }
    }

    pub fn any_active(&self) -> bool {
        self.agents.values().any(|a| !a.status.is_terminal())
    }
}

/// Child config + tool set for a role, per the role-override table.
pub(crate) fn derive_child_session(
    state: &SessionState,
    role: AgentRole,
) -> (SessionConfig, Vec<ToolSpec>) {
    let mut config = state.config.clone();
    let child_depth = state.agent_control.parent_depth + 1;
    match role {
        AgentRole::Default | AgentRole::Worker => {}
        AgentRole::Explorer => {
            // Cheaper model on OpenAI; other providers keep the original.
            if state.resolved_profile.provider == "openai" {
                if let Some(cheap) = &state.resolved_profile.cheap_variant {
                    config.model.name = cheap.clone();
                    config.model.context_window = None;
                    config.model.max_tokens = None;
                }
            }
            config.base_instructions =
                format!("{}\n\nReasoning effort: medium.", config.base_instructions)
                    .trim()
                    .to_string();
        }
        AgentRole::Orchestrator => config.base_instructions = ORCHESTRATOR_PROMPT.to_string(),
        AgentRole::Planner => config.base_instructions = PLANNER_PROMPT.to_string(),
    }
    let read_only = matches!(
        role,
        AgentRole::Explorer | AgentRole::Orchestrator | AgentRole::Planner
    );
    let mut specs: Vec<ToolSpec> = state
        .tool_specs
        .iter()
        .filter(|s| !s.collaboration && !(read_only && s.writes))
        .cloned()
        .collect();
    // Children at the depth limit never get collaboration tools; workers
    // are one-shot and cannot spawn either.
    let can_spawn = matches!(role, AgentRole::Default) && child_depth < MAX_AGENT_DEPTH;
    if can_spawn {
        specs.extend(otto_tools::collaboration_specs());
    }
    (config, specs)
}

/// Start a child session; shared by the `spawn_agent` tool and the
/// `plan_request` update.
pub(crate) async fn spawn_agent_internal(
    sh: &Rc<SessionShared>,
    message: &str,
    role: AgentRole,
) -> Result<(String, String), String> {
    {
        let st = sh.state.borrow();
        if st.agent_control.parent_depth + 1 > MAX_AGENT_DEPTH {
            return Err(format!(
                "maximum sub-agent depth ({MAX_AGENT_DEPTH}) reached"
            ));
        }
    }
    let agent_id = format!("agent-{}", sh.ctx.clock_nanos());
    let (workflow_id, input) = {
        let st = sh.state.borrow();
        let workflow_id = format!("{}/{}", st.conversation_id, agent_id);
        let (config, specs) = derive_child_session(&st, role);
        let input = SessionWorkflowInput::Start(StartSessionInput {
            config,
            user_message: message.to_string(),
            tool_specs: Some(specs),
            parent_depth: st.agent_control.parent_depth + 1,
            instructions_resolved: true,
        });
        (workflow_id, input)
    };
    let input = serde_json::to_value(input).map_err(|e| e.to_string())?;
    let handle = sh
        .ctx
        .start_child(SESSION_WORKFLOW, &workflow_id, input)
        .await
        .map_err(|e| format!("failed to start sub-agent: {e}"))?;
    {
        let mut st = sh.state.borrow_mut();
        st.agent_control.agents.insert(
            agent_id.clone(),
            AgentInfo {
                workflow_id: workflow_id.clone(),
                run_id: format!("{workflow_id}#1"),
                role,
                status: AgentStatus::Running,
                final_output: None,
                task_message: message.to_string(),
            },
        );
    }
    sh.children
        .borrow_mut()
        .insert(agent_id.clone(), handle.clone());
    spawn_watcher(sh, agent_id.clone(), handle);
    sh.bump();
    debug!(agent_id = %agent_id, ?role, "sub-agent spawned");
    Ok((agent_id, workflow_id))
}

/// Record the child's terminal state into the registry when it finishes.
fn spawn_watcher(sh: &Rc<SessionShared>, agent_id: String, handle: WorkflowHandle) {
    let sh = sh.clone();
    let ctx = sh.ctx.clone();
    ctx.spawn(async move {
        let status = handle.join().await;
        let (agent_status, final_output) = match status {
            RunStatus::Completed(v) => (
                AgentStatus::Completed,
                v["final_assistant_message"].as_str().map(str::to_string),
            ),
            RunStatus::Failed(message) => (AgentStatus::Errored, Some(message)),
            RunStatus::Running => (AgentStatus::Errored, None),
        };
        {
            let mut st = sh.state.borrow_mut();
            if let Some(info) = st.agent_control.agents.get_mut(&agent_id) {
                if !info.status.is_terminal() {
                    info.status = agent_status;
                    info.final_output = final_output;
                }
            }
        }
        sh.children.borrow_mut().remove(&agent_id);
        sh.bump();
    });
}

/// After continue-as-new the future map is empty; re-derive handles for
/// agents the registry still considers live.
pub(crate) fn reattach_children(sh: &Rc<SessionShared>) {
    let live: Vec<(String, String)> = sh
        .state
        .borrow()
        .agent_control
        .agents
        .iter()
        .filter(|(_, info)| !info.status.is_terminal())
        .map(|(id, info)| (id.clone(), info.workflow_id.clone()))
        .collect();
    for (agent_id, workflow_id) in live {
        match sh.ctx.find_workflow(&workflow_id) {
            Some(handle) => {
                sh.children
                    .borrow_mut()
                    .insert(agent_id.clone(), handle.clone());
                spawn_watcher(sh, agent_id, handle);
            }
            None => {
                warn!(agent_id = %agent_id, "child workflow lost across restart");
                if let Some(info) = sh.state.borrow_mut().agent_control.agents.get_mut(&agent_id)
                {
                    info.status = AgentStatus::NotFound;
                }
            }
        }
    }
}

fn ensure_handle(sh: &Rc<SessionShared>, agent_id: &str) -> Option<WorkflowHandle> {
    if let Some(handle) = sh.children.borrow().get(agent_id) {
        return Some(handle.clone());
    }
    let (workflow_id, terminal) = {
        let st = sh.state.borrow();
        let info = st.agent_control.agents.get(agent_id)?;
        (info.workflow_id.clone(), info.status.is_terminal())
    };
    let handle = sh.ctx.find_workflow(&workflow_id)?;
    sh.children
        .borrow_mut()
        .insert(agent_id.to_string(), handle.clone());
    if !terminal {
        spawn_watcher(sh, agent_id.to_string(), handle.clone());
    }
    Some(handle)
}

fn clamp_wait_timeout(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(WAIT_DEFAULT_MS)
        .clamp(WAIT_MIN_MS, WAIT_MAX_MS)
}

fn parse_args(raw: &str) -> Result<Value, FunctionCallOutputPayload> {
    serde_json::from_str(raw)
        .map_err(|e| FunctionCallOutputPayload::err(format!("malformed arguments: {e}")))
}

/// Accepts either a plain `message` or a content-item array, but not both.
fn extract_message(args: &Value) -> Result<String, String> {
    let message = args.get("message").and_then(Value::as_str);
    let items = args.get("items").and_then(Value::as_array);
    match (message, items) {
        (Some(_), Some(_)) => Err("provide either `message` or `items`, not both".into()),
        (Some(m), None) if !m.trim().is_empty() => Ok(m.to_string()),
        (None, Some(items)) => {
            let text: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            if text.is_empty() {
                Err("`items` contains no text entries".into())
            } else {
                Ok(text.join("\n"))
            }
        }
        _ => Err("missing task message".into()),
    }
}

// ─── Collaboration tool handlers ─────────────────────────────────────────────

pub(crate) async fn spawn_agent_tool(
    sh: &Rc<SessionShared>,
    arguments: &str,
) -> FunctionCallOutputPayload {
    let args = match parse_args(arguments) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let message = match extract_message(&args) {
        Ok(m) => m,
        Err(e) => return FunctionCallOutputPayload::err(e),
    };
    let role = match args.get("agent_type").and_then(Value::as_str) {
        None => AgentRole::Default,
        Some(s) => match AgentRole::parse(s) {
            Some(role) => role,
            None => return FunctionCallOutputPayload::err(format!("unknown agent_type: {s}")),
        },
    };
    match spawn_agent_internal(sh, &message, role).await {
        Ok((agent_id, workflow_id)) => FunctionCallOutputPayload::ok(
            json!({ "agent_id": agent_id, "workflow_id": workflow_id }).to_string(),
        ),
        Err(e) => FunctionCallOutputPayload::err(e),
    }
}

pub(crate) async fn send_input_tool(
    sh: &Rc<SessionShared>,
    arguments: &str,
) -> FunctionCallOutputPayload {
    let args = match parse_args(arguments) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let agent_id = match args.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => return FunctionCallOutputPayload::err("missing `id`"),
    };
    let status = {
        let st = sh.state.borrow();
        st.agent_control.agents.get(&agent_id).map(|a| a.status)
    };
    match status {
        None => return FunctionCallOutputPayload::err(format!("unknown agent: {agent_id}")),
        Some(status) if status.is_terminal() => {
            return FunctionCallOutputPayload::err(format!(
                "agent {agent_id} is no longer running"
            ))
        }
        Some(_) => {}
    }
    let message = match extract_message(&args) {
        Ok(m) => m,
        Err(e) => return FunctionCallOutputPayload::err(e),
    };
    let interrupt = args.get("interrupt").and_then(Value::as_bool).unwrap_or(false);
    let handle = match ensure_handle(sh, &agent_id) {
        Some(handle) => handle,
        None => {
            mark_not_found(sh, &agent_id);
            return FunctionCallOutputPayload::err(format!("agent {agent_id} not found"));
        }
    };
    match handle.signal(
        "agent_input",
        json!({ "content": message, "interrupt": interrupt }),
    ) {
        Ok(()) => FunctionCallOutputPayload::ok(json!({ "delivered": true }).to_string()),
        Err(e) => FunctionCallOutputPayload::err(format!("failed to signal agent: {e}")),
    }
}

pub(crate) async fn wait_tool(
    sh: &Rc<SessionShared>,
    arguments: &str,
) -> Result<FunctionCallOutputPayload, TurnEnd> {
    let args = match parse_args(arguments) {
        Ok(v) => v,
        Err(e) => return Ok(e),
    };
    let ids: Vec<String> = args
        .get("ids")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if ids.is_empty() {
        return Ok(FunctionCallOutputPayload::err("missing `ids`"));
    }
    let timeout_ms = clamp_wait_timeout(args.get("timeout_ms").and_then(Value::as_u64));

    // Re-derive handles so watchers exist even after continue-as-new.
    for id in &ids {
        if ensure_handle(sh, id).is_none() {
            let known = sh.state.borrow().agent_control.agents.contains_key(id);
            if known {
                mark_not_found(sh, id);
            }
        }
    }

    sh.set_phase(crate::control::Phase::WaitingForAgents);
    let cond_sh = sh.clone();
    let cond_ids = ids.clone();
    sh.ctx
        .await_condition_timeout(
            move || {
                let c = cond_sh.control.borrow();
                if c.interrupted || c.shutdown_requested {
                    return true;
                }
                let st = cond_sh.state.borrow();
                cond_ids.iter().any(|id| {
                    st.agent_control
                        .agents
                        .get(id)
                        .map(|a| a.status.is_terminal())
                        .unwrap_or(true)
                })
            },
            Duration::from_millis(timeout_ms),
        )
        .await;

    {
        let c = sh.control.borrow();
        if c.shutdown_requested {
            return Err(TurnEnd::Shutdown);
        }
        if c.interrupted {
            return Err(TurnEnd::Interrupted);
        }
    }

    let st = sh.state.borrow();
    let mut agents = Map::new();
    for id in &ids {
        let entry = match st.agent_control.agents.get(id) {
            Some(info) => json!({
                "status": info.status,
                "final_output": info.final_output,
            }),
            None => json!({ "status": AgentStatus::NotFound, "final_output": null }),
        };
        agents.insert(id.clone(), entry);
    }
    Ok(FunctionCallOutputPayload::ok(
        Value::Object(agents).to_string(),
    ))
}

pub(crate) async fn close_agent_tool(
    sh: &Rc<SessionShared>,
    arguments: &str,
) -> FunctionCallOutputPayload {
    let args = match parse_args(arguments) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let agent_id = match args.get("id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => return FunctionCallOutputPayload::err("missing `id`"),
    };
    let status = {
        let st = sh.state.borrow();
        st.agent_control.agents.get(&agent_id).map(|a| a.status)
    };
    let status = match status {
        None => return FunctionCallOutputPayload::err(format!("unknown agent: {agent_id}")),
        Some(status) => status,
    };
    if status.is_terminal() {
        return FunctionCallOutputPayload::ok(
            json!({ "id": agent_id, "status": status }).to_string(),
        );
    }
    if let Some(handle) = ensure_handle(sh, &agent_id) {
        let _ = handle.signal("agent_shutdown", json!({}));
    } else {
        mark_not_found(sh, &agent_id);
        return FunctionCallOutputPayload::ok(
            json!({ "id": agent_id, "status": AgentStatus::NotFound }).to_string(),
        );
    }
    let cond_sh = sh.clone();
    let cond_id = agent_id.clone();
    let reached = sh
        .ctx
        .await_condition_timeout(
            move || {
                cond_sh
                    .state
                    .borrow()
                    .agent_control
                    .agents
                    .get(&cond_id)
                    .map(|a| a.status.is_terminal())
                    .unwrap_or(true)
            },
            CLOSE_GRACE,
        )
        .await;
    if !reached {
        // Did not stop within the grace period; record it as shut down.
        if let Some(info) = sh
            .state
            .borrow_mut()
            .agent_control
            .agents
            .get_mut(&agent_id)
        {
            info.status = AgentStatus::Shutdown;
        }
        sh.bump();
    }
    let status = sh
        .state
        .borrow()
        .agent_control
        .agents
        .get(&agent_id)
        .map(|a| a.status)
        .unwrap_or(AgentStatus::NotFound);
    FunctionCallOutputPayload::ok(json!({ "id": agent_id, "status": status }).to_string())
}

fn mark_not_found(sh: &Rc<SessionShared>, agent_id: &str) {
    if let Some(info) = sh
        .state
        .borrow_mut()
        .agent_control
        .agents
        .get_mut(agent_id)
    {
        if !info.status.is_terminal() {
            info.status = AgentStatus::NotFound;
        }
    }
    sh.bump();
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_config::ModelSettings;

    fn state_with(provider: &str, model: &str) -> SessionState {
        let config = SessionConfig {
            model: ModelSettings {
                provider: provider.into(),
                name: model.into(),
                ..ModelSettings::default()
            },
            base_instructions: "base".into(),
            ..SessionConfig::default()
        };
        SessionState::new("conv", config, crate::session::default_tool_specs(), 0)
    }

    #[test]
    fn explorer_loses_write_tools() {
        let st = state_with("anthropic", "claude-sonnet-4-5");
        let (_, specs) = derive_child_session(&st, AgentRole::Explorer);
        assert!(specs.iter().all(|s| !s.writes));
        assert!(specs.iter().any(|s| s.name == "read_file"));
    }

    #[test]
    fn explorer_gets_cheap_model_on_openai_only() {
        let st = state_with("openai", "gpt-4o");
        let (config, _) = derive_child_session(&st, AgentRole::Explorer);
        assert_eq!(config.model.name, "gpt-4o-mini");

        let st = state_with("anthropic", "claude-sonnet-4-5");
        let (config, _) = derive_child_session(&st, AgentRole::Explorer);
        assert_eq!(config.model.name, "claude-sonnet-4-5");
    }

    #[test]
    fn children_at_depth_limit_lose_collaboration_tools() {
        let st = state_with("mock", "mock-model");
        for role in [
            AgentRole::Default,
            AgentRole::Worker,
            AgentRole::Explorer,
            AgentRole::Orchestrator,
            AgentRole::Planner,
        ] {
            let (_, specs) = derive_child_session(&st, role);
            assert!(
                specs.iter().all(|s| !s.collaboration),
                "{role:?} child at max depth kept collaboration tools"
            );
        }
    }

    #[test]
    fn worker_keeps_write_tools() {
        let st = state_with("mock", "mock-model");
        let (_, specs) = derive_child_session(&st, AgentRole::Worker);
        assert!(specs.iter().any(|s| s.writes));
    }

    #[test]
    fn planner_gets_planner_prompt() {
        let st = state_with("mock", "mock-model");
        let (config, _) = derive_child_session(&st, AgentRole::Planner);
        assert!(config.base_instructions.contains("planning agent"));
    }

    #[test]
    fn message_extraction_rules() {
        assert_eq!(
            extract_message(&json!({"message": "do it"})).unwrap(),
            "do it"
        );
        assert_eq!(
            extract_message(&json!({"items": [{"type": "text", "text": "a"}, {"text": "b"}]}))
                .unwrap(),
            "a\nb"
        );
        assert!(extract_message(&json!({"message": "x", "items": []})).is_err());
        assert!(extract_message(&json!({})).is_err());
    }

    #[test]
    fn agent_control_activity_tracking() {
        let mut ac = AgentControl::new(0);
        assert!(!ac.any_active());
        ac.agents.insert(
            "agent-1".into(),
            AgentInfo {
                workflow_id: "conv/agent-1".into(),
                run_id: "conv/agent-1#1".into(),
                role: AgentRole::Explorer,
                status: AgentStatus::Running,
                final_output: None,
                task_message: "explore".into(),
            },
        );
        assert!(ac.any_active());
        if let Some(agent) = ac.agents.get_mut("agent-1") {
            agent.status = AgentStatus::Completed;
        }
        assert!(!ac.any_active());
    }

    #[test]
    fn wait_timeout_is_clamped() {
        assert_eq!(clamp_wait_timeout(Some(1_000)), 10_000);
        assert_eq!(clamp_wait_timeout(Some(999_999)), 300_000);
        assert_eq!(clamp_wait_timeout(None), 30_000);
        assert_eq!(clamp_wait_timeout(Some(60_000)), 60_000);
    }

    #[test]
    fn status_wire_values_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::NotFound).unwrap(),
            "\"not_found\""
        );
        assert_eq!(
            serde_json::to_string(&AgentRole::Orchestrator).unwrap(),
            "\"orchestrator\""
        );
    }
}

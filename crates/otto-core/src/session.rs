// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use otto_config::SessionConfig;
use otto_model::activity_names;
use otto_model::{
    ConversationItem, FunctionCallOutputPayload, InstructionsInput, ItemPayload, McpInitOutput,
    SuggestionInput, ToolSpec,
};
use otto_workflow::{
    ActivityOptions, RetryPolicy, WfContext, WorkflowError, WorkflowExit, WorkflowFuture,
    WorkflowHandle,
};

use crate::control::{LoopControl, Phase};
use crate::state::SessionState;
use crate::{compact, handlers, turn};

/// Workflow type name of an agentic session.
pub const SESSION_WORKFLOW: &str = "agentic_session";

/// Start payload for a fresh session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionInput {
    pub config: SessionConfig,
    #[serde(default)]
    pub user_message: String,
    /// Pre-assembled tool set; `None` selects the built-in set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_specs: Option<Vec<ToolSpec>>,
    /// 0 for top-level sessions; children inherit parent depth + 1.
    #[serde(default)]
    pub parent_depth: u32,
    /// True when the harness already resolved instruction files.
    #[serde(default)]
    pub instructions_resolved: bool,
}

/// Input of the session workflow: a fresh start, or the state snapshot
/// carried across continue-as-new.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionWorkflowInput {
    Start(StartSessionInput),
    Resume { state: SessionState },
}

/// Everything the session's coroutines share.  Plain `RefCell`s: the
/// kernel serializes all of them onto one logical thread, so borrows are
/// only ever held between suspension points.
pub(crate) struct SessionShared {
    pub ctx: WfContext,
    pub state: RefCell<SessionState>,
    pub control: RefCell<LoopControl>,
    /// Transient child handles; vanish on continue-as-new and are
    /// re-derived from `AgentInfo` by workflow id.
    pub children: RefCell<HashMap<String, WorkflowHandle>>,
}

impl SessionShared {
    /// Mark an observable mutation: bump the version and wake waiters.
    pub fn bump(&self) {
        self.control.borrow_mut().state_version += 1;
        self.ctx.state_changed();
    }

    pub fn set_phase(&self, phase: Phase) {
        self.control.borrow_mut().phase = phase;
        self.bump();
    }

    pub fn append_item(&self, item: ConversationItem) -> u64 {
        let seq = self.state.borrow_mut().history.append(item);
        self.bump();
        seq
    }

    /// Append an assistant message stamped with the current turn id.
    pub fn append_assistant(&self, content: impl Into<String>) {
        let turn_id = self.control.borrow().turn_id.clone();
        let mut item = ConversationItem::assistant_message(content);
        item.turn_id = turn_id;
        self.append_item(item);
    }

    pub fn append_call_output(&self, call_id: &str, output: FunctionCallOutputPayload) {
        let turn_id = self.control.borrow().turn_id.clone();
        let mut item = ConversationItem::new(ItemPayload::FunctionCallOutput {
            call_id: call_id.to_string(),
            output,
        });
        item.turn_id = turn_id;
        self.append_item(item);
    }

    pub fn interrupted(&self) -> bool {
        self.control.borrow().interrupted
    }

    pub fn shutdown_requested(&self) -> bool {
        self.control.borrow().shutdown_requested
    }
}

/// Open a new user turn: `TurnStarted` + `UserMessage`, queued for the
/// loop.  Input arriving while a turn is active does not disturb the
/// active turn's id; the loop picks the queued turn up afterwards.
pub(crate) fn begin_user_turn(sh: &SessionShared, content: &str) -> String {
    let turn_id = format!("turn-{}", sh.ctx.clock_nanos());
    {
        let mut c = sh.control.borrow_mut();
        c.pending_turns.push_back(turn_id.clone());
        c.pending_input = true;
        c.interrupted = false;
        if !c.turn_open {
            c.turn_id = Some(turn_id.clone());
        }
    }
    {
        let mut st = sh.state.borrow_mut();
        st.history
            .append(ConversationItem::with_turn(ItemPayload::TurnStarted, &turn_id));
        st.history
            .append(ConversationItem::user_message(content, &turn_id));
    }
    sh.bump();
    turn_id
}

/// Set the interrupt flag and close any open turn with an "interrupted"
/// completion marker.
pub(crate) fn do_interrupt(sh: &SessionShared) {
    let open_turn = {
        let mut c = sh.control.borrow_mut();
        c.interrupted = true;
        c.pending_approvals.clear();
        c.pending_escalations.clear();
        c.pending_question = None;
        c.approval_slot.clear();
        c.escalation_slot.clear();
        c.question_slot.clear();
        if c.turn_open {
            c.turn_open = false;
            c.turn_id.clone()
        } else {
            None
        }
    };
    if let Some(turn_id) = open_turn {
        sh.state.borrow_mut().history.append(ConversationItem::with_turn(
            ItemPayload::TurnComplete {
                content: Some("interrupted".into()),
            },
            &turn_id,
        ));
    }
    sh.bump();
}

/// Request shutdown; implies an interrupt of the active turn.
pub(crate) fn do_shutdown(sh: &SessionShared) {
    sh.control.borrow_mut().shutdown_requested = true;
    do_interrupt(sh);
}

/// Close the current turn normally.
fn complete_turn(sh: &SessionShared) {
    let turn_id = {
        let mut c = sh.control.borrow_mut();
        c.turn_open = false;
        c.turn_id.clone()
    };
    let mut item = ConversationItem::new(ItemPayload::TurnComplete { content: None });
    item.turn_id = turn_id;
    sh.append_item(item);
}

/// The default tool set of a top-level session.
pub fn default_tool_specs() -> Vec<ToolSpec> {
    let mut specs = otto_tools::builtin_specs();
    specs.extend(otto_tools::collaboration_specs());
    specs
}

/// The agentic session workflow: await input, run a turn, compact on
/// demand, and continue-as-new when the run grows old.
pub fn session_workflow(ctx: WfContext, input: Value) -> WorkflowFuture {
    Box::pin(async move {
        let input: SessionWorkflowInput =
            serde_json::from_value(input).map_err(|e| WorkflowError::BadInput(e.to_string()))?;
        let (state, start) = match input {
            SessionWorkflowInput::Resume { mut state } => {
                // The iteration budget bounds one run's event history.
                state.total_iterations = 0;
                (state, None)
            }
            SessionWorkflowInput::Start(start) => {
                let specs = start.tool_specs.clone().unwrap_or_else(default_tool_specs);
                let state = SessionState::new(
                    ctx.workflow_id().to_string(),
                    start.config.clone(),
                    specs,
                    start.parent_depth,
                );
                (state, Some(start))
            }
        };
        info!(
            conversation_id = %state.conversation_id,
            resumed = start.is_none(),
            "session workflow starting"
        );
        let sh = Rc::new(SessionShared {
            ctx: ctx.clone(),
            state: RefCell::new(state),
            control: RefCell::new(LoopControl::default()),
            children: RefCell::new(HashMap::new()),
        });
        handlers::register_handlers(&sh);
        register_signal_drains(&sh);
        if let Some(start) = start {
            if !start.user_message.is_empty() {
                begin_user_turn(&sh, &start.user_message);
            }
            resolve_session_inputs(&sh, start.instructions_resolved).await;
        } else {
            crate::agents::reattach_children(&sh);
        }
        outer_loop(sh).await
    })
}

/// Load instruction files, the exec policy and (when enabled) MCP tool
/// specs.  All fail-soft: a missing file or broken server never takes the
/// session down.
async fn resolve_session_inputs(sh: &Rc<SessionShared>, instructions_resolved: bool) {
    let cwd = sh.state.borrow().config.cwd.clone();
    let load_opts = || {
        ActivityOptions::default()
            .with_retry(RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            })
            .with_start_to_close(Duration::from_secs(10))
    };
    let input = serde_json::to_value(InstructionsInput { cwd }).unwrap_or(Value::Null);

    if !instructions_resolved {
        for (activity, is_personal) in [
            (activity_names::LOAD_WORKER_INSTRUCTIONS, false),
            (activity_names::LOAD_PERSONAL_INSTRUCTIONS, true),
        ] {
            match sh
                .ctx
                .execute_activity(activity, input.clone(), load_opts())
                .await
            {
                Ok(v) => {
                    let content = v["content"].as_str().unwrap_or("").to_string();
                    let mut st = sh.state.borrow_mut();
                    if is_personal && st.config.user_instructions.is_empty() {
                        st.config.user_instructions = content;
                    } else if !is_personal && st.config.developer_instructions.is_empty() {
                        st.config.developer_instructions = content;
                    }
                }
                Err(e) => debug!(activity, error = %e, "instruction load failed"),
            }
        }
    }

    let needs_policy = sh.state.borrow().exec_policy_text.is_empty();
    if needs_policy {
        match sh
            .ctx
            .execute_activity(activity_names::LOAD_EXEC_POLICY, input.clone(), load_opts())
            .await
        {
            Ok(v) => {
                sh.state.borrow_mut().exec_policy_text =
                    v["content"].as_str().unwrap_or("").to_string();
            }
            Err(e) => debug!(error = %e, "exec policy load failed"),
        }
    }

    let mcp_enabled = sh.state.borrow().config.mcp_enabled;
    if mcp_enabled {
        match sh
            .ctx
            .execute_activity(activity_names::INITIALIZE_MCP_SERVERS, input, load_opts())
            .await
        {
            Ok(v) => {
                if let Ok(out) = serde_json::from_value::<McpInitOutput>(v) {
                    sh.state.borrow_mut().tool_specs.extend(out.tool_specs);
                }
            }
            Err(e) => warn!(error = %e, "mcp initialization failed"),
        }
    }
    sh.bump();
}

/// Parent→child messaging arrives as signals, drained by coroutines so
/// the main loop never blocks on a channel.
fn register_signal_drains(sh: &Rc<SessionShared>) {
    {
        let sh = sh.clone();
        let rx = sh.ctx.signal_channel("agent_input");
        sh.ctx.clone().spawn(async move {
            loop {
                let v = rx.recv().await;
                if sh.shutdown_requested() {
                    continue;
                }
                let content = v["content"].as_str().unwrap_or("").to_string();
                let interrupt = v["interrupt"].as_bool().unwrap_or(false);
                if interrupt {
                    do_interrupt(&sh);
                }
                if !content.is_empty() {
                    begin_user_turn(&sh, &content);
                }
            }
        });
    }
    {
        let sh = sh.clone();
        let rx = sh.ctx.signal_channel("agent_shutdown");
        sh.ctx.clone().spawn(async move {
            loop {
                let _ = rx.recv().await;
                do_shutdown(&sh);
            }
        });
    }
}

async fn outer_loop(sh: Rc<SessionShared>) -> Result<WorkflowExit, WorkflowError> {
    loop {
        let next_turn = {
            let mut c = sh.control.borrow_mut();
            let next = c.pending_turns.pop_front();
            c.pending_input = !c.pending_turns.is_empty();
            if let Some(turn_id) = &next {
                c.turn_id = Some(turn_id.clone());
                c.turn_open = true;
            }
            next
        };
        if next_turn.is_some() {
            match turn::run_agentic_turn(&sh).await {
                turn::TurnEnd::Completed => {
                    complete_turn(&sh);
                    generate_suggestion(&sh).await;
                    // Sub-agent sessions are one-shot: once the task turn
                    // is done and nothing is queued, report the result to
                    // the parent by completing.
                    let child_done = {
                        let st = sh.state.borrow();
                        let c = sh.control.borrow();
                        st.agent_control.parent_depth > 0
                            && c.pending_turns.is_empty()
                            && !c.shutdown_requested
                    };
                    if child_done {
                        return finish_session(&sh, "completed").await;
                    }
                }
                turn::TurnEnd::Interrupted => {
                    // The interrupt handler already closed the turn.
                    sh.control.borrow_mut().interrupted = false;
                    sh.bump();
                }
                turn::TurnEnd::Shutdown => {}
            }
            continue;
        }

        let compact_requested = {
            let mut c = sh.control.borrow_mut();
            if c.compact_requested {
                c.compact_requested = false;
                true
            } else {
                false
            }
        };
        if compact_requested {
            if let Err(e) = compact::run_compaction(&sh).await {
                warn!(error = %e, "requested compaction failed");
                sh.append_assistant(format!("Compaction failed: {e}"));
            }
            sh.set_phase(Phase::WaitingForInput);
            continue;
        }

        if sh.shutdown_requested() {
            return finish_session(&sh, "shutdown").await;
        }

        // Run out of iteration budget: restart with a fresh event history.
        let over_budget = {
            let st = sh.state.borrow();
            st.total_iterations >= st.config.max_total_iterations
        };
        if over_budget {
            return continue_as_new(&sh).await;
        }

        let agents_active = sh.state.borrow().agent_control.any_active();
        if agents_active {
            sh.set_phase(Phase::WaitingForAgents);
            let sh2 = sh.clone();
            sh.ctx
                .await_condition(move || {
                    let c = sh2.control.borrow();
                    c.pending_input
                        || c.shutdown_requested
                        || c.compact_requested
                        || !sh2.state.borrow().agent_control.any_active()
                })
                .await;
            continue;
        }

        sh.set_phase(Phase::WaitingForInput);
        let idle_timeout = Duration::from_secs(sh.state.borrow().config.idle_timeout_secs);
        let sh2 = sh.clone();
        let woke = sh
            .ctx
            .await_condition_timeout(
                move || {
                    let c = sh2.control.borrow();
                    c.pending_input || c.shutdown_requested || c.compact_requested
                },
                idle_timeout,
            )
            .await;
        if !woke {
            // Idle too long: bound this run's history.
            return continue_as_new(&sh).await;
        }
    }
}

/// Drain handlers and exit with the session result.
async fn finish_session(
    sh: &Rc<SessionShared>,
    end_reason: &str,
) -> Result<WorkflowExit, WorkflowError> {
    {
        let mut c = sh.control.borrow_mut();
        c.draining = true;
        c.turn_open = false;
    }
    // Close every turn the interrupt path did not already close, so no
    // TurnStarted is left unmatched in the final history.
    let open_turns = sh.state.borrow().history.open_turn_ids();
    for turn_id in open_turns {
        sh.state.borrow_mut().history.append(ConversationItem::with_turn(
            ItemPayload::TurnComplete { content: None },
            &turn_id,
        ));
    }
    sh.bump();
    sh.ctx.await_handlers_drained().await;
    let result = session_result(sh, end_reason);
    info!(
        conversation_id = %sh.state.borrow().conversation_id,
        end_reason,
        "session complete"
    );
    Ok(WorkflowExit::Completed(result))
}

async fn continue_as_new(sh: &Rc<SessionShared>) -> Result<WorkflowExit, WorkflowError> {
    {
        let mut c = sh.control.borrow_mut();
        c.draining = true;
    }
    sh.bump();
    sh.ctx.await_handlers_drained().await;
    let state = sh.state.borrow().clone();
    debug!(
        conversation_id = %state.conversation_id,
        history_len = state.history.len(),
        "continuing session as new"
    );
    let snapshot = serde_json::to_value(SessionWorkflowInput::Resume { state })
        .map_err(|e| WorkflowError::Internal(format!("state snapshot failed: {e}")))?;
    Ok(WorkflowExit::ContinueAsNew(snapshot))
}

fn session_result(sh: &SessionShared, end_reason: &str) -> Value {
    let st = sh.state.borrow();
    json!({
        "conversation_id": st.conversation_id,
        "end_reason": end_reason,
        "final_assistant_message": st.history.last_assistant_message(),
        "total_tokens": st.total_tokens,
        "total_cached_tokens": st.total_cached_tokens,
        "turn_count": st.history.turn_count(),
        "compaction_count": st.compaction_count,
        "tool_calls_executed": st.tool_calls_executed,
    })
}

/// Best-effort post-turn prompt suggestion; failures are invisible.
async fn generate_suggestion(sh: &Rc<SessionShared>) {
    let input = {
        let st = sh.state.borrow();
        let user_message = st
            .history
            .items()
            .iter()
            .rev()
            .find_map(|i| match &i.payload {
                ItemPayload::UserMessage { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();
        SuggestionInput {
            user_message,
            assistant_message: st.history.last_assistant_message().unwrap_or_default(),
            tool_summaries: st.tool_calls_executed.iter().rev().take(5).cloned().collect(),
            model: st.resolved_profile.clone(),
        }
    };
    let options = ActivityOptions::default()
        .with_retry(RetryPolicy::no_retries())
        .with_start_to_close(Duration::from_secs(5));
    match sh
        .ctx
        .execute_activity(
            activity_names::GENERATE_SUGGESTIONS,
            serde_json::to_value(input).unwrap_or(Value::Null),
            options,
        )
        .await
    {
        Ok(v) => {
            let suggestion = v["suggestion"].as_str().unwrap_or("").to_string();
            if !suggestion.is_empty() {
                sh.control.borrow_mut().suggestion = Some(suggestion);
                sh.bump();
            }
        }
        Err(e) => debug!(error = %e, "suggestion generation failed"),
    }
}

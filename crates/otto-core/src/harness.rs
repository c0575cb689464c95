// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Long-lived per-directory parent workflow.
//!
//! Owns the sessions of one logical user/directory: resolves the base
//! configuration once, starts session children on demand, tracks their
//! status, and idles with periodic continue-as-new so its own event
//! history stays bounded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use otto_config::SessionConfig;
use otto_model::activity_names;
use otto_model::InstructionsInput;
use otto_workflow::{
    ActivityOptions, RetryPolicy, UpdateRejection, WfContext, WorkflowError, WorkflowExit,
    WorkflowFuture, WorkflowHandle,
};

use crate::session::{SessionWorkflowInput, StartSessionInput, SESSION_WORKFLOW};

/// Workflow type name of the harness.
pub const HARNESS_WORKFLOW: &str = "harness";

/// Idle span between continue-as-new restarts.
const HARNESS_IDLE: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub workflow_id: String,
    pub user_message: String,
    pub status: String,
    pub started_at: String,
}

/// Harness state carried across continue-as-new.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessState {
    pub config: SessionConfig,
    pub sessions: Vec<SessionEntry>,
    pub counter: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HarnessInput {
    Start { config: SessionConfig },
    Resume { state: HarnessState },
}

struct HarnessShared {
    ctx: WfContext,
    state: RefCell<HarnessState>,
    children: RefCell<HashMap<String, WorkflowHandle>>,
}

pub fn harness_workflow(ctx: WfContext, input: Value) -> WorkflowFuture {
    Box::pin(async move {
        let input: HarnessInput =
            serde_json::from_value(input).map_err(|e| WorkflowError::BadInput(e.to_string()))?;
        let (state, fresh) = match input {
            HarnessInput::Start { config } => (
                HarnessState {
                    config,
                    sessions: Vec::new(),
                    counter: 0,
                },
                true,
            ),
            HarnessInput::Resume { state } => (state, false),
        };
        let sh = Rc::new(HarnessShared {
            ctx: ctx.clone(),
            state: RefCell::new(state),
            children: RefCell::new(HashMap::new()),
        });
        register_handlers(&sh);
        if fresh {
            resolve_base_config(&sh).await;
            info!(harness = %ctx.workflow_id(), "harness started");
        } else {
            reattach_sessions(&sh);
        }

        // Idle: nothing to compute until the timer fires, then restart
        // with a fresh event history carrying the session list forward.
        let _ = ctx
            .await_condition_timeout(|| false, HARNESS_IDLE)
            .await;
        let state = sh.state.borrow().clone();
        debug!(sessions = state.sessions.len(), "harness continuing as new");
        let snapshot = serde_json::to_value(HarnessInput::Resume { state })
            .map_err(|e| WorkflowError::Internal(format!("harness snapshot failed: {e}")))?;
        Ok(WorkflowExit::ContinueAsNew(snapshot))
    })
}

/// Load instruction files once; sessions started by this harness skip
/// their own resolution step.
async fn resolve_base_config(sh: &Rc<HarnessShared>) {
    let cwd = sh.state.borrow().config.cwd.clone();
    let input =
        serde_json::to_value(InstructionsInput { cwd }).unwrap_or(Value::Null);
    let options = || {
        ActivityOptions::default()
            .with_retry(RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            })
            .with_start_to_close(Duration::from_secs(10))
    };
    for (activity, is_personal) in [
        (activity_names::LOAD_WORKER_INSTRUCTIONS, false),
        (activity_names::LOAD_PERSONAL_INSTRUCTIONS, true),
    ] {
        if let Ok(v) = sh
            .ctx
            .execute_activity(activity, input.clone(), options())
            .await
        {
            let content = v["content"].as_str().unwrap_or("").to_string();
            let mut state = sh.state.borrow_mut();
            if is_personal {
                state.config.user_instructions = content;
            } else {
                state.config.developer_instructions = content;
            }
        }
    }
}

fn register_handlers(sh: &Rc<HarnessShared>) {
    let ctx = sh.ctx.clone();
    {
        let qsh = sh.clone();
        ctx.register_query("get_sessions", move || {
            serde_json::to_value(&qsh.state.borrow().sessions).unwrap_or(Value::Null)
        });
    }
    {
        let hsh = sh.clone();
        ctx.register_update(
            "start_session",
            |input: &Value| {
                let message = input
                    .get("user_message")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if message.trim().is_empty() {
                    return Err(UpdateRejection::new("user_message must not be empty"));
                }
                Ok(())
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let user_message = input
                        .get("user_message")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let nanos = sh.ctx.clock_nanos();
                    let counter = {
                        let mut state = sh.state.borrow_mut();
                        state.counter += 1;
                        state.counter
                    };
                    let stamp = chrono::DateTime::from_timestamp_nanos(nanos as i64)
                        .format("%Y%m%d-%H%M%S")
                        .to_string();
                    let session_id = format!("sess-{stamp}-{counter}");
                    let workflow_id = format!("{}/{}", sh.ctx.workflow_id(), session_id);
                    let start = StartSessionInput {
                        config: sh.state.borrow().config.clone(),
                        user_message: user_message.clone(),
                        tool_specs: None,
                        parent_depth: 0,
                        instructions_resolved: true,
                    };
                    let start = serde_json::to_value(SessionWorkflowInput::Start(start))
                        .map_err(|e| UpdateRejection::new(e.to_string()))?;
                    let handle = sh
                        .ctx
                        .start_child(SESSION_WORKFLOW, &workflow_id, start)
                        .await
                        .map_err(|e| {
                            UpdateRejection::new(format!("failed to start session: {e}"))
                        })?;
                    sh.state.borrow_mut().sessions.push(SessionEntry {
                        session_id: session_id.clone(),
                        workflow_id: workflow_id.clone(),
                        user_message,
                        status: "running".into(),
                        started_at: chrono::DateTime::from_timestamp_nanos(nanos as i64)
                            .to_rfc3339(),
                    });
                    sh.children
                        .borrow_mut()
                        .insert(session_id.clone(), handle.clone());
                    spawn_watcher(&sh, session_id.clone(), handle);
                    info!(session_id = %session_id, "session started");
                    Ok(json!({
                        "session_id": session_id,
                        "workflow_id": workflow_id,
                    }))
                })
            },
        );
    }
}

fn spawn_watcher(sh: &Rc<HarnessShared>, session_id: String, handle: WorkflowHandle) {
    let sh = sh.clone();
    let ctx = sh.ctx.clone();
    ctx.spawn(async move {
        let status = handle.join().await;
        let label = status.label();
        let mut state = sh.state.borrow_mut();
        if let Some(entry) = state
            .sessions
            .iter_mut()
            .find(|entry| entry.session_id == session_id)
        {
            entry.status = label.to_string();
        }
        sh.children.borrow_mut().remove(&session_id);
        sh.ctx.state_changed();
    });
}

/// After continue-as-new, re-derive handles for sessions still marked
/// running so their status keeps updating.
fn reattach_sessions(sh: &Rc<HarnessShared>) {
    let running: Vec<(String, String)> = sh
        .state
        .borrow()
        .sessions
        .iter()
        .filter(|entry| entry.status == "running")
        .map(|entry| (entry.session_id.clone(), entry.workflow_id.clone()))
        .collect();
    for (session_id, workflow_id) in running {
        match sh.ctx.find_workflow(&workflow_id) {
            Some(handle) => {
                sh.children
                    .borrow_mut()
                    .insert(session_id.clone(), handle.clone());
                spawn_watcher(sh, session_id, handle);
            }
            None => {
                let mut state = sh.state.borrow_mut();
                if let Some(entry) = state
                    .sessions
                    .iter_mut()
                    .find(|entry| entry.session_id == session_id)
                {
                    entry.status = "not_found".into();
                }
            }
        }
    }
}

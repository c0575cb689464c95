// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Update, query and signal handlers of the session workflow.
//!
//! Handlers run serialized with the main loop on the workflow's logical
//! thread.  They mutate loop-control and session state, never block on
//! activities, bump the state version on every observable mutation, and
//! reject new work once shutdown has been requested.

use std::collections::HashMap;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::info;

use otto_model::resolve_profile;
use otto_workflow::UpdateRejection;

use crate::agents::{self, AgentRole};
use crate::control::{ApprovalDecision, Phase};
use crate::session::{begin_user_turn, do_interrupt, do_shutdown, SessionShared};

/// Wire names of the session handlers.
pub mod handler_names {
    pub const USER_INPUT: &str = "user_input";
    pub const INTERRUPT: &str = "interrupt";
    pub const SHUTDOWN: &str = "shutdown";
    pub const APPROVAL_RESPONSE: &str = "approval_response";
    pub const ESCALATION_RESPONSE: &str = "escalation_response";
    pub const USER_INPUT_QUESTION_RESPONSE: &str = "user_input_question_response";
    pub const COMPACT: &str = "compact";
    pub const UPDATE_MODEL: &str = "update_model";
    pub const PLAN_REQUEST: &str = "plan_request";
    pub const GET_STATE_UPDATE: &str = "get_state_update";
    pub const GET_CONVERSATION_ITEMS: &str = "get_conversation_items";
    pub const GET_TURN_STATUS: &str = "get_turn_status";
}

/// Snapshot served by `get_turn_status` and embedded in update responses.
pub(crate) fn turn_status_value(sh: &SessionShared) -> Value {
    let st = sh.state.borrow();
    let c = sh.control.borrow();
    json!({
        "phase": c.phase,
        "turn_id": c.turn_id,
        "tools_in_flight": c.tools_in_flight,
        "pending_approvals": c.pending_approvals,
        "pending_escalations": c.pending_escalations,
        "pending_user_input_request": c.pending_question,
        "iteration_count": st.iteration_count,
        "total_tokens": st.total_tokens,
        "total_cached_tokens": st.total_cached_tokens,
        "turn_count": st.history.turn_count(),
        "worker_version": sh.ctx.worker_version(),
        "suggestion": c.suggestion,
        "plan": st.plan,
        "child_agents": st.agent_control.agents.iter().map(|(id, info)| json!({
            "agent_id": id,
            "role": info.role,
            "status": info.status,
        })).collect::<Vec<Value>>(),
    })
}

fn reject_when_shutting_down(sh: &SessionShared) -> Result<(), UpdateRejection> {
    if sh.control.borrow().shutdown_requested {
        Err(UpdateRejection::new("session is shutting down"))
    } else {
        Ok(())
    }
}

pub(crate) fn register_handlers(sh: &Rc<SessionShared>) {
    let ctx = sh.ctx.clone();

    // ── user_input ────────────────────────────────────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::USER_INPUT,
            move |input: &Value| {
                let content = input.get("content").and_then(Value::as_str).unwrap_or("");
                if content.trim().is_empty() {
                    return Err(UpdateRejection::new("content must not be empty"));
                }
                reject_when_shutting_down(&vsh)
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let content = input
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let turn_id = begin_user_turn(&sh, &content);
                    let items = sh.state.borrow().history.items_for_prompt();
                    Ok(json!({
                        "turn_id": turn_id,
                        "items": items,
                        "status": turn_status_value(&sh),
                    }))
                })
            },
        );
    }

    // ── interrupt ─────────────────────────────────────────────────────────────
    {
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::INTERRUPT,
            |_input: &Value| Ok(()),
            move |_input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    do_interrupt(&sh);
                    Ok(json!({ "acknowledged": true }))
                })
            },
        );
    }

    // ── shutdown ──────────────────────────────────────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::SHUTDOWN,
            move |_input: &Value| {
                if vsh.control.borrow().shutdown_requested {
                    Err(UpdateRejection::new("already shutting down"))
                } else {
                    Ok(())
                }
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    if let Some(reason) = input.get("reason").and_then(Value::as_str) {
                        info!(reason, "shutdown requested");
                    }
                    do_shutdown(&sh);
                    Ok(json!({ "acknowledged": true }))
                })
            },
        );
    }

    // ── approval_response / escalation_response ──────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::APPROVAL_RESPONSE,
            move |_input: &Value| {
                if vsh.control.borrow().phase != Phase::ApprovalPending {
                    Err(UpdateRejection::new("no approval is pending"))
                } else {
                    Ok(())
                }
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let decision: ApprovalDecision =
                        serde_json::from_value(input).unwrap_or_default();
                    {
                        let mut c = sh.control.borrow_mut();
                        c.pending_approvals.clear();
                        c.approval_slot.deliver(decision);
                    }
                    sh.bump();
                    Ok(json!({}))
                })
            },
        );
    }
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::ESCALATION_RESPONSE,
            move |_input: &Value| {
                if vsh.control.borrow().phase != Phase::EscalationPending {
                    Err(UpdateRejection::new("no escalation is pending"))
                } else {
                    Ok(())
                }
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let decision: ApprovalDecision =
                        serde_json::from_value(input).unwrap_or_default();
                    {
                        let mut c = sh.control.borrow_mut();
                        c.pending_escalations.clear();
                        c.escalation_slot.deliver(decision);
                    }
                    sh.bump();
                    Ok(json!({}))
                })
            },
        );
    }

    // ── user_input_question_response ──────────────────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::USER_INPUT_QUESTION_RESPONSE,
            move |_input: &Value| {
                if vsh.control.borrow().phase != Phase::UserInputPending {
                    Err(UpdateRejection::new("no user-input question is pending"))
                } else {
                    Ok(())
                }
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let answers: HashMap<String, String> = input
                        .get("answers")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    {
                        let mut c = sh.control.borrow_mut();
                        c.question_slot.deliver(answers);
                    }
                    sh.bump();
                    Ok(json!({}))
                })
            },
        );
    }

    // ── compact ───────────────────────────────────────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::COMPACT,
            move |_input: &Value| {
                let c = vsh.control.borrow();
                if c.phase == Phase::Compacting || c.compact_requested {
                    return Err(UpdateRejection::new("compaction already in progress"));
                }
                drop(c);
                reject_when_shutting_down(&vsh)
            },
            move |_input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    sh.control.borrow_mut().compact_requested = true;
                    sh.bump();
                    Ok(json!({ "acknowledged": true }))
                })
            },
        );
    }

    // ── update_model ──────────────────────────────────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::UPDATE_MODEL,
            move |input: &Value| {
                let provider = input.get("provider").and_then(Value::as_str).unwrap_or("");
                let model = input.get("model").and_then(Value::as_str).unwrap_or("");
                if provider.is_empty() || model.is_empty() {
                    return Err(UpdateRejection::new("provider and model are required"));
                }
                reject_when_shutting_down(&vsh)
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let provider = input
                        .get("provider")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let model = input
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    let context_window = input
                        .get("context_window")
                        .and_then(Value::as_u64)
                        .map(|v| v as u32);
                    {
                        let mut st = sh.state.borrow_mut();
                        st.previous_model = Some(st.resolved_profile.model.clone());
                        st.previous_context_window = Some(st.resolved_profile.context_window);
                        st.config.model.provider = provider.clone();
                        st.config.model.name = model.clone();
                        // Profile defaults for everything not explicitly
                        // overridden by this update.
                        st.config.model.context_window = context_window;
                        st.config.model.temperature = None;
                        st.config.model.max_tokens = None;
                        st.resolved_profile = resolve_profile(&st.config.model);
                        st.last_response_id = None;
                        st.last_sent_history_len = 0;
                        st.model_switched = true;
                    }
                    sh.bump();
                    info!(provider, model, "session model updated");
                    Ok(json!({ "acknowledged": true }))
                })
            },
        );
    }

    // ── plan_request ──────────────────────────────────────────────────────────
    {
        let vsh = sh.clone();
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::PLAN_REQUEST,
            move |input: &Value| {
                let message = input.get("message").and_then(Value::as_str).unwrap_or("");
                if message.trim().is_empty() {
                    return Err(UpdateRejection::new("message must not be empty"));
                }
                reject_when_shutting_down(&vsh)
            },
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let message = input
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string();
                    match agents::spawn_agent_internal(&sh, &message, AgentRole::Planner).await {
                        Ok((agent_id, workflow_id)) => Ok(json!({
                            "agent_id": agent_id,
                            "workflow_id": workflow_id,
                        })),
                        Err(e) => Err(UpdateRejection::new(e)),
                    }
                })
            },
        );
    }

    // ── get_state_update (long-poll) ──────────────────────────────────────────
    {
        let hsh = sh.clone();
        ctx.register_update(
            handler_names::GET_STATE_UPDATE,
            |_input: &Value| Ok(()),
            move |input: Value| {
                let sh = hsh.clone();
                Box::pin(async move {
                    let since_seq = input
                        .get("since_seq")
                        .and_then(Value::as_i64)
                        .unwrap_or(-1);
                    let since_phase = input
                        .get("since_phase")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    loop {
                        let ready = {
                            let st = sh.state.borrow();
                            let c = sh.control.borrow();
                            let (items, compacted) = st.history.items_since(since_seq);
                            let phase_changed = since_phase
                                .as_deref()
                                .map(|p| p != c.phase.as_str())
                                .unwrap_or(false);
                            if !items.is_empty()
                                || compacted
                                || phase_changed
                                || c.shutdown_requested
                                || c.draining
                            {
                                Some(json!({
                                    "turn_id": c.turn_id,
                                    "items": items,
                                    "compacted": compacted,
                                    "completed": c.shutdown_requested,
                                }))
                            } else {
                                None
                            }
                        };
                        if let Some(mut response) = ready {
                            response["status"] = turn_status_value(&sh);
                            return Ok(response);
                        }
                        // Nothing new: park until the next observable change.
                        let version = sh.control.borrow().state_version;
                        let cond_sh = sh.clone();
                        sh.ctx
                            .await_condition(move || {
                                cond_sh.control.borrow().state_version != version
                            })
                            .await;
                    }
                })
            },
        );
    }

    // ── Queries ───────────────────────────────────────────────────────────────
    {
        let qsh = sh.clone();
        ctx.register_query(handler_names::GET_CONVERSATION_ITEMS, move || {
            serde_json::to_value(qsh.state.borrow().history.items_for_prompt())
                .unwrap_or(Value::Null)
        });
    }
    {
        let qsh = sh.clone();
        ctx.register_query(handler_names::GET_TURN_STATUS, move || {
            turn_status_value(&qsh)
        });
    }
}

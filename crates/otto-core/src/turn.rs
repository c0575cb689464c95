// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-turn driver: LLM calls alternating with parallel tool execution.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use otto_config::ApprovalMode;
use otto_model::activity_names;
use otto_model::{
    ConversationItem, FinishReason, FunctionCallOutputPayload, ItemPayload, LlmCallInput,
    LlmCallOutput,
};
use otto_tools::{
    classify_call, is_sandbox_denial, tool_names, CallDisposition, DENIAL_MESSAGE,
};
use otto_workflow::{ActivityOptions, RetryPolicy};

use crate::control::{ApprovalRequest, EscalationRequest, Phase, UserInputRequest, UserQuestion};
use crate::executor::{self, PendingCall};
use crate::session::SessionShared;
use crate::state::PlanStep;
use crate::{agents, compact};

/// How many identical consecutive call batches end the turn.
const MAX_REPEATED_BATCHES: u32 = 3;

/// Why the turn engine returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnEnd {
    Completed,
    Interrupted,
    Shutdown,
}

fn llm_options() -> ActivityOptions {
    ActivityOptions::default()
        .with_retry(RetryPolicy::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
            3,
        ))
        .with_start_to_close(Duration::from_secs(120))
}

/// Drive one turn: up to `max_iterations` rounds of LLM + tools.
pub(crate) async fn run_agentic_turn(sh: &Rc<SessionShared>) -> TurnEnd {
    sh.control.borrow_mut().compacted_this_turn = false;
    sh.state.borrow_mut().iteration_count = 0;
    let mut repeat_key = String::new();
    let mut repeat_count: u32 = 0;

    loop {
        // Interrupt and shutdown abandon the turn without writing items.
        {
            let c = sh.control.borrow();
            if c.shutdown_requested {
                return TurnEnd::Shutdown;
            }
            if c.interrupted {
                return TurnEnd::Interrupted;
            }
        }

        let capped = {
            let st = sh.state.borrow();
            st.iteration_count >= st.max_iterations
        };
        if capped {
            let max = sh.state.borrow().max_iterations;
            sh.append_assistant(format!(
                "Turn ended: reached maximum of {max} iterations without completing the task."
            ));
            return TurnEnd::Completed;
        }

        // A model switch since the last turn becomes a developer-visible
        // item and resets the incremental-send bookkeeping.
        let switched = sh.state.borrow().model_switched;
        if switched {
            let (previous, current) = {
                let mut st = sh.state.borrow_mut();
                st.model_switched = false;
                st.last_response_id = None;
                st.last_sent_history_len = 0;
                (
                    st.previous_model.clone().unwrap_or_default(),
                    st.resolved_profile.model.clone(),
                )
            };
            sh.append_item(ConversationItem::new(ItemPayload::ModelSwitch {
                previous,
                current,
            }));
        }

        // Proactive compaction, at most once per turn.
        let over_budget = {
            let st = sh.state.borrow();
            st.history.estimate_tokens() >= st.effective_compact_limit()
        };
        if over_budget && !sh.control.borrow().compacted_this_turn {
            if let Err(e) = compact::run_compaction(sh).await {
                warn!(error = %e, "proactive compaction failed");
            }
        }

        // LLM call with an incremental prompt when response chaining holds.
        let input = build_llm_input(sh);
        sh.set_phase(Phase::LlmCalling);
        let result = sh
            .ctx
            .execute_activity(
                activity_names::EXECUTE_LLM_CALL,
                serde_json::to_value(&input).unwrap_or(Value::Null),
                llm_options(),
            )
            .await;

        let output: LlmCallOutput = match result {
            Ok(v) => match serde_json::from_value(v) {
                Ok(output) => output,
                Err(e) => {
                    sh.append_assistant(format!("LLM call returned a malformed response: {e}"));
                    return TurnEnd::Completed;
                }
            },
            Err(e) => match e.kind.as_str() {
                // Recoverable: compact (or destructively drop old turns)
                // and retry the iteration without counting it.
                "context_overflow" => {
                    debug!("context overflow reported by provider");
                    if compact::run_compaction(sh).await.is_err() {
                        let mut st = sh.state.borrow_mut();
                        let keep = (st.history.turn_count() / 2).max(2);
                        let dropped = st.history.drop_oldest_user_turns(keep);
                        warn!(dropped, keep, "compaction failed; dropped oldest turns");
                    }
                    {
                        let mut st = sh.state.borrow_mut();
                        st.last_response_id = None;
                        st.last_sent_history_len = 0;
                    }
                    sh.bump();
                    continue;
                }
                // Recoverable: wait out the rate limit and retry.
                "api_limit" => {
                    warn!("provider rate limit; sleeping before retry");
                    sh.ctx.sleep(Duration::from_secs(60)).await;
                    continue;
                }
                _ => {
                    sh.append_assistant(format!("LLM call failed: {}", e.message));
                    return TurnEnd::Completed;
                }
            },
        };

        // The flag may have been raised while the activity ran; abandon
        // before writing any further items.
        {
            let c = sh.control.borrow();
            if c.shutdown_requested {
                return TurnEnd::Shutdown;
            }
            if c.interrupted {
                return TurnEnd::Interrupted;
            }
        }

        // Record the response in order; collect this round's calls.
        let turn_id = sh.control.borrow().turn_id.clone();
        let mut calls: Vec<PendingCall> = Vec::new();
        for mut item in output.items {
            item.turn_id = turn_id.clone();
            if let ItemPayload::FunctionCall {
                name,
                arguments,
                call_id,
            } = &item.payload
            {
                calls.push(PendingCall {
                    name: name.clone(),
                    arguments: arguments.clone(),
                    call_id: call_id.clone(),
                });
            }
            sh.state.borrow_mut().history.append(item);
        }
        {
            let mut st = sh.state.borrow_mut();
            st.total_tokens += output.token_usage.total;
            st.total_cached_tokens += output.token_usage.cached;
            st.iteration_count += 1;
            st.total_iterations += 1;
            if let Some(response_id) = output.response_id {
                st.last_response_id = Some(response_id);
                st.last_sent_history_len = st.history.len();
            }
        }
        sh.bump();

        let had_calls = !calls.is_empty();

        // Workflow-intercepted calls run inline; their outputs join the
        // history like any other tool result.
        let mut remaining: Vec<PendingCall> = Vec::new();
        for call in calls {
            if otto_tools::is_intercepted_tool(&call.name) {
                match dispatch_intercepted(sh, &call).await {
                    Ok(payload) => sh.append_call_output(&call.call_id, payload),
                    Err(end) => return end,
                }
            } else {
                remaining.push(call);
            }
        }

        if remaining.is_empty() {
            if !had_calls && output.finish_reason == FinishReason::Stop {
                return TurnEnd::Completed;
            }
            continue;
        }

        // Pathological-loop defense: three identical batches in a row.
        let mut key_parts: Vec<String> = remaining
            .iter()
            .map(|c| format!("{}:{}", c.name, c.arguments))
            .collect();
        key_parts.sort();
        let key = key_parts.join("|");
        if key == repeat_key {
            repeat_count += 1;
        } else {
            repeat_key = key;
            repeat_count = 1;
        }
        if repeat_count >= MAX_REPEATED_BATCHES {
            sh.append_assistant(
                "Detected repeated identical tool calls; ending the turn without executing them again.",
            );
            return TurnEnd::Completed;
        }

        // Approval gate.
        let to_execute = match gate_calls(sh, remaining).await {
            Ok(calls) => calls,
            Err(end) => return end,
        };
        if to_execute.is_empty() {
            continue;
        }

        let mut outputs = match executor::execute_calls(sh, &to_execute, false).await {
            Ok(outputs) => outputs,
            Err(end) => return end,
        };

        // Sandbox-denial escalation (on-failure mode only).
        if let Err(end) = handle_escalations(sh, &to_execute, &mut outputs).await {
            return end;
        }

        for (call, payload) in to_execute.iter().zip(outputs) {
            sh.state
                .borrow_mut()
                .tool_calls_executed
                .push(call.name.clone());
            sh.append_call_output(&call.call_id, payload);
        }
    }
}

fn build_llm_input(sh: &Rc<SessionShared>) -> LlmCallInput {
    let incremental = {
        let st = sh.state.borrow();
        st.last_response_id.is_some() && st.last_sent_history_len <= st.history.len()
    };
    if !incremental {
        sh.state.borrow_mut().last_response_id = None;
    }
    let st = sh.state.borrow();
    let (history, previous_response_id) = if incremental {
        (
            st.history.items_from(st.last_sent_history_len),
            st.last_response_id.clone(),
        )
    } else {
        (st.history.items_for_prompt(), None)
    };
    LlmCallInput {
        history,
        model: st.resolved_profile.clone(),
        tool_specs: st.tool_specs.clone(),
        base_instructions: st.config.base_instructions.clone(),
        developer_instructions: st.config.developer_instructions.clone(),
        user_instructions: st.config.user_instructions.clone(),
        previous_response_id,
    }
}

/// Classify calls, collect the user's decision for those that need it,
/// and return the dispatchable set in original call order.
async fn gate_calls(
    sh: &Rc<SessionShared>,
    calls: Vec<PendingCall>,
) -> Result<Vec<PendingCall>, TurnEnd> {
    #[derive(PartialEq)]
    enum Gate {
        Run,
        Ask,
        Blocked,
    }

    let (mode, policy) = {
        let st = sh.state.borrow();
        (st.config.approval_mode, st.exec_policy())
    };

    let mut gates: Vec<Gate> = Vec::with_capacity(calls.len());
    for call in &calls {
        match classify_call(&call.name, &call.arguments, mode, &policy) {
            CallDisposition::Skip => gates.push(Gate::Run),
            CallDisposition::NeedsApproval => gates.push(Gate::Ask),
            CallDisposition::Forbidden { reason } => {
                sh.append_call_output(&call.call_id, FunctionCallOutputPayload::err(reason));
                gates.push(Gate::Blocked);
            }
        }
    }

    let pending: Vec<ApprovalRequest> = calls
        .iter()
        .zip(&gates)
        .filter(|(_, gate)| **gate == Gate::Ask)
        .map(|(call, _)| ApprovalRequest {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .collect();

    if !pending.is_empty() {
        {
            let mut c = sh.control.borrow_mut();
            c.pending_approvals = pending;
            c.approval_slot.clear();
        }
        sh.set_phase(Phase::ApprovalPending);
        let cond_sh = sh.clone();
        sh.ctx
            .await_condition(move || {
                let c = cond_sh.control.borrow();
                c.approval_slot.is_ready() || c.interrupted || c.shutdown_requested
            })
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
        let decision = {
            let mut c = sh.control.borrow_mut();
            c.pending_approvals.clear();
            c.approval_slot.take().unwrap_or_default()
        };
        sh.bump();
        for (call, gate) in calls.iter().zip(gates.iter_mut()) {
            if *gate == Gate::Ask {
                if decision.approved.iter().any(|id| id == &call.call_id) {
                    *gate = Gate::Run;
                } else {
                    sh.append_call_output(
                        &call.call_id,
                        FunctionCallOutputPayload::err(DENIAL_MESSAGE),
                    );
                    *gate = Gate::Blocked;
                }
            }
        }
    }

    Ok(calls
        .into_iter()
        .zip(gates)
        .filter(|(_, gate)| *gate == Gate::Run)
        .map(|(call, _)| call)
        .collect())
}

/// In on-failure mode, failed calls whose output matches the sandbox
/// denial keywords are escalated; approved ones re-run unsandboxed.
async fn handle_escalations(
    sh: &Rc<SessionShared>,
    calls: &[PendingCall],
    outputs: &mut [FunctionCallOutputPayload],
) -> Result<(), TurnEnd> {
    let mode = sh.state.borrow().config.approval_mode;
    if mode != ApprovalMode::OnFailure {
        return Ok(());
    }
    let escalatable: Vec<usize> = outputs
        .iter()
        .enumerate()
        .filter(|(_, o)| !o.success && is_sandbox_denial(&o.content))
        .map(|(idx, _)| idx)
        .collect();
    if escalatable.is_empty() {
        return Ok(());
    }

    {
        let mut c = sh.control.borrow_mut();
        c.pending_escalations = escalatable
            .iter()
            .map(|&idx| EscalationRequest {
                call_id: calls[idx].call_id.clone(),
                tool_name: calls[idx].name.clone(),
                arguments: calls[idx].arguments.clone(),
                failure: outputs[idx].content.clone(),
            })
            .collect();
        c.escalation_slot.clear();
    }
    sh.set_phase(Phase::EscalationPending);
    let cond_sh = sh.clone();
    sh.ctx
        .await_condition(move || {
            let c = cond_sh.control.borrow();
            c.escalation_slot.is_ready() || c.interrupted || c.shutdown_requested
        })
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
    let decision = {
        let mut c = sh.control.borrow_mut();
        c.pending_escalations.clear();
        c.escalation_slot.take().unwrap_or_default()
    };
    sh.bump();

    let approved: Vec<usize> = escalatable
        .into_iter()
        .filter(|&idx| decision.approved.iter().any(|id| id == &calls[idx].call_id))
        .collect();
    if approved.is_empty() {
        return Ok(());
    }
    let retry_calls: Vec<PendingCall> = approved.iter().map(|&idx| calls[idx].clone()).collect();
    let retry_outputs = executor::execute_calls(sh, &retry_calls, true).await?;
    for (&idx, output) in approved.iter().zip(retry_outputs) {
        outputs[idx] = output;
    }
    Ok(())
}

/// Route a workflow-intercepted call to its inline handler.
async fn dispatch_intercepted(
    sh: &Rc<SessionShared>,
    call: &PendingCall,
) -> Result<FunctionCallOutputPayload, TurnEnd> {
    match call.name.as_str() {
        tool_names::REQUEST_USER_INPUT => request_user_input(sh, &call.arguments).await,
        tool_names::UPDATE_PLAN => Ok(update_plan(sh, &call.arguments)),
        tool_names::SPAWN_AGENT => Ok(agents::spawn_agent_tool(sh, &call.arguments).await),
        tool_names::SEND_INPUT => Ok(agents::send_input_tool(sh, &call.arguments).await),
        tool_names::WAIT => agents::wait_tool(sh, &call.arguments).await,
        tool_names::CLOSE_AGENT => Ok(agents::close_agent_tool(sh, &call.arguments).await),
        tool_names::RESUME_AGENT => Ok(FunctionCallOutputPayload::err(
            "resume_agent is not supported",
        )),
        other => Ok(FunctionCallOutputPayload::err(format!(
            "unknown intercepted tool: {other}"
        ))),
    }
}

/// Publish the model's questions and block until the user answers.
async fn request_user_input(
    sh: &Rc<SessionShared>,
    arguments: &str,
) -> Result<FunctionCallOutputPayload, TurnEnd> {
    let args: Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => {
            return Ok(FunctionCallOutputPayload::err(format!(
                "malformed arguments: {e}"
            )))
        }
    };
    let questions: Vec<UserQuestion> = args
        .get("questions")
        .and_then(Value::as_array)
        .map(|qs| {
            qs.iter()
                .filter_map(|q| {
                    Some(UserQuestion {
                        id: q.get("id")?.as_str()?.to_string(),
                        prompt: q.get("prompt")?.as_str()?.to_string(),
                        options: q
                            .get("options")
                            .and_then(Value::as_array)
                            .map(|opts| {
                                opts.iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if questions.is_empty() {
        return Ok(FunctionCallOutputPayload::err("no questions provided"));
    }

    let request_id = format!("question-{}", sh.ctx.clock_nanos());
    {
        let mut c = sh.control.borrow_mut();
        c.pending_question = Some(UserInputRequest {
            id: request_id,
            questions,
        });
        c.question_slot.clear();
    }
    sh.set_phase(Phase::UserInputPending);
    let cond_sh = sh.clone();
    sh.ctx
        .await_condition(move || {
            let c = cond_sh.control.borrow();
            c.question_slot.is_ready() || c.interrupted || c.shutdown_requested
        })
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
    let answers: HashMap<String, String> = {
        let mut c = sh.control.borrow_mut();
        c.pending_question = None;
        c.question_slot.take().unwrap_or_default()
    };
    sh.bump();
    Ok(FunctionCallOutputPayload::ok(
        json!({ "answers": answers }).to_string(),
    ))
}

/// Replace the session plan with the model's new step list.
fn update_plan(sh: &Rc<SessionShared>, arguments: &str) -> FunctionCallOutputPayload {
    let args: Value = match serde_json::from_str(arguments) {
        Ok(v) => v,
        Err(e) => return FunctionCallOutputPayload::err(format!("malformed arguments: {e}")),
    };
    let steps: Vec<PlanStep> = args
        .get("steps")
        .and_then(Value::as_array)
        .map(|steps| {
            steps
                .iter()
                .filter_map(|s| {
                    Some(PlanStep {
                        step: s.get("step")?.as_str()?.to_string(),
                        status: s
                            .get("status")
                            .and_then(Value::as_str)
                            .unwrap_or("pending")
                            .to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    if steps.is_empty() {
        return FunctionCallOutputPayload::err("plan must contain at least one step");
    }
    let count = steps.len();
    sh.state.borrow_mut().plan = steps;
    sh.bump();
    FunctionCallOutputPayload::ok(format!("Plan updated ({count} steps)"))
}

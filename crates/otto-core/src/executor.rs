// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;

use otto_model::activity_names;
use otto_model::{FunctionCallOutputPayload, ToolCallRequest, ToolCallResult};
use otto_tools::resolve_timeout_ms;
use otto_workflow::{error_kinds, ActivityError, ActivityHandle, ActivityOptions, RetryPolicy};

use crate::control::Phase;
use crate::session::SessionShared;
use crate::turn::TurnEnd;

/// One non-intercepted tool call awaiting dispatch.
#[derive(Debug, Clone)]
pub(crate) struct PendingCall {
    pub name: String,
    pub arguments: String,
    pub call_id: String,
}

/// Convert a typed tool-activity failure into the output the model sees.
/// Tool failures never propagate further up than this.
pub(crate) fn error_to_output(e: &ActivityError) -> FunctionCallOutputPayload {
    let content = match e.kind.as_str() {
        error_kinds::APPLICATION => e.message.clone(),
        error_kinds::TIMEOUT => "tool execution timed out".to_string(),
        error_kinds::CANCELED => "tool execution was canceled".to_string(),
        _ => "activity execution failed".to_string(),
    };
    FunctionCallOutputPayload::err(content)
}

/// Run all calls concurrently and collect results in call order.
///
/// Interrupt or shutdown abandons the batch: dropping the in-flight
/// handles cancels the underlying activities.
pub(crate) async fn execute_calls(
    sh: &Rc<SessionShared>,
    calls: &[PendingCall],
    sandbox_disabled: bool,
) -> Result<Vec<FunctionCallOutputPayload>, TurnEnd> {
    sh.set_phase(Phase::ToolExecuting);
    sh.control.borrow_mut().tools_in_flight = calls.iter().map(|c| c.name.clone()).collect();
    sh.bump();

    let (cwd, queue) = {
        let st = sh.state.borrow();
        (st.config.cwd.clone(), st.config.session_task_queue.clone())
    };

    let handles: Vec<ActivityHandle> = calls
        .iter()
        .map(|call| {
            let timeout_ms = {
                let st = sh.state.borrow();
                resolve_timeout_ms(&call.arguments, st.find_spec(&call.name))
            };
            let request = ToolCallRequest {
                call_id: call.call_id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                cwd: cwd.clone(),
                sandbox_disabled,
                timeout_ms,
            };
            let options = ActivityOptions::default()
                .with_retry(RetryPolicy::new(
                    Duration::from_secs(1),
                    2.0,
                    Duration::from_secs(60),
                    5,
                ))
                .with_start_to_close(Duration::from_millis(timeout_ms))
                .with_task_queue(queue.clone());
            sh.ctx.start_activity(
                activity_names::EXECUTE_TOOL,
                serde_json::to_value(&request).unwrap_or(Value::Null),
                options,
            )
        })
        .collect();

    let collect = async {
        let mut outputs = Vec::with_capacity(handles.len());
        for handle in handles {
            let payload = match handle.result().await {
                Ok(v) => match serde_json::from_value::<ToolCallResult>(v) {
                    Ok(result) => FunctionCallOutputPayload {
                        content: result.content,
                        success: result.success,
                    },
                    Err(e) => {
                        FunctionCallOutputPayload::err(format!("malformed tool result: {e}"))
                    }
                },
                Err(e) => error_to_output(&e),
            };
            outputs.push(payload);
        }
        outputs
    };

    let abort_sh = sh.clone();
    let outputs = tokio::select! {
        biased;
        _ = sh.ctx.await_condition(move || {
            let c = abort_sh.control.borrow();
            c.interrupted || c.shutdown_requested
        }) => {
            sh.control.borrow_mut().tools_in_flight.clear();
            sh.bump();
            return Err(if sh.shutdown_requested() {
                TurnEnd::Shutdown
            } else {
                TurnEnd::Interrupted
            });
        }
        outputs = collect => outputs,
    };

    sh.control.borrow_mut().tools_in_flight.clear();
    sh.bump();
    Ok(outputs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_keeps_its_reason() {
        let e = ActivityError::application("disk quota exceeded");
        let out = error_to_output(&e);
        assert!(!out.success);
        assert_eq!(out.content, "disk quota exceeded");
    }

    #[test]
    fn timeout_and_cancel_have_fixed_messages() {
        assert_eq!(
            error_to_output(&ActivityError::timeout()).content,
            "tool execution timed out"
        );
        assert_eq!(
            error_to_output(&ActivityError::canceled()).content,
            "tool execution was canceled"
        );
    }

    #[test]
    fn unknown_errors_are_generic() {
        let e = ActivityError::unknown("socket closed");
        assert_eq!(error_to_output(&e).content, "activity execution failed");
    }
}

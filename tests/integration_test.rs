// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios against a real worker with scripted providers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use otto_config::{ApprovalMode, SessionConfig};
use otto_core::{core_worker_builder, SessionWorkflowInput, StartSessionInput, SESSION_WORKFLOW};
use otto_model::{
    CompletionRequest, ConversationItem, ItemPayload, LlmCallOutput, ModelProvider,
    ProviderError, ScriptedProvider,
};
use otto_workflow::{RunStatus, Worker, WorkflowHandle};

fn config(approval_mode: ApprovalMode, cwd: &str) -> SessionConfig {
    SessionConfig {
        approval_mode,
        cwd: cwd.to_string(),
        ..SessionConfig::default()
    }
}

fn scripted_worker(scripts: Vec<Result<LlmCallOutput, ProviderError>>) -> Worker {
    core_worker_builder(Arc::new(ScriptedProvider::new(scripts)))
        .start()
        .expect("worker starts")
}

async fn start_session(
    worker: &Worker,
    workflow_id: &str,
    config: SessionConfig,
    user_message: &str,
) -> WorkflowHandle {
    let input = SessionWorkflowInput::Start(StartSessionInput {
        config,
        user_message: user_message.to_string(),
        tool_specs: None,
        parent_depth: 0,
        instructions_resolved: true,
    });
    worker
        .start_workflow(
            SESSION_WORKFLOW,
            workflow_id,
            serde_json::to_value(input).unwrap(),
        )
        .await
        .expect("session starts")
}

async fn items(handle: &WorkflowHandle) -> Vec<Value> {
    handle
        .query("get_conversation_items")
        .await
        .ok()
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
}

fn count_of(items: &[Value], item_type: &str) -> usize {
    items.iter().filter(|i| i["type"] == item_type).count()
}

async fn wait_for_items(handle: &WorkflowHandle, predicate: impl Fn(&[Value]) -> bool) {
    for _ in 0..1000 {
        let current = items(handle).await;
        if predicate(&current) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held; items: {:?}", items(handle).await);
}

async fn wait_for_phase(handle: &WorkflowHandle, phase: &str) {
    for _ in 0..1000 {
        if let Ok(status) = handle.query("get_turn_status").await {
            if status["phase"] == phase {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("phase {phase} never reached");
}

async fn shutdown_and_join(handle: &WorkflowHandle) -> Value {
    handle.update("shutdown", json!({})).await.expect("shutdown accepted");
    match handle.join().await {
        RunStatus::Completed(result) => result,
        other => panic!("session did not complete: {other:?}"),
    }
}

// ── Scenario 1: single turn, no tools ─────────────────────────────────────────

#[tokio::test]
async fn single_turn_without_tools() {
    let worker = scripted_worker(vec![Ok(ScriptedProvider::text_response("Hi!", 50))]);
    let handle = start_session(
        &worker,
        "it-single-turn",
        config(ApprovalMode::Never, ""),
        "Hello",
    )
    .await;
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;

    let history = items(&handle).await;
    assert_eq!(history.len(), 4);
    assert_eq!(history[0]["type"], "turn_started");
    assert_eq!(history[1]["type"], "user_message");
    assert_eq!(history[1]["content"], "Hello");
    assert_eq!(history[2]["type"], "assistant_message");
    assert_eq!(history[2]["content"], "Hi!");
    assert_eq!(history[3]["type"], "turn_complete");
    for (idx, item) in history.iter().enumerate() {
        assert_eq!(item["seq"], idx as u64);
    }

    let result = shutdown_and_join(&handle).await;
    assert_eq!(result["end_reason"], "shutdown");
    assert_eq!(result["total_tokens"], 50);
}

// ── Scenario 2: approve a mutating tool ───────────────────────────────────────

#[tokio::test]
async fn approve_mutating_tool() {
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("victim.txt");
    std::fs::write(&victim, "delete me").unwrap();
    let command = format!("rm -rf {}", victim.display());

    let worker = scripted_worker(vec![
        Ok(ScriptedProvider::tool_call_response(
            "c1",
            "shell",
            json!({ "command": command }).to_string(),
        )),
        Ok(ScriptedProvider::text_response("Done.", 10)),
    ]);
    let handle = start_session(
        &worker,
        "it-approve",
        config(ApprovalMode::UnlessTrusted, &dir.path().to_string_lossy()),
        "Delete the scratch file",
    )
    .await;

    wait_for_phase(&handle, "approval_pending").await;
    let status = handle.query("get_turn_status").await.unwrap();
    let pending = status["pending_approvals"].as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["call_id"], "c1");
    assert_eq!(pending[0]["tool_name"], "shell");

    handle
        .update("approval_response", json!({"approved": ["c1"], "denied": []}))
        .await
        .unwrap();
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;

    assert!(!victim.exists(), "approved command must have run");
    let history = items(&handle).await;
    let output = history
        .iter()
        .find(|i| i["type"] == "function_call_output")
        .unwrap();
    assert_eq!(output["output"]["success"], true);

    let result = shutdown_and_join(&handle).await;
    let executed = result["tool_calls_executed"].as_array().unwrap();
    assert!(executed.iter().any(|t| t == "shell"));
}

// ── Scenario 3: deny a mutating tool ──────────────────────────────────────────

#[tokio::test]
async fn deny_mutating_tool() {
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("victim.txt");
    std::fs::write(&victim, "keep me").unwrap();
    let command = format!("rm -rf {}", victim.display());

    let worker = scripted_worker(vec![
        Ok(ScriptedProvider::tool_call_response(
            "c1",
            "shell",
            json!({ "command": command }).to_string(),
        )),
        Ok(ScriptedProvider::text_response(
            "Understood, leaving it alone.",
            10,
        )),
    ]);
    let handle = start_session(
        &worker,
        "it-deny",
        config(ApprovalMode::UnlessTrusted, &dir.path().to_string_lossy()),
        "Delete the scratch file",
    )
    .await;

    wait_for_phase(&handle, "approval_pending").await;
    handle
        .update("approval_response", json!({"approved": [], "denied": ["c1"]}))
        .await
        .unwrap();
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;

    assert!(victim.exists(), "denied command must not run");
    let history = items(&handle).await;
    let output = history
        .iter()
        .find(|i| i["type"] == "function_call_output")
        .unwrap();
    assert_eq!(output["output"]["success"], false);
    assert!(output["output"]["content"]
        .as_str()
        .unwrap()
        .contains("denied"));
    // The model saw the denial and still answered.
    assert!(history
        .iter()
        .any(|i| i["content"] == "Understood, leaving it alone."));

    let result = shutdown_and_join(&handle).await;
    let executed = result["tool_calls_executed"].as_array().unwrap();
    assert!(executed.is_empty());
}

// ── Scenario 4: context overflow then compaction ──────────────────────────────

#[tokio::test]
async fn context_overflow_triggers_compaction() {
    let worker = scripted_worker(vec![
        Ok(ScriptedProvider::text_response("turn one", 10)),
        Ok(ScriptedProvider::text_response("turn two", 10)),
        // Third turn: the provider rejects the prompt, compaction
        // summarizes, and the retried call succeeds.
        Err(ProviderError::context_overflow("prompt too large")),
        Ok(ScriptedProvider::text_response("summary of the session", 5)),
        Ok(ScriptedProvider::text_response("turn three", 10)),
    ]);
    let handle = start_session(
        &worker,
        "it-overflow",
        config(ApprovalMode::Never, ""),
        "first",
    )
    .await;
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;
    handle
        .update("user_input", json!({"content": "second"}))
        .await
        .unwrap();
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 2).await;
    handle
        .update("user_input", json!({"content": "third"}))
        .await
        .unwrap();
    wait_for_items(&handle, |items| {
        items.iter().any(|i| i["content"] == "turn three")
    })
    .await;

    let history = items(&handle).await;
    // Compaction replaced everything before the retried call.
    assert_eq!(history[0]["type"], "compaction");
    assert_eq!(history[0]["content"], "summary of the session");
    assert!(!history.iter().any(|i| i["content"] == "turn one"));
    for (idx, item) in history.iter().enumerate() {
        assert_eq!(item["seq"], idx as u64);
    }

    let result = shutdown_and_join(&handle).await;
    assert_eq!(result["compaction_count"], 1);
}

// ── Scenario 5: parallel tool execution ───────────────────────────────────────

#[tokio::test]
async fn parallel_tools_collect_in_call_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "contents of a").unwrap();
    std::fs::write(dir.path().join("b.txt"), "contents of b").unwrap();

    let worker = scripted_worker(vec![
        Ok(ScriptedProvider::tool_calls_response(vec![
            (
                "c-a".into(),
                "read_file".into(),
                json!({"path": "a.txt"}).to_string(),
            ),
            (
                "c-b".into(),
                "read_file".into(),
                json!({"path": "b.txt"}).to_string(),
            ),
        ])),
        Ok(ScriptedProvider::text_response("read both", 10)),
    ]);
    let handle = start_session(
        &worker,
        "it-parallel-order",
        config(ApprovalMode::Never, &dir.path().to_string_lossy()),
        "read a and b",
    )
    .await;
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;

    let history = items(&handle).await;
    let outputs: Vec<&Value> = history
        .iter()
        .filter(|i| i["type"] == "function_call_output")
        .collect();
    assert_eq!(outputs.len(), 2);
    // Results are collected in the order the calls appeared.
    assert_eq!(outputs[0]["call_id"], "c-a");
    assert_eq!(outputs[0]["output"]["content"], "contents of a");
    assert_eq!(outputs[1]["call_id"], "c-b");
    assert_eq!(outputs[1]["output"]["content"], "contents of b");
    // Both outputs precede the next assistant message.
    let reply_index = history
        .iter()
        .position(|i| i["content"] == "read both")
        .unwrap();
    let last_output_index = history
        .iter()
        .rposition(|i| i["type"] == "function_call_output")
        .unwrap();
    assert!(last_output_index < reply_index);
}

#[tokio::test]
async fn parallel_tools_run_concurrently() {
    let worker = scripted_worker(vec![
        Ok(ScriptedProvider::tool_calls_response(vec![
            (
                "c-1".into(),
                "shell".into(),
                json!({"command": "sleep 0.3"}).to_string(),
            ),
            (
                "c-2".into(),
                "shell".into(),
                json!({"command": "sleep 0.3"}).to_string(),
            ),
        ])),
        Ok(ScriptedProvider::text_response("slept", 10)),
    ]);
    let started = Instant::now();
    let handle = start_session(
        &worker,
        "it-parallel-time",
        config(ApprovalMode::Never, ""),
        "sleep twice",
    )
    .await;
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;
    // Sequential execution would need ≥ 0.6 s of sleeping alone.
    assert!(
        started.elapsed() < Duration::from_millis(550),
        "tools did not overlap: {:?}",
        started.elapsed()
    );
}

// ── Scenario 6: sub-agent spawn ───────────────────────────────────────────────

/// Routes completions by conversation content so the parent and the child
/// session can share one provider deterministically.
struct RoutingProvider;

impl RoutingProvider {
    fn find_spawn_output(items: &[ConversationItem]) -> Option<Value> {
        items.iter().find_map(|item| match &item.payload {
            ItemPayload::FunctionCallOutput { output, .. }
                if output.content.contains("agent_id") =>
            {
                serde_json::from_str(&output.content).ok()
            }
            _ => None,
        })
    }
}

#[async_trait]
impl ModelProvider for RoutingProvider {
    fn name(&self) -> &str {
        "routing-mock"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<LlmCallOutput, ProviderError> {
        let last_user = req.items.iter().rev().find_map(|i| match &i.payload {
            ItemPayload::UserMessage { content } => Some(content.as_str()),
            _ => None,
        });
        let spawn_output = Self::find_spawn_output(&req.items);
        let wait_done = req.items.iter().any(|i| match &i.payload {
            ItemPayload::FunctionCallOutput { output, .. } => output.content.contains("status"),
            _ => false,
        });
        let response = match last_user {
            // The child session's task message.
            Some("explore") => ScriptedProvider::text_response("I looked around.", 5),
            Some("use a sub-agent") => match spawn_output {
                None => ScriptedProvider::tool_call_response(
                    "c-spawn",
                    "spawn_agent",
                    json!({"message": "explore", "agent_type": "explorer"}).to_string(),
                ),
                Some(_) => ScriptedProvider::text_response("spawned", 5),
            },
            Some("wait for the agent") => {
                let agent_id = spawn_output
                    .and_then(|v| v["agent_id"].as_str().map(str::to_string))
                    .unwrap_or_default();
                if wait_done {
                    ScriptedProvider::text_response("all done", 5)
                } else {
                    ScriptedProvider::tool_call_response(
                        "c-wait",
                        "wait",
                        json!({"ids": [agent_id], "timeout_ms": 60_000}).to_string(),
                    )
                }
            }
            _ => ScriptedProvider::text_response("ok", 5),
        };
        Ok(response)
    }
}

#[tokio::test]
async fn sub_agent_spawn_and_wait() {
    let worker = core_worker_builder(Arc::new(RoutingProvider))
        .start()
        .expect("worker starts");
    let handle = start_session(
        &worker,
        "it-subagent",
        config(ApprovalMode::Never, ""),
        "use a sub-agent",
    )
    .await;
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 1).await;

    let history = items(&handle).await;
    let spawn_output = history
        .iter()
        .find(|i| i["type"] == "function_call_output")
        .unwrap();
    let payload: Value =
        serde_json::from_str(spawn_output["output"]["content"].as_str().unwrap()).unwrap();
    let agent_id = payload["agent_id"].as_str().unwrap().to_string();
    let child_workflow_id = payload["workflow_id"].as_str().unwrap().to_string();
    assert!(agent_id.starts_with("agent-"));
    assert_eq!(child_workflow_id, format!("it-subagent/{agent_id}"));

    // Registry reaches the child's terminal state via the watcher.
    for _ in 0..1000 {
        let status = handle.query("get_turn_status").await.unwrap();
        let agents = status["child_agents"].as_array().unwrap().clone();
        if agents
            .iter()
            .any(|a| a["agent_id"] == agent_id.as_str() && a["status"] == "completed")
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = handle.query("get_turn_status").await.unwrap();
    let agent = &status["child_agents"].as_array().unwrap()[0];
    assert_eq!(agent["role"], "explorer");
    assert_eq!(agent["status"], "completed");

    // A second turn waits on the agent and sees its final output.
    handle
        .update("user_input", json!({"content": "wait for the agent"}))
        .await
        .unwrap();
    wait_for_items(&handle, |items| count_of(items, "turn_complete") == 2).await;
    let history = items(&handle).await;
    let wait_output = history
        .iter()
        .filter(|i| i["type"] == "function_call_output")
        .last()
        .unwrap();
    let wait_content = wait_output["output"]["content"].as_str().unwrap();
    assert!(wait_content.contains("completed"));
    assert!(wait_content.contains("I looked around."));
}

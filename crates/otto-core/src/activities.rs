// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Worker-side activity implementations and worker assembly.
//!
//! The LLM-facing activities delegate to a [`ModelProvider`]; the tool
//! activity routes calls to workspace implementations and to the
//! worker-local exec-session store.  Provider HTTP clients, sandbox
//! engines and patch parsing are external collaborators; what lives here
//! is the contract plumbing the workflows consume.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use otto_exec::ExecSessionStore;
use otto_model::activity_names;
use otto_model::{
    CompactInput, CompactOutput, CompletionRequest, ConversationItem, InstructionsInput,
    InstructionsOutput, ItemPayload, LlmCallInput, ModelProvider, ProviderError,
    ProviderErrorKind, SuggestionInput, SuggestionOutput, ToolCallRequest, ToolCallResult,
};
use otto_workflow::{Activity, ActivityError, Worker, WorkerBuilder};

use crate::harness::{harness_workflow, HARNESS_WORKFLOW};
use crate::session::{session_workflow, SESSION_WORKFLOW};

const COMPACT_PROMPT: &str = "You are a context compaction assistant. Summarise the \
conversation history below in a concise, information-dense way. Preserve technical \
details, decisions, file names, code snippets and tool outputs that matter for future \
work; the summary replaces the original history.";

fn provider_error_to_activity(e: ProviderError) -> ActivityError {
    match e.kind {
        ProviderErrorKind::ContextOverflow => {
            ActivityError::non_retryable("context_overflow", e.message)
        }
        ProviderErrorKind::ApiLimit => ActivityError::non_retryable("api_limit", e.message),
        ProviderErrorKind::Fatal => ActivityError::non_retryable("fatal", e.message),
        ProviderErrorKind::Transient => ActivityError::retryable("transient", e.message),
    }
}

fn parse_input<T: serde::de::DeserializeOwned>(input: Value) -> Result<T, ActivityError> {
    serde_json::from_value(input)
        .map_err(|e| ActivityError::application(format!("malformed activity input: {e}")))
}

fn to_result(value: impl serde::Serialize) -> Result<Value, ActivityError> {
    serde_json::to_value(value)
        .map_err(|e| ActivityError::application(format!("result serialization failed: {e}")))
}

// ─── LLM call ─────────────────────────────────────────────────────────────────

pub struct LlmCallActivity {
    provider: Arc<dyn ModelProvider>,
}

impl LlmCallActivity {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Activity for LlmCallActivity {
    fn name(&self) -> &str {
        activity_names::EXECUTE_LLM_CALL
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let input: LlmCallInput = parse_input(input)?;
        let request = CompletionRequest {
            items: input.history,
            model: input.model,
            tool_specs: input.tool_specs,
            base_instructions: input.base_instructions,
            developer_instructions: input.developer_instructions,
            user_instructions: input.user_instructions,
            previous_response_id: input.previous_response_id,
        };
        let output = self
            .provider
            .complete(request)
            .await
            .map_err(provider_error_to_activity)?;
        to_result(output)
    }
}

// ─── Compaction ───────────────────────────────────────────────────────────────

pub struct CompactActivity {
    provider: Arc<dyn ModelProvider>,
}

impl CompactActivity {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

fn serialize_history(items: &[ConversationItem]) -> String {
    items
        .iter()
        .filter_map(|item| match &item.payload {
            ItemPayload::UserMessage { content } => Some(format!("User: {content}")),
            ItemPayload::AssistantMessage { content } => Some(format!("Assistant: {content}")),
            ItemPayload::FunctionCall {
                name, arguments, ..
            } => Some(format!("[tool_call: {name}({arguments})]")),
            ItemPayload::FunctionCallOutput { output, .. } => {
                Some(format!("[tool_result: {}]", output.content))
            }
            ItemPayload::Compaction { content } => Some(format!("[earlier summary: {content}]")),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Activity for CompactActivity {
    fn name(&self) -> &str {
        activity_names::EXECUTE_COMPACT
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let input: CompactInput = parse_input(input)?;
        let prompt = format!(
            "{COMPACT_PROMPT}\n\n---\n\n{}",
            serialize_history(&input.input)
        );
        let request = CompletionRequest {
            items: vec![ConversationItem::user_message(prompt, "compaction")],
            model: input.model,
            tool_specs: Vec::new(),
            base_instructions: input.instructions,
            developer_instructions: String::new(),
            user_instructions: String::new(),
            previous_response_id: None,
        };
        let output = self
            .provider
            .complete(request)
            .await
            .map_err(provider_error_to_activity)?;
        let summary = output
            .items
            .iter()
            .find_map(|item| item.as_text().map(str::to_string))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ActivityError::application("compaction produced no summary"))?;
        to_result(CompactOutput {
            items: vec![ConversationItem::new(ItemPayload::Compaction {
                content: summary,
            })],
            token_usage: output.token_usage,
        })
    }
}

// ─── Suggestions ──────────────────────────────────────────────────────────────

/// Best-effort next-prompt suggestion.  Deliberately model-free: the
/// heuristic is cheap, deterministic, and failures are invisible anyway.
pub struct SuggestionActivity;

#[async_trait]
impl Activity for SuggestionActivity {
    fn name(&self) -> &str {
        activity_names::GENERATE_SUGGESTIONS
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let input: SuggestionInput = parse_input(input)?;
        let assistant = input.assistant_message.trim();
        let suggestion = if assistant.is_empty() {
            String::new()
        } else if assistant.ends_with('?') {
            "Answer the assistant's question".to_string()
        } else {
            let first_line = assistant.lines().next().unwrap_or("");
            let mut topic: String = first_line.chars().take(60).collect();
            if topic.len() < first_line.len() {
                topic.push('…');
            }
            format!("Ask a follow-up about: {topic}")
        };
        to_result(SuggestionOutput { suggestion })
    }
}

// ─── Instruction / policy loading ─────────────────────────────────────────────

enum InstructionsKind {
    Worker,
    Personal,
    ExecPolicy,
}

/// Fail-soft file loading: a missing or unreadable file yields empty
/// content, never an error.
pub struct InstructionsActivity {
    kind: InstructionsKind,
}

impl InstructionsActivity {
    pub fn worker() -> Self {
        Self {
            kind: InstructionsKind::Worker,
        }
    }

    pub fn personal() -> Self {
        Self {
            kind: InstructionsKind::Personal,
        }
    }

    pub fn exec_policy() -> Self {
        Self {
            kind: InstructionsKind::ExecPolicy,
        }
    }

    fn path(&self, cwd: &str) -> Option<PathBuf> {
        match self.kind {
            InstructionsKind::Worker => Some(Path::new(cwd).join("AGENTS.md")),
            InstructionsKind::Personal => {
                dirs::config_dir().map(|dir| dir.join("otto").join("instructions.md"))
            }
            InstructionsKind::ExecPolicy => {
                Some(Path::new(cwd).join(".otto").join("exec-policy"))
            }
        }
    }
}

#[async_trait]
impl Activity for InstructionsActivity {
    fn name(&self) -> &str {
        match self.kind {
            InstructionsKind::Worker => activity_names::LOAD_WORKER_INSTRUCTIONS,
            InstructionsKind::Personal => activity_names::LOAD_PERSONAL_INSTRUCTIONS,
            InstructionsKind::ExecPolicy => activity_names::LOAD_EXEC_POLICY,
        }
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let input: InstructionsInput = parse_input(input)?;
        let content = match self.path(&input.cwd) {
            Some(path) => tokio::fs::read_to_string(&path).await.unwrap_or_default(),
            None => String::new(),
        };
        to_result(InstructionsOutput { content })
    }
}

// ─── Tool execution ───────────────────────────────────────────────────────────

const GREP_MATCH_LIMIT: usize = 200;
const GREP_FILE_LIMIT: usize = 2000;

/// Routes `execute_tool` calls to the workspace tool implementations and
/// the exec-session store.
pub struct ToolRouterActivity {
    exec: Arc<ExecSessionStore>,
}

impl ToolRouterActivity {
    pub fn new(exec: Arc<ExecSessionStore>) -> Self {
        Self { exec }
    }

    async fn run_shell(
        &self,
        request: &ToolCallRequest,
        args: &Value,
    ) -> Result<(String, bool), ActivityError> {
        let cwd = if request.cwd.is_empty() {
            None
        } else {
            Some(request.cwd.as_str())
        };
        let deadline = Duration::from_millis(request.timeout_ms.max(1));

        // Continue an interactive session: the command goes to its stdin.
        if let Some(session_id) = args.get("session_id").and_then(Value::as_u64) {
            let session = self.exec.get(session_id).ok_or_else(|| {
                ActivityError::application(format!("exec session not found: {session_id}"))
            })?;
            if let Some(command) = args.get("command").and_then(Value::as_str) {
                session
                    .write_stdin(&format!("{command}\n"))
                    .map_err(|e| ActivityError::application(e.to_string()))?;
            }
            let snapshot = session.collect_output(deadline, || {}).await;
            return Ok((snapshot.content, true));
        }

        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ActivityError::application("missing 'command' argument"))?;

        // A fresh interactive session runs on a PTY and stays registered.
        if args.get("interactive").and_then(Value::as_bool).unwrap_or(false) {
            #[cfg(unix)]
            {
                let session = self
                    .exec
                    .spawn_pty(command, cwd)
                    .map_err(|e| ActivityError::application(e.to_string()))?;
                let snapshot = session.collect_output(deadline, || {}).await;
                let header = format!("[exec session {} started]\n", session.id());
                return Ok((format!("{header}{}", snapshot.content), true));
            }
            #[cfg(not(unix))]
            {
                return Err(ActivityError::application(
                    "interactive sessions require a PTY, unavailable on this platform",
                ));
            }
        }

        // One-shot: run to completion (or deadline) and unregister.
        let session = self
            .exec
            .spawn_pipe(command, cwd)
            .map_err(|e| ActivityError::application(e.to_string()))?;
        let started = Instant::now();
        let snapshot = loop {
            let remaining = deadline.saturating_sub(started.elapsed());
            let snapshot = session.collect_output(remaining, || {}).await;
            if snapshot.exited {
                break snapshot;
            }
            if started.elapsed() >= deadline {
                let _ = session.kill();
                break snapshot;
            }
        };
        let id = session.id();
        let _ = self.exec.remove(id);
        if !snapshot.exited {
            return Ok((
                format!(
                    "{}\n[command timed out after {} ms]",
                    snapshot.content, request.timeout_ms
                ),
                false,
            ));
        }
        match snapshot.exit_code {
            Some(0) => Ok((snapshot.content, true)),
            code => Ok((
                format!("[exit {}]\n{}", code.unwrap_or(-1), snapshot.content),
                false,
            )),
        }
    }

    async fn write_stdin(&self, args: &Value) -> Result<(String, bool), ActivityError> {
        let session_id = args
            .get("session_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ActivityError::application("missing 'session_id' argument"))?;
        let data = args
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| ActivityError::application("missing 'data' argument"))?;
        let session = self.exec.get(session_id).ok_or_else(|| {
            ActivityError::application(format!("exec session not found: {session_id}"))
        })?;
        session
            .write_stdin(data)
            .map_err(|e| ActivityError::application(e.to_string()))?;
        let snapshot = session
            .collect_output(Duration::from_millis(500), || {})
            .await;
        Ok((snapshot.content, true))
    }
}

fn resolve_path(cwd: &str, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() || cwd.is_empty() {
        p.to_path_buf()
    } else {
        Path::new(cwd).join(p)
    }
}

async fn read_file(cwd: &str, args: &Value) -> Result<(String, bool), ActivityError> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ActivityError::application("missing 'path' argument"))?;
    let full = resolve_path(cwd, path);
    let content = tokio::fs::read_to_string(&full)
        .await
        .map_err(|e| ActivityError::application(format!("failed to read {path}: {e}")))?;
    let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = args.get("limit").and_then(Value::as_u64).map(|v| v as usize);
    let selected: Vec<&str> = match limit {
        Some(limit) => content.lines().skip(offset).take(limit).collect(),
        None if offset > 0 => content.lines().skip(offset).collect(),
        None => return Ok((content, true)),
    };
    Ok((selected.join("\n"), true))
}

async fn write_file(cwd: &str, args: &Value) -> Result<(String, bool), ActivityError> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ActivityError::application("missing 'path' argument"))?;
    let content = args
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| ActivityError::application("missing 'content' argument"))?;
    let full = resolve_path(cwd, path);
    if let Some(parent) = full.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    tokio::fs::write(&full, content)
        .await
        .map_err(|e| ActivityError::application(format!("failed to write file {path}: {e}")))?;
    Ok((format!("wrote {} bytes to {path}", content.len()), true))
}

async fn list_dir(cwd: &str, args: &Value) -> Result<(String, bool), ActivityError> {
    let path = args
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| ActivityError::application("missing 'path' argument"))?;
    let full = resolve_path(cwd, path);
    let mut reader = tokio::fs::read_dir(&full)
        .await
        .map_err(|e| ActivityError::application(format!("failed to list {path}: {e}")))?;
    let mut entries = Vec::new();
    while let Ok(Some(entry)) = reader.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push(if is_dir { format!("{name}/") } else { name });
    }
    entries.sort();
    Ok((entries.join("\n"), true))
}

fn grep_walk(dir: &Path, files: &mut Vec<PathBuf>) {
    if files.len() >= GREP_FILE_LIMIT {
        return;
    }
    let reader = match std::fs::read_dir(dir) {
        Ok(reader) => reader,
        Err(_) => return,
    };
    for entry in reader.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == "target" || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            grep_walk(&path, files);
        } else if files.len() < GREP_FILE_LIMIT {
            files.push(path);
        }
    }
}

async fn grep_files(cwd: &str, args: &Value) -> Result<(String, bool), ActivityError> {
    let pattern = args
        .get("pattern")
        .and_then(Value::as_str)
        .ok_or_else(|| ActivityError::application("missing 'pattern' argument"))?;
    let regex = regex::Regex::new(pattern)
        .map_err(|e| ActivityError::application(format!("invalid pattern: {e}")))?;
    let root = resolve_path(
        cwd,
        args.get("path").and_then(Value::as_str).unwrap_or("."),
    );
    let matches = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        if root.is_dir() {
            grep_walk(&root, &mut files);
        } else {
            files.push(root);
        }
        let mut matches = Vec::new();
        'files: for file in files {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };
            for (number, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}:{}", file.display(), number + 1, line));
                    if matches.len() >= GREP_MATCH_LIMIT {
                        break 'files;
                    }
                }
            }
        }
        matches
    })
    .await
    .map_err(|e| ActivityError::unknown(format!("grep task failed: {e}")))?;
    Ok((matches.join("\n"), true))
}

#[async_trait]
impl Activity for ToolRouterActivity {
    fn name(&self) -> &str {
        activity_names::EXECUTE_TOOL
    }

    async fn execute(&self, input: Value) -> Result<Value, ActivityError> {
        let request: ToolCallRequest = parse_input(input)?;
        let args: Value = serde_json::from_str(&request.arguments).unwrap_or_else(|_| json!({}));
        debug!(tool = %request.tool_name, call_id = %request.call_id, "executing tool");
        let (content, success) = match request.tool_name.as_str() {
            "shell" => self.run_shell(&request, &args).await?,
            "write_stdin" => self.write_stdin(&args).await?,
            "read_file" => read_file(&request.cwd, &args).await?,
            "write_file" => write_file(&request.cwd, &args).await?,
            "list_dir" => list_dir(&request.cwd, &args).await?,
            "grep_files" => grep_files(&request.cwd, &args).await?,
            "apply_patch" => {
                return Err(ActivityError::application(
                    "apply_patch requires the external patch engine, which is not wired \
                     into this worker",
                ))
            }
            other => {
                return Err(ActivityError::application(format!("unknown tool: {other}")))
            }
        };
        to_result(ToolCallResult {
            call_id: request.call_id,
            content,
            success,
        })
    }
}

// ─── Worker assembly ──────────────────────────────────────────────────────────

/// Builder with the session + harness workflows and the full default
/// activity set registered.  Callers may add queue-scoped activities or a
/// history sink before starting.
pub fn core_worker_builder(provider: Arc<dyn ModelProvider>) -> WorkerBuilder {
    let exec = Arc::new(ExecSessionStore::default());
    Worker::builder()
        .register_workflow(SESSION_WORKFLOW, session_workflow)
        .register_workflow(HARNESS_WORKFLOW, harness_workflow)
        .register_activity(Arc::new(LlmCallActivity::new(provider.clone())))
        .register_activity(Arc::new(CompactActivity::new(provider)))
        .register_activity(Arc::new(SuggestionActivity))
        .register_activity(Arc::new(InstructionsActivity::worker()))
        .register_activity(Arc::new(InstructionsActivity::personal()))
        .register_activity(Arc::new(InstructionsActivity::exec_policy()))
        .register_activity(Arc::new(ToolRouterActivity::new(exec)))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use otto_model::TokenUsage;

    fn tool_request(name: &str, arguments: Value, cwd: &str) -> Value {
        serde_json::to_value(ToolCallRequest {
            call_id: "c1".into(),
            tool_name: name.into(),
            arguments: arguments.to_string(),
            cwd: cwd.into(),
            sandbox_disabled: false,
            timeout_ms: 10_000,
        })
        .unwrap()
    }

    fn router() -> ToolRouterActivity {
        ToolRouterActivity::new(Arc::new(ExecSessionStore::default()))
    }

    #[tokio::test]
    async fn shell_tool_runs_and_reports_exit() {
        let out = router()
            .execute(tool_request("shell", json!({"command": "echo out"}), ""))
            .await
            .unwrap();
        let result: ToolCallResult = serde_json::from_value(out).unwrap();
        assert!(result.success);
        assert!(result.content.contains("out"));
    }

    #[tokio::test]
    async fn shell_nonzero_exit_is_failure() {
        let out = router()
            .execute(tool_request("shell", json!({"command": "exit 4"}), ""))
            .await
            .unwrap();
        let result: ToolCallResult = serde_json::from_value(out).unwrap();
        assert!(!result.success);
        assert!(result.content.contains("[exit 4]"));
    }

    #[tokio::test]
    async fn file_tools_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_string_lossy().to_string();
        let router = router();
        let out = router
            .execute(tool_request(
                "write_file",
                json!({"path": "notes.txt", "content": "alpha\nbeta"}),
                &cwd,
            ))
            .await
            .unwrap();
        let result: ToolCallResult = serde_json::from_value(out).unwrap();
        assert!(result.success);

        let out = router
            .execute(tool_request("read_file", json!({"path": "notes.txt"}), &cwd))
            .await
            .unwrap();
        let result: ToolCallResult = serde_json::from_value(out).unwrap();
        assert_eq!(result.content, "alpha\nbeta");

        let out = router
            .execute(tool_request("list_dir", json!({"path": "."}), &cwd))
            .await
            .unwrap();
        let result: ToolCallResult = serde_json::from_value(out).unwrap();
        assert!(result.content.contains("notes.txt"));
    }

    #[tokio::test]
    async fn grep_finds_matches_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("code.rs"), "fn main() {}\nlet x = 1;\n").unwrap();
        let out = router()
            .execute(tool_request(
                "grep_files",
                json!({"pattern": "fn \\w+"}),
                &dir.path().to_string_lossy(),
            ))
            .await
            .unwrap();
        let result: ToolCallResult = serde_json::from_value(out).unwrap();
        assert!(result.content.contains("code.rs:1:fn main() {}"));
    }

    #[tokio::test]
    async fn missing_file_is_application_error() {
        let err = router()
            .execute(tool_request(
                "read_file",
                json!({"path": "/definitely/not/here"}),
                "",
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "application");
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn unknown_tool_is_application_error() {
        let err = router()
            .execute(tool_request("teleport", json!({}), ""))
            .await
            .unwrap_err();
        assert!(err.message.contains("unknown tool"));
    }

    #[tokio::test]
    async fn suggestion_activity_is_best_effort() {
        let input = serde_json::to_value(SuggestionInput {
            user_message: "fix the bug".into(),
            assistant_message: "Done. The fix is in parser.rs".into(),
            tool_summaries: vec![],
            model: otto_model::ResolvedProfile::default(),
        })
        .unwrap();
        let out = SuggestionActivity.execute(input).await.unwrap();
        let result: SuggestionOutput = serde_json::from_value(out).unwrap();
        assert!(result.suggestion.contains("parser.rs"));
    }

    #[tokio::test]
    async fn instructions_are_fail_soft() {
        let input = serde_json::to_value(InstructionsInput {
            cwd: "/nonexistent/path".into(),
        })
        .unwrap();
        let out = InstructionsActivity::worker().execute(input).await.unwrap();
        let result: InstructionsOutput = serde_json::from_value(out).unwrap();
        assert_eq!(result.content, "");
    }

    #[tokio::test]
    async fn compact_activity_summarizes_via_provider() {
        let provider = Arc::new(otto_model::ScriptedProvider::new(vec![Ok(
            otto_model::ScriptedProvider::text_response("the summary", 7),
        )]));
        let input = serde_json::to_value(CompactInput {
            model: otto_model::ResolvedProfile::default(),
            input: vec![ConversationItem::user_message("long history", "t1")],
            instructions: String::new(),
        })
        .unwrap();
        let out = CompactActivity::new(provider).execute(input).await.unwrap();
        let result: CompactOutput = serde_json::from_value(out).unwrap();
        assert_eq!(result.items.len(), 1);
        assert!(matches!(
            &result.items[0].payload,
            ItemPayload::Compaction { content } if content == "the summary"
        ));
        assert_eq!(result.token_usage, TokenUsage { total: 7, cached: 0, cache_creation: 0 });
    }

    #[tokio::test]
    async fn llm_activity_maps_error_kinds() {
        let provider = Arc::new(otto_model::ScriptedProvider::new(vec![Err(
            otto_model::ProviderError::context_overflow("too long"),
        )]));
        let input = serde_json::to_value(LlmCallInput {
            history: vec![],
            model: otto_model::ResolvedProfile::default(),
            tool_specs: vec![],
            base_instructions: String::new(),
            developer_instructions: String::new(),
            user_instructions: String::new(),
            previous_response_id: None,
        })
        .unwrap();
        let err = LlmCallActivity::new(provider).execute(input).await.unwrap_err();
        assert_eq!(err.kind, "context_overflow");
        assert!(!err.retryable);
    }
}

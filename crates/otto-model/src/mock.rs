// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::contracts::{FinishReason, LlmCallOutput, TokenUsage};
use crate::items::{ConversationItem, ItemPayload};
use crate::provider::{CompletionRequest, ModelProvider, ProviderError};

/// A pre-scripted provider.  Each `complete` call pops the next response
/// from the front of the queue, so tests can specify exact sequences
/// (including tool calls and typed failures) without network access.
///
/// When the script runs out, the provider falls back to echoing the last
/// user message, which keeps open-ended tests from hanging.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<VecDeque<Result<LlmCallOutput, ProviderError>>>>,
    /// The last request seen, for tests that assert on what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Result<LlmCallOutput, ProviderError>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: a provider that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Ok(Self::text_response(reply, 10))])
    }

    /// A finished text response worth `tokens` total tokens.
    pub fn text_response(text: impl Into<String>, tokens: u64) -> LlmCallOutput {
        LlmCallOutput {
            items: vec![ConversationItem::assistant_message(text.into())],
            finish_reason: FinishReason::Stop,
            token_usage: TokenUsage {
                total: tokens,
                ..TokenUsage::default()
            },
            response_id: None,
        }
    }

    /// A response consisting of one tool call.
    pub fn tool_call_response(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> LlmCallOutput {
        LlmCallOutput {
            items: vec![ConversationItem::new(ItemPayload::FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
                call_id: call_id.into(),
            })],
            finish_reason: FinishReason::ToolCalls,
            token_usage: TokenUsage {
                total: 10,
                ..TokenUsage::default()
            },
            response_id: None,
        }
    }

    /// A response consisting of several tool calls in one batch.
    pub fn tool_calls_response(calls: Vec<(String, String, String)>) -> LlmCallOutput {
        LlmCallOutput {
            items: calls
                .into_iter()
                .map(|(call_id, name, arguments)| {
                    ConversationItem::new(ItemPayload::FunctionCall {
                        name,
                        arguments,
                        call_id,
                    })
                })
                .collect(),
            finish_reason: FinishReason::ToolCalls,
            token_usage: TokenUsage {
                total: 10,
                ..TokenUsage::default()
            },
            response_id: None,
        }
    }

    /// Number of scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn complete(&self, req: CompletionRequest) -> Result<LlmCallOutput, ProviderError> {
        let next = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front());
        let last_user = req
            .items
            .iter()
            .rev()
            .find_map(|item| match &item.payload {
                ItemPayload::UserMessage { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "[no input]".into());
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(req);
        }
        match next {
            Some(result) => result,
            None => Ok(Self::text_response(format!("MOCK: {last_user}"), 10)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::ResolvedProfile;

    fn request(user: &str) -> CompletionRequest {
        CompletionRequest {
            items: vec![ConversationItem::user_message(user, "turn-1")],
            model: ResolvedProfile::default(),
            tool_specs: vec![],
            base_instructions: String::new(),
            developer_instructions: String::new(),
            user_instructions: String::new(),
            previous_response_id: None,
        }
    }

    #[tokio::test]
    async fn pops_scripts_in_order() {
        let p = ScriptedProvider::new(vec![
            Ok(ScriptedProvider::text_response("first", 1)),
            Ok(ScriptedProvider::text_response("second", 1)),
        ]);
        let a = p.complete(request("x")).await.unwrap();
        let b = p.complete(request("x")).await.unwrap();
        assert_eq!(a.items[0].as_text(), Some("first"));
        assert_eq!(b.items[0].as_text(), Some("second"));
        assert_eq!(p.remaining(), 0);
    }

    #[tokio::test]
    async fn exhausted_script_echoes_user() {
        let p = ScriptedProvider::new(vec![]);
        let out = p.complete(request("hello")).await.unwrap();
        assert_eq!(out.items[0].as_text(), Some("MOCK: hello"));
    }

    #[tokio::test]
    async fn scripted_error_is_returned() {
        let p = ScriptedProvider::new(vec![Err(ProviderError::context_overflow("too big"))]);
        let err = p.complete(request("x")).await.unwrap_err();
        assert_eq!(err.kind, crate::provider::ProviderErrorKind::ContextOverflow);
    }

    #[tokio::test]
    async fn records_last_request() {
        let p = ScriptedProvider::always_text("ok");
        let _ = p.complete(request("inspect me")).await.unwrap();
        let guard = p.last_request.lock().unwrap();
        let req = guard.as_ref().unwrap();
        assert_eq!(req.items[0].as_text(), Some("inspect me"));
    }
}

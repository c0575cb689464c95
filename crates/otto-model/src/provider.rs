// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use thiserror::Error;

use crate::contracts::{LlmCallOutput, ToolSpec};
use crate::items::ConversationItem;
use crate::profiles::ResolvedProfile;

/// Classification of a provider failure.
///
/// The turn engine branches on this: overflow triggers compaction, rate
/// limits trigger a timed retry, fatal errors end the turn.  Everything
/// else is transient and handled by the activity retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    ContextOverflow,
    ApiLimit,
    Fatal,
    Transient,
}

impl ProviderErrorKind {
    /// Stable kind string used in activity errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderErrorKind::ContextOverflow => "context_overflow",
            ProviderErrorKind::ApiLimit => "api_limit",
            ProviderErrorKind::Fatal => "fatal",
            ProviderErrorKind::Transient => "transient",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", kind.as_str())]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn context_overflow(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ContextOverflow, message)
    }

    pub fn api_limit(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ApiLimit, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Fatal, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient, message)
    }
}

/// One non-streaming completion request.
///
/// Streaming token delivery is deliberately absent: activity results are
/// atomic, so the provider returns the finished response in one piece.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub items: Vec<ConversationItem>,
    pub model: ResolvedProfile,
    pub tool_specs: Vec<ToolSpec>,
    pub base_instructions: String,
    pub developer_instructions: String,
    pub user_instructions: String,
    pub previous_response_id: Option<String>,
}

/// Trait implemented by concrete provider clients on the worker side.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, req: CompletionRequest) -> Result<LlmCallOutput, ProviderError>;
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Conversation data model, model-profile catalog and activity contracts.
//!
//! This crate holds every type that crosses the workflow/activity boundary:
//! [`ConversationItem`]s, the typed inputs and outputs of the LLM-facing
//! activities, and the [`ModelProvider`] trait that concrete provider clients
//! implement on the worker side.  It deliberately has no HTTP client; the
//! provider implementations are external collaborators.

mod contracts;
mod items;
mod mock;
mod profiles;
mod provider;

pub use contracts::{
    activity_names, CompactInput, CompactOutput, FinishReason, InstructionsInput,
    InstructionsOutput, LlmCallInput, LlmCallOutput, McpInitOutput, SuggestionInput,
    SuggestionOutput, TokenUsage, ToolCallRequest, ToolCallResult, ToolSpec,
};
pub use items::{ConversationItem, FunctionCallOutputPayload, ItemPayload};
pub use mock::ScriptedProvider;
pub use profiles::{resolve_profile, ModelProfile, ResolvedProfile, PROFILES};
pub use provider::{CompletionRequest, ModelProvider, ProviderError, ProviderErrorKind};

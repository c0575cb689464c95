// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Result payload of one tool call, as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallOutputPayload {
    pub content: String,
    pub success: bool,
}

impl FunctionCallOutputPayload {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    pub fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
        }
    }
}

/// Variant-specific content of a [`ConversationItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemPayload {
    /// Marks the start of a user turn.
    TurnStarted,
    UserMessage {
        content: String,
    },
    AssistantMessage {
        content: String,
    },
    /// A tool invocation requested by the model.  `arguments` is the raw
    /// JSON string exactly as the provider produced it.
    FunctionCall {
        name: String,
        arguments: String,
        call_id: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: FunctionCallOutputPayload,
    },
    /// Closes the turn opened by the matching `TurnStarted`.  Carries
    /// `"interrupted"` when the turn was cut short.
    TurnComplete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    /// Developer-visible announcement that the session model changed.
    ModelSwitch {
        previous: String,
        current: String,
    },
    /// Summary that replaced older history during compaction.
    Compaction {
        content: String,
    },
}

/// The fundamental unit of conversation history.
///
/// `seq` is assigned on append and always equals the item's index in its
/// history; `turn_id` groups the items of one user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(flatten)]
    pub payload: ItemPayload,
}

impl ConversationItem {
    pub fn new(payload: ItemPayload) -> Self {
        Self {
            seq: 0,
            turn_id: None,
            payload,
        }
    }

    pub fn with_turn(payload: ItemPayload, turn_id: impl Into<String>) -> Self {
        Self {
            seq: 0,
            turn_id: Some(turn_id.into()),
            payload,
        }
    }

    pub fn user_message(content: impl Into<String>, turn_id: impl Into<String>) -> Self {
        Self::with_turn(
            ItemPayload::UserMessage {
                content: content.into(),
            },
            turn_id,
        )
    }

    pub fn assistant_message(content: impl Into<String>) -> Self {
        Self::new(ItemPayload::AssistantMessage {
            content: content.into(),
        })
    }

    /// Plain text of the item, if it is a user or assistant message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            ItemPayload::UserMessage { content } | ItemPayload::AssistantMessage { content } => {
                Some(content)
            }
            _ => None,
        }
    }

    /// The call id, for function-call and function-call-output items.
    pub fn call_id(&self) -> Option<&str> {
        match &self.payload {
            ItemPayload::FunctionCall { call_id, .. } => Some(call_id),
            ItemPayload::FunctionCallOutput { call_id, .. } => Some(call_id),
            _ => None,
        }
    }

    /// Approximate token count using the 4-chars-per-token heuristic.
    ///
    /// Good enough to trigger proactive compaction; precise accounting
    /// comes from provider-reported usage.
    pub fn approx_tokens(&self) -> usize {
        self.text_len() / 4
    }

    fn text_len(&self) -> usize {
        match &self.payload {
            ItemPayload::TurnStarted => 0,
            ItemPayload::UserMessage { content } | ItemPayload::AssistantMessage { content } => {
                content.len()
            }
            ItemPayload::FunctionCall {
                name, arguments, ..
            } => name.len() + arguments.len(),
            ItemPayload::FunctionCallOutput { output, .. } => output.content.len(),
            ItemPayload::TurnComplete { content } => {
                content.as_ref().map(String::len).unwrap_or(0)
            }
            ItemPayload::ModelSwitch { previous, current } => previous.len() + current.len(),
            ItemPayload::Compaction { content } => content.len(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

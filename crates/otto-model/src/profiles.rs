// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model profile catalog: static metadata for known models.
//!
//! Profile resolution is a pure function so workflow code can call it
//! directly without going through an activity.

use serde::{Deserialize, Serialize};

use otto_config::ModelSettings;

/// Static metadata for one known model.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub provider: &'static str,
    /// Model-name prefix this profile applies to (longest prefix wins).
    pub name_prefix: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Cheaper sibling used for explorer sub-agents, when one exists.
    pub cheap_variant: Option<&'static str>,
}

/// Complete catalog of known profiles.  Unknown models fall back to the
/// per-provider default entry (empty `name_prefix`).
pub static PROFILES: &[ModelProfile] = &[
    ModelProfile {
        provider: "openai",
        name_prefix: "gpt-4o-mini",
        context_window: 128_000,
        max_output_tokens: 16_384,
        temperature: 1.0,
        cheap_variant: None,
    },
    ModelProfile {
        provider: "openai",
        name_prefix: "gpt-4o",
        context_window: 128_000,
        max_output_tokens: 16_384,
        temperature: 1.0,
        cheap_variant: Some("gpt-4o-mini"),
    },
    ModelProfile {
        provider: "openai",
        name_prefix: "gpt-4.1",
        context_window: 1_000_000,
        max_output_tokens: 32_768,
        temperature: 1.0,
        cheap_variant: Some("gpt-4.1-mini"),
    },
    ModelProfile {
        provider: "openai",
        name_prefix: "",
        context_window: 128_000,
        max_output_tokens: 16_384,
        temperature: 1.0,
        cheap_variant: Some("gpt-4o-mini"),
    },
    ModelProfile {
        provider: "anthropic",
        name_prefix: "claude-haiku",
        context_window: 200_000,
        max_output_tokens: 8_192,
        temperature: 1.0,
        cheap_variant: None,
    },
    ModelProfile {
        provider: "anthropic",
        name_prefix: "claude-sonnet",
        context_window: 200_000,
        max_output_tokens: 64_000,
        temperature: 1.0,
        cheap_variant: None,
    },
    ModelProfile {
        provider: "anthropic",
        name_prefix: "claude-opus",
        context_window: 200_000,
        max_output_tokens: 32_000,
        temperature: 1.0,
        cheap_variant: None,
    },
    ModelProfile {
        provider: "anthropic",
        name_prefix: "",
        context_window: 200_000,
        max_output_tokens: 8_192,
        temperature: 1.0,
        cheap_variant: None,
    },
    ModelProfile {
        provider: "mock",
        name_prefix: "",
        context_window: 32_000,
        max_output_tokens: 4_096,
        temperature: 0.0,
        cheap_variant: Some("mock-mini"),
    },
];

/// Fully resolved model parameters for one session.
///
/// Produced by [`resolve_profile`] from the user's [`ModelSettings`] and the
/// static catalog; explicit settings override profile defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub provider: String,
    pub model: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cheap_variant: Option<String>,
}

impl Default for ResolvedProfile {
    fn default() -> Self {
        resolve_profile(&ModelSettings::default())
    }
}

/// Resolve the profile for `settings`.  Pure and infallible: an unknown
/// provider gets conservative defaults.
pub fn resolve_profile(settings: &ModelSettings) -> ResolvedProfile {
    let profile = PROFILES
        .iter()
        .filter(|p| p.provider == settings.provider && settings.name.starts_with(p.name_prefix))
        .max_by_key(|p| p.name_prefix.len());

    let (context_window, max_output_tokens, temperature, cheap_variant) = match profile {
        Some(p) => (
            p.context_window,
            p.max_output_tokens,
            p.temperature,
            p.cheap_variant.map(str::to_string),
        ),
        None => (128_000, 8_192, 1.0, None),
    };

    ResolvedProfile {
        provider: settings.provider.clone(),
        model: settings.name.clone(),
        context_window: settings.context_window.unwrap_or(context_window),
        max_output_tokens: settings.max_tokens.unwrap_or(max_output_tokens),
        temperature: settings.temperature.unwrap_or(temperature),
        cheap_variant,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(provider: &str, name: &str) -> ModelSettings {
        ModelSettings {
            provider: provider.into(),
            name: name.into(),
            ..ModelSettings::default()
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let p = resolve_profile(&settings("openai", "gpt-4o-mini-2024"));
        // gpt-4o-mini matches more specifically than gpt-4o
        assert_eq!(p.max_output_tokens, 16_384);
        assert_eq!(p.cheap_variant, None);
    }

    #[test]
    fn provider_default_applies_to_unknown_model() {
        let p = resolve_profile(&settings("anthropic", "claude-experimental"));
        assert_eq!(p.context_window, 200_000);
    }

    #[test]
    fn unknown_provider_gets_fallback() {
        let p = resolve_profile(&settings("acme", "frontier-1"));
        assert_eq!(p.context_window, 128_000);
        assert_eq!(p.cheap_variant, None);
    }

    #[test]
    fn explicit_overrides_beat_profile() {
        let mut s = settings("openai", "gpt-4o");
        s.context_window = Some(9000);
        s.temperature = Some(0.2);
        let p = resolve_profile(&s);
        assert_eq!(p.context_window, 9000);
        assert_eq!(p.temperature, 0.2);
    }

    #[test]
    fn openai_models_have_cheap_variant() {
        let p = resolve_profile(&settings("openai", "gpt-4o"));
        assert_eq!(p.cheap_variant.as_deref(), Some("gpt-4o-mini"));
    }
}

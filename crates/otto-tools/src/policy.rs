// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::warn;

/// Decision attached to a policy rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Runs without approval in any mode.
    Trusted,
    /// Never dispatched; a failure output is synthesized.
    Forbidden,
}

/// One parsed rule: `trusted <prefix>` or `forbidden <prefix> [-- why]`.
#[derive(Debug, Clone)]
pub struct ExecPolicyRule {
    pub decision: PolicyDecision,
    pub prefix: String,
    pub justification: Option<String>,
}

/// Textual exec policy.
///
/// Format, one rule per line:
///
/// ```text
/// # comments and blank lines are ignored
/// trusted git status
/// trusted cargo check
/// forbidden git push --force -- protected branches
/// ```
///
/// Evaluation picks the longest matching prefix; on equal length,
/// `forbidden` beats `trusted`.
#[derive(Debug, Clone, Default)]
pub struct ExecPolicy {
    rules: Vec<ExecPolicyRule>,
}

impl ExecPolicy {
    /// Parse policy text.  Malformed lines are skipped with a warning so a
    /// typo in the policy file never takes the session down.
    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some(split) => split,
                None => {
                    warn!(line = number + 1, "exec policy rule missing a command prefix");
                    continue;
                }
            };
            let decision = match keyword {
                "trusted" => PolicyDecision::Trusted,
                "forbidden" => PolicyDecision::Forbidden,
                other => {
                    warn!(
                        line = number + 1,
                        keyword = other,
                        "unknown exec policy decision"
                    );
                    continue;
                }
            };
            let (prefix, justification) = match rest.split_once(" -- ") {
                Some((p, j)) => (p.trim(), Some(j.trim().to_string())),
                None => (rest.trim(), None),
            };
            if prefix.is_empty() {
                warn!(line = number + 1, "exec policy rule with empty prefix");
                continue;
            }
            rules.push(ExecPolicyRule {
                decision,
                prefix: prefix.to_string(),
                justification,
            });
        }
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[ExecPolicyRule] {
        &self.rules
    }

    /// The rule governing `command`, if any.
    pub fn evaluate(&self, command: &str) -> Option<&ExecPolicyRule> {
        self.rules
            .iter()
            .filter(|rule| prefix_matches(&rule.prefix, command))
            .max_by_key(|rule| {
                // Forbidden wins ties against trusted at the same length.
                (
                    rule.prefix.len(),
                    matches!(rule.decision, PolicyDecision::Forbidden),
                )
            })
    }
}

/// True when `command` starts with `prefix` at a token boundary, so
/// `trusted git` does not match `gitk`.
fn prefix_matches(prefix: &str, command: &str) -> bool {
    match command.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ExecPolicy {
        ExecPolicy::parse(
            "# deploy policy\n\
             trusted git status\n\
             trusted cargo\n\
             forbidden cargo publish -- releases go through CI\n\
             forbidden rm\n",
        )
    }

    #[test]
    fn longest_prefix_wins() {
        let p = policy();
        let rule = p.evaluate("cargo publish --dry-run").unwrap();
        assert_eq!(rule.decision, PolicyDecision::Forbidden);
        assert_eq!(rule.justification.as_deref(), Some("releases go through CI"));
    }

    #[test]
    fn shorter_trusted_prefix_still_applies() {
        let p = policy();
        let rule = p.evaluate("cargo check").unwrap();
        assert_eq!(rule.decision, PolicyDecision::Trusted);
    }

    #[test]
    fn prefix_requires_token_boundary() {
        let p = ExecPolicy::parse("forbidden rm\n");
        assert!(p.evaluate("rm -rf /tmp/x").is_some());
        assert!(p.evaluate("rmdir /tmp/x").is_none());
    }

    #[test]
    fn unmatched_command_has_no_rule() {
        assert!(policy().evaluate("ls -la").is_none());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let p = ExecPolicy::parse("trusted\nallow ls\n\n# note\ntrusted ls\n");
        assert_eq!(p.rules().len(), 1);
        assert_eq!(p.rules()[0].prefix, "ls");
    }

    #[test]
    fn forbidden_beats_trusted_on_equal_prefix() {
        let p = ExecPolicy::parse("trusted git push\nforbidden git push\n");
        let rule = p.evaluate("git push origin main").unwrap();
        assert_eq!(rule.decision, PolicyDecision::Forbidden);
    }

    #[test]
    fn empty_text_yields_empty_policy() {
        assert!(ExecPolicy::parse("").is_empty());
    }
}

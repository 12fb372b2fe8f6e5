//! Token usage tracking for model operations.
//!
//! [`Usage`] is the prompt/completion/total triple reported by providers.
//! Values accumulate across provider rounds within one operation via
//! `Add`/`AddAssign` and are recorded on the operation's history entry.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage statistics from a model operation.
///
/// Field names follow the common chat-completion convention; serde aliases
/// accept the `input_tokens`/`output_tokens` spelling some providers use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the prompt.
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: u32,

    /// Number of tokens in the completion.
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: u32,

    /// Total tokens used (prompt + completion).
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Create a new usage record.
    #[must_use]
    pub const fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Create an empty usage record.
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    /// Check if no tokens were used.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_computes_total() {
        let usage = Usage::new(100, 50);
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn zero_is_empty() {
        assert!(Usage::zero().is_empty());
        assert!(!Usage::new(1, 0).is_empty());
    }

    #[test]
    fn add_accumulates() {
        let mut usage = Usage::new(100, 50);
        usage += Usage::new(20, 10);
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 60);
        assert_eq!(usage.total_tokens, 180);
    }

    #[test]
    fn serde_accepts_provider_aliases() {
        let usage: Usage =
            serde_json::from_str(r#"{"input_tokens": 7, "output_tokens": 3, "total_tokens": 10}"#)
                .unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn serde_roundtrip() {
        let usage = Usage::new(11, 22);
        let json = serde_json::to_string(&usage).unwrap();
        let parsed: Usage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, usage);
    }
}

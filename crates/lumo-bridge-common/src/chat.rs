//! Conversation turns exchanged with the generation backend.
//!
//! The backend's conversation model is deliberately flat: only `user` and
//! `assistant` roles exist on the wire. System/developer instructions and
//! tool results from richer client protocols are folded into these two roles
//! before a request is built.

use serde::{Deserialize, Serialize};

/// Role of a conversation turn as the backend understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// Content supplied by the end user (or synthesized on their behalf).
    User,
    /// Content previously produced by the model.
    Assistant,
}

/// A single element of the conversation sent to the backend.
///
/// Once encryption is enabled, `content` holds base64 ciphertext bound to a
/// per-request key and request id; until then it is plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who authored this turn.
    pub role: TurnRole,
    /// The turn's textual content (plaintext or ciphertext).
    pub content: String,
}

impl Turn {
    /// Creates a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    /// Creates an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }

    /// Whether this turn starts with the local command token.
    ///
    /// Command turns (`/title …`, `/save`, …) are handled locally and never
    /// reach the backend when commands are enabled.
    #[must_use]
    pub fn is_command(&self) -> bool {
        self.role == TurnRole::User && self.content.starts_with('/')
    }
}

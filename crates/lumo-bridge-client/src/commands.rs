//! Local `/`-command handling.
//!
//! Certain user turns (`/title <text>`, `/save`, `/logout`, `/quit`, …) are
//! handled on this side of the bridge: the generation client short-circuits
//! before encryption, invokes the handler, and returns its string as the
//! chat text without contacting the backend. When commands are disabled by
//! configuration such turns travel to the backend verbatim.

use anyhow::Result;
use async_trait::async_trait;

/// Handler for `/`-prefixed user turns.
///
/// Implemented by the surrounding system (conversation persistence, session
/// management); the generation client only routes to it.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Handles one command turn (including the leading `/`).
    ///
    /// The returned string becomes the chat result's text. Errors surface
    /// to the caller as command failures.
    async fn handle(&self, command: &str) -> Result<String>;
}

//! # lumo-bridge
//!
//! A local translating proxy between an OpenAI-compatible Chat Completions
//! / Responses API and the lumo conversational backend.
//!
//! The backend speaks SSE `token_data` frames over four logical targets
//! (`message`, `title`, `tool_call`, `tool_result`), encrypts user turns
//! end-to-end, and supports only its own small native tool vocabulary.
//! Clients supply arbitrary custom tools and expect OpenAI-shaped
//! streaming deltas. The [`Bridge`] sits between the two:
//!
//! 1. the request normalizer folds OpenAI message shapes into flat turns,
//! 2. the generation serializer admits one backend generation at a time,
//! 3. the generation client encrypts turns, consumes the SSE stream and
//!    bounces misrouted tool calls,
//! 4. the streaming tool detector lifts JSON tool calls out of the
//!    assistant text,
//! 5. the emitters produce the exact OpenAI chunk framing and
//!    finish-reason policy.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lumo_bridge::Bridge;
//! use lumo_bridge_api::ChatCompletionsRequest;
//! use lumo_bridge_common::BridgeConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Arc::new(BridgeConfig::load("bridge.toml")?);
//! let bridge = Bridge::new(config)?;
//!
//! let request: ChatCompletionsRequest = serde_json::from_str(r#"{
//!     "messages": [{"role": "user", "content": "hello"}]
//! }"#)?;
//! let response = bridge.chat_completions(&request, false).await?;
//! println!("{}", serde_json::to_string_pretty(&response)?);
//! # Ok(())
//! # }
//! ```

pub mod core;
mod error;

pub use crate::core::Bridge;
pub use error::BridgeError;

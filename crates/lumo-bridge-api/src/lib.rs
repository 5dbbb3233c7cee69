//! # lumo-bridge-api
//!
//! The OpenAI-compatible surface of the bridge:
//!
//! - Wire shapes for Chat Completions and Responses-API requests and for
//!   the streamed / accumulated responses ([`openai`])
//! - The request normalizer folding OpenAI message shapes into backend
//!   turns ([`normalize`])
//! - The streaming and accumulating emitters implementing the generation
//!   client's sink trait ([`emit`])
//!
//! ## Example
//!
//! ```
//! use lumo_bridge_api::normalize::{IncomingMessage, normalize_chat_messages};
//!
//! let messages: Vec<IncomingMessage> = serde_json::from_str(r#"[
//!     {"role": "system", "content": "Be terse."},
//!     {"role": "user", "content": "hello"}
//! ]"#).unwrap();
//!
//! let normalized = normalize_chat_messages(&messages).unwrap();
//! assert_eq!(normalized.turns.len(), 1);
//! assert_eq!(normalized.instructions.as_deref(), Some("Be terse."));
//! ```

pub mod emit;
pub mod normalize;
pub mod openai;

pub use emit::{AccumulatingEmitter, DONE_FRAME, StreamingEmitter};
pub use normalize::{
    IncomingMessage, NormalizeError, NormalizedRequest, ResponsesInput, ResponsesItem,
    normalize_chat_messages, normalize_responses_input,
};
pub use openai::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionsRequest, FinishReason, ResponsesRequest,
    StreamErrorFrame, response_id,
};

//! # lumo-bridge-client
//!
//! Client for the lumo generation backend. Drives the whole backend side of
//! the bridge:
//!
//! - **Request serializer**: at most one in-flight generation per process,
//!   FIFO ordering ([`GenerationSerializer`])
//! - **Generation client**: per-turn encryption, SSE consumption, dispatch
//!   by target, and the misroute bounce loop ([`GenerationClient`])
//! - **Native tool processor**: classifies `tool_call` / `tool_result`
//!   frames and detects misroutes ([`NativeToolProcessor`])
//! - **Local commands**: `/`-prefixed turns short-circuit generation via a
//!   [`CommandHandler`]
//!
//! The OpenAI-compatible surface lives in `lumo-bridge-api`; this crate
//! only speaks the backend's protocol and hands translated events to a
//! [`TextAndToolEmitter`].

// ClientError embeds reqwest/eventsource errors; acceptable for
// network-bound code where HTTP latency dwarfs stack size concerns.
#![allow(clippy::result_large_err)]

pub mod commands;
pub mod crypto;
mod error;
pub mod generation;
pub mod native;
pub mod serializer;
pub mod wire;

pub use commands::CommandHandler;
pub use crypto::{RequestCipher, TurnCrypto, chunk_associated_data, turn_associated_data};
pub use error::ClientError;
pub use generation::{
    ChatResult, GenerationClient, GenerationOptions, InjectInto, TextAndToolEmitter,
};
pub use native::{
    EXTERNAL_TOOLS, INTERNAL_TOOLS, NativeToolOutcome, NativeToolProcessor, advertised_tools,
    is_native_tool,
};
pub use serializer::GenerationSerializer;
pub use wire::{GenerationRequest, ServerFrame, Target};

/// A retry policy for SSE streams that never retries.
///
/// Reconnecting mid-generation would replay the request against a stateful
/// backend; failures are surfaced instead and handled above the stream.
pub struct NoRetryPolicy;

impl reqwest_eventsource::retry::RetryPolicy for NoRetryPolicy {
    fn retry(
        &self,
        _error: &reqwest_eventsource::Error,
        _last_retry: Option<(usize, std::time::Duration)>,
    ) -> Option<std::time::Duration> {
        None
    }

    fn set_reconnection_time(&mut self, _duration: std::time::Duration) {
        // Ignored - we never retry anyway
    }
}

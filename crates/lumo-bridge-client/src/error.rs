//! Error types for the generation client.

use thiserror::Error;

/// Errors surfaced while talking to the generation backend.
///
/// Terminal SSE frames (`rejected`, `harmful`, `timeout`, `error`) map to
/// their own variants so callers can distinguish policy rejections from
/// transport failures. Chunk decryption failures and detector parse
/// failures never appear here - both degrade in place (see the generation
/// client).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The backend refused the request (`rejected` frame).
    #[error("backend rejected the request: {0}")]
    Rejected(String),

    /// The backend flagged the content (`harmful` frame).
    #[error("backend flagged the request as harmful: {0}")]
    Harmful(String),

    /// The backend gave up on the generation (`timeout` frame).
    #[error("backend timed out: {0}")]
    TimedOut(String),

    /// The backend reported an internal error (`error` frame).
    #[error("backend error: {0}")]
    Backend(String),

    /// Network or HTTP request failure.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SSE event source failure (connection drop, bad framing).
    #[error("event source error: {0}")]
    EventSource(#[from] reqwest_eventsource::Error),

    /// JSON encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key wrapping or turn encryption failure.
    #[error("encryption error: {0}")]
    Crypto(String),

    /// Invalid client configuration (bad URL, malformed public key).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A local `/`-command handler failed.
    #[error("command failed: {0}")]
    Command(String),

    /// The caller went away before the generation finished.
    #[error("generation canceled")]
    Canceled,
}

impl ClientError {
    /// Whether this error came from a terminal backend SSE frame rather
    /// than the transport.
    #[must_use]
    pub const fn is_backend_verdict(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::Harmful(_) | Self::TimedOut(_) | Self::Backend(_)
        )
    }

    /// Whether retrying at a higher level could plausibly succeed.
    ///
    /// Backend verdicts are final; transport hiccups are not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::EventSource(_))
    }
}

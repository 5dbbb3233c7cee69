//! Bridge-level errors.

use thiserror::Error;

use lumo_bridge_api::NormalizeError;
use lumo_bridge_client::ClientError;

/// Errors surfaced by the bridge facade.
///
/// The HTTP front-end maps these to OpenAI-shaped error envelopes; the
/// bridge itself only returns typed errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The client request could not be normalized.
    #[error("invalid request: {0}")]
    Normalize(#[from] NormalizeError),

    /// The backend generation failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The response stream could not be written (client gone).
    #[error("stream write failed: {0}")]
    Stream(String),
}

impl BridgeError {
    /// Whether this error was caused by the client's own request.
    #[must_use]
    pub const fn is_client_fault(&self) -> bool {
        matches!(self, Self::Normalize(_))
    }
}

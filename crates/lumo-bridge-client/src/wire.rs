//! Backend wire shapes: the generation request body and SSE frames.

use serde::{Deserialize, Serialize};

use lumo_bridge_common::Turn;

/// Logical target of a `token_data` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The assistant's main text stream.
    Message,
    /// The generated conversation title (only when requested).
    Title,
    /// A native tool invocation made by the backend.
    ToolCall,
    /// The backend's result for a native tool invocation.
    ToolResult,
}

/// Request body POSTed to the generation endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    /// Always `"generation_request"`.
    #[serde(rename = "type")]
    pub request_type: &'static str,
    /// The conversation, oldest turn first. Ciphertext when encrypted.
    pub turns: Vec<Turn>,
    /// Per-request backend options.
    pub options: GenerationRequestOptions,
    /// Which targets the backend should stream.
    pub targets: Vec<Target>,
    /// The per-request symmetric key, wrapped for the backend's public key
    /// and base64-encoded. Present iff the turns are encrypted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_key: Option<String>,
    /// Opaque id binding this request's ciphertexts together.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl GenerationRequest {
    /// Builds a plaintext request (no key material attached).
    #[must_use]
    pub fn new(turns: Vec<Turn>, tools: Vec<String>, request_title: bool) -> Self {
        let targets = if request_title {
            vec![Target::Title, Target::Message]
        } else {
            vec![Target::Message]
        };
        Self {
            request_type: "generation_request",
            turns,
            options: GenerationRequestOptions { tools },
            targets,
            request_key: None,
            request_id: None,
        }
    }
}

/// Backend options carried inside the request body.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequestOptions {
    /// Names of the native tools enabled for this request.
    pub tools: Vec<String>,
}

/// One decoded SSE frame from the backend.
///
/// Unknown frame types deserialize to [`ServerFrame::Unknown`] and are
/// skipped; the backend adds informational frames from time to time.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A content chunk for one of the four targets.
    TokenData {
        /// Which logical stream this chunk belongs to.
        target: Target,
        /// Chunk payload; base64 ciphertext when `encrypted`.
        content: String,
        /// Whether `content` must be decrypted with the request key.
        #[serde(default)]
        encrypted: bool,
    },
    /// Terminal frame: backend-side failure.
    Error {
        /// Optional human-readable detail.
        #[serde(default)]
        message: Option<String>,
    },
    /// Terminal frame: the request was refused.
    Rejected {
        /// Optional human-readable detail.
        #[serde(default)]
        message: Option<String>,
    },
    /// Terminal frame: the content tripped a safety filter.
    Harmful {
        /// Optional human-readable detail.
        #[serde(default)]
        message: Option<String>,
    },
    /// Terminal frame: the backend gave up waiting on the model.
    Timeout {
        /// Optional human-readable detail.
        #[serde(default)]
        message: Option<String>,
    },
    /// Any frame type this client does not know.
    #[serde(other)]
    Unknown,
}

//! OpenAI-compatible wire shapes.
//!
//! The bridge accepts Chat Completions and Responses-API requests and
//! produces Chat Completions responses - one JSON envelope when not
//! streaming, `chat.completion.chunk` frames over `text/event-stream`
//! otherwise.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use lumo_bridge_common::tools::ToolDefinition;

use crate::normalize::{IncomingMessage, ResponsesInput};

/// A Chat Completions request as received from the client.
///
/// Sampling parameters the backend does not support are accepted and
/// ignored rather than rejected; clients send them unconditionally.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionsRequest {
    /// Requested model; the configured name is echoed back when omitted.
    #[serde(default)]
    pub model: Option<String>,
    /// The conversation, in any of the accepted message shapes.
    pub messages: Vec<IncomingMessage>,
    /// Whether to stream the response.
    #[serde(default)]
    pub stream: bool,
    /// Client-defined tools; never forwarded to the backend.
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
}

/// A Responses-API request as received from the client.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesRequest {
    /// Requested model; the configured name is echoed back when omitted.
    #[serde(default)]
    pub model: Option<String>,
    /// The input: a bare string or a list of items.
    pub input: ResponsesInput,
    /// Top-level system instructions.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Whether to stream the response.
    #[serde(default)]
    pub stream: bool,
    /// Client-defined tools; never forwarded to the backend.
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Why the response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The generation completed with text only.
    #[serde(rename = "stop")]
    Stop,
    /// At least one tool call was emitted.
    #[serde(rename = "tool_calls")]
    ToolCalls,
}

/// One streamed `chat.completion.chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Response id, shared by every chunk of one response.
    pub id: String,
    /// Always `"chat.completion.chunk"`.
    pub object: String,
    /// Unix timestamp of response creation.
    pub created: i64,
    /// Model name echoed to the client.
    pub model: String,
    /// Single-choice delta payload.
    pub choices: Vec<ChunkChoice>,
}

/// The one choice inside a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Always 0; the bridge generates one choice.
    pub index: u32,
    /// Incremental update.
    pub delta: Delta,
    /// Null until the terminal chunk.
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    /// `"assistant"`, sent on the first chunk only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Text appended to the message content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls appended to the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<SmallVec<[DeltaToolCall; 1]>>,
}

/// One tool call inside a delta.
///
/// The bridge emits each tool call whole, in a single chunk, with `index`
/// reflecting completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaToolCall {
    /// Position of this tool call in the message.
    pub index: u32,
    /// The bridge call id (`<name>__<hex>`).
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function name and arguments.
    pub function: FunctionPayload,
}

/// Function name plus JSON-string arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionPayload {
    /// The stripped tool name.
    pub name: String,
    /// Arguments as a compact JSON string.
    pub arguments: String,
}

/// The non-streaming `chat.completion` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Response id (`chatcmpl-…`).
    pub id: String,
    /// Always `"chat.completion"`.
    pub object: String,
    /// Unix timestamp of response creation.
    pub created: i64,
    /// Model name echoed to the client.
    pub model: String,
    /// The single generated choice.
    pub choices: Vec<CompletionChoice>,
}

/// The one choice of a non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Always 0.
    pub index: u32,
    /// The assembled assistant message.
    pub message: AssistantMessage,
    /// `tool_calls` iff any tool call was emitted, else `stop`.
    pub finish_reason: FinishReason,
}

/// The assistant message of a non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Always `"assistant"`.
    pub role: String,
    /// Message text; null when the response is tool calls only.
    pub content: Option<String>,
    /// Tool calls, when any were emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OutgoingToolCall>>,
}

/// One tool call in a non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingToolCall {
    /// The bridge call id (`<name>__<hex>`).
    pub id: String,
    /// Always `"function"`.
    #[serde(rename = "type")]
    pub call_type: String,
    /// Function name and arguments.
    pub function: FunctionPayload,
}

/// In-band error frame emitted after headers are already on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorFrame {
    /// The error payload.
    pub error: StreamErrorBody,
}

/// Error payload of an in-band error frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamErrorBody {
    /// Human-readable message.
    pub message: String,
    /// Always `"server_error"` for post-header failures.
    #[serde(rename = "type")]
    pub error_type: String,
}

impl StreamErrorFrame {
    /// Builds the standard post-header error frame.
    #[must_use]
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            error: StreamErrorBody {
                message: message.into(),
                error_type: "server_error".to_string(),
            },
        }
    }
}

/// Mints a fresh `chatcmpl-…` response id.
#[must_use]
pub fn response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

//! Response emitters: the OpenAI-shaped output side of the bridge.
//!
//! Both emitters implement the generation client's
//! [`TextAndToolEmitter`] sink, so the same detector-driven pipeline feeds
//! either a live `text/event-stream` or a single accumulated envelope.
//!
//! Finish-reason policy, shared by both: `tool_calls` iff at least one
//! tool call was emitted, else `stop`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use smallvec::smallvec;
use tokio::sync::mpsc;

use lumo_bridge_client::TextAndToolEmitter;
use lumo_bridge_common::tools::{CallId, ParsedToolCall};

use crate::openai::{
    AssistantMessage, ChatCompletion, ChatCompletionChunk, ChunkChoice, CompletionChoice, Delta,
    DeltaToolCall, FinishReason, FunctionPayload, OutgoingToolCall, StreamErrorFrame, response_id,
};

/// The SSE terminator every streaming response ends with.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Streams `chat.completion.chunk` frames into an mpsc channel.
///
/// The HTTP front-end forwards each string verbatim; everything here is
/// already `data: …\n\n` framed. Exactly one chunk carries a non-null
/// `finish_reason`, then [`DONE_FRAME`] follows.
pub struct StreamingEmitter {
    sink: mpsc::Sender<String>,
    id: String,
    created: i64,
    model: String,
    next_tool_index: u32,
    role_sent: bool,
    finished: bool,
}

impl StreamingEmitter {
    /// Creates an emitter for one response.
    #[must_use]
    pub fn new(model: impl Into<String>, sink: mpsc::Sender<String>) -> Self {
        Self {
            sink,
            id: response_id(),
            created: Utc::now().timestamp(),
            model: model.into(),
            next_tool_index: 0,
            role_sent: false,
            finished: false,
        }
    }

    /// The response id shared by every chunk.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether any tool call has been emitted so far.
    #[must_use]
    pub fn emitted_tool_calls(&self) -> bool {
        self.next_tool_index > 0
    }

    /// Writes the terminal chunk and the `[DONE]` sentinel.
    ///
    /// # Errors
    ///
    /// Fails when the client is no longer reading.
    pub async fn finish(mut self) -> Result<()> {
        let finish_reason = if self.emitted_tool_calls() {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        };

        let chunk = self.chunk(Delta::default(), Some(finish_reason));
        self.send_json(&chunk).await?;
        self.finished = true;
        self.sink
            .send(DONE_FRAME.to_string())
            .await
            .context("client stopped reading the stream")?;
        Ok(())
    }

    /// Emits the in-band error frame used after headers are sent, then
    /// ends the stream without a `[DONE]` sentinel.
    ///
    /// # Errors
    ///
    /// Fails when the client is no longer reading.
    pub async fn fail(mut self, message: impl Into<String>) -> Result<()> {
        let frame = StreamErrorFrame::server_error(message);
        self.send_json(&frame).await?;
        self.finished = true;
        Ok(())
    }

    fn chunk(&mut self, delta: Delta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        let delta = if self.role_sent {
            delta
        } else {
            self.role_sent = true;
            Delta {
                role: Some("assistant".to_string()),
                ..delta
            }
        };
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    async fn send_json(&self, payload: &impl serde::Serialize) -> Result<()> {
        let frame = format!(
            "data: {}\n\n",
            serde_json::to_string(payload).context("chunk serialization failed")?
        );
        self.sink
            .send(frame)
            .await
            .context("client stopped reading the stream")?;
        Ok(())
    }
}

impl Drop for StreamingEmitter {
    fn drop(&mut self) {
        if !self.finished {
            debug!("streaming emitter dropped before finish (client gone or error path)");
        }
    }
}

#[async_trait]
impl TextAndToolEmitter for StreamingEmitter {
    async fn emit_text_delta(&mut self, text: &str) -> Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let chunk = self.chunk(
            Delta {
                content: Some(text.to_string()),
                ..Delta::default()
            },
            None,
        );
        self.send_json(&chunk).await
    }

    async fn emit_tool_call(&mut self, call_id: &CallId, call: &ParsedToolCall) -> Result<()> {
        let index = self.next_tool_index;
        self.next_tool_index += 1;

        let chunk = self.chunk(
            Delta {
                tool_calls: Some(smallvec![DeltaToolCall {
                    index,
                    id: call_id.as_str().to_string(),
                    call_type: "function".to_string(),
                    function: FunctionPayload {
                        name: call.name.clone(),
                        arguments: call.arguments_json(),
                    },
                }]),
                ..Delta::default()
            },
            None,
        );
        self.send_json(&chunk).await
    }
}

/// Accumulates the whole response and produces one `chat.completion`.
#[derive(Debug)]
pub struct AccumulatingEmitter {
    id: String,
    created: i64,
    model: String,
    content: String,
    tool_calls: Vec<OutgoingToolCall>,
}

impl AccumulatingEmitter {
    /// Creates an emitter for one response.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: response_id(),
            created: Utc::now().timestamp(),
            model: model.into(),
            content: String::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Builds the final envelope.
    #[must_use]
    pub fn into_response(self) -> ChatCompletion {
        let finish_reason = if self.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };

        // OpenAI reports null content for pure tool-call responses.
        let content = if self.content.is_empty() && !self.tool_calls.is_empty() {
            None
        } else {
            Some(self.content)
        };

        ChatCompletion {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: if self.tool_calls.is_empty() {
                        None
                    } else {
                        Some(self.tool_calls)
                    },
                },
                finish_reason,
            }],
        }
    }
}

#[async_trait]
impl TextAndToolEmitter for AccumulatingEmitter {
    async fn emit_text_delta(&mut self, text: &str) -> Result<()> {
        self.content.push_str(text);
        Ok(())
    }

    async fn emit_tool_call(&mut self, call_id: &CallId, call: &ParsedToolCall) -> Result<()> {
        self.tool_calls.push(OutgoingToolCall {
            id: call_id.as_str().to_string(),
            call_type: "function".to_string(),
            function: FunctionPayload {
                name: call.name.clone(),
                arguments: call.arguments_json(),
            },
        });
        Ok(())
    }
}

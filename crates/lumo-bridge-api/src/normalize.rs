//! Request normalization: OpenAI message shapes into backend turns.
//!
//! The backend knows only flat `user` / `assistant` turns, so richer
//! client shapes fold down:
//!
//! - `system` / `developer` messages become the instruction string and are
//!   removed from the turn list,
//! - an assistant message carrying `tool_calls` becomes one assistant turn
//!   per call, content a JSON `function_call` envelope,
//! - a `role: "tool"` result (or a Responses `function_call_output` item)
//!   becomes a user turn whose content is the output envelope inside a json
//!   code fence - the backend ignores the object without the fence.
//!
//! User turns beginning with the local command token are passed through
//! untouched; the generation client decides whether to handle them.

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

use lumo_bridge_common::Turn;

/// Errors raised while normalizing a request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    /// A message carried a role the bridge does not understand.
    #[error("unsupported message role: {0}")]
    UnsupportedRole(String),
    /// A message's content was neither text nor text parts.
    #[error("message content is not text")]
    NonTextContent,
}

/// The normalized request handed to the bridge core.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedRequest {
    /// Flat conversation in the backend's model.
    pub turns: Vec<Turn>,
    /// Concatenated system/developer instructions, if any.
    pub instructions: Option<String>,
}

/// One Chat Completions message, in any of the three accepted shapes.
///
/// Shape is decided by field presence (one variant per shape), not by
/// inspecting raw JSON at use sites.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingMessage {
    /// `{role:"tool", tool_call_id, content}` - a tool result.
    ToolResult {
        /// Must be `"tool"`.
        role: String,
        /// The call this result answers, in our `<name>__<hex>` format
        /// when the call originated here.
        tool_call_id: String,
        /// The tool's output (string or arbitrary JSON).
        #[serde(default)]
        content: Value,
    },
    /// An assistant message carrying `tool_calls`.
    AssistantToolCalls {
        /// Must be `"assistant"`.
        role: String,
        /// Optional text alongside the calls.
        #[serde(default)]
        content: Option<Value>,
        /// The calls previously emitted by the bridge.
        tool_calls: Vec<IncomingToolCall>,
    },
    /// A plain `{role, content}` message.
    Plain {
        /// `system`, `developer`, `user` or `assistant`.
        role: String,
        /// Text content (string or text-part array).
        #[serde(default)]
        content: Value,
    },
}

/// A tool call echoed back by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingToolCall {
    /// The call id the bridge minted.
    pub id: String,
    /// The wrapped function invocation.
    pub function: IncomingFunctionCall,
}

/// Function name and arguments as echoed back by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingFunctionCall {
    /// The tool name.
    pub name: String,
    /// Arguments as a JSON string or an already-parsed object.
    #[serde(default)]
    pub arguments: Value,
}

/// The Responses-API `input` field: a bare string or a list of items.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    /// Shorthand for a single user message.
    Text(String),
    /// Structured input items.
    Items(Vec<ResponsesItem>),
}

/// One Responses-API input item.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResponsesItem {
    /// An item with an explicit `type` tag.
    Tagged(TaggedResponsesItem),
    /// A bare `{role, content}` message without a `type` tag.
    BareMessage {
        /// `system`, `developer`, `user` or `assistant`.
        role: String,
        /// Text content (string or text-part array).
        #[serde(default)]
        content: Value,
    },
}

/// The `type`-tagged Responses-API item shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaggedResponsesItem {
    /// A conversation message.
    Message {
        /// Message role.
        role: String,
        /// Text content (string or text-part array).
        #[serde(default)]
        content: Value,
    },
    /// A function call previously emitted by the bridge.
    FunctionCall {
        /// The call id the bridge minted.
        call_id: String,
        /// The tool name.
        name: String,
        /// Arguments as a JSON string or object.
        #[serde(default)]
        arguments: Value,
    },
    /// The client's output for a function call.
    FunctionCallOutput {
        /// The call this output answers.
        call_id: String,
        /// The tool's output.
        #[serde(default)]
        output: Value,
    },
}

/// Normalizes Chat Completions messages into turns plus instructions.
///
/// # Errors
///
/// Returns a [`NormalizeError`] for unknown roles or non-text content.
pub fn normalize_chat_messages(
    messages: &[IncomingMessage],
) -> Result<NormalizedRequest, NormalizeError> {
    let mut request = NormalizedRequest::default();
    let mut instructions: Vec<String> = Vec::new();

    for message in messages {
        match message {
            IncomingMessage::ToolResult {
                role,
                tool_call_id,
                content,
            } => {
                if role != "tool" {
                    return Err(NormalizeError::UnsupportedRole(role.clone()));
                }
                request
                    .turns
                    .push(tool_output_turn(tool_call_id, content.clone()));
            }
            IncomingMessage::AssistantToolCalls {
                role,
                content,
                tool_calls,
            } => {
                if role != "assistant" {
                    return Err(NormalizeError::UnsupportedRole(role.clone()));
                }
                if let Some(content) = content {
                    let text = content_text(content)?;
                    if !text.is_empty() {
                        request.turns.push(Turn::assistant(text));
                    }
                }
                for call in tool_calls {
                    request.turns.push(function_call_turn(
                        &call.id,
                        &call.function.name,
                        &call.function.arguments,
                    ));
                }
            }
            IncomingMessage::Plain { role, content } => {
                push_plain(&mut request.turns, &mut instructions, role, content)?;
            }
        }
    }

    if !instructions.is_empty() {
        request.instructions = Some(instructions.join("\n\n"));
    }
    Ok(request)
}

/// Normalizes Responses-API input into turns plus instructions.
///
/// Top-level `instructions` from the request are prepended to any
/// system/developer messages found among the items.
///
/// # Errors
///
/// Returns a [`NormalizeError`] for unknown roles or non-text content.
pub fn normalize_responses_input(
    input: &ResponsesInput,
    top_level_instructions: Option<&str>,
) -> Result<NormalizedRequest, NormalizeError> {
    let mut request = NormalizedRequest::default();
    let mut instructions: Vec<String> = Vec::new();
    if let Some(text) = top_level_instructions {
        if !text.is_empty() {
            instructions.push(text.to_string());
        }
    }

    match input {
        ResponsesInput::Text(text) => request.turns.push(Turn::user(text.clone())),
        ResponsesInput::Items(items) => {
            for item in items {
                match item {
                    ResponsesItem::BareMessage { role, content }
                    | ResponsesItem::Tagged(TaggedResponsesItem::Message { role, content }) => {
                        push_plain(&mut request.turns, &mut instructions, role, content)?;
                    }
                    ResponsesItem::Tagged(TaggedResponsesItem::FunctionCall {
                        call_id,
                        name,
                        arguments,
                    }) => {
                        request
                            .turns
                            .push(function_call_turn(call_id, name, arguments));
                    }
                    ResponsesItem::Tagged(TaggedResponsesItem::FunctionCallOutput {
                        call_id,
                        output,
                    }) => {
                        request.turns.push(tool_output_turn(call_id, output.clone()));
                    }
                }
            }
        }
    }

    if !instructions.is_empty() {
        request.instructions = Some(instructions.join("\n\n"));
    }
    Ok(request)
}

fn push_plain(
    turns: &mut Vec<Turn>,
    instructions: &mut Vec<String>,
    role: &str,
    content: &Value,
) -> Result<(), NormalizeError> {
    let text = content_text(content)?;
    match role {
        "system" | "developer" => {
            if !text.is_empty() {
                instructions.push(text);
            }
        }
        "user" => turns.push(Turn::user(text)),
        "assistant" => turns.push(Turn::assistant(text)),
        other => return Err(NormalizeError::UnsupportedRole(other.to_string())),
    }
    Ok(())
}

/// The `function_call` envelope turn for an assistant-side tool call.
///
/// `arguments` is normalized to a JSON string (object inputs are
/// re-stringified) so the envelope is byte-stable across clients.
fn function_call_turn(call_id: &str, name: &str, arguments: &Value) -> Turn {
    let arguments = match arguments {
        Value::String(s) => s.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    };
    let envelope = json!({
        "type": "function_call",
        "call_id": call_id,
        "name": name,
        "arguments": arguments,
    });
    Turn::assistant(envelope.to_string())
}

/// The fenced `function_call_output` turn for a tool result.
///
/// The ```json fence is load-bearing: the backend treats the object as
/// opaque prose without it.
fn tool_output_turn(call_id: &str, output: Value) -> Turn {
    let envelope = json!({
        "type": "function_call_output",
        "call_id": call_id,
        "output": output,
    });
    Turn::user(format!("```json\n{envelope}\n```"))
}

/// Extracts text from a content value: a string, null, or an array of
/// text parts (`{"type":"text","text":…}` / `{"type":"input_text",…}`).
fn content_text(content: &Value) -> Result<String, NormalizeError> {
    match content {
        Value::String(text) => Ok(text.clone()),
        Value::Null => Ok(String::new()),
        Value::Array(parts) => {
            let mut text = String::new();
            for part in parts {
                match part.get("text").and_then(Value::as_str) {
                    Some(fragment) => text.push_str(fragment),
                    None => return Err(NormalizeError::NonTextContent),
                }
            }
            Ok(text)
        }
        _ => Err(NormalizeError::NonTextContent),
    }
}

//! Tool definitions, parsed tool calls, and call-id handling.
//!
//! Clients advertise "custom" tools in either of the two OpenAI wire shapes
//! (nested under `function`, or flat). The backend never sees these
//! definitions; they are folded into instruction text, and invocations come
//! back as JSON objects embedded in the assistant's text stream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Separator between the tool name and the random suffix in a call id.
pub const CALL_ID_SEPARATOR: &str = "__";

/// Number of random bytes backing the hex suffix of a call id (24 hex chars).
const CALL_ID_SUFFIX_BYTES: usize = 12;

/// The function portion of a tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Tool name as the client registered it.
    pub name: String,
    /// Human-readable description, shown to the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// A client-supplied tool definition, in either accepted wire shape.
///
/// ```
/// use lumo_bridge_common::tools::ToolDefinition;
///
/// let nested: ToolDefinition = serde_json::from_str(
///     r#"{"type":"function","function":{"name":"search"}}"#,
/// ).unwrap();
/// let flat: ToolDefinition = serde_json::from_str(r#"{"name":"search"}"#).unwrap();
/// assert_eq!(nested.name(), flat.name());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolDefinition {
    /// `{ "type": "function", "function": { … } }`
    Nested {
        /// Tool type, in practice always `"function"`.
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        tool_type: Option<String>,
        /// The wrapped function definition.
        function: FunctionSpec,
    },
    /// `{ "name": …, "description": …, "parameters": … }`
    Flat(FunctionSpec),
}

impl ToolDefinition {
    /// The tool's registered name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec().name
    }

    /// The tool's description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.spec().description.as_deref()
    }

    /// The tool's JSON-schema parameters, if any.
    #[must_use]
    pub fn parameters(&self) -> Option<&Value> {
        self.spec().parameters.as_ref()
    }

    fn spec(&self) -> &FunctionSpec {
        match self {
            Self::Nested { function, .. } => function,
            Self::Flat(spec) => spec,
        }
    }
}

/// Why a JSON candidate was rejected as a tool call.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolCallShapeError {
    /// The candidate was valid JSON but not an object.
    #[error("tool call candidate is not a JSON object")]
    NotAnObject,
    /// The object has no string-valued `name` field.
    #[error("tool call candidate has no string `name`")]
    MissingName,
    /// Neither `arguments` nor `parameters` holds an object (after one level
    /// of string decoding).
    #[error("tool call `arguments` is not an object")]
    BadArguments,
}

/// A tool invocation extracted from the assistant's output.
///
/// Produced both by the streaming detector (from text) and by the native
/// tool processor (from the backend's `tool_call` SSE target). `arguments`
/// is always a JSON object; string-encoded arguments are decoded one level
/// during parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedToolCall {
    /// The tool name, possibly still carrying the configured prefix.
    pub name: String,
    /// The call's arguments as a JSON object.
    pub arguments: Map<String, Value>,
}

impl ParsedToolCall {
    /// Parses a JSON value into a tool call, applying the acceptance rules.
    ///
    /// The value must be an object with a string `name` and an object-valued
    /// `arguments` (or `parameters`, accepted as an alias). A string-valued
    /// `arguments` is JSON-decoded one level; anything else is rejected.
    /// A missing `arguments` key is treated as an empty object.
    ///
    /// # Errors
    ///
    /// Returns a [`ToolCallShapeError`] describing which rule failed.
    pub fn from_value(value: &Value) -> Result<Self, ToolCallShapeError> {
        let object = value.as_object().ok_or(ToolCallShapeError::NotAnObject)?;

        let name = object
            .get("name")
            .and_then(Value::as_str)
            .ok_or(ToolCallShapeError::MissingName)?
            .to_string();

        let raw_arguments = object
            .get("arguments")
            .or_else(|| object.get("parameters"));

        let arguments = match raw_arguments {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            // Some backends double-encode arguments as a JSON string.
            Some(Value::String(encoded)) => serde_json::from_str::<Value>(encoded)
                .ok()
                .and_then(|decoded| decoded.as_object().cloned())
                .ok_or(ToolCallShapeError::BadArguments)?,
            Some(_) => return Err(ToolCallShapeError::BadArguments),
        };

        Ok(Self { name, arguments })
    }

    /// Strips `prefix` from the tool name, if present.
    ///
    /// Returns `true` when the prefix was found and removed.
    pub fn strip_prefix(&mut self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return false;
        }
        match self.name.strip_prefix(prefix) {
            Some(stripped) => {
                self.name = stripped.to_string();
                true
            }
            None => false,
        }
    }

    /// Serializes the arguments to the compact JSON string form the OpenAI
    /// wire shapes carry.
    #[must_use]
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

/// A stable opaque token identifying one tool invocation.
///
/// Format: `<tool-name>__<24 lowercase hex>`. Embedding the tool name lets
/// downstream `function_call_output` messages route back to the originating
/// tool without a lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Generates a fresh call id for `tool_name`.
    ///
    /// The 24-hex suffix is drawn from the operating system's CSPRNG, so ids
    /// are unique for all practical purposes. `tool_name` must not itself
    /// contain `__`; callers are responsible for escaping before
    /// registration.
    #[must_use]
    pub fn generate(tool_name: &str) -> Self {
        let mut suffix = [0u8; CALL_ID_SUFFIX_BYTES];
        rand::Rng::fill(&mut rand::rngs::OsRng, &mut suffix[..]);
        Self(format!(
            "{tool_name}{CALL_ID_SEPARATOR}{}",
            hex::encode(suffix)
        ))
    }

    /// Wraps an id received from a client, without validation.
    #[must_use]
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The full id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recovers the tool name embedded in this id, if the id is in our
    /// `<name>__<hex>` format.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        let (name, suffix) = self.0.rsplit_once(CALL_ID_SEPARATOR)?;
        if name.is_empty() || suffix.len() != CALL_ID_SUFFIX_BYTES * 2 {
            return None;
        }
        suffix
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            .then_some(name)
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn parses_object_arguments() {
        let call =
            ParsedToolCall::from_value(&json!({"name": "get_weather", "arguments": {"city": "Paris"}}))
                .unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments.get("city"), Some(&json!("Paris")));
    }

    #[test]
    fn accepts_parameters_alias() {
        let call =
            ParsedToolCall::from_value(&json!({"name": "t", "parameters": {"a": 1}})).unwrap();
        assert_eq!(call.arguments.get("a"), Some(&json!(1)));
    }

    #[test]
    fn decodes_string_encoded_arguments_one_level() {
        let call = ParsedToolCall::from_value(
            &json!({"name": "t", "arguments": "{\"city\":\"Paris\"}"}),
        )
        .unwrap();
        assert_eq!(call.arguments.get("city"), Some(&json!("Paris")));
    }

    #[test]
    fn missing_arguments_is_empty_object() {
        let call = ParsedToolCall::from_value(&json!({"name": "t"})).unwrap();
        assert!(call.arguments.is_empty());
    }

    #[test]
    fn rejects_bad_shapes() {
        assert_eq!(
            ParsedToolCall::from_value(&json!("nope")),
            Err(ToolCallShapeError::NotAnObject)
        );
        assert_eq!(
            ParsedToolCall::from_value(&json!({"arguments": {}})),
            Err(ToolCallShapeError::MissingName)
        );
        assert_eq!(
            ParsedToolCall::from_value(&json!({"name": "t", "arguments": [1, 2]})),
            Err(ToolCallShapeError::BadArguments)
        );
        assert_eq!(
            ParsedToolCall::from_value(&json!({"name": "t", "arguments": "not json"})),
            Err(ToolCallShapeError::BadArguments)
        );
    }

    #[test]
    fn strip_prefix_only_when_present() {
        let mut call =
            ParsedToolCall::from_value(&json!({"name": "user:search", "arguments": {}})).unwrap();
        assert!(call.strip_prefix("user:"));
        assert_eq!(call.name, "search");
        assert!(!call.strip_prefix("user:"));
        assert_eq!(call.name, "search");
    }

    #[test]
    fn call_id_round_trips_tool_name() {
        let id = CallId::generate("search");
        assert_eq!(id.tool_name(), Some("search"));

        let (_, suffix) = id.as_str().rsplit_once("__").unwrap();
        assert_eq!(suffix.len(), 24);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn call_ids_are_unique() {
        let a = CallId::generate("t");
        let b = CallId::generate("t");
        assert_ne!(a, b);
    }

    #[test]
    fn foreign_call_ids_yield_no_tool_name() {
        assert_eq!(CallId::from_raw("call_abc123").tool_name(), None);
        assert_eq!(CallId::from_raw("__deadbeef").tool_name(), None);
        // Wrong suffix length.
        assert_eq!(CallId::from_raw("tool__abcd").tool_name(), None);
    }

    #[test]
    fn tool_definition_both_shapes() {
        let nested: ToolDefinition = serde_json::from_value(json!({
            "type": "function",
            "function": {"name": "search", "description": "d", "parameters": {"type": "object"}}
        }))
        .unwrap();
        assert_eq!(nested.name(), "search");
        assert_eq!(nested.description(), Some("d"));
        assert!(nested.parameters().is_some());

        let flat: ToolDefinition = serde_json::from_value(json!({"name": "search"})).unwrap();
        assert_eq!(flat.name(), "search");
        assert_eq!(flat.description(), None);
    }
}

//! # lumo-bridge-common
//!
//! Shared types for the lumo-bridge translating proxy:
//! - Conversation [`Turn`]s in the backend's flat user/assistant model
//! - Tool definitions, parsed tool calls and call ids
//! - Bridge configuration loaded from TOML
//! - The `{{var}}` template interpolator for instruction fragments
//! - Process-wide metric counters
//!
//! ## Example
//!
//! ```
//! use lumo_bridge_common::{CallId, ParsedToolCall, Turn};
//!
//! let turn = Turn::user("What's the weather in Paris?");
//! assert!(!turn.is_command());
//!
//! let call = ParsedToolCall::from_value(&serde_json::json!({
//!     "name": "get_weather",
//!     "arguments": {"city": "Paris"},
//! })).unwrap();
//!
//! let id = CallId::generate(&call.name);
//! assert_eq!(id.tool_name(), Some("get_weather"));
//! ```

pub mod chat;
pub mod config;
pub mod metrics;
pub mod template;
pub mod tools;

pub use chat::{Turn, TurnRole};
pub use config::{
    BackendConfig, BridgeConfig, CommandsConfig, ConfigError, CustomToolsConfig,
    InstructionTemplates,
};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use tools::{CallId, FunctionSpec, ParsedToolCall, ToolCallShapeError, ToolDefinition};

//! Bridge configuration.
//!
//! Loaded once at startup from TOML and treated as immutable afterwards.
//! Every section defaults sensibly, so an empty file is a valid
//! configuration.
//!
//! ## Example configuration
//!
//! ```toml
//! model = "lumo"
//! enable_web_search = true
//!
//! [backend]
//! base_url = "https://lumo-api.proton.me"
//! generation_path = "/v1/generation"
//!
//! [custom_tools]
//! enabled = true
//! prefix = "user:"
//!
//! [commands]
//! enabled = true
//! ```

use std::fs;
use std::path::Path;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid TOML (or has wrong types).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Model name echoed back to clients when they omit one.
    pub model: String,
    /// Backend connection settings.
    pub backend: BackendConfig,
    /// Custom-tool detection settings.
    pub custom_tools: CustomToolsConfig,
    /// Whether to advertise the backend's external native tool set
    /// (web search, weather, stock, cryptocurrency).
    pub enable_web_search: bool,
    /// Instruction text fragments composed via the template interpolator.
    pub instructions: InstructionTemplates,
    /// Local `/`-command handling.
    pub commands: CommandsConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model: "lumo".to_string(),
            backend: BackendConfig::default(),
            custom_tools: CustomToolsConfig::default(),
            enable_web_search: false,
            instructions: InstructionTemplates::default(),
            commands: CommandsConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(Self::from_str(&contents)?)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `toml::de::Error` when the document is malformed.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the generation backend.
    pub base_url: String,
    /// Path of the generation endpoint, appended to `base_url`.
    pub generation_path: String,
    /// The backend's published RSA public key in PEM form, used to wrap the
    /// per-request symmetric key. Encryption is skipped when absent.
    pub public_key_pem: Option<String>,
    /// Bearer token for the backend (stored securely).
    ///
    /// Never serialized, to prevent accidental exposure.
    #[serde(skip_serializing, default)]
    pub access_token: Option<SecretString>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://lumo-api.proton.me".to_string(),
            generation_path: "/v1/generation".to_string(),
            public_key_pem: None,
            access_token: None,
        }
    }
}

/// Settings for custom-tool detection in the assistant text stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomToolsConfig {
    /// Whether the streaming detector runs at all.
    pub enabled: bool,
    /// Prefix added to tool names when advertising and stripped after
    /// detection (e.g. `"user:"`).
    pub prefix: String,
}

impl Default for CustomToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "user:".to_string(),
        }
    }
}

/// Local command handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    /// Whether `/`-prefixed user turns are handled locally instead of being
    /// sent to the backend.
    pub enabled: bool,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Instruction text fragments.
///
/// The composed instruction text is built by rendering `template` with the
/// variables `prefix`, `tools`, `clientInstructions`, `forTools` and
/// `fallback`, where `forTools` and `fallback` are themselves rendered
/// first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstructionTemplates {
    /// Top-level composition template.
    pub template: String,
    /// Fragment used when no custom tools are registered.
    pub fallback: String,
    /// Fragment advertising the custom tools.
    pub for_tools: String,
    /// Instruction sent on the bounce request after a misrouted tool call.
    /// The pretty-printed example JSON is appended after this text.
    pub for_tool_bounce: String,
}

impl Default for InstructionTemplates {
    fn default() -> Self {
        Self {
            template: "{{#if tools}}{{forTools}}{{else}}{{fallback}}{{/if}}\
                       {{#if clientInstructions}}\n\n{{clientInstructions}}{{/if}}"
                .to_string(),
            fallback: String::new(),
            for_tools: "You can use external tools. To call one, reply with a single JSON \
                        object inside a ```json code fence, shaped exactly as \
                        {\"name\": \"{{prefix}}tool_name\", \"arguments\": { ... }}. \
                        Do not put any other text inside the fence.\n\nAvailable tools:\n{{tools}}"
                .to_string(),
            for_tool_bounce: "That tool cannot be invoked on this channel. Repeat the call as a \
                              single JSON object inside a ```json code fence, exactly like this \
                              example:"
                .to_string(),
        }
    }
}

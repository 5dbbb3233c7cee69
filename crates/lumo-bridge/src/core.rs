//! The bridge facade: one object wiring normalizer, serializer,
//! generation client and emitters together.
//!
//! Initialization is a linear chain - config, then metrics, then
//! serializer, then generation client - and every component receives its
//! dependencies explicitly; nothing global is consulted after startup.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;

use lumo_bridge_api::emit::{AccumulatingEmitter, StreamingEmitter};
use lumo_bridge_api::normalize::{normalize_chat_messages, normalize_responses_input};
use lumo_bridge_api::openai::{ChatCompletion, ChatCompletionsRequest, ResponsesRequest};
use lumo_bridge_client::commands::CommandHandler;
use lumo_bridge_client::generation::{GenerationClient, GenerationOptions, TextAndToolEmitter};
use lumo_bridge_client::serializer::GenerationSerializer;
use lumo_bridge_client::{ChatResult, ClientError};
use lumo_bridge_common::config::BridgeConfig;
use lumo_bridge_common::metrics::BridgeMetrics;
use lumo_bridge_common::template::interpolate;
use lumo_bridge_common::tools::ToolDefinition;

use crate::error::BridgeError;

/// The translating proxy core.
///
/// One instance serves the whole process. Every chat call is serialized
/// through the generation slot; per-call state lives inside the call.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    metrics: BridgeMetrics,
    serializer: GenerationSerializer,
    client: GenerationClient,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Builds the bridge from configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`] when the backend URL or public key in the
    /// configuration is unusable.
    pub fn new(config: Arc<BridgeConfig>) -> Result<Self, BridgeError> {
        let metrics = BridgeMetrics::new();
        let client = GenerationClient::new(Arc::clone(&config), metrics.clone())?;
        Ok(Self {
            config,
            metrics,
            serializer: GenerationSerializer::new(),
            client,
        })
    }

    /// Attaches the local `/`-command handler.
    #[must_use]
    pub fn with_command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.client = self.client.with_command_handler(handler);
        self
    }

    /// The process-wide counters.
    #[must_use]
    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    /// The generation serializer, for observability endpoints.
    #[must_use]
    pub fn serializer(&self) -> &GenerationSerializer {
        &self.serializer
    }

    /// Handles a non-streaming Chat Completions request.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`] for malformed requests or failed
    /// generations; the front-end maps it to an HTTP error envelope.
    pub async fn chat_completions(
        &self,
        request: &ChatCompletionsRequest,
        request_title: bool,
    ) -> Result<ChatCompletion, BridgeError> {
        let normalized = normalize_chat_messages(&request.messages)?;
        let options = self.build_options(
            request.tools.as_deref().unwrap_or_default(),
            normalized.instructions.as_deref(),
            request_title,
        );

        let mut emitter = AccumulatingEmitter::new(self.model_for(request.model.as_deref()));
        self.run_generation(normalized.turns, &mut emitter, &options)
            .await?;
        Ok(emitter.into_response())
    }

    /// Handles a streaming Chat Completions request, writing framed SSE
    /// strings into `sink`.
    ///
    /// Failures after the first frame are reported in-band as an error
    /// frame; the returned error is for logging only at that point.
    ///
    /// # Errors
    ///
    /// Returns a [`BridgeError`] when normalization or the generation
    /// fails, or when the client stops reading.
    pub async fn chat_completions_stream(
        &self,
        request: &ChatCompletionsRequest,
        request_title: bool,
        sink: mpsc::Sender<String>,
    ) -> Result<(), BridgeError> {
        let normalized = normalize_chat_messages(&request.messages)?;
        let options = self.build_options(
            request.tools.as_deref().unwrap_or_default(),
            normalized.instructions.as_deref(),
            request_title,
        );

        let mut emitter = StreamingEmitter::new(self.model_for(request.model.as_deref()), sink);
        match self
            .run_generation(normalized.turns, &mut emitter, &options)
            .await
        {
            Ok(_) => emitter
                .finish()
                .await
                .map_err(|e| BridgeError::Stream(e.to_string())),
            Err(BridgeError::Client(ClientError::Canceled)) => {
                debug!("client went away mid-stream");
                Err(BridgeError::Client(ClientError::Canceled))
            }
            Err(error) => {
                warn!("generation failed mid-stream: {error}");
                if let Err(write_error) = emitter.fail(error.to_string()).await {
                    debug!("could not write in-band error frame: {write_error}");
                }
                Err(error)
            }
        }
    }

    /// Handles a non-streaming Responses-API request.
    ///
    /// The response is the same `chat.completion` envelope the Chat
    /// Completions surface produces.
    ///
    /// # Errors
    ///
    /// See [`Self::chat_completions`].
    pub async fn responses(
        &self,
        request: &ResponsesRequest,
        request_title: bool,
    ) -> Result<ChatCompletion, BridgeError> {
        let normalized =
            normalize_responses_input(&request.input, request.instructions.as_deref())?;
        let options = self.build_options(
            request.tools.as_deref().unwrap_or_default(),
            normalized.instructions.as_deref(),
            request_title,
        );

        let mut emitter = AccumulatingEmitter::new(self.model_for(request.model.as_deref()));
        self.run_generation(normalized.turns, &mut emitter, &options)
            .await?;
        Ok(emitter.into_response())
    }

    /// Handles a streaming Responses-API request.
    ///
    /// # Errors
    ///
    /// See [`Self::chat_completions_stream`].
    pub async fn responses_stream(
        &self,
        request: &ResponsesRequest,
        request_title: bool,
        sink: mpsc::Sender<String>,
    ) -> Result<(), BridgeError> {
        let normalized =
            normalize_responses_input(&request.input, request.instructions.as_deref())?;
        let options = self.build_options(
            request.tools.as_deref().unwrap_or_default(),
            normalized.instructions.as_deref(),
            request_title,
        );

        let mut emitter = StreamingEmitter::new(self.model_for(request.model.as_deref()), sink);
        match self
            .run_generation(normalized.turns, &mut emitter, &options)
            .await
        {
            Ok(_) => emitter
                .finish()
                .await
                .map_err(|e| BridgeError::Stream(e.to_string())),
            Err(error) => {
                if let Err(write_error) = emitter.fail(error.to_string()).await {
                    debug!("could not write in-band error frame: {write_error}");
                }
                Err(error)
            }
        }
    }

    /// Runs one generation through the serializer slot.
    async fn run_generation(
        &self,
        turns: Vec<lumo_bridge_common::Turn>,
        emitter: &mut dyn TextAndToolEmitter,
        options: &GenerationOptions,
    ) -> Result<ChatResult, BridgeError> {
        let result = self
            .serializer
            .run(self.client.chat_with_history(turns, Some(emitter), options))
            .await?;
        Ok(result)
    }

    fn model_for(&self, requested: Option<&str>) -> String {
        requested.unwrap_or(&self.config.model).to_string()
    }

    fn build_options(
        &self,
        tools: &[ToolDefinition],
        client_instructions: Option<&str>,
        request_title: bool,
    ) -> GenerationOptions {
        GenerationOptions::builder()
            .instructions(self.compose_instructions(tools, client_instructions))
            .request_title(request_title)
            .build()
    }

    /// Composes the instruction text from the configured templates.
    ///
    /// Custom tools are advertised here, as instruction prose, because the
    /// backend must see them as string content - never as native tool
    /// definitions. Names carry the configured prefix; the detector strips
    /// it again after the model echoes it back.
    fn compose_instructions(
        &self,
        tools: &[ToolDefinition],
        client_instructions: Option<&str>,
    ) -> Option<String> {
        let prefix = &self.config.custom_tools.prefix;
        let tools_text = if self.config.custom_tools.enabled {
            describe_tools(tools, prefix)
        } else {
            String::new()
        };

        let mut vars: HashMap<&str, String> = HashMap::new();
        vars.insert("prefix", prefix.clone());
        vars.insert("tools", tools_text);
        vars.insert(
            "clientInstructions",
            client_instructions.unwrap_or_default().to_string(),
        );

        let for_tools = interpolate(&self.config.instructions.for_tools, &vars);
        let fallback = interpolate(&self.config.instructions.fallback, &vars);
        vars.insert("forTools", for_tools);
        vars.insert("fallback", fallback);

        let composed = interpolate(&self.config.instructions.template, &vars);
        let trimmed = composed.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// One line per tool: prefixed name, description, parameter schema.
fn describe_tools(tools: &[ToolDefinition], prefix: &str) -> String {
    let mut lines = Vec::with_capacity(tools.len());
    for tool in tools {
        let mut line = format!("- {prefix}{}", tool.name());
        if let Some(description) = tool.description() {
            line.push_str(": ");
            line.push_str(description);
        }
        if let Some(parameters) = tool.parameters() {
            line.push_str("\n  parameters: ");
            line.push_str(&parameters.to_string());
        }
        lines.push(line);
    }
    lines.join("\n")
}

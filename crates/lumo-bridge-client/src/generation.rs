//! The generation client: encryption, backend I/O, SSE dispatch, and the
//! misroute bounce loop.
//!
//! One call to [`GenerationClient::chat_with_history`] performs up to two
//! backend generations: the main pass, plus a single bounce pass when the
//! backend misroutes a client-defined tool through its native channel. The
//! bounce replays the conversation with the first pass's text and an
//! explicit instruction to re-emit the call as text; the inner pass never
//! bounces again.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, warn};
use reqwest_eventsource::{Event, EventSource};
use secrecy::{ExposeSecret, SecretString};
use typed_builder::TypedBuilder;

use lumo_bridge_common::config::BridgeConfig;
use lumo_bridge_common::metrics::BridgeMetrics;
use lumo_bridge_common::tools::{CallId, ParsedToolCall};
use lumo_bridge_common::{Turn, TurnRole};
use lumo_bridge_detect::{DetectorEvent, ProcessOutput, StreamingToolDetector};

use crate::NoRetryPolicy;
use crate::commands::CommandHandler;
use crate::crypto::{RequestCipher, TurnCrypto, chunk_associated_data, turn_associated_data};
use crate::error::ClientError;
use crate::native::{NativeToolProcessor, advertised_tools};
use crate::wire::{GenerationRequest, ServerFrame, Target};

/// Longest title returned to clients, in characters.
const MAX_TITLE_CHARS: usize = 100;

/// Where to inject project instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectInto {
    /// Prepend to the first eligible user turn.
    First,
    /// Prepend to the last eligible user turn.
    Last,
}

/// Per-call options for a generation.
#[derive(Debug, Clone, TypedBuilder)]
pub struct GenerationOptions {
    /// Encrypt turn contents and decrypt response chunks.
    #[builder(default = true)]
    pub enable_encryption: bool,
    /// Override the backend generation path for this call.
    #[builder(default)]
    pub endpoint: Option<String>,
    /// Also request the `title` target (used for new conversations).
    #[builder(default = false)]
    pub request_title: bool,
    /// Project instructions transiently prepended to a user turn before
    /// encryption; never persisted.
    #[builder(default)]
    pub instructions: Option<String>,
    /// Which user turn receives the instructions.
    #[builder(default = InjectInto::Last)]
    pub inject_instructions_into: InjectInto,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// What one chat call produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResult {
    /// The assistant text, after tool-call extraction.
    pub text: String,
    /// The generated title, post-processed, when the `title` target was
    /// requested and produced content.
    pub title: Option<String>,
    /// Whether the backend misrouted a custom tool through its native
    /// channel during this pass.
    pub misrouted: bool,
    /// The first tool call observed on the native channel.
    pub native_tool_call: Option<ParsedToolCall>,
    /// Whether a native tool result reported an error.
    pub native_tool_call_failed: bool,
    /// How many custom tool calls were emitted to the caller.
    pub tool_calls_emitted: usize,
}

/// Sink for the translated stream: text deltas and completed tool calls.
///
/// The streaming and accumulating response processors are two
/// implementations of this trait sharing the same detector driver inside
/// the generation client.
#[async_trait]
pub trait TextAndToolEmitter: Send {
    /// Forwards a text delta to the client.
    async fn emit_text_delta(&mut self, text: &str) -> Result<()>;

    /// Forwards one completed tool call with its freshly minted call id.
    async fn emit_tool_call(&mut self, call_id: &CallId, call: &ParsedToolCall) -> Result<()>;
}

/// Client for the generation backend.
///
/// Owns the HTTP client, the optional turn encryption material, and the
/// optional local command handler. Per-generation state (detector, native
/// tool processor, request cipher) is created fresh for every pass and
/// never shared.
pub struct GenerationClient {
    http: reqwest::Client,
    config: Arc<BridgeConfig>,
    crypto: Option<TurnCrypto>,
    commands: Option<Arc<dyn CommandHandler>>,
    metrics: BridgeMetrics,
    access_token: Option<SecretString>,
}

impl std::fmt::Debug for GenerationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationClient")
            .field("config", &self.config)
            .field("encryption", &self.crypto.is_some())
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl GenerationClient {
    /// Creates a client from the bridge configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] for an unparseable backend
    /// URL or public key, and [`ClientError::Network`] if the HTTP client
    /// cannot be built.
    pub fn new(config: Arc<BridgeConfig>, metrics: BridgeMetrics) -> Result<Self, ClientError> {
        let base = format!(
            "{}{}",
            config.backend.base_url.trim_end_matches('/'),
            config.backend.generation_path
        );
        reqwest::Url::parse(&base)
            .map_err(|e| ClientError::Configuration(format!("invalid backend URL '{base}': {e}")))?;

        let crypto = config
            .backend
            .public_key_pem
            .as_deref()
            .map(TurnCrypto::from_pem)
            .transpose()?;

        let access_token = config.backend.access_token.clone();

        Ok(Self {
            http: reqwest::Client::builder().build()?,
            config,
            crypto,
            commands: None,
            metrics,
            access_token,
        })
    }

    /// Attaches the local command handler.
    #[must_use]
    pub fn with_command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands = Some(handler);
        self
    }

    /// Sends a single user message.
    ///
    /// # Errors
    ///
    /// See [`Self::chat_with_history`].
    pub async fn chat(
        &self,
        message: impl Into<String> + Send,
        emitter: Option<&mut dyn TextAndToolEmitter>,
        options: &GenerationOptions,
    ) -> Result<ChatResult, ClientError> {
        self.chat_with_history(vec![Turn::user(message)], emitter, options)
            .await
    }

    /// Runs a generation over a full conversation.
    ///
    /// Commands short-circuit before anything touches the wire. A misroute
    /// on the first pass triggers exactly one bounce; the total number of
    /// backend requests per call is at most two.
    ///
    /// # Errors
    ///
    /// Returns a [`ClientError`] for terminal backend frames, transport
    /// failures, or a failed command handler. An emitter that stops
    /// accepting output is treated as [`ClientError::Canceled`].
    pub async fn chat_with_history(
        &self,
        turns: Vec<Turn>,
        mut emitter: Option<&mut dyn TextAndToolEmitter>,
        options: &GenerationOptions,
    ) -> Result<ChatResult, ClientError> {
        if self.config.commands.enabled {
            if let (Some(handler), Some(last)) = (&self.commands, turns.last()) {
                if last.is_command() {
                    debug!("handling command turn locally");
                    let text = handler
                        .handle(&last.content)
                        .await
                        .map_err(|e| ClientError::Command(e.to_string()))?;
                    if let Some(emitter) = emitter.as_deref_mut() {
                        emitter
                            .emit_text_delta(&text)
                            .await
                            .map_err(|_| ClientError::Canceled)?;
                    }
                    return Ok(ChatResult {
                        text,
                        ..ChatResult::default()
                    });
                }
            }
        }

        let (first, misrouted_call) = self
            .generate(&turns, &mut emitter, options, false)
            .await?;

        if !first.misrouted {
            return Ok(first);
        }
        let Some(misrouted_call) = misrouted_call else {
            // Flagged without a captured call: nothing to bounce on.
            return Ok(first);
        };

        self.metrics.incr_bounce();
        debug!(
            "bouncing misrouted tool call '{}' back through the text channel",
            misrouted_call.name
        );
        let bounce = self.bounce_turns(turns, &first.text, &misrouted_call)?;
        let (result, _) = self.generate(&bounce, &mut emitter, options, true).await?;
        Ok(result)
    }

    /// One backend pass. Returns the result plus the first misrouted call,
    /// which the caller needs to build the bounce request.
    async fn generate(
        &self,
        turns: &[Turn],
        emitter: &mut Option<&mut dyn TextAndToolEmitter>,
        options: &GenerationOptions,
        is_bounce: bool,
    ) -> Result<(ChatResult, Option<ParsedToolCall>), ClientError> {
        let mut outbound = turns.to_vec();

        if let Some(instructions) = options.instructions.as_deref() {
            self.inject_instructions(&mut outbound, instructions, options.inject_instructions_into);
        }

        let cipher = if options.enable_encryption {
            match &self.crypto {
                Some(crypto) => Some(crypto.begin_request()?),
                None => {
                    debug!("encryption requested but no backend public key configured");
                    None
                }
            }
        } else {
            None
        };

        if let Some(cipher) = &cipher {
            for (index, turn) in outbound.iter_mut().enumerate() {
                let ad = turn_associated_data(cipher.request_id(), index);
                turn.content = cipher.encrypt(&ad, &turn.content)?;
            }
        }

        let mut request = GenerationRequest::new(
            outbound,
            advertised_tools(self.config.enable_web_search),
            options.request_title,
        );
        if let Some(cipher) = &cipher {
            request.request_key = Some(cipher.wrapped_key().to_string());
            request.request_id = Some(cipher.request_id().to_string());
        }

        let url = self.endpoint_url(options.endpoint.as_deref())?;
        let mut builder = self.http.post(url).json(&request);
        if let Some(token) = &self.access_token {
            builder = builder.header(
                "Authorization",
                format!("Bearer {}", token.expose_secret()),
            );
        }

        let mut source = EventSource::new(builder)
            .map_err(|e| ClientError::Configuration(format!("cannot open event source: {e}")))?;
        source.set_retry_policy(Box::new(NoRetryPolicy));

        self.consume_stream(&mut source, cipher.as_ref(), emitter, is_bounce)
            .await
    }

    /// Reads the SSE stream to completion, dispatching chunks by target.
    async fn consume_stream(
        &self,
        source: &mut EventSource,
        cipher: Option<&RequestCipher>,
        emitter: &mut Option<&mut dyn TextAndToolEmitter>,
        is_bounce: bool,
    ) -> Result<(ChatResult, Option<ParsedToolCall>), ClientError> {
        let mut detector = self.config.custom_tools.enabled.then(|| {
            StreamingToolDetector::new(
                self.config.custom_tools.prefix.clone(),
                self.metrics.clone(),
            )
        });
        let mut processor = NativeToolProcessor::new(is_bounce, self.metrics.clone());
        let mut result = ChatResult::default();
        let mut title = String::new();

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => debug!("generation stream opened"),
                Ok(Event::Message(message)) => {
                    let frame = match serde_json::from_str::<ServerFrame>(&message.data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("skipping undecodable SSE frame: {e}");
                            continue;
                        }
                    };

                    match frame {
                        ServerFrame::TokenData {
                            target,
                            content,
                            encrypted,
                        } => {
                            let text = self.open_chunk(cipher, encrypted, content);
                            match target {
                                Target::Message => {
                                    self.handle_message_text(
                                        &text,
                                        detector.as_mut(),
                                        emitter,
                                        &mut result,
                                    )
                                    .await?;
                                }
                                Target::Title => title.push_str(&text),
                                Target::ToolCall => {
                                    if processor.feed_tool_call(&text) {
                                        debug!("misroute observed, aborting stream for bounce");
                                        source.close();
                                        break;
                                    }
                                }
                                Target::ToolResult => processor.feed_tool_result(&text),
                            }
                        }
                        ServerFrame::Error { message } => {
                            source.close();
                            return Err(ClientError::Backend(frame_message(message)));
                        }
                        ServerFrame::Rejected { message } => {
                            source.close();
                            return Err(ClientError::Rejected(frame_message(message)));
                        }
                        ServerFrame::Harmful { message } => {
                            source.close();
                            return Err(ClientError::Harmful(frame_message(message)));
                        }
                        ServerFrame::Timeout { message } => {
                            source.close();
                            return Err(ClientError::TimedOut(frame_message(message)));
                        }
                        ServerFrame::Unknown => debug!("ignoring unknown frame type"),
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    debug!("generation stream ended");
                    break;
                }
                Err(e) => {
                    error!("generation stream failed: {e}");
                    source.close();
                    return Err(ClientError::EventSource(e));
                }
            }
        }

        if let Some(detector) = detector.as_mut() {
            let output = detector.finalize();
            self.dispatch_events(output, emitter, &mut result)
                .await?;
        }

        processor.finalize();
        let outcome = processor.result();
        result.misrouted = outcome.misrouted;
        result.native_tool_call = outcome.tool_call;
        result.native_tool_call_failed = outcome.failed;

        if !title.trim().is_empty() {
            result.title = Some(postprocess_title(&title));
        }

        Ok((result, outcome.misrouted_call))
    }

    /// Routes message text through the detector when custom tools are
    /// enabled, straight through otherwise.
    async fn handle_message_text(
        &self,
        text: &str,
        detector: Option<&mut StreamingToolDetector>,
        emitter: &mut Option<&mut dyn TextAndToolEmitter>,
        result: &mut ChatResult,
    ) -> Result<(), ClientError> {
        match detector {
            Some(detector) => {
                let output = detector.process_chunk(text);
                self.dispatch_events(output, emitter, result).await
            }
            None => {
                result.text.push_str(text);
                if let Some(emitter) = emitter.as_deref_mut() {
                    emitter
                        .emit_text_delta(text)
                        .await
                        .map_err(|_| ClientError::Canceled)?;
                }
                Ok(())
            }
        }
    }

    /// Forwards detector events to the emitter in stream order, minting a
    /// call id per tool call.
    async fn dispatch_events(
        &self,
        output: ProcessOutput,
        emitter: &mut Option<&mut dyn TextAndToolEmitter>,
        result: &mut ChatResult,
    ) -> Result<(), ClientError> {
        for event in output.events {
            match event {
                DetectorEvent::Text(text) => {
                    result.text.push_str(&text);
                    if let Some(emitter) = emitter.as_deref_mut() {
                        emitter
                            .emit_text_delta(&text)
                            .await
                            .map_err(|_| ClientError::Canceled)?;
                    }
                }
                DetectorEvent::ToolCall(call) => {
                    result.tool_calls_emitted += 1;
                    let call_id = CallId::generate(&call.name);
                    debug!("emitting tool call {call_id}");
                    if let Some(emitter) = emitter.as_deref_mut() {
                        emitter
                            .emit_tool_call(&call_id, &call)
                            .await
                            .map_err(|_| ClientError::Canceled)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Decrypts an encrypted chunk, degrading to the raw payload when the
    /// chunk cannot be opened. A dropped byte would corrupt the stream; a
    /// garbled one is at least visible.
    fn open_chunk(
        &self,
        cipher: Option<&RequestCipher>,
        encrypted: bool,
        content: String,
    ) -> String {
        if !encrypted {
            return content;
        }
        let Some(cipher) = cipher else {
            warn!("encrypted chunk arrived without request key, forwarding raw content");
            self.metrics.incr_decrypt_failure();
            return content;
        };
        let ad = chunk_associated_data(cipher.request_id());
        match cipher.decrypt(&ad, &content) {
            Ok(text) => text,
            Err(e) => {
                warn!("chunk decryption failed, forwarding raw content: {e}");
                self.metrics.incr_decrypt_failure();
                content
            }
        }
    }

    /// Transiently prepends project instructions to the first or last
    /// eligible user turn. Command turns are never eligible while commands
    /// are enabled.
    fn inject_instructions(&self, turns: &mut [Turn], instructions: &str, into: InjectInto) {
        let commands_enabled = self.config.commands.enabled;
        let eligible =
            |turn: &Turn| turn.role == TurnRole::User && !(commands_enabled && turn.is_command());

        let index = match into {
            InjectInto::First => turns.iter().position(eligible),
            InjectInto::Last => turns.iter().rposition(eligible),
        };

        if let Some(index) = index {
            let sanitized = sanitize_instructions(instructions);
            let turn = &mut turns[index];
            turn.content = format!("[Project instructions: {sanitized}]\n\n{}", turn.content);
        } else {
            warn!("no eligible user turn for instruction injection");
        }
    }

    /// Builds the bounce conversation: the original turns, the first-pass
    /// assistant text, and the bounce instruction with a pretty-printed
    /// example using the prefixed tool name. Prefix stripping happens after
    /// detection on the second pass, so the prefix is applied exactly once.
    fn bounce_turns(
        &self,
        mut turns: Vec<Turn>,
        first_text: &str,
        call: &ParsedToolCall,
    ) -> Result<Vec<Turn>, ClientError> {
        let prefixed = format!("{}{}", self.config.custom_tools.prefix, call.name);
        let example = serde_json::to_string_pretty(&serde_json::json!({
            "name": prefixed,
            "arguments": call.arguments,
        }))?;

        turns.push(Turn::assistant(first_text));
        turns.push(Turn::user(format!(
            "{}\n\n{example}",
            self.config.instructions.for_tool_bounce
        )));
        Ok(turns)
    }

    fn endpoint_url(&self, endpoint_override: Option<&str>) -> Result<String, ClientError> {
        let path = endpoint_override.unwrap_or(&self.config.backend.generation_path);
        let url = format!(
            "{}{path}",
            self.config.backend.base_url.trim_end_matches('/')
        );
        reqwest::Url::parse(&url)
            .map_err(|e| ClientError::Configuration(format!("invalid generation URL '{url}': {e}")))?;
        Ok(url)
    }
}

fn frame_message(message: Option<String>) -> String {
    message.unwrap_or_else(|| "no detail provided".to_string())
}

/// Sanitizes instruction text before injection: `]\n` cannot appear (it
/// would terminate the marker early), and runs of three or more newlines
/// collapse to two.
fn sanitize_instructions(raw: &str) -> String {
    let guarded = raw.replace("]\n", "] \n");
    let mut out = String::with_capacity(guarded.len());
    let mut newline_run = 0usize;
    for c in guarded.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                out.push(c);
            }
        } else {
            newline_run = 0;
            out.push(c);
        }
    }
    out
}

/// Trims, strips one pair of surrounding quotes, and truncates the
/// accumulated title on a char boundary.
fn postprocess_title(raw: &str) -> String {
    let mut title = raw.trim();
    for quote in ['"', '\''] {
        if title.len() >= 2 && title.starts_with(quote) && title.ends_with(quote) {
            title = title[1..title.len() - 1].trim();
            break;
        }
    }
    match title.char_indices().nth(MAX_TITLE_CHARS) {
        Some((cut, _)) => title[..cut].trim_end().to_string(),
        None => title.to_string(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use lumo_bridge_common::config::BridgeConfig;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    /// Emitter double that records everything it is handed.
    #[derive(Default)]
    struct CollectingEmitter {
        text: String,
        calls: Vec<(CallId, ParsedToolCall)>,
    }

    #[async_trait]
    impl TextAndToolEmitter for CollectingEmitter {
        async fn emit_text_delta(&mut self, text: &str) -> Result<()> {
            self.text.push_str(text);
            Ok(())
        }

        async fn emit_tool_call(&mut self, call_id: &CallId, call: &ParsedToolCall) -> Result<()> {
            self.calls.push((call_id.clone(), call.clone()));
            Ok(())
        }
    }

    fn sse_body(frames: &[serde_json::Value]) -> String {
        frames
            .iter()
            .map(|frame| format!("data: {frame}\n\n"))
            .collect()
    }

    fn sse_response(frames: &[serde_json::Value]) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(sse_body(frames), "text/event-stream")
    }

    fn message_frame(content: &str) -> serde_json::Value {
        json!({"type": "token_data", "target": "message", "content": content, "encrypted": false})
    }

    fn test_config(server_uri: &str) -> Arc<BridgeConfig> {
        let mut config = BridgeConfig::default();
        config.backend.base_url = server_uri.to_string();
        Arc::new(config)
    }

    fn client(server_uri: &str) -> GenerationClient {
        let _ = env_logger::builder().is_test(true).try_init();
        GenerationClient::new(test_config(server_uri), BridgeMetrics::new()).unwrap()
    }

    fn plaintext_options() -> GenerationOptions {
        GenerationOptions::builder().enable_encryption(false).build()
    }

    fn request_body(request: &Request) -> serde_json::Value {
        serde_json::from_slice(&request.body).unwrap()
    }

    #[tokio::test]
    async fn streams_message_text_through_emitter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generation"))
            .respond_with(sse_response(&[
                message_frame("Hello, "),
                message_frame("world!"),
            ]))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let mut emitter = CollectingEmitter::default();
        let result = client
            .chat("hi", Some(&mut emitter), &plaintext_options())
            .await
            .unwrap();

        assert_eq!(result.text, "Hello, world!");
        assert_eq!(emitter.text, "Hello, world!");
        assert!(emitter.calls.is_empty());
        assert_eq!(result.tool_calls_emitted, 0);
        assert!(!result.misrouted);
    }

    #[tokio::test]
    async fn fenced_tool_call_is_extracted_and_emitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[
                message_frame("Sure: "),
                message_frame("```json\n{\"name\":\"user:get_weather\",\"argum"),
                message_frame("ents\":{\"city\":\"Paris\"}}```"),
                message_frame(" Done!"),
            ]))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let mut emitter = CollectingEmitter::default();
        let result = client
            .chat("weather?", Some(&mut emitter), &plaintext_options())
            .await
            .unwrap();

        assert_eq!(result.text, "Sure:  Done!");
        assert_eq!(result.tool_calls_emitted, 1);
        assert_eq!(emitter.calls.len(), 1);

        let (call_id, call) = &emitter.calls[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call_id.tool_name(), Some("get_weather"));
        assert_eq!(call.arguments.get("city"), Some(&json!("Paris")));
    }

    #[tokio::test]
    async fn detector_disabled_forwards_tool_json_as_text() {
        let server = MockServer::start().await;
        let fenced = "```json\n{\"name\":\"user:t\",\"arguments\":{}}```";
        Mock::given(method("POST"))
            .respond_with(sse_response(&[message_frame(fenced)]))
            .mount(&server)
            .await;

        let mut config = BridgeConfig::default();
        config.backend.base_url = server.uri();
        config.custom_tools.enabled = false;
        let client = GenerationClient::new(Arc::new(config), BridgeMetrics::new()).unwrap();

        let mut emitter = CollectingEmitter::default();
        let result = client
            .chat("hi", Some(&mut emitter), &plaintext_options())
            .await
            .unwrap();

        assert_eq!(result.text, fenced);
        assert_eq!(emitter.text, fenced);
        assert!(emitter.calls.is_empty());
        assert_eq!(result.tool_calls_emitted, 0);
    }

    #[tokio::test]
    async fn title_target_is_accumulated_and_post_processed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[
                json!({"type": "token_data", "target": "title", "content": "\"Weather", "encrypted": false}),
                json!({"type": "token_data", "target": "title", "content": " in Paris\"", "encrypted": false}),
                message_frame("Sunny."),
            ]))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let options = GenerationOptions::builder()
            .enable_encryption(false)
            .request_title(true)
            .build();
        let result = client.chat("weather?", None, &options).await.unwrap();

        assert_eq!(result.title.as_deref(), Some("Weather in Paris"));
        assert_eq!(result.text, "Sunny.");

        // Title never leaks into the delta stream.
        let requests = server.received_requests().await.unwrap();
        let body = request_body(&requests[0]);
        assert_eq!(body["targets"], json!(["title", "message"]));
    }

    #[tokio::test]
    async fn rejected_frame_becomes_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[
                json!({"type": "rejected", "message": "daily quota exhausted"}),
            ]))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let error = client
            .chat("hi", None, &plaintext_options())
            .await
            .unwrap_err();

        assert!(matches!(error, ClientError::Rejected(ref m) if m.contains("quota")));
        assert!(error.is_backend_verdict());
    }

    #[tokio::test]
    async fn misroute_triggers_exactly_one_bounce() {
        let server = MockServer::start().await;

        // First pass: the backend misroutes the custom tool natively.
        Mock::given(method("POST"))
            .respond_with(sse_response(&[
                message_frame("Let me call that tool."),
                json!({
                    "type": "token_data",
                    "target": "tool_call",
                    "content": "{\"name\":\"my_custom_tool\",\"arguments\":{\"a\":1}}",
                    "encrypted": false,
                }),
            ]))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        // Second pass: the model re-emits the call as text.
        Mock::given(method("POST"))
            .respond_with(sse_response(&[message_frame(
                "```json\n{\"name\":\"user:my_custom_tool\",\"arguments\":{\"a\":1}}```",
            )]))
            .mount(&server)
            .await;

        let metrics = BridgeMetrics::new();
        let client =
            GenerationClient::new(test_config(&server.uri()), metrics.clone()).unwrap();
        let mut emitter = CollectingEmitter::default();
        let result = client
            .chat("run my tool", Some(&mut emitter), &plaintext_options())
            .await
            .unwrap();

        // The bounced call comes back through the text channel, prefix
        // stripped exactly once.
        assert_eq!(emitter.calls.len(), 1);
        assert_eq!(emitter.calls[0].1.name, "my_custom_tool");
        assert_eq!(result.tool_calls_emitted, 1);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2, "bounce depth is bounded at one");

        let second = request_body(&requests[1]);
        let turns = second["turns"].as_array().unwrap();
        let last = turns.last().unwrap();
        assert_eq!(last["role"], "user");
        let content = last["content"].as_str().unwrap();
        assert!(content.contains("```json"));
        assert!(content.contains("user:my_custom_tool"));
        // The first-pass assistant text precedes the bounce instruction.
        assert_eq!(turns[turns.len() - 2]["role"], "assistant");

        assert_eq!(metrics.snapshot().bounces, 1);
        assert_eq!(metrics.snapshot().misrouted_tool_calls, 1);
    }

    #[tokio::test]
    async fn native_tool_result_error_sets_failure_without_bounce() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[
                json!({
                    "type": "token_data",
                    "target": "tool_call",
                    "content": "{\"name\":\"web_search\",\"arguments\":{\"q\":\"rust\"}}",
                    "encrypted": false,
                }),
                json!({
                    "type": "token_data",
                    "target": "tool_result",
                    "content": "{\"error\":true}",
                    "encrypted": false,
                }),
                message_frame("The search failed, sorry."),
            ]))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let result = client
            .chat("search rust", None, &plaintext_options())
            .await
            .unwrap();

        assert!(result.native_tool_call_failed);
        assert!(!result.misrouted);
        assert_eq!(result.native_tool_call.unwrap().name, "web_search");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1, "no bounce for native failures");
    }

    #[tokio::test]
    async fn command_turn_short_circuits_the_backend() {
        struct SaveHandler;

        #[async_trait]
        impl CommandHandler for SaveHandler {
            async fn handle(&self, command: &str) -> Result<String> {
                assert_eq!(command, "/save");
                Ok("Conversation saved.".to_string())
            }
        }

        let server = MockServer::start().await;
        let client = client(&server.uri()).with_command_handler(Arc::new(SaveHandler));

        let mut emitter = CollectingEmitter::default();
        let result = client
            .chat("/save", Some(&mut emitter), &plaintext_options())
            .await
            .unwrap();

        assert_eq!(result.text, "Conversation saved.");
        assert_eq!(emitter.text, "Conversation saved.");
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_turns_are_sent_verbatim_when_commands_disabled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[message_frame("ok")]))
            .mount(&server)
            .await;

        let mut config = BridgeConfig::default();
        config.backend.base_url = server.uri();
        config.commands.enabled = false;

        struct PanickyHandler;
        #[async_trait]
        impl CommandHandler for PanickyHandler {
            async fn handle(&self, _command: &str) -> Result<String> {
                anyhow::bail!("must not be called")
            }
        }

        let client = GenerationClient::new(Arc::new(config), BridgeMetrics::new())
            .unwrap()
            .with_command_handler(Arc::new(PanickyHandler));

        let result = client.chat("/save", None, &plaintext_options()).await.unwrap();
        assert_eq!(result.text, "ok");

        let requests = server.received_requests().await.unwrap();
        let body = request_body(&requests[0]);
        assert_eq!(body["turns"][0]["content"], "/save");
    }

    #[tokio::test]
    async fn instructions_inject_into_last_user_turn() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[message_frame("ok")]))
            .mount(&server)
            .await;

        let client = client(&server.uri());
        let options = GenerationOptions::builder()
            .enable_encryption(false)
            .instructions(Some("Answer in French.\n\n\n\nAlways.".to_string()))
            .build();

        let turns = vec![
            Turn::user("first question"),
            Turn::assistant("first answer"),
            Turn::user("second question"),
        ];
        client.chat_with_history(turns, None, &options).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = request_body(&requests[0]);
        let turns = body["turns"].as_array().unwrap();

        // Only the last user turn is touched, newline runs collapsed.
        assert_eq!(turns[0]["content"], "first question");
        let injected = turns[2]["content"].as_str().unwrap();
        assert!(injected
            .starts_with("[Project instructions: Answer in French.\n\nAlways.]\n\nsecond question"));
    }

    #[tokio::test]
    async fn advertised_tools_and_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(sse_response(&[message_frame("ok")]))
            .mount(&server)
            .await;

        let mut config = BridgeConfig::default();
        config.backend.base_url = server.uri();
        config.enable_web_search = true;
        let client = GenerationClient::new(Arc::new(config), BridgeMetrics::new()).unwrap();

        client.chat("hi", None, &plaintext_options()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = request_body(&requests[0]);
        assert_eq!(body["type"], "generation_request");
        let tools = body["options"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 5);
        assert!(tools.contains(&json!("web_search")));
        // Plaintext requests carry no key material.
        assert!(body.get("request_key").is_none());
    }

    #[test]
    fn title_post_processing() {
        assert_eq!(postprocess_title("  \"My Chat\"  "), "My Chat");
        assert_eq!(postprocess_title("'quoted'"), "quoted");
        assert_eq!(postprocess_title("plain title"), "plain title");
        // Only one pair of quotes is stripped.
        assert_eq!(postprocess_title("\"\"double\"\""), "\"double\"");

        let long = "x".repeat(150);
        assert_eq!(postprocess_title(&long).chars().count(), 100);

        // Truncation respects char boundaries.
        let unicode = "é".repeat(150);
        let processed = postprocess_title(&unicode);
        assert_eq!(processed.chars().count(), 100);
    }

    #[test]
    fn instruction_sanitization() {
        assert_eq!(sanitize_instructions("be]\nnice"), "be] \nnice");
        assert_eq!(sanitize_instructions("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(sanitize_instructions("plain"), "plain");
    }
}

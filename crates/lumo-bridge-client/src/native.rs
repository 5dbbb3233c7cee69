//! Native tool channel processing.
//!
//! The backend can invoke a small closed set of tools itself; their frames
//! arrive on the `tool_call` / `tool_result` SSE targets. Anything else on
//! that channel is a client-defined tool the backend mis-classified - a
//! misroute - and the generation client reacts by bouncing the request so
//! the model re-emits the call as text.

use log::{debug, warn};

use lumo_bridge_common::metrics::BridgeMetrics;
use lumo_bridge_common::tools::ParsedToolCall;
use lumo_bridge_detect::JsonBraceTracker;

/// Tools the backend always has available.
pub const INTERNAL_TOOLS: &[&str] = &["proton_info"];

/// Tools gated behind the web-search toggle.
pub const EXTERNAL_TOOLS: &[&str] = &["web_search", "weather", "stock", "cryptocurrency"];

/// Whether `name` belongs to the backend's native tool vocabulary.
#[must_use]
pub fn is_native_tool(name: &str) -> bool {
    INTERNAL_TOOLS.contains(&name) || EXTERNAL_TOOLS.contains(&name)
}

/// The native tool names to advertise for one request.
#[must_use]
pub fn advertised_tools(enable_web_search: bool) -> Vec<String> {
    let mut tools: Vec<String> = INTERNAL_TOOLS.iter().map(ToString::to_string).collect();
    if enable_web_search {
        tools.extend(EXTERNAL_TOOLS.iter().map(ToString::to_string));
    }
    tools
}

/// What the native channel produced over one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeToolOutcome {
    /// The first tool call observed on the channel, if any.
    pub tool_call: Option<ParsedToolCall>,
    /// Whether a `tool_result` frame reported `error: true`.
    pub failed: bool,
    /// Whether a non-native tool name appeared on the channel.
    pub misrouted: bool,
    /// The first misrouted call, kept separately so the bounce request can
    /// name it even when a legitimate native call arrived first.
    pub misrouted_call: Option<ParsedToolCall>,
}

/// Observes `tool_call` / `tool_result` frames for one generation.
///
/// Frames may arrive chunked; each channel gets its own
/// [`JsonBraceTracker`] to reassemble complete objects. Only the first
/// observed tool call is retained; later ones count toward metrics only.
#[derive(Debug)]
pub struct NativeToolProcessor {
    call_tracker: JsonBraceTracker,
    result_tracker: JsonBraceTracker,
    outcome: NativeToolOutcome,
    /// In bounce mode misroutes are recorded without aborting, so the
    /// second pass cannot loop.
    bounce_mode: bool,
    metrics: BridgeMetrics,
}

impl NativeToolProcessor {
    /// Creates a processor; `bounce_mode` suppresses the abort signal.
    #[must_use]
    pub fn new(bounce_mode: bool, metrics: BridgeMetrics) -> Self {
        Self {
            call_tracker: JsonBraceTracker::new(),
            result_tracker: JsonBraceTracker::new(),
            outcome: NativeToolOutcome::default(),
            bounce_mode,
            metrics,
        }
    }

    /// Feeds a chunk from the `tool_call` target.
    ///
    /// Returns `true` when the generation should be aborted early: a
    /// misrouted custom tool was observed outside bounce mode, and the
    /// caller will redo the request as a bounce.
    pub fn feed_tool_call(&mut self, content: &str) -> bool {
        let mut should_abort = false;

        for object in self.call_tracker.feed(content) {
            should_abort |= self.observe_call(&object);
        }

        should_abort
    }

    /// Feeds a chunk from the `tool_result` target.
    pub fn feed_tool_result(&mut self, content: &str) {
        for object in self.result_tracker.feed(content) {
            self.observe_result(&object);
        }
    }

    /// Gives any incomplete buffered frame one final parse.
    ///
    /// Some backend builds omit the trailing newline that completes a
    /// frame; a buffer that parses as JSON at end of stream is processed as
    /// if it had completed.
    pub fn finalize(&mut self) {
        let leftover_call = self.call_tracker.feed_with_remainder("").remainder;
        if !leftover_call.trim().is_empty() {
            self.observe_call(&leftover_call);
        }

        let leftover_result = self.result_tracker.feed_with_remainder("").remainder;
        if !leftover_result.trim().is_empty() {
            self.observe_result(&leftover_result);
        }
    }

    /// The accumulated outcome.
    #[must_use]
    pub fn result(&self) -> NativeToolOutcome {
        self.outcome.clone()
    }

    fn observe_call(&mut self, object: &str) -> bool {
        let call = match serde_json::from_str::<serde_json::Value>(object)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                ParsedToolCall::from_value(&value).map_err(|e| e.to_string())
            }) {
            Ok(call) => call,
            Err(reason) => {
                warn!("unparseable native tool_call frame: {reason}");
                self.metrics.incr_invalid_candidate();
                return false;
            }
        };

        let native = is_native_tool(&call.name);
        debug!(
            "native channel tool call: {} (native: {native})",
            call.name
        );

        if self.outcome.tool_call.is_none() {
            self.outcome.tool_call = Some(call.clone());
        }

        if native {
            return false;
        }

        self.outcome.misrouted = true;
        if self.outcome.misrouted_call.is_none() {
            self.outcome.misrouted_call = Some(call);
        }
        self.metrics.incr_misrouted();
        !self.bounce_mode
    }

    fn observe_result(&mut self, object: &str) {
        match serde_json::from_str::<serde_json::Value>(object) {
            Ok(value) => {
                if value.get("error").and_then(serde_json::Value::as_bool) == Some(true) {
                    self.outcome.failed = true;
                }
            }
            Err(e) => warn!("unparseable native tool_result frame: {e}"),
        }
    }
}

//! Streaming detection of JSON tool calls embedded in assistant text.
//!
//! The backend cannot invoke client-defined tools natively; instead the
//! model is instructed to emit a JSON object - either inside a ```json code
//! fence or as a raw top-level object - in its ordinary text stream. The
//! detector forwards normal text as soon as possible while diverting
//! syntactically complete tool-call objects out of band.

use log::debug;

use lumo_bridge_common::metrics::BridgeMetrics;
use lumo_bridge_common::tools::ParsedToolCall;

use crate::brace::JsonBraceTracker;

const FENCE: &str = "```";

/// Up to this many trailing characters of pending text are held back so a
/// partial opener split across chunk boundaries is never emitted as text.
const KEEP_BACK_CHARS: usize = 10;

/// One ordered output of the detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    /// Bytes safe to forward to the client immediately.
    Text(String),
    /// A syntactically complete tool call, prefix already stripped.
    ToolCall(ParsedToolCall),
}

/// Events produced by one [`StreamingToolDetector::process_chunk`] or
/// [`StreamingToolDetector::finalize`] call, in stream order.
#[derive(Debug, Default, PartialEq)]
pub struct ProcessOutput {
    /// Text and tool-call events in the exact order they completed.
    pub events: Vec<DetectorEvent>,
}

impl ProcessOutput {
    /// Concatenation of all text events.
    #[must_use]
    pub fn text_to_emit(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                DetectorEvent::Text(text) => Some(text.as_str()),
                DetectorEvent::ToolCall(_) => None,
            })
            .collect()
    }

    /// The completed tool calls, in the order they closed in the stream.
    #[must_use]
    pub fn completed_tool_calls(&self) -> Vec<&ParsedToolCall> {
        self.events
            .iter()
            .filter_map(|event| match event {
                DetectorEvent::ToolCall(call) => Some(call),
                DetectorEvent::Text(_) => None,
            })
            .collect()
    }

    /// Whether this output carries neither text nor tool calls.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    InCodeFence,
    InRawJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    /// A complete ``` opener at this byte offset.
    Fence(usize),
    /// A `{` at this offset whose next non-whitespace byte is `"`.
    RawJson(usize),
    /// A possible opener that cannot be decided until more data arrives.
    Hold(usize),
}

/// State machine splitting free-form text into text deltas and tool calls.
///
/// One detector instance lives for exactly one generation; bounce retries
/// get a fresh instance. State is the current mode, the pending-text buffer
/// and a [`JsonBraceTracker`] - nothing is persisted.
#[derive(Debug)]
pub struct StreamingToolDetector {
    state: State,
    /// Text not yet emitted nor claimed by a fence/object.
    pending: String,
    /// Content accumulated between fence delimiters (opener excluded).
    fence_buffer: String,
    tracker: JsonBraceTracker,
    /// Tool-name prefix stripped after detection (e.g. `"user:"`).
    prefix: String,
    metrics: BridgeMetrics,
    /// Whether the byte before `pending[0]` leaves the line "open": only
    /// whitespace since the last newline (or stream start).
    line_open: bool,
}

impl StreamingToolDetector {
    /// Creates a detector stripping `prefix` from detected tool names.
    #[must_use]
    pub fn new(prefix: impl Into<String>, metrics: BridgeMetrics) -> Self {
        Self {
            state: State::Normal,
            pending: String::new(),
            fence_buffer: String::new(),
            tracker: JsonBraceTracker::new(),
            prefix: prefix.into(),
            metrics,
            line_open: true,
        }
    }

    /// Processes one chunk of assistant text.
    ///
    /// Returns text that is safe to forward plus any tool calls whose
    /// closing byte arrived in this chunk, in stream order.
    pub fn process_chunk(&mut self, chunk: &str) -> ProcessOutput {
        let mut output = ProcessOutput::default();
        self.pending.push_str(chunk);
        self.run(&mut output);
        output
    }

    /// Flushes all remaining state at end of stream.
    ///
    /// Held-back text is always emitted. A partially accumulated fence or
    /// raw-JSON candidate gets one last parse attempt and otherwise degrades
    /// to plain text - an incomplete candidate is never emitted as a tool
    /// call it did not fully form.
    pub fn finalize(&mut self) -> ProcessOutput {
        let mut output = ProcessOutput::default();
        self.run(&mut output);

        match self.state {
            State::Normal => {
                let text = std::mem::take(&mut self.pending);
                self.push_text(text, &mut output);
            }
            State::InCodeFence => {
                let content = std::mem::take(&mut self.fence_buffer);
                match self.parse_candidate(strip_json_token(&content)) {
                    Some(call) => output.events.push(DetectorEvent::ToolCall(call)),
                    None => self.push_text(format!("{FENCE}{content}"), &mut output),
                }
            }
            State::InRawJson => {
                let buffered = self.tracker.feed_with_remainder("").remainder;
                match self.parse_candidate(&buffered) {
                    Some(call) => output.events.push(DetectorEvent::ToolCall(call)),
                    None => self.push_text(buffered, &mut output),
                }
            }
        }

        self.state = State::Normal;
        self.line_open = true;
        output
    }

    /// Drives the state machine until it needs more data.
    ///
    /// Every iteration either consumes pending bytes or transitions state;
    /// when neither is possible the loop breaks and waits. This bounds CPU
    /// on adversarial input.
    fn run(&mut self, output: &mut ProcessOutput) {
        loop {
            let progressed = match self.state {
                State::Normal => self.scan_normal(output),
                State::InCodeFence => self.scan_fence(output),
                State::InRawJson => self.scan_raw(output),
            };
            if !progressed {
                break;
            }
        }
    }

    fn scan_normal(&mut self, output: &mut ProcessOutput) -> bool {
        match self.find_candidate() {
            Some(Candidate::Fence(at)) => {
                let text: String = self.pending.drain(..at).collect();
                self.push_text(text, output);
                self.pending.replace_range(..FENCE.len(), "");
                self.line_open = false;
                self.state = State::InCodeFence;
                true
            }
            Some(Candidate::RawJson(at)) => {
                let text: String = self.pending.drain(..at).collect();
                self.push_text(text, output);
                self.state = State::InRawJson;
                true
            }
            Some(Candidate::Hold(at)) => {
                let text: String = self.pending.drain(..at).collect();
                self.push_text(text, output);
                false
            }
            None => {
                self.flush_keeping_window(output);
                false
            }
        }
    }

    fn scan_fence(&mut self, output: &mut ProcessOutput) -> bool {
        if !self.pending.is_empty() {
            let chunk = std::mem::take(&mut self.pending);
            self.fence_buffer.push_str(&chunk);
        }

        let Some(close) = self.fence_buffer.find(FENCE) else {
            return false;
        };

        let rest = self.fence_buffer.split_off(close + FENCE.len());
        self.fence_buffer.truncate(close);
        let content = std::mem::take(&mut self.fence_buffer);

        match self.parse_candidate(strip_json_token(&content)) {
            Some(call) => output.events.push(DetectorEvent::ToolCall(call)),
            None => {
                if !content.trim().is_empty() {
                    self.metrics.incr_invalid_candidate();
                    debug!("fenced block did not parse as a tool call, re-emitting as text");
                }
                self.push_text(format!("{FENCE}{content}{FENCE}"), output);
            }
        }

        self.line_open = false;
        self.pending = rest;
        self.state = State::Normal;
        true
    }

    fn scan_raw(&mut self, output: &mut ProcessOutput) -> bool {
        if self.pending.is_empty() {
            return false;
        }

        let chunk = std::mem::take(&mut self.pending);
        let mut completed = self.tracker.feed(&chunk).into_iter();
        let Some(object) = completed.next() else {
            return false;
        };

        // Anything after the first completed object goes back through the
        // normal scanner.
        let mut leftover: String = completed.collect::<Vec<_>>().concat();
        leftover.push_str(&self.tracker.feed_with_remainder("").remainder);

        match self.parse_candidate(&object) {
            Some(call) => {
                output.events.push(DetectorEvent::ToolCall(call));
                self.line_open = false;
            }
            None => {
                self.metrics.incr_invalid_candidate();
                debug!("raw JSON object did not parse as a tool call, re-emitting as text");
                self.push_text(object, output);
            }
        }

        self.pending = leftover;
        self.state = State::Normal;
        true
    }

    /// Finds the earliest opener (or undecidable partial opener) in pending.
    fn find_candidate(&self) -> Option<Candidate> {
        let bytes = self.pending.as_bytes();
        let len = bytes.len();
        let mut i = 0;

        while i < len {
            match bytes[i] {
                b'`' => {
                    if len - i >= FENCE.len() {
                        if &bytes[i..i + FENCE.len()] == FENCE.as_bytes() {
                            return Some(Candidate::Fence(i));
                        }
                    } else if bytes[i..].iter().all(|&b| b == b'`') {
                        return Some(Candidate::Hold(i));
                    }
                }
                b'{' if self.is_line_open(i) => {
                    let mut j = i + 1;
                    while j < len && matches!(bytes[j], b' ' | b'\t' | b'\r' | b'\n') {
                        j += 1;
                    }
                    if j == len {
                        return Some(Candidate::Hold(i));
                    }
                    if bytes[j] == b'"' {
                        return Some(Candidate::RawJson(i));
                    }
                }
                _ => {}
            }
            i += 1;
        }

        None
    }

    /// Whether only whitespace separates byte `at` from the last newline
    /// (or the start of the stream).
    fn is_line_open(&self, at: usize) -> bool {
        let bytes = self.pending.as_bytes();
        let mut j = at;
        while j > 0 {
            match bytes[j - 1] {
                b'\n' => return true,
                b' ' | b'\t' | b'\r' => j -= 1,
                _ => return false,
            }
        }
        self.line_open
    }

    /// Flushes pending text except for the trailing keep-back window.
    fn flush_keeping_window(&mut self, output: &mut ProcessOutput) {
        let keep_from = self
            .pending
            .char_indices()
            .rev()
            .nth(KEEP_BACK_CHARS - 1)
            .map(|(index, _)| index);
        if let Some(keep_from) = keep_from {
            if keep_from > 0 {
                let text: String = self.pending.drain(..keep_from).collect();
                self.push_text(text, output);
            }
        }
    }

    /// Parses a completed candidate, applying the tool-call acceptance
    /// rules and stripping the configured name prefix.
    ///
    /// The candidate must be an object carrying a string `name` and an
    /// explicit `arguments` (or `parameters`) key; this keeps ordinary data
    /// objects like `{"name":"Bob"}` in the text stream.
    fn parse_candidate(&self, raw: &str) -> Option<ParsedToolCall> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let object = value.as_object()?;
        if !object.contains_key("arguments") && !object.contains_key("parameters") {
            return None;
        }
        let mut call = ParsedToolCall::from_value(&value).ok()?;
        call.strip_prefix(&self.prefix);
        Some(call)
    }

    /// Emits a text event, merging with a trailing text event and keeping
    /// the line-open flag in sync with what was emitted.
    fn push_text(&mut self, text: String, output: &mut ProcessOutput) {
        if text.is_empty() {
            return;
        }

        if let Some(last_newline) = text.rfind('\n') {
            self.line_open = text[last_newline + 1..]
                .bytes()
                .all(|b| matches!(b, b' ' | b'\t' | b'\r'));
        } else if !text.bytes().all(|b| matches!(b, b' ' | b'\t' | b'\r')) {
            self.line_open = false;
        }

        if let Some(DetectorEvent::Text(previous)) = output.events.last_mut() {
            previous.push_str(&text);
        } else {
            output.events.push(DetectorEvent::Text(text));
        }
    }
}

/// Strips an optional leading `json` language token from fenced content.
fn strip_json_token(content: &str) -> &str {
    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("json") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with('{') {
            return rest.trim_start();
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;
    use serde_json::json;

    fn detector() -> StreamingToolDetector {
        StreamingToolDetector::new("user:", BridgeMetrics::new())
    }

    /// Feeds chunks, finalizes, and returns all events in order.
    fn drive(chunks: &[&str]) -> Vec<DetectorEvent> {
        let mut det = detector();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(det.process_chunk(chunk).events);
        }
        events.extend(det.finalize().events);
        coalesce(events)
    }

    /// Merges adjacent text events so assertions do not depend on chunking.
    fn coalesce(events: Vec<DetectorEvent>) -> Vec<DetectorEvent> {
        let mut merged: Vec<DetectorEvent> = Vec::new();
        for event in events {
            match (merged.last_mut(), event) {
                (Some(DetectorEvent::Text(last)), DetectorEvent::Text(next)) => {
                    last.push_str(&next);
                }
                (_, event) => merged.push(event),
            }
        }
        merged
    }

    #[test]
    fn fenced_tool_call_between_text() {
        let events = drive(&[
            "Here: ",
            "```json\n{\"name\":\"get_weather\"",
            ",\"arguments\":{\"city\":\"Paris\"}}",
            "```",
            " Done!",
        ]);

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], DetectorEvent::Text("Here: ".to_string()));
        match &events[1] {
            DetectorEvent::ToolCall(call) => {
                assert_eq!(call.name, "get_weather");
                assert_eq!(call.arguments.get("city"), Some(&json!("Paris")));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
        assert_eq!(events[2], DetectorEvent::Text(" Done!".to_string()));
    }

    #[test]
    fn raw_json_fed_byte_by_byte() {
        let input = "{\n  \"name\": \"HassTurnOff\",\n  \"arguments\": {\n    \"name\": \"office\"\n  }\n}";
        let chunks: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let events = drive(&chunk_refs);

        assert_eq!(events.len(), 1);
        match &events[0] {
            DetectorEvent::ToolCall(call) => {
                assert_eq!(call.name, "HassTurnOff");
                assert_eq!(call.arguments.get("name"), Some(&json!("office")));
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn mid_line_json_stays_text() {
        let input = "Config: {\"foo\":\"bar\"} done";
        let events = drive(&[input]);
        assert_eq!(events, vec![DetectorEvent::Text(input.to_string())]);
    }

    #[test]
    fn malformed_fence_re_emitted_verbatim() {
        let metrics = BridgeMetrics::new();
        let mut det = StreamingToolDetector::new("user:", metrics.clone());
        let mut events = det.process_chunk("```json\n{not json}```").events;
        events.extend(det.finalize().events);

        assert_eq!(
            coalesce(events),
            vec![DetectorEvent::Text("```json\n{not json}```".to_string())]
        );
        assert_eq!(metrics.snapshot().invalid_tool_candidates, 1);
    }

    #[test]
    fn raw_json_split_mid_string_across_many_chunks() {
        let input = r#"{"name":"user:search","arguments":{"query":"café near me"}}"#;
        let chunks: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let events = drive(&chunk_refs);

        assert_eq!(events.len(), 1, "no text bytes may leak: {events:?}");
        match &events[0] {
            DetectorEvent::ToolCall(call) => {
                // Prefix stripping happens after detection.
                assert_eq!(call.name, "search");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn unicode_braces_inside_strings_do_not_terminate() {
        let input = "{\"name\":\"t\",\"arguments\":{\"note\":\"brace } in 文字列 {\"}}";
        let events = drive(&[input]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DetectorEvent::ToolCall(_)));
    }

    #[test]
    fn parameters_alias_accepted() {
        let events = drive(&["```json\n{\"name\":\"t\",\"parameters\":{\"a\":1}}\n```"]);
        match &events[0] {
            DetectorEvent::ToolCall(call) => assert_eq!(call.arguments.get("a"), Some(&json!(1))),
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn object_without_arguments_key_is_text() {
        let input = "{\"name\":\"Bob\"}";
        let events = drive(&[input]);
        assert_eq!(events, vec![DetectorEvent::Text(input.to_string())]);
    }

    #[test]
    fn keep_back_window_flushed_on_finalize() {
        let mut det = detector();
        let first = det.process_chunk("short");
        // Fewer than the window size: everything held back.
        assert!(first.is_empty());
        let last = det.finalize();
        assert_eq!(last.text_to_emit(), "short");
    }

    #[test]
    fn unterminated_fence_degrades_to_text_on_finalize() {
        let mut det = detector();
        assert!(det.process_chunk("```json\n{\"name\":").is_empty());
        let out = det.finalize();
        assert_eq!(out.text_to_emit(), "```json\n{\"name\":");
        assert!(out.completed_tool_calls().is_empty());
    }

    #[test]
    fn unterminated_fence_with_complete_call_parses_on_finalize() {
        let mut det = detector();
        det.process_chunk("```json\n{\"name\":\"t\",\"arguments\":{}}");
        let out = det.finalize();
        assert_eq!(out.completed_tool_calls().len(), 1);
    }

    #[test]
    fn unterminated_raw_object_degrades_to_text_on_finalize() {
        let mut det = detector();
        assert!(det.process_chunk("{\"name\": \"half").is_empty());
        let out = det.finalize();
        assert_eq!(out.text_to_emit(), "{\"name\": \"half");
    }

    #[test]
    fn text_after_newline_can_open_raw_json() {
        let events = drive(&["intro\n", "{\"name\":\"t\",\"arguments\":{}}"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DetectorEvent::Text("intro\n".to_string()));
        assert!(matches!(events[1], DetectorEvent::ToolCall(_)));
    }

    #[test]
    fn indented_raw_json_after_newline_is_detected() {
        let events = drive(&["list:\n   {\"name\":\"t\",\"arguments\":{}}"]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], DetectorEvent::Text("list:\n   ".to_string()));
        assert!(matches!(events[1], DetectorEvent::ToolCall(_)));
    }

    #[test]
    fn two_fenced_calls_in_one_stream() {
        let events = drive(&[
            "```json\n{\"name\":\"a\",\"arguments\":{}}\n``` and ",
            "```json\n{\"name\":\"b\",\"arguments\":{}}\n```",
        ]);
        let calls: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                DetectorEvent::ToolCall(c) => Some(c.name.clone()),
                DetectorEvent::Text(_) => None,
            })
            .collect();
        assert_eq!(calls, vec!["a".to_string(), "b".to_string()]);
        assert!(events.contains(&DetectorEvent::Text(" and ".to_string())));
    }

    #[test]
    fn plain_text_round_trips_across_any_chunking() {
        let input = "nothing special here, just prose with `inline code` and 10 > 3";
        for split in [1, 2, 3, 7, input.len()] {
            let chunks: Vec<String> = input
                .as_bytes()
                .chunks(split)
                .map(|c| String::from_utf8(c.to_vec()).unwrap())
                .collect();
            let chunk_refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
            let events = drive(&chunk_refs);
            assert_eq!(events, vec![DetectorEvent::Text(input.to_string())]);
        }
    }
}

#[cfg(test)]
mod fuzz_tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    /// Reference result: the event stream for the whole input in one chunk.
    fn one_shot(input: &str) -> Vec<DetectorEvent> {
        let mut det = StreamingToolDetector::new("user:", BridgeMetrics::new());
        let mut events = det.process_chunk(input).events;
        events.extend(det.finalize().events);
        merge(events)
    }

    fn chunked(input: &str, cuts: &[usize]) -> Vec<DetectorEvent> {
        let mut det = StreamingToolDetector::new("user:", BridgeMetrics::new());
        let mut events = Vec::new();
        let boundaries: Vec<usize> = {
            let mut b: Vec<usize> = cuts
                .iter()
                .map(|c| c % (input.len() + 1))
                .filter(|&c| input.is_char_boundary(c))
                .collect();
            b.push(0);
            b.push(input.len());
            b.sort_unstable();
            b.dedup();
            b
        };
        for window in boundaries.windows(2) {
            events.extend(det.process_chunk(&input[window[0]..window[1]]).events);
        }
        events.extend(det.finalize().events);
        merge(events)
    }

    fn merge(events: Vec<DetectorEvent>) -> Vec<DetectorEvent> {
        let mut merged: Vec<DetectorEvent> = Vec::new();
        for event in events {
            match (merged.last_mut(), event) {
                (Some(DetectorEvent::Text(last)), DetectorEvent::Text(next)) => {
                    last.push_str(&next);
                }
                (_, event) => merged.push(event),
            }
        }
        merged
    }

    fn sample_inputs() -> Vec<String> {
        vec![
            "plain text only, no tools".to_string(),
            "Here: ```json\n{\"name\":\"w\",\"arguments\":{\"c\":\"Paris\"}}``` Done!".to_string(),
            "{\"name\":\"t\",\"arguments\":{\"s\":\"a } b { c\"}}".to_string(),
            "Config: {\"foo\":\"bar\"} done".to_string(),
            "```json\n{bad}``` trailing".to_string(),
            "mixed\n{\"name\":\"a\",\"arguments\":{}}\nand ```json\n{\"name\":\"b\",\"arguments\":{}}```".to_string(),
            "ends with partial ``".to_string(),
            "unicode 東京 {\"in\":\"line\"} ok".to_string(),
        ]
    }

    proptest! {
        /// Chunking must never change what the detector produces.
        #[test]
        fn chunking_invariance(
            input_index in 0usize..8,
            cuts in prop::collection::vec(0usize..200, 0..12),
        ) {
            let inputs = sample_inputs();
            let input = &inputs[input_index];
            prop_assert_eq!(one_shot(input), chunked(input, &cuts));
        }

        /// Inputs with no openers at all must round-trip byte-for-byte.
        #[test]
        fn openerless_text_round_trips(input in "[a-zA-Z0-9 .,!?]{0,80}") {
            let events = one_shot(&input);
            let text: String = events
                .iter()
                .map(|e| match e {
                    DetectorEvent::Text(t) => t.clone(),
                    DetectorEvent::ToolCall(_) => String::new(),
                })
                .collect();
            prop_assert_eq!(text, input);
        }

        /// The detector must never panic on arbitrary input.
        #[test]
        fn never_panics(input in "\\PC{0,200}") {
            let mut det = StreamingToolDetector::new("user:", BridgeMetrics::new());
            det.process_chunk(&input);
            det.finalize();
        }
    }
}

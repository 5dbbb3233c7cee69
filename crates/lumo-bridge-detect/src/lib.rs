//! # lumo-bridge-detect
//!
//! Streaming detection of tool calls embedded in free-form assistant text.
//!
//! The generation backend has no native channel for client-defined tools;
//! the model emits them as JSON objects in its text stream, either inside a
//! ```` ```json ```` code fence or as a raw top-level object. This crate
//! isolates those objects while forwarding everything else as text deltas,
//! across arbitrary chunk boundaries.
//!
//! ## Example
//!
//! ```
//! use lumo_bridge_common::BridgeMetrics;
//! use lumo_bridge_detect::{DetectorEvent, StreamingToolDetector};
//!
//! let mut detector = StreamingToolDetector::new("user:", BridgeMetrics::new());
//! let mut events = detector
//!     .process_chunk("```json\n{\"name\":\"user:search\",\"arguments\":{\"q\":\"rust\"}}```")
//!     .events;
//! events.extend(detector.finalize().events);
//!
//! match &events[0] {
//!     DetectorEvent::ToolCall(call) => assert_eq!(call.name, "search"),
//!     DetectorEvent::Text(text) => panic!("unexpected text: {text}"),
//! }
//! ```

pub mod brace;
pub mod detector;

pub use brace::{FeedResult, JsonBraceTracker};
pub use detector::{DetectorEvent, ProcessOutput, StreamingToolDetector};

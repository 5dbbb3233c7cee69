//! Process-wide counters.
//!
//! There is no metrics backend here; components receive an injected
//! [`BridgeMetrics`] handle and bump plain atomic counters. A scraper or
//! status endpoint can read a [`MetricsSnapshot`] at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counter handle, cloneable across components.
#[derive(Debug, Default, Clone)]
pub struct BridgeMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    misrouted_tool_calls: AtomicU64,
    invalid_tool_candidates: AtomicU64,
    decrypt_failures: AtomicU64,
    bounces: AtomicU64,
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Custom tool calls the backend misrouted through its native channel.
    pub misrouted_tool_calls: u64,
    /// JSON candidates that failed the tool-call acceptance rules.
    pub invalid_tool_candidates: u64,
    /// Message chunks that failed to decrypt (forwarded undecrypted).
    pub decrypt_failures: u64,
    /// Second-pass requests issued after a misroute.
    pub bounces: u64,
}

impl BridgeMetrics {
    /// Creates a fresh, zeroed handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a misrouted tool call.
    pub fn incr_misrouted(&self) {
        self.inner
            .misrouted_tool_calls
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records a JSON candidate that failed tool-call acceptance.
    pub fn incr_invalid_candidate(&self) {
        self.inner
            .invalid_tool_candidates
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records a chunk decryption failure.
    pub fn incr_decrypt_failure(&self) {
        self.inner.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a bounce request.
    pub fn incr_bounce(&self) {
        self.inner.bounces.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            misrouted_tool_calls: self.inner.misrouted_tool_calls.load(Ordering::Relaxed),
            invalid_tool_candidates: self.inner.invalid_tool_candidates.load(Ordering::Relaxed),
            decrypt_failures: self.inner.decrypt_failures.load(Ordering::Relaxed),
            bounces: self.inner.bounces.load(Ordering::Relaxed),
        }
    }
}

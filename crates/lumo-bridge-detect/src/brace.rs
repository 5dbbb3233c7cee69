//! Streaming balanced-brace scanner for top-level JSON objects.

/// Character-by-character scanner that reports when a top-level JSON object
/// terminates, across arbitrary chunk boundaries.
///
/// The tracker only balances braces; it does not validate JSON. A string
/// that balances braces "completes" even when it would not parse -
/// validity is the caller's problem. Braces inside JSON strings are ignored,
/// with `\\` handled as a two-character escape.
///
/// UTF-8 multi-byte sequences are transparent: braces and quotes are single
/// bytes, and everything else is copied through untouched.
#[derive(Debug, Default)]
pub struct JsonBraceTracker {
    buffer: String,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

/// Result of [`JsonBraceTracker::feed_with_remainder`].
#[derive(Debug, PartialEq, Eq)]
pub struct FeedResult {
    /// Completed top-level object strings, in completion order.
    pub results: Vec<String>,
    /// Whatever was buffered after the last completed object.
    pub remainder: String,
}

impl JsonBraceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns any object strings completed by it.
    ///
    /// A new buffer starts at the byte following each completed object, so
    /// directly concatenated objects split cleanly regardless of how the
    /// input is chunked.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        let mut completed = Vec::new();

        for c in chunk.chars() {
            self.buffer.push(c);

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
                continue;
            }

            match c {
                '"' => self.in_string = true,
                '{' => self.depth += 1,
                '}' => {
                    if self.depth > 0 {
                        self.depth -= 1;
                        if self.depth == 0 {
                            completed.push(std::mem::take(&mut self.buffer));
                        }
                    }
                }
                _ => {}
            }
        }

        completed
    }

    /// Feeds a chunk, then drains the tracker.
    ///
    /// Returns the completed objects plus whatever incomplete tail was
    /// buffered; the tracker is reset afterwards.
    pub fn feed_with_remainder(&mut self, chunk: &str) -> FeedResult {
        let results = self.feed(chunk);
        let remainder = std::mem::take(&mut self.buffer);
        self.reset();
        FeedResult { results, remainder }
    }

    /// The bytes buffered since the last completed object.
    #[must_use]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Clears all state, discarding any buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

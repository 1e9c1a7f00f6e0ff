// Delta tracking for streamed responses
// Turns cumulative snapshots and wire deltas into non-overlapping increments

/// Inserted between assistant messages of one reply
pub const SEGMENT_BREAK: &str = "\n\n";

/// Tracks the text already emitted for one stream
///
/// A reply can span several assistant messages (text, tool call, more text).
/// The runtime's snapshots cover only the latest message, so each message is
/// tracked as its own segment and the reply is their concatenation.
#[derive(Debug, Default, Clone)]
pub struct DeltaTracker {
    emitted: String,
    segment: String,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text emitted so far, across all segments
    pub fn text(&self) -> &str {
        &self.emitted
    }

    /// Feed one chunk; returns the increment to emit, if any
    ///
    /// A cumulative snapshot is authoritative when present: only the part past
    /// the current segment is returned. A snapshot that does not extend the
    /// current segment starts a new one.
    pub fn observe(&mut self, wire_delta: &str, cumulative: Option<&str>) -> Option<String> {
        match cumulative {
            Some(snapshot) => self.advance_to(snapshot),
            None => self.append(wire_delta),
        }
    }

    /// Close the stream against the runtime's final text
    ///
    /// Returns a catch-up increment (if the final text runs past what was
    /// streamed) and the full text, which always equals the concatenation of
    /// every increment returned by this tracker.
    pub fn finish(&mut self, final_text: Option<&str>) -> (Option<String>, String) {
        let catch_up = match final_text {
            None | Some("") => None,
            Some(text) if self.emitted.ends_with(text) || self.segment.starts_with(text) => None,
            Some(text) => match text.strip_prefix(self.emitted.as_str()) {
                // Whole-reply text rather than the last message
                Some(suffix) if !self.emitted.is_empty() => self.append(suffix),
                _ => self.advance_to(text),
            },
        };
        (catch_up, self.emitted.clone())
    }

    fn advance_to(&mut self, snapshot: &str) -> Option<String> {
        match snapshot.strip_prefix(self.segment.as_str()) {
            Some(suffix) => self.append(suffix),
            None => {
                log::debug!(
                    "[DeltaTracker] New assistant message after {} chars",
                    self.emitted.chars().count()
                );
                self.segment.clear();
                self.append(snapshot)
            }
        }
    }

    fn append(&mut self, piece: &str) -> Option<String> {
        if piece.is_empty() {
            return None;
        }
        let mut delta = String::with_capacity(piece.len() + SEGMENT_BREAK.len());
        if self.segment.is_empty() && !self.emitted.is_empty() {
            delta.push_str(SEGMENT_BREAK);
        }
        delta.push_str(piece);

        self.segment.push_str(piece);
        self.emitted.push_str(&delta);
        Some(delta)
    }
}

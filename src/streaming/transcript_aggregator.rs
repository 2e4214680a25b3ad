//! Transcript aggregation for one utterance
//!
//! Aggregates transcript deltas into coherent text while the utterance is
//! still open.
//!
//! # Aggregation Strategy
//!
//! - **Substantive deltas**: Appended as they arrive
//! - **Filler deltas**: Held back, and only kept if substantive text follows
//!   in the same utterance
//! - **Completed**: Replaces accumulated text (authoritative from the service)

#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    /// Accumulated substantive text from delta events
    partial_text: String,
    /// Filler deltas waiting for substantive content
    held_filler: String,
    /// Final authoritative text from the completed event
    final_text: Option<String>,
    delta_count: u64,
    filler_count: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process an incoming transcript delta.
    ///
    /// Filler deltas are held; a later substantive delta releases them into
    /// the text ahead of itself. Returns the accumulated substantive text.
    pub fn process_delta(&mut self, delta: &str, is_filler: bool) -> &str {
        if delta.is_empty() {
            return &self.partial_text;
        }

        self.delta_count += 1;
        if is_filler {
            self.filler_count += 1;
            self.held_filler.push_str(delta);
        } else {
            self.partial_text.push_str(&self.held_filler);
            self.held_filler.clear();
            self.partial_text.push_str(delta);
        }

        if self.delta_count % 10 == 0 {
            log::debug!(
                "TranscriptAggregator: {} deltas ({} filler), {} chars accumulated",
                self.delta_count,
                self.filler_count,
                self.partial_text.len()
            );
        }
        &self.partial_text
    }

    /// Set the final authoritative text, overriding accumulated deltas.
    pub fn process_completed(&mut self, transcript: &str) {
        log::debug!(
            "TranscriptAggregator: completed with {} chars (had {} deltas, {} partial chars)",
            transcript.len(),
            self.delta_count,
            self.partial_text.len()
        );
        self.final_text = Some(transcript.to_string());
    }

    /// Final text if available, otherwise the substantive partial text
    pub fn current_text(&self) -> &str {
        self.final_text.as_deref().unwrap_or(&self.partial_text)
    }

    pub fn reset(&mut self) {
        self.partial_text.clear();
        self.held_filler.clear();
        self.final_text = None;
        self.delta_count = 0;
        self.filler_count = 0;
    }
}

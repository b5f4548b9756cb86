//! Cumulative vs incremental text delta extraction.
//!
//! A backend may send the full assistant text so far or only the new part,
//! and may not say which. When a chunk declares its [`DeltaMode`] that mode
//! is trusted. Otherwise a prefix heuristic applies: a non-empty chunk that
//! starts with everything accumulated so far is cumulative and only its
//! suffix is new; anything else is appended as-is.
//!
//! Known limitation: an undeclared incremental chunk that happens to start
//! with the accumulated text (for example a model repeating itself) is
//! misread as cumulative and only its suffix is emitted. Backends that can
//! should declare the mode.

use crate::backend::{DeltaMode, TextChunk};

#[derive(Debug, Clone, Default)]
pub struct DeltaExtractor {
    accumulated: String,
}

impl DeltaExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn reset(&mut self) {
        self.accumulated.clear();
    }

    /// Return the new text carried by `chunk`.
    pub fn extract(&mut self, chunk: &TextChunk) -> String {
        let text = chunk.text.as_str();
        match chunk.mode {
            Some(DeltaMode::Incremental) => {
                self.accumulated.push_str(text);
                text.to_string()
            }
            Some(DeltaMode::Cumulative) => {
                if let Some(suffix) = text.strip_prefix(self.accumulated.as_str()) {
                    let delta = suffix.to_string();
                    self.accumulated = text.to_string();
                    delta
                } else {
                    // The backend restarted its text; everything is new.
                    tracing::debug!("Cumulative chunk diverged from accumulated text");
                    self.accumulated = text.to_string();
                    text.to_string()
                }
            }
            None => {
                if !text.is_empty() && !self.accumulated.is_empty() {
                    if let Some(suffix) = text.strip_prefix(self.accumulated.as_str()) {
                        let delta = suffix.to_string();
                        self.accumulated = text.to_string();
                        return delta;
                    }
                }
                self.accumulated.push_str(text);
                text.to_string()
            }
        }
    }
}

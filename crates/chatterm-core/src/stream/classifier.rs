//! Event Classifier
//!
//! Decides, per complete line, whether the child emitted a structured JSON
//! event or plain text, and which plain text is prompt noise.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::trace;

use super::event::StructuredEvent;
use super::scanner::strip_ansi;

/// Lines at or below this many characters count as noise while a tool runs
pub const DEFAULT_NOISE_MAX_LEN: usize = 4;

/// Lone prompt echo: `>`, `$`, `#`, `%` or `❯`, optionally padded
static PROMPT_ONLY_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*[❯>$#%]\s*$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Structured(StructuredEvent),
    Raw(String),
}

pub struct EventClassifier {
    noise_max_len: usize,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self {
            noise_max_len: DEFAULT_NOISE_MAX_LEN,
        }
    }

    pub fn with_noise_max_len(mut self, noise_max_len: usize) -> Self {
        self.noise_max_len = noise_max_len;
        self
    }

    pub fn noise_max_len(&self) -> usize {
        self.noise_max_len
    }

    /// Classify one complete line.
    ///
    /// Only a JSON object counts as structured; arrays, scalars and broken
    /// JSON fall back to raw text.
    pub fn classify(&self, line: &str) -> Classified {
        let plain = strip_ansi(line);
        let candidate = plain.trim();
        if candidate.starts_with('{') {
            match serde_json::from_str::<Value>(candidate) {
                Ok(value @ Value::Object(_)) => {
                    let event = StructuredEvent::from_value(&value);
                    trace!(?event, "structured line");
                    return Classified::Structured(event);
                }
                Ok(_) => {}
                Err(e) => trace!(error = %e, "line looks like JSON but does not parse"),
            }
        }
        Classified::Raw(normalize_raw(line))
    }

    /// True if a raw line is prompt echo or too short to be real output.
    pub fn is_noise(&self, text: &str) -> bool {
        let plain = strip_ansi(text);
        PROMPT_ONLY_PATTERN.is_match(&plain) || plain.trim().chars().count() <= self.noise_max_len
    }
}

impl Default for EventClassifier {
    fn default() -> Self {
        Self::new()
    }
}

/// True if a line starts like a JSON object once styling is removed.
pub fn looks_structured(line: &str) -> bool {
    strip_ansi(line).trim_start().starts_with('{')
}

/// Keep only what a terminal would leave visible on a raw line.
///
/// Carriage returns redraw the line, so only the last non-empty segment
/// survives. Escape sequences reaching this point are styling the scanner
/// was told to keep.
fn normalize_raw(line: &str) -> String {
    let visible = line
        .rsplit('\r')
        .find(|segment| !segment.is_empty())
        .unwrap_or_default();
    visible
        .chars()
        .filter(|&c| c == '\t' || c == '\x1b' || !c.is_control())
        .collect()
}

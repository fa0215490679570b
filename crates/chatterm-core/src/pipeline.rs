//! Pipelines
//!
//! [`ChatPipeline`] turns PTY bytes into conversational turns;
//! [`TerminalPipeline`] forwards PTY bytes untouched for a terminal renderer.
//! Both surface OSC-7 reports into a [`DirectoryTracker`].
//!
//! Pipelines are synchronous, `&mut self` transforms. Hosts that deliver
//! output from tasks keep each pipeline behind a single lock.

use serde::Serialize;
use tracing::{debug, trace};

use crate::chat::{Message, TurnAggregator, TurnEvent, TurnPhase};
use crate::config::ChatConfig;
use crate::directory::DirectoryTracker;
use crate::stream::classifier::looks_structured;
use crate::stream::{Anomaly, Classified, EscapeScanner, EventClassifier, LineReassembler, ScanMode, Span};

/// Everything a mutating call changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub events: Vec<TurnEvent>,
    /// Directory accepted during the call (the last one, if several)
    pub directory: Option<String>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.directory.is_none()
    }
}

/// Counters for everything the chat pipeline saw or recovered from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub chunks: u64,
    pub bytes: u64,
    pub lines: u64,
    pub structured_events: u64,
    pub raw_lines: u64,
    /// Raw lines dropped because the turn is structured
    pub suppressed_lines: u64,
    /// Raw lines dropped as prompt noise
    pub noise_lines: u64,
    pub directory_reports: u64,
    pub malformed_escape_sequences: u64,
    pub unparsable_structured_lines: u64,
    pub unrecognized_events: u64,
    pub malformed_osc7_payloads: u64,
}

impl PipelineStats {
    pub fn record(&mut self, anomaly: Anomaly) {
        match anomaly {
            Anomaly::MalformedEscapeSequence => self.malformed_escape_sequences += 1,
            Anomaly::UnparsableStructuredLine => self.unparsable_structured_lines += 1,
            Anomaly::UnrecognizedStructuredEventShape => self.unrecognized_events += 1,
            Anomaly::MalformedOsc7Payload => self.malformed_osc7_payloads += 1,
        }
    }

    pub fn anomalies(&self) -> u64 {
        self.malformed_escape_sequences
            + self.unparsable_structured_lines
            + self.unrecognized_events
            + self.malformed_osc7_payloads
    }
}

// ========== Chat ==========

pub struct ChatPipeline {
    scanner: EscapeScanner,
    lines: LineReassembler,
    classifier: EventClassifier,
    aggregator: TurnAggregator,
    directory: DirectoryTracker,
    stats: PipelineStats,
    closed: bool,
}

impl ChatPipeline {
    pub fn new() -> Self {
        Self::from_config(&ChatConfig::default())
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            scanner: EscapeScanner::new(ScanMode::Chat)
                .with_keep_sgr(config.scanner.keep_sgr)
                .with_max_sequence_len(config.scanner.max_sequence_len),
            lines: LineReassembler::new(),
            classifier: EventClassifier::new().with_noise_max_len(config.classifier.noise_max_len),
            aggregator: TurnAggregator::new(),
            directory: DirectoryTracker::new(),
            stats: PipelineStats::default(),
            closed: false,
        }
    }

    /// Publish directory reports into an existing tracker.
    pub fn with_directory(mut self, directory: DirectoryTracker) -> Self {
        self.directory = directory;
        self
    }

    /// Feed one chunk of PTY output.
    pub fn feed(&mut self, chunk: &[u8]) -> StateDelta {
        if self.closed {
            trace!(bytes = chunk.len(), "pipeline closed, dropping chunk");
            return StateDelta::default();
        }
        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;

        let spans = self.scanner.scan(chunk);
        for anomaly in self.scanner.drain_anomalies() {
            self.stats.record(anomaly);
        }

        let mut directory = None;
        for span in spans {
            match span {
                Span::Text(bytes) => {
                    for line in self.lines.feed(&bytes) {
                        self.handle_line(&line);
                    }
                }
                Span::Osc7(path) => {
                    self.stats.directory_reports += 1;
                    self.directory.report(path.clone());
                    directory = Some(path);
                }
            }
        }

        StateDelta {
            events: self.aggregator.take_events(),
            directory,
        }
    }

    pub fn feed_str(&mut self, chunk: &str) -> StateDelta {
        self.feed(chunk.as_bytes())
    }

    /// Record user input and open a new assistant turn.
    pub fn submit_user(&mut self, text: &str) -> StateDelta {
        self.aggregator.submit_user(text);
        self.delta()
    }

    /// Drop all messages and any partial input.
    pub fn clear_session(&mut self) -> StateDelta {
        self.scanner.discard();
        self.lines.discard();
        self.aggregator.clear_session();
        self.delta()
    }

    pub fn close_open_turn(&mut self) -> StateDelta {
        self.aggregator.close_open_turn();
        self.delta()
    }

    /// Stop accepting output. The partial line and output buffer are
    /// discarded without being flushed; an open turn is closed as is.
    pub fn close(&mut self) -> StateDelta {
        debug!(pending = self.lines.pending_len(), "closing chat pipeline");
        self.closed = true;
        self.scanner.discard();
        self.lines.discard();
        self.aggregator.discard_buffer();
        self.aggregator.close_open_turn();
        self.delta()
    }

    /// Accept output again after `close`.
    pub fn reopen(&mut self) {
        self.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_tool_active(&mut self, active: bool) {
        self.aggregator.set_tool_active(active);
    }

    pub fn messages(&self) -> &[Message] {
        self.aggregator.messages()
    }

    pub fn phase(&self) -> TurnPhase {
        self.aggregator.phase()
    }

    pub fn directory(&self) -> &DirectoryTracker {
        &self.directory
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    fn handle_line(&mut self, line: &str) {
        self.stats.lines += 1;
        match self.classifier.classify(line) {
            Classified::Structured(event) => {
                if self.aggregator.on_structured_event(event) {
                    self.stats.structured_events += 1;
                } else {
                    self.stats.record(Anomaly::UnrecognizedStructuredEventShape);
                }
            }
            Classified::Raw(text) => {
                if looks_structured(line) {
                    self.stats.record(Anomaly::UnparsableStructuredLine);
                }
                if self.aggregator.is_structured_turn() {
                    self.stats.suppressed_lines += 1;
                } else if self.aggregator.tool_active() && self.classifier.is_noise(&text) {
                    trace!(line = %text, "noise line dropped");
                    self.stats.noise_lines += 1;
                } else {
                    self.stats.raw_lines += 1;
                    self.aggregator.on_raw_text(&text);
                }
            }
        }
    }

    fn delta(&mut self) -> StateDelta {
        StateDelta {
            events: self.aggregator.take_events(),
            directory: None,
        }
    }
}

impl Default for ChatPipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ========== Terminal ==========

/// Output of [`TerminalPipeline::feed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalDelta {
    /// Bytes for the renderer, identical to the input
    pub output: Vec<u8>,
    pub directory: Option<String>,
}

pub struct TerminalPipeline {
    scanner: EscapeScanner,
    directory: DirectoryTracker,
    stats: PipelineStats,
}

impl TerminalPipeline {
    pub fn new() -> Self {
        Self::from_config(&ChatConfig::default())
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self {
            scanner: EscapeScanner::new(ScanMode::Raw)
                .with_max_sequence_len(config.scanner.max_sequence_len),
            directory: DirectoryTracker::new(),
            stats: PipelineStats::default(),
        }
    }

    pub fn with_directory(mut self, directory: DirectoryTracker) -> Self {
        self.directory = directory;
        self
    }

    pub fn feed(&mut self, chunk: &[u8]) -> TerminalDelta {
        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;

        let mut delta = TerminalDelta {
            output: Vec::with_capacity(chunk.len()),
            directory: None,
        };
        for span in self.scanner.scan(chunk) {
            match span {
                Span::Text(bytes) => delta.output.extend_from_slice(&bytes),
                Span::Osc7(path) => {
                    self.stats.directory_reports += 1;
                    self.directory.report(path.clone());
                    delta.directory = Some(path);
                }
            }
        }
        for anomaly in self.scanner.drain_anomalies() {
            self.stats.record(anomaly);
        }
        delta
    }

    /// Forget a sequence held across chunks (e.g. before a restart).
    pub fn reset(&mut self) {
        self.scanner.discard();
    }

    pub fn directory(&self) -> &DirectoryTracker {
        &self.directory
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }
}

impl Default for TerminalPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageRole;

    #[test]
    fn test_osc7_then_text_scenario() {
        let mut pipeline = ChatPipeline::new();
        let delta = pipeline.feed(b"\x1b]7;file:///C:/Users/dev\x07");
        assert_eq!(delta.directory.as_deref(), Some("C:\\Users\\dev"));
        assert_eq!(pipeline.directory().current().as_deref(), Some("C:\\Users\\dev"));

        pipeline.submit_user("run");
        pipeline.feed(b"hello ");
        assert_eq!(pipeline.messages()[1].content, "");
        pipeline.feed(b"world\n");
        assert_eq!(pipeline.messages()[1].content, "hello world");
        assert!(pipeline.messages()[1].is_streaming);
    }

    #[test]
    fn test_structured_scenario() {
        let mut pipeline = ChatPipeline::new();
        pipeline.feed(br#"{"type":"assistant","content":[{"type":"text","text":"Hi"}]}"#);
        pipeline.feed(b"\n");
        pipeline.feed(b"{\"type\":\"result\"}\n");

        let messages = pipeline.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(messages[0].content, "Hi");
        assert!(!messages[0].is_streaming);
        assert_eq!(pipeline.stats().structured_events, 2);
    }

    #[test]
    fn test_noise_suppressed_while_tool_active() {
        let mut pipeline = ChatPipeline::new();
        pipeline.set_tool_active(true);

        let delta = pipeline.feed(b"> \n");
        assert!(delta.is_empty());
        assert!(pipeline.messages().is_empty());
        assert_eq!(pipeline.stats().noise_lines, 1);

        let delta = pipeline.feed(b"Actual output here\n");
        assert_eq!(pipeline.messages().len(), 1);
        assert_eq!(pipeline.messages()[0].content, "Actual output here");
        assert!(matches!(&delta.events[..], [TurnEvent::Appended(_)]));
    }

    #[test]
    fn test_short_lines_kept_when_tool_inactive() {
        let mut pipeline = ChatPipeline::new();
        pipeline.feed(b"ok\n");
        assert_eq!(pipeline.messages()[0].content, "ok");
    }

    #[test]
    fn test_raw_after_structured_is_dropped() {
        let mut pipeline = ChatPipeline::new();
        pipeline.submit_user("q");
        pipeline.feed(b"{\"type\":\"assistant\",\"content\":\"A\"}\nstray text\n");
        assert_eq!(pipeline.messages()[1].content, "A");
        assert_eq!(pipeline.stats().suppressed_lines, 1);
    }

    #[test]
    fn test_anomalies_counted() {
        let mut pipeline = ChatPipeline::new();
        pipeline.feed(b"{\"type\": \"assistant\", broken\n");
        pipeline.feed(b"{\"type\":\"system\"}\n");
        pipeline.feed(b"\x1b]7;ftp://x/y\x07");
        pipeline.feed(b"\x1b[1\x1b[0mz\n");

        let stats = pipeline.stats();
        assert_eq!(stats.unparsable_structured_lines, 1);
        assert_eq!(stats.unrecognized_events, 1);
        assert_eq!(stats.malformed_osc7_payloads, 1);
        assert_eq!(stats.malformed_escape_sequences, 1);
        assert_eq!(pipeline.directory().current(), None);
        // broken JSON still reached the chat as text
        assert!(pipeline.messages()[0].content.starts_with("{\"type\": \"assistant\", broken"));
    }

    #[test]
    fn test_clear_discards_partial_input() {
        let mut pipeline = ChatPipeline::new();
        pipeline.submit_user("hello");
        pipeline.feed(b"half a li");
        pipeline.feed(b"\x1b]7;file:///tm");
        let delta = pipeline.clear_session();
        assert_eq!(delta.events, vec![TurnEvent::Cleared]);
        assert!(pipeline.messages().is_empty());

        pipeline.feed(b"p\x07fresh\n");
        assert_eq!(pipeline.messages().len(), 1);
        assert_eq!(pipeline.messages()[0].content, "pfresh");
        assert_eq!(pipeline.directory().current(), None);
    }

    #[test]
    fn test_close_does_not_flush_partial_line() {
        let mut pipeline = ChatPipeline::new();
        pipeline.submit_user("q");
        pipeline.feed(b"done\npartial");
        let delta = pipeline.close();
        assert!(matches!(&delta.events[..], [TurnEvent::Closed(m)] if m.content == "done"));
        assert!(pipeline.feed(b" more\n").is_empty());
        assert_eq!(pipeline.messages()[1].content, "done");
    }

    #[test]
    fn test_shared_tracker() {
        let tracker = DirectoryTracker::new();
        let mut chat = ChatPipeline::new().with_directory(tracker.clone());
        let mut term = TerminalPipeline::new().with_directory(tracker.clone());

        chat.feed(b"\x1b]7;file:///one\x07");
        term.feed(b"\x1b]7;file:///two\x1b\\");
        assert_eq!(tracker.current().as_deref(), Some("/two"));
        assert_eq!(tracker.generation(), 2);
    }

    #[test]
    fn test_directory_changes_only_on_osc7() {
        let mut pipeline = ChatPipeline::new();
        pipeline.feed(b"\x1b]7;file:///srv/app\x07");
        pipeline.feed(b"cd /not/from/osc7\n\x1b]7;/relative\x07\x1b]2;/title/path\x07");
        assert_eq!(pipeline.directory().current().as_deref(), Some("/srv/app"));
        assert_eq!(pipeline.directory().generation(), 1);
    }

    #[test]
    fn test_terminal_pipeline_is_transparent() {
        let mut pipeline = TerminalPipeline::new();
        let chunks: [&[u8]; 3] = [b"\x1b[2J\x1b]7;file://h/ho", b"me/dev\x07$ ls\r\n", b"\x1b[0m"];
        let mut forwarded = Vec::new();
        let mut dirs = Vec::new();
        for chunk in chunks {
            let delta = pipeline.feed(chunk);
            forwarded.extend(delta.output);
            dirs.extend(delta.directory);
        }
        assert_eq!(forwarded, chunks.concat());
        assert_eq!(dirs, vec!["/home/dev".to_string()]);
    }
}

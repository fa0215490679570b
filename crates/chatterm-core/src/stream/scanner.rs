//! Escape Sequence Scanner
//!
//! Splits PTY output into visible text runs and OSC-7 working directory
//! reports. Sequence recognition is driven by a [`vte::Parser`]; the scanner
//! wraps it to bound how long a sequence may stay open and to keep raw
//! output byte-exact. State survives chunk boundaries at any position.
//!
//! - [`ScanMode::Chat`]: control sequences and stray C0 bytes are removed
//!   from the text (SGR can optionally be kept).
//! - [`ScanMode::Raw`]: every byte is forwarded untouched; OSC-7 reports are
//!   still surfaced at their position in the stream.

use tracing::trace;
use vte::{Params, Parser, Perform};

use super::osc7::normalize_osc7_uri;
use super::Anomaly;

const ESC: u8 = 0x1b;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a;
const DEL: u8 = 0x7f;

/// Default bound on a held, not yet terminated sequence
pub const DEFAULT_MAX_SEQUENCE_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Strip control sequences for the chat view
    Chat,
    /// Preserve every byte for a terminal renderer
    Raw,
}

/// One tagged piece of scanner output, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Text(Vec<u8>),
    Osc7(String),
}

/// Text run and spans being built during one `scan` call.
#[derive(Default)]
struct Emitter {
    spans: Vec<Span>,
    run: Vec<u8>,
}

impl Emitter {
    fn flush(&mut self) {
        if !self.run.is_empty() {
            self.spans.push(Span::Text(std::mem::take(&mut self.run)));
        }
    }

    fn finish(mut self) -> Vec<Span> {
        self.flush();
        self.spans
    }
}

/// Receives parser actions for a single byte.
#[derive(Default)]
struct Performer {
    /// Collect visible text (chat mode only)
    collect: bool,
    /// Set by the scanner when a sequence was open before this byte
    in_sequence: bool,
    text: Vec<u8>,
    /// The open sequence finished on this byte
    ended: bool,
    /// Parser fell back to ground without dispatching the open sequence
    silent_end: bool,
    sgr: bool,
    ignored: bool,
    /// OSC-7 payload (everything after `7;`)
    osc7: Option<Vec<u8>>,
}

impl Performer {
    fn reset(&mut self, in_sequence: bool) {
        self.in_sequence = in_sequence;
        self.text.clear();
        self.ended = false;
        self.silent_end = false;
        self.sgr = false;
        self.ignored = false;
        self.osc7 = None;
    }
}

impl Perform for Performer {
    fn print(&mut self, c: char) {
        if self.in_sequence {
            self.ended = true;
            self.silent_end = true;
        }
        if self.collect && !c.is_control() {
            let mut buf = [0u8; 4];
            self.text.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\t' | b'\n' | b'\r' if self.collect => self.text.push(byte),
            CAN | SUB => self.ended = true,
            _ => {}
        }
    }

    fn unhook(&mut self) {
        self.ended = true;
    }

    fn osc_dispatch(&mut self, params: &[&[u8]], _bell_terminated: bool) {
        self.ended = true;
        if let [kind, rest @ ..] = params {
            if *kind == b"7" {
                self.osc7 = Some(rest.join(&b';'));
            }
        }
    }

    fn csi_dispatch(&mut self, _params: &Params, intermediates: &[u8], ignore: bool, action: char) {
        self.ended = true;
        self.ignored = ignore;
        self.sgr = action == 'm' && intermediates.is_empty() && !ignore;
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], ignore: bool, _byte: u8) {
        self.ended = true;
        self.ignored = ignore;
    }
}

pub struct EscapeScanner {
    mode: ScanMode,
    keep_sgr: bool,
    max_sequence_len: usize,
    parser: Parser,
    performer: Performer,
    /// Bytes of the sequence in progress, starting with ESC
    held: Vec<u8>,
    anomalies: Vec<Anomaly>,
}

impl EscapeScanner {
    pub fn new(mode: ScanMode) -> Self {
        Self {
            mode,
            keep_sgr: false,
            max_sequence_len: DEFAULT_MAX_SEQUENCE_LEN,
            parser: Parser::new(),
            performer: Performer {
                collect: mode == ScanMode::Chat,
                ..Performer::default()
            },
            held: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    /// Keep `CSI ... m` styling in chat text.
    pub fn with_keep_sgr(mut self, keep_sgr: bool) -> Self {
        self.keep_sgr = keep_sgr;
        self
    }

    pub fn with_max_sequence_len(mut self, max_sequence_len: usize) -> Self {
        // ESC plus at least one byte must fit
        self.max_sequence_len = max_sequence_len.max(2);
        self
    }

    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// True while a sequence is held across chunks.
    pub fn in_sequence(&self) -> bool {
        !self.held.is_empty()
    }

    /// Scan one chunk. Never fails.
    pub fn scan(&mut self, chunk: &[u8]) -> Vec<Span> {
        let mut out = Emitter::default();
        for &byte in chunk {
            if self.mode == ScanMode::Raw {
                out.run.push(byte);
            }
            self.step(byte, &mut out);
        }
        out.finish()
    }

    /// Drop any held sequence without emitting it.
    pub fn discard(&mut self) {
        self.parser = Parser::new();
        self.held.clear();
    }

    /// Anomalies recovered since the last call.
    pub fn drain_anomalies(&mut self) -> Vec<Anomaly> {
        std::mem::take(&mut self.anomalies)
    }

    fn step(&mut self, byte: u8, out: &mut Emitter) {
        let was_held = !self.held.is_empty();
        self.performer.reset(was_held);
        self.parser.advance(&mut self.performer, byte);

        let executed_inline = !self.performer.text.is_empty();
        out.run.append(&mut self.performer.text);

        if let Some(payload) = self.performer.osc7.take() {
            if byte == CAN || byte == SUB {
                trace!("OSC-7 report aborted");
            } else {
                self.finish_osc7(payload, out);
            }
        }

        if byte == ESC {
            // ESC always opens a new sequence; an open one that did not
            // dispatch was cut short (SOS/PM/APC bodies only end this way)
            if was_held && !self.performer.ended && !self.in_string_body() {
                self.malformed("sequence interrupted by ESC");
            }
            self.held.clear();
            self.held.push(ESC);
            return;
        }

        if !was_held {
            return;
        }

        if self.performer.ended {
            if self.performer.sgr && self.keep_sgr && self.mode == ScanMode::Chat {
                out.run.extend_from_slice(&self.held);
                out.run.push(byte);
            }
            if self.performer.silent_end || self.performer.ignored || byte == CAN || byte == SUB {
                self.malformed("sequence dropped");
            }
            self.held.clear();
            return;
        }

        if !executed_inline {
            self.held.push(byte);
        }
        if self.held.len() >= self.max_sequence_len {
            self.expire(out);
        }
    }

    /// Held sequence is an SOS, PM or APC string.
    fn in_string_body(&self) -> bool {
        matches!(self.held.get(1), Some(b'X' | b'^' | b'_'))
    }

    fn finish_osc7(&mut self, payload: Vec<u8>, out: &mut Emitter) {
        let path = String::from_utf8(payload)
            .ok()
            .and_then(|uri| normalize_osc7_uri(&uri));
        match path {
            Some(path) => {
                trace!(path = %path, "OSC-7 directory report");
                out.flush();
                out.spans.push(Span::Osc7(path));
            }
            None => {
                trace!("dropping malformed OSC-7 payload");
                self.anomalies.push(Anomaly::MalformedOsc7Payload);
            }
        }
    }

    fn malformed(&mut self, reason: &'static str) {
        trace!(reason, "malformed escape sequence");
        self.anomalies.push(Anomaly::MalformedEscapeSequence);
    }

    /// Held sequence grew past the bound.
    fn expire(&mut self, out: &mut Emitter) {
        trace!(len = self.held.len(), "escape sequence expired");
        self.anomalies.push(Anomaly::MalformedEscapeSequence);
        if self.mode == ScanMode::Chat {
            for &byte in &self.held[1..] {
                push_visible(&mut out.run, byte);
            }
        }
        self.parser = Parser::new();
        self.held.clear();
    }
}

impl Default for EscapeScanner {
    fn default() -> Self {
        Self::new(ScanMode::Chat)
    }
}

/// Append a byte to chat text unless it is a C0 control other than TAB/LF/CR.
fn push_visible(run: &mut Vec<u8>, byte: u8) {
    match byte {
        b'\t' | b'\n' | b'\r' => run.push(byte),
        0x00..=0x1f | DEL => {}
        _ => run.push(byte),
    }
}

/// Remove every control sequence from an already decoded string.
///
/// A trailing unterminated sequence is dropped.
pub fn strip_ansi(text: &str) -> String {
    if !text.bytes().any(|b| b < 0x20 || b == DEL) {
        return text.to_string();
    }
    let mut scanner = EscapeScanner::new(ScanMode::Chat).with_max_sequence_len(usize::MAX);
    let mut bytes = Vec::with_capacity(text.len());
    for span in scanner.scan(text.as_bytes()) {
        if let Span::Text(run) = span {
            bytes.extend_from_slice(&run);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(spans: &[Span]) -> String {
        let mut bytes = Vec::new();
        for span in spans {
            if let Span::Text(run) = span {
                bytes.extend_from_slice(run);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn dirs_of(spans: &[Span]) -> Vec<String> {
        spans
            .iter()
            .filter_map(|s| match s {
                Span::Osc7(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text_passes_through() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"hello world\r\n");
        assert_eq!(spans, vec![Span::Text(b"hello world\r\n".to_vec())]);
    }

    #[test]
    fn test_csi_is_stripped_in_chat_mode() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b[1;32mgreen\x1b[0m \x1b[2K\x1b[?25lplain");
        assert_eq!(text_of(&spans), "green plain");
        assert!(scanner.drain_anomalies().is_empty());
    }

    #[test]
    fn test_keep_sgr() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat).with_keep_sgr(true);
        let spans = scanner.scan(b"\x1b[31mred\x1b[0m\x1b[2J");
        assert_eq!(text_of(&spans), "\x1b[31mred\x1b[0m");
    }

    #[test]
    fn test_other_sequences_stripped() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        // title OSC, DCS, charset designation, keypad mode, APC
        let input = b"a\x1b]0;title\x07b\x1bPq#0\x1b\\c\x1b(Bd\x1b=e\x1b_app\x1b\\f";
        assert_eq!(text_of(&scanner.scan(input)), "abcdef");
    }

    #[test]
    fn test_stray_c0_removed() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"a\x07b\x08c\td\x00e\x7f");
        assert_eq!(text_of(&spans), "abc\tde");
    }

    #[test]
    fn test_osc7_bel_terminated() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"before\x1b]7;file://host/home/dev\x07after");
        assert_eq!(
            spans,
            vec![
                Span::Text(b"before".to_vec()),
                Span::Osc7("/home/dev".to_string()),
                Span::Text(b"after".to_vec()),
            ]
        );
    }

    #[test]
    fn test_osc7_st_terminated() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b]7;file:///C:/Users/dev\x1b\\");
        assert_eq!(spans, vec![Span::Osc7("C:\\Users\\dev".to_string())]);
    }

    #[test]
    fn test_osc7_split_across_chunks() {
        let input = b"\x1b]7;file:///srv/data\x1b\\ok";
        for split in 0..=input.len() {
            let mut scanner = EscapeScanner::new(ScanMode::Chat);
            let mut spans = scanner.scan(&input[..split]);
            spans.extend(scanner.scan(&input[split..]));
            assert_eq!(dirs_of(&spans), vec!["/srv/data".to_string()], "split at {}", split);
            assert_eq!(text_of(&spans), "ok", "split at {}", split);
        }
    }

    #[test]
    fn test_malformed_osc7_dropped() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b]7;http://nope/x\x07\x1b]7\x07text");
        assert!(dirs_of(&spans).is_empty());
        assert_eq!(text_of(&spans), "text");
        assert_eq!(
            scanner.drain_anomalies(),
            vec![Anomaly::MalformedOsc7Payload, Anomaly::MalformedOsc7Payload]
        );
    }

    #[test]
    fn test_raw_mode_forwards_every_byte() {
        let input: &[u8] = b"\x1b[1mbold\x1b[0m\x1b]7;file:///tmp\x07\x00tail\x1b[";
        let mut scanner = EscapeScanner::new(ScanMode::Raw);
        let spans = scanner.scan(input);

        let mut forwarded = Vec::new();
        for span in &spans {
            if let Span::Text(run) = span {
                forwarded.extend_from_slice(run);
            }
        }
        assert_eq!(forwarded, input);
        assert_eq!(dirs_of(&spans), vec!["/tmp".to_string()]);

        // the report sits right after its terminator
        let osc_pos = spans.iter().position(|s| matches!(s, Span::Osc7(_))).unwrap();
        match &spans[osc_pos - 1] {
            Span::Text(run) => assert!(run.ends_with(b"\x07")),
            other => panic!("unexpected span {:?}", other),
        }
    }

    #[test]
    fn test_can_aborts_sequence() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b[12\x18visible");
        assert_eq!(text_of(&spans), "visible");
    }

    #[test]
    fn test_can_inside_osc7_drops_report() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b]7;file:///home/dev\x18after");
        assert!(dirs_of(&spans).is_empty());
        assert_eq!(text_of(&spans), "after");
        assert_eq!(scanner.drain_anomalies(), vec![Anomaly::MalformedEscapeSequence]);
    }

    #[test]
    fn test_parameter_after_intermediate_is_ignored() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b[1$2mX");
        assert_eq!(text_of(&spans), "X");
        assert!(!scanner.in_sequence());
        assert_eq!(scanner.drain_anomalies(), vec![Anomaly::MalformedEscapeSequence]);
    }

    #[test]
    fn test_interrupted_csi_is_malformed() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat).with_keep_sgr(true);
        let spans = scanner.scan(b"\x1b[1\x1b[0mz");
        assert_eq!(text_of(&spans), "\x1b[0mz");
        assert_eq!(scanner.drain_anomalies(), vec![Anomaly::MalformedEscapeSequence]);
    }

    #[test]
    fn test_esc_inside_osc_terminates_it() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let spans = scanner.scan(b"\x1b]0;unterminated\x1b[1mx");
        assert_eq!(text_of(&spans), "x");
        assert!(scanner.drain_anomalies().is_empty());
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let bytes = "caf\u{e9} \u{2713}".as_bytes();
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        let mut spans = Vec::new();
        for byte in bytes {
            spans.extend(scanner.scan(std::slice::from_ref(byte)));
        }
        assert_eq!(text_of(&spans), "caf\u{e9} \u{2713}");
    }

    #[test]
    fn test_unterminated_sequence_expires() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat).with_max_sequence_len(8);
        let mut spans = scanner.scan(b"\x1b]0;abc");
        assert!(scanner.in_sequence());
        spans.extend(scanner.scan(b"defgh"));
        assert!(!scanner.in_sequence());
        // ESC ] 0 ; a b c d reached the bound; the rest is ordinary text
        assert_eq!(text_of(&spans), "]0;abcdefgh");
        assert_eq!(scanner.drain_anomalies(), vec![Anomaly::MalformedEscapeSequence]);
    }

    #[test]
    fn test_discard_drops_held_sequence() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat);
        scanner.scan(b"\x1b]7;file:///old");
        scanner.discard();
        let spans = scanner.scan(b"/path\x07next");
        assert!(dirs_of(&spans).is_empty());
        assert_eq!(text_of(&spans), "/pathnext");
    }

    #[test]
    fn test_arbitrary_bytes_never_panic() {
        let mut scanner = EscapeScanner::new(ScanMode::Chat).with_max_sequence_len(16);
        let noise: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        for chunk in noise.chunks(7) {
            scanner.scan(chunk);
        }
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1mhi\x1b[0m there"), "hi there");
        assert_eq!(strip_ansi("no codes"), "no codes");
        assert_eq!(strip_ansi("cut\x1b[3"), "cut");
    }
}

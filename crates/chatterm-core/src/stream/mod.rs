//! Byte stream interpretation
//!
//! Raw PTY bytes flow through three stages before reaching the turn
//! aggregator:
//!
//! ```text
//! bytes -> EscapeScanner -> LineReassembler -> EventClassifier
//!              |
//!              +-> OSC-7 directory reports
//! ```

pub mod classifier;
pub mod event;
pub mod lines;
pub mod osc7;
pub mod scanner;

pub use classifier::{Classified, EventClassifier, DEFAULT_NOISE_MAX_LEN};
pub use event::{ContentBlock, ResultInfo, StructuredEvent};
pub use lines::LineReassembler;
pub use osc7::normalize_osc7_uri;
pub use scanner::{strip_ansi, EscapeScanner, ScanMode, Span, DEFAULT_MAX_SEQUENCE_LEN};

use thiserror::Error;

/// Malformed input the pipeline recovered from.
///
/// None of these stop processing; they are counted in
/// [`PipelineStats`](crate::pipeline::PipelineStats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Anomaly {
    #[error("malformed escape sequence")]
    MalformedEscapeSequence,

    #[error("unparsable structured line")]
    UnparsableStructuredLine,

    #[error("unrecognized structured event shape")]
    UnrecognizedStructuredEventShape,

    #[error("malformed OSC-7 payload")]
    MalformedOsc7Payload,
}

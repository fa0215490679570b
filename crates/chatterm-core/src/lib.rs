//! chatterm core
//!
//! Interprets the byte stream of an interactive process running behind a
//! pseudo-terminal and turns it into:
//!
//! - a working directory signal extracted from OSC-7 reports,
//! - cleaned display text for a chat view,
//! - an ordered, append-only list of conversational turns, built from plain
//!   text or from line-delimited JSON events.
//!
//! # Example
//!
//! ```
//! use chatterm_core::ChatPipeline;
//!
//! let mut pipeline = ChatPipeline::new();
//! pipeline.feed(b"\x1b]7;file:///C:/Users/dev\x07");
//! pipeline.submit_user("build");
//! pipeline.feed(b"hello ");
//! pipeline.feed(b"world\r\n");
//!
//! assert_eq!(pipeline.directory().current().as_deref(), Some("C:\\Users\\dev"));
//! assert_eq!(pipeline.messages()[1].content, "hello world");
//! ```

pub mod chat;
pub mod config;
pub mod directory;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod pty;
pub mod stream;

// Re-exports for convenience
pub use chat::{Message, MessageId, MessageRole, ToolBlock, TurnAggregator, TurnEvent, TurnPhase};
pub use config::ChatConfig;
pub use directory::DirectoryTracker;
pub use error::{ConfigError, PtyError};
pub use host::{ChatSession, SessionManager, TerminalSession};
pub use pipeline::{ChatPipeline, PipelineStats, StateDelta, TerminalDelta, TerminalPipeline};
pub use pty::{NativePty, PtyEvent, PtySession};
pub use stream::{Anomaly, StructuredEvent};

//! Session hosts
//!
//! A host owns one [`PtySession`](crate::pty::PtySession), drives its
//! pipeline from a pump task and exposes read-only, change-notified views.

pub mod chat;
pub mod manager;
pub mod terminal;

pub use chat::ChatSession;
pub use manager::{ManagerEvent, PtyFactory, SessionInfo, SessionKind, SessionManager};
pub use terminal::TerminalSession;

use crate::error::PtyError;

/// Red banner shown in a terminal view when the PTY cannot be opened.
pub fn failure_banner(err: &PtyError) -> String {
    format!("\r\n\x1b[31mchatterm: failed to start session: {}\x1b[0m\r\n", err)
}

pub(crate) fn exit_banner(exit_code: i32) -> String {
    format!("\r\n\x1b[2mchatterm: process exited with code {}\x1b[0m\r\n", exit_code)
}

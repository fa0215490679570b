//! PTY session abstraction
//!
//! The pipelines never touch a PTY directly. Hosts drive any
//! [`PtySession`]: the `portable-pty` backed [`NativePty`] in production and
//! an in-memory [`ScriptedPty`] in tests.

mod native;
#[cfg(any(test, feature = "test-support"))]
mod scripted;

pub use native::NativePty;
#[cfg(any(test, feature = "test-support"))]
pub use scripted::{ScriptedHandle, ScriptedPty};

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PtyError;

/// Raw PTY output, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// Child exited with this code (-1 if unknown)
    Exit(i32),
}

#[async_trait]
pub trait PtySession: Send + Sync {
    fn id(&self) -> &str;

    /// Spawn the child on a new PTY of the given size.
    async fn open(&mut self, cols: u16, rows: u16) -> Result<(), PtyError>;

    async fn write(&self, data: &[u8]) -> Result<(), PtyError>;

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Terminate the child. Closing a session that is not running is a no-op.
    async fn close(&mut self) -> Result<(), PtyError>;

    fn is_running(&self) -> bool;

    /// Receive every event emitted after this call.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent>;
}

/// Fan-out of PTY events to every live subscriber.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<PtyEvent>>>>,
}

impl Subscribers {
    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Send to every subscriber, dropping the ones that went away.
    pub(crate) fn send(&self, event: PtyEvent) {
        let mut senders = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Session id in the form `pty-<millis>-<8 hex>`.
pub(crate) fn new_session_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("pty-{}-{}", chrono::Utc::now().timestamp_millis(), &uuid[..8])
}

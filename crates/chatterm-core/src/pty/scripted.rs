//! In-memory PTY session driven by tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{new_session_id, PtyEvent, PtySession, Subscribers};
use crate::error::PtyError;

/// Test-side controls for a [`ScriptedPty`] that has been moved into a host.
#[derive(Clone)]
pub struct ScriptedHandle {
    running: Arc<AtomicBool>,
    subscribers: Subscribers,
    written: Arc<Mutex<Vec<u8>>>,
    size: Arc<Mutex<Option<(u16, u16)>>>,
}

impl ScriptedHandle {
    /// Emit output as if the child wrote it.
    pub fn emit(&self, data: impl AsRef<[u8]>) {
        self.subscribers.send(PtyEvent::Output(data.as_ref().to_vec()));
    }

    /// Simulate the child exiting.
    pub fn exit(&self, code: i32) {
        self.running.store(false, Ordering::SeqCst);
        self.subscribers.send(PtyEvent::Exit(code));
    }

    /// Everything written to the session so far.
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Size from the last `open` or `resize`.
    pub fn size(&self) -> Option<(u16, u16)> {
        *self.size.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct ScriptedPty {
    id: String,
    handle: ScriptedHandle,
    fail_open: Option<String>,
}

impl ScriptedPty {
    pub fn new() -> Self {
        Self {
            id: new_session_id(),
            handle: ScriptedHandle {
                running: Arc::new(AtomicBool::new(false)),
                subscribers: Subscribers::default(),
                written: Arc::new(Mutex::new(Vec::new())),
                size: Arc::new(Mutex::new(None)),
            },
            fail_open: None,
        }
    }

    /// A session whose `open` always fails with `reason`.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_open: Some(reason.into()),
            ..Self::new()
        }
    }

    pub fn handle(&self) -> ScriptedHandle {
        self.handle.clone()
    }
}

impl Default for ScriptedPty {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PtySession for ScriptedPty {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if let Some(reason) = &self.fail_open {
            return Err(PtyError::Spawn {
                command: "scripted".to_string(),
                reason: reason.clone(),
            });
        }
        if self.handle.running.swap(true, Ordering::SeqCst) {
            return Err(PtyError::AlreadyRunning);
        }
        *self
            .handle
            .size
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((cols, rows));
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.handle.is_running() {
            return Err(PtyError::NotRunning);
        }
        self.handle
            .written
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if !self.handle.is_running() {
            return Err(PtyError::NotRunning);
        }
        *self
            .handle
            .size
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((cols, rows));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PtyError> {
        self.handle.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        self.handle.subscribers.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_session_records_writes() {
        let mut pty = ScriptedPty::new();
        let handle = pty.handle();
        let mut rx = pty.subscribe();

        assert!(matches!(pty.write(b"x").await, Err(PtyError::NotRunning)));
        pty.open(100, 40).await.unwrap();
        assert!(matches!(pty.open(100, 40).await, Err(PtyError::AlreadyRunning)));
        pty.write(b"ls\r").await.unwrap();
        pty.resize(80, 24).await.unwrap();

        handle.emit("out");
        handle.exit(3);

        assert_eq!(handle.written(), b"ls\r");
        assert_eq!(handle.size(), Some((80, 24)));
        assert_eq!(rx.recv().await, Some(PtyEvent::Output(b"out".to_vec())));
        assert_eq!(rx.recv().await, Some(PtyEvent::Exit(3)));
        assert!(!pty.is_running());
    }

    #[tokio::test]
    async fn test_failing_session() {
        let mut pty = ScriptedPty::failing("no such file");
        let err = pty.open(80, 24).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to spawn scripted: no such file");
        assert!(!pty.is_running());
    }
}

//! Directory Tracker
//!
//! Session-wide working directory, fed by OSC-7 reports. Clones share the
//! same value, so a chat and a terminal pipeline can publish into one
//! tracker while any number of readers watch it.
//!
//! Only the pipelines in this crate write to it; everyone else reads:
//!
//! ```compile_fail
//! let pipeline = chatterm_core::ChatPipeline::new();
//! pipeline.directory().report("/not/from/osc7");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

#[derive(Clone)]
pub struct DirectoryTracker {
    tx: Arc<watch::Sender<Option<String>>>,
    generation: Arc<AtomicU64>,
}

impl DirectoryTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Overwrite the current directory. The path is not checked.
    pub(crate) fn report(&self, path: impl Into<String>) {
        let path = path.into();
        debug!(path = %path, "working directory changed");
        self.tx.send_replace(Some(path));
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Last reported directory, `None` until the first report.
    pub fn current(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Change-notified read-only view.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }

    /// Number of accepted reports.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for DirectoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DirectoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryTracker")
            .field("current", &self.current())
            .field("generation", &self.generation())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_unknown() {
        let tracker = DirectoryTracker::new();
        assert_eq!(tracker.current(), None);
        assert_eq!(tracker.generation(), 0);
    }

    #[test]
    fn test_report_overwrites() {
        let tracker = DirectoryTracker::new();
        tracker.report("/a");
        tracker.report("/does/not/exist");
        assert_eq!(tracker.current().as_deref(), Some("/does/not/exist"));
        assert_eq!(tracker.generation(), 2);
    }

    #[test]
    fn test_clones_share_value() {
        let tracker = DirectoryTracker::new();
        let other = tracker.clone();
        other.report("/shared");
        assert_eq!(tracker.current().as_deref(), Some("/shared"));
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let tracker = DirectoryTracker::new();
        let mut rx = tracker.subscribe();
        assert_eq!(*rx.borrow(), None);

        tracker.report("/srv");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some("/srv"));
    }
}

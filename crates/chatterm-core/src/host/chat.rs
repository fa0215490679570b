//! Chat session host
//!
//! Owns one PTY session and pumps its output through a [`ChatPipeline`].
//! The pipeline sits behind a single lock; every mutation publishes a new
//! message snapshot and the [`StateDelta`] that produced it.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chat::Message;
use crate::config::ChatConfig;
use crate::directory::DirectoryTracker;
use crate::error::PtyError;
use crate::pipeline::{ChatPipeline, PipelineStats, StateDelta};
use crate::pty::{PtyEvent, PtySession};

const DELTA_CHANNEL_CAPACITY: usize = 1024;

/// Publishes pipeline changes to readers.
#[derive(Clone)]
struct Publisher {
    messages_tx: Arc<watch::Sender<Vec<Message>>>,
    delta_tx: broadcast::Sender<StateDelta>,
}

impl Publisher {
    /// Must be called with the pipeline lock held so snapshots stay ordered.
    fn publish(&self, pipeline: &ChatPipeline, delta: StateDelta) {
        if delta.is_empty() {
            return;
        }
        if !delta.events.is_empty() {
            self.messages_tx.send_replace(pipeline.messages().to_vec());
        }
        // No receivers is fine
        let _ = self.delta_tx.send(delta);
    }
}

pub struct ChatSession<P: PtySession + 'static> {
    id: String,
    cols: u16,
    rows: u16,
    pty: Arc<Mutex<P>>,
    pipeline: Arc<Mutex<ChatPipeline>>,
    directory: DirectoryTracker,
    publisher: Publisher,
    pump: Option<JoinHandle<()>>,
}

impl<P: PtySession + 'static> ChatSession<P> {
    pub fn new(pty: P, config: &ChatConfig) -> Self {
        let directory = DirectoryTracker::new();
        let pipeline = ChatPipeline::from_config(config).with_directory(directory.clone());
        let (messages_tx, _) = watch::channel(Vec::new());
        let (delta_tx, _) = broadcast::channel(DELTA_CHANNEL_CAPACITY);

        Self {
            id: pty.id().to_string(),
            cols: config.pty.cols,
            rows: config.pty.rows,
            pty: Arc::new(Mutex::new(pty)),
            pipeline: Arc::new(Mutex::new(pipeline)),
            directory,
            publisher: Publisher {
                messages_tx: Arc::new(messages_tx),
                delta_tx,
            },
            pump: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Open the PTY and start feeding its output into the pipeline.
    ///
    /// A failure to open is returned as is; nothing is retried.
    pub async fn start(&mut self) -> Result<(), PtyError> {
        let events = {
            let mut pty = self.pty.lock().await;
            if pty.is_running() {
                return Err(PtyError::AlreadyRunning);
            }
            // Subscribe first so no early output is missed
            let events = pty.subscribe();
            pty.open(self.cols, self.rows).await?;
            events
        };

        {
            let mut pipeline = self.pipeline.lock().await;
            pipeline.reopen();
            pipeline.set_tool_active(true);
        }

        info!(session = %self.id, cols = self.cols, rows = self.rows, "Chat session started");
        self.pump = Some(tokio::spawn(pump(
            self.id.clone(),
            events,
            Arc::clone(&self.pipeline),
            self.publisher.clone(),
        )));
        Ok(())
    }

    /// Record `text` as a user turn and send it to the child.
    pub async fn submit_user_input(&self, text: &str) -> Result<(), PtyError> {
        let pty = self.pty.lock().await;
        if !pty.is_running() {
            return Err(PtyError::NotRunning);
        }

        {
            let mut pipeline = self.pipeline.lock().await;
            let delta = pipeline.submit_user(text);
            self.publisher.publish(&pipeline, delta);
        }

        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\r');
        pty.write(&data).await
    }

    /// Empty the message list. The working directory is kept.
    pub async fn clear(&self) {
        let mut pipeline = self.pipeline.lock().await;
        let delta = pipeline.clear_session();
        self.publisher.publish(&pipeline, delta);
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.pty.lock().await.resize(cols, rows).await
    }

    /// Close the PTY. Partial output is discarded, an open turn is closed.
    pub async fn close(&mut self) -> Result<(), PtyError> {
        let result = self.pty.lock().await.close().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        let mut pipeline = self.pipeline.lock().await;
        pipeline.set_tool_active(false);
        let delta = pipeline.close();
        self.publisher.publish(&pipeline, delta);
        info!(session = %self.id, "Chat session closed");
        result
    }

    pub async fn is_running(&self) -> bool {
        self.pty.lock().await.is_running()
    }

    /// Change-notified message list.
    pub fn messages(&self) -> watch::Receiver<Vec<Message>> {
        self.publisher.messages_tx.subscribe()
    }

    /// Current message list.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.pipeline.lock().await.messages().to_vec()
    }

    /// Change-notified working directory.
    pub fn directory(&self) -> watch::Receiver<Option<String>> {
        self.directory.subscribe()
    }

    pub fn directory_tracker(&self) -> &DirectoryTracker {
        &self.directory
    }

    /// Every non-empty delta, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<StateDelta> {
        self.publisher.delta_tx.subscribe()
    }

    pub async fn stats(&self) -> PipelineStats {
        self.pipeline.lock().await.stats().clone()
    }
}

impl<P: PtySession + 'static> Drop for ChatSession<P> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump(
    id: String,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
    pipeline: Arc<Mutex<ChatPipeline>>,
    publisher: Publisher,
) {
    while let Some(event) = events.recv().await {
        let mut state = pipeline.lock().await;
        match event {
            PtyEvent::Output(bytes) => {
                let delta = state.feed(&bytes);
                publisher.publish(&state, delta);
            }
            PtyEvent::Exit(exit_code) => {
                info!(session = %id, exit_code, "Chat session child exited");
                state.set_tool_active(false);
                let delta = state.close_open_turn();
                publisher.publish(&state, delta);
                break;
            }
        }
    }
    debug!(session = %id, "Chat pump finished");
}

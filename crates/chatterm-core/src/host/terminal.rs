//! Terminal session host
//!
//! Forwards PTY output byte for byte to a renderer while tracking the
//! working directory. Startup failures are shown in the terminal itself.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{exit_banner, failure_banner};
use crate::config::ChatConfig;
use crate::directory::DirectoryTracker;
use crate::error::PtyError;
use crate::pipeline::{PipelineStats, TerminalPipeline};
use crate::pty::{PtyEvent, PtySession};

pub struct TerminalSession<P: PtySession + 'static> {
    id: String,
    cols: u16,
    rows: u16,
    pty: Arc<Mutex<P>>,
    pipeline: Arc<Mutex<TerminalPipeline>>,
    directory: DirectoryTracker,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    output_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    pump: Option<JoinHandle<()>>,
}

impl<P: PtySession + 'static> TerminalSession<P> {
    pub fn new(pty: P, config: &ChatConfig) -> Self {
        let directory = DirectoryTracker::new();
        let pipeline = TerminalPipeline::from_config(config).with_directory(directory.clone());
        let (output_tx, output_rx) = mpsc::unbounded_channel();

        Self {
            id: pty.id().to_string(),
            cols: config.pty.cols,
            rows: config.pty.rows,
            pty: Arc::new(Mutex::new(pty)),
            pipeline: Arc::new(Mutex::new(pipeline)),
            directory,
            output_tx,
            output_rx: Some(output_rx),
            pump: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes for the renderer. Can be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.output_rx.take()
    }

    /// Open the PTY. On failure the error is also written to the output as
    /// a banner; call [`restart`](Self::restart) to try again.
    pub async fn start(&mut self) -> Result<(), PtyError> {
        let events = {
            let mut pty = self.pty.lock().await;
            if pty.is_running() {
                return Err(PtyError::AlreadyRunning);
            }
            let events = pty.subscribe();
            if let Err(e) = pty.open(self.cols, self.rows).await {
                error!(session = %self.id, error = %e, "Failed to start terminal session");
                let _ = self.output_tx.send(failure_banner(&e).into_bytes());
                return Err(e);
            }
            events
        };

        info!(session = %self.id, cols = self.cols, rows = self.rows, "Terminal session started");
        self.pump = Some(tokio::spawn(pump(
            self.id.clone(),
            events,
            Arc::clone(&self.pipeline),
            self.output_tx.clone(),
        )));
        Ok(())
    }

    /// User-initiated retry: close whatever is left and start again.
    pub async fn restart(&mut self) -> Result<(), PtyError> {
        info!(session = %self.id, "Restarting terminal session");
        self.close().await?;
        self.pipeline.lock().await.reset();
        self.start().await
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        self.pty.lock().await.write(data).await
    }

    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.cols = cols;
        self.rows = rows;
        let pty = self.pty.lock().await;
        if !pty.is_running() {
            // applied on the next start
            return Ok(());
        }
        pty.resize(cols, rows).await
    }

    pub async fn close(&mut self) -> Result<(), PtyError> {
        let result = self.pty.lock().await.close().await;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        debug!(session = %self.id, "Terminal session closed");
        result
    }

    pub async fn is_running(&self) -> bool {
        self.pty.lock().await.is_running()
    }

    /// Change-notified working directory.
    pub fn directory(&self) -> watch::Receiver<Option<String>> {
        self.directory.subscribe()
    }

    pub fn directory_tracker(&self) -> &DirectoryTracker {
        &self.directory
    }

    pub async fn stats(&self) -> PipelineStats {
        self.pipeline.lock().await.stats().clone()
    }
}

impl<P: PtySession + 'static> Drop for TerminalSession<P> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump(
    id: String,
    mut events: mpsc::UnboundedReceiver<PtyEvent>,
    pipeline: Arc<Mutex<TerminalPipeline>>,
    output: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PtyEvent::Output(bytes) => {
                let delta = pipeline.lock().await.feed(&bytes);
                if let Some(dir) = &delta.directory {
                    debug!(session = %id, dir = %dir, "Terminal directory changed");
                }
                if !delta.output.is_empty() && output.send(delta.output).is_err() {
                    debug!(session = %id, "Renderer went away");
                    break;
                }
            }
            PtyEvent::Exit(exit_code) => {
                info!(session = %id, exit_code, "Terminal session child exited");
                let _ = output.send(exit_banner(exit_code).into_bytes());
                break;
            }
        }
    }
}

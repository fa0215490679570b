//! Raw-mode terminal view
//!
//! Keystrokes go to the PTY byte for byte; output goes to stdout unmodified,
//! OSC-7 reports included, while the session tracks the working directory.
//! Ctrl+] detaches. After the process exits, `r` restarts it.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use chatterm_core::{ChatConfig, SessionManager};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::keys::{is_detach, key_to_bytes};

const SESSION_ID: &str = "term";

enum Input {
    Bytes(Vec<u8>),
    Resize(u16, u16),
    Detach,
}

/// Leaves raw mode when dropped, including on early return.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

pub async fn run(mut config: ChatConfig) -> Result<()> {
    if let Ok((cols, rows)) = terminal::size() {
        config.pty.cols = cols;
        config.pty.rows = rows;
    }

    let manager = SessionManager::native(config);
    let session = manager
        .spawn_terminal(SESSION_ID)
        .await
        .context("Failed to create terminal session")?;
    let mut output = session
        .lock()
        .await
        .take_output()
        .context("Terminal output already taken")?;

    eprint!("\x1b[90m[chatterm] Ctrl+] to detach\x1b[0m\r\n");
    let _raw = RawModeGuard::enable()?;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    let reader = tokio::task::spawn_blocking(move || read_input(input_tx));

    let mut stdout = io::stdout();
    let mut hinted = false;

    loop {
        tokio::select! {
            chunk = output.recv() => {
                let Some(chunk) = chunk else { break };
                stdout.write_all(&chunk)?;
                stdout.flush()?;

                if !hinted && !session.lock().await.is_running().await {
                    write!(stdout, "\x1b[90m[chatterm] press r to restart, Ctrl+] to detach\x1b[0m\r\n")?;
                    stdout.flush()?;
                    hinted = true;
                }
            }
            input = input_rx.recv() => {
                let Some(input) = input else { break };
                let mut session = session.lock().await;
                match input {
                    Input::Detach => break,
                    Input::Resize(cols, rows) => {
                        if let Err(e) = session.resize(cols, rows).await {
                            debug!(error = %e, "Resize failed");
                        }
                    }
                    Input::Bytes(bytes) if session.is_running().await => {
                        if let Err(e) = session.write(&bytes).await {
                            warn!(error = %e, "Write to PTY failed");
                        }
                    }
                    Input::Bytes(bytes) => {
                        if bytes == b"r" {
                            info!("Restarting terminal session");
                            hinted = false;
                            if let Err(e) = session.restart().await {
                                warn!(error = %e, "Restart failed");
                            }
                        }
                    }
                }
            }
        }
    }

    reader.abort();
    manager.shutdown().await;
    Ok(())
}

/// Blocking crossterm loop; stops when the receiver is gone or on detach.
fn read_input(tx: mpsc::UnboundedSender<Input>) {
    loop {
        if tx.is_closed() {
            return;
        }
        match event::poll(Duration::from_millis(100)) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                warn!(error = %e, "Input poll failed");
                return;
            }
        }

        let input = match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release && is_detach(&key) => Input::Detach,
            Ok(Event::Key(key)) => match key_to_bytes(&key) {
                Some(bytes) => Input::Bytes(bytes),
                None => {
                    if key.code != KeyCode::Null {
                        debug!(code = ?key.code, "Unmapped key");
                    }
                    continue;
                }
            },
            Ok(Event::Paste(text)) => Input::Bytes(text.into_bytes()),
            Ok(Event::Resize(cols, rows)) => Input::Resize(cols, rows),
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Input read failed");
                return;
            }
        };

        let detach = matches!(input, Input::Detach);
        if tx.send(input).is_err() || detach {
            return;
        }
    }
}

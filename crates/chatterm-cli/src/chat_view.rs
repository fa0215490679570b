//! Line-mode chat view
//!
//! Stdin lines become user turns; assistant text streams to stdout as it
//! grows. `/clear` empties the session, `/quit` leaves.

use std::collections::HashMap;
use std::io::{self, Write};

use anyhow::{Context, Result};
use chatterm_core::{ChatConfig, MessageId, SessionManager, StateDelta, TurnEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const SESSION_ID: &str = "chat";

/// Prints only what is new in each assistant message.
#[derive(Default)]
pub struct ChatPrinter {
    /// Content and tool count already shown, per message
    shown: HashMap<MessageId, (String, usize)>,
}

impl ChatPrinter {
    pub fn apply(&mut self, delta: &StateDelta, out: &mut impl Write) -> io::Result<()> {
        for event in &delta.events {
            match event {
                TurnEvent::Cleared => {
                    self.shown.clear();
                    writeln!(out, "--- session cleared ---")?;
                }
                TurnEvent::Appended(m) | TurnEvent::Updated(m) | TurnEvent::Closed(m) => {
                    // the user already sees what they typed
                    if m.is_user() {
                        continue;
                    }
                    let (text, tools) = self.shown.entry(m.id).or_default();
                    match m.content.strip_prefix(text.as_str()) {
                        Some(suffix) => write!(out, "{}", suffix)?,
                        None => write!(out, "\n{}", m.content)?,
                    }
                    text.clone_from(&m.content);

                    for block in m.blocks.iter().skip(*tools) {
                        write!(out, "\n[tool: {}]\n", block.name)?;
                    }
                    *tools = m.blocks.len();

                    if matches!(event, TurnEvent::Closed(_)) && !m.content.is_empty() {
                        writeln!(out)?;
                    }
                }
            }
        }
        out.flush()
    }
}

pub async fn run(config: ChatConfig) -> Result<()> {
    let manager = SessionManager::native(config);
    let session = manager
        .spawn_chat(SESSION_ID)
        .await
        .context("Failed to start chat session")?;
    let mut deltas = session.lock().await.subscribe();

    eprintln!("\x1b[90mchatterm chat: /clear to reset, /quit to leave\x1b[0m");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = ChatPrinter::default();
    let mut stdout = io::stdout();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "/quit" => break,
                    "/clear" => session.lock().await.clear().await,
                    "" => {}
                    _ => {
                        if let Err(e) = session.lock().await.submit_user_input(&line).await {
                            eprintln!("\x1b[31mchatterm: {}\x1b[0m", e);
                            break;
                        }
                    }
                }
            }
            delta = deltas.recv() => {
                match delta {
                    Ok(delta) => {
                        if let Some(dir) = &delta.directory {
                            eprintln!("\x1b[90m[cwd] {}\x1b[0m", dir);
                        }
                        printer.apply(&delta, &mut stdout)?;
                        if !session.lock().await.is_running().await {
                            eprintln!("\x1b[33mSession exited\x1b[0m");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Chat view fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

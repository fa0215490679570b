//! Session Manager - keeps independent chat and terminal hosts by id

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};

use super::chat::ChatSession;
use super::terminal::TerminalSession;
use crate::config::ChatConfig;
use crate::error::PtyError;
use crate::pty::{NativePty, PtySession};

// ========== Types ==========

/// Builds a fresh PTY session for each spawned host.
pub type PtyFactory<P> = Arc<dyn Fn(&ChatConfig) -> P + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Chat,
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub kind: SessionKind,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Events from the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Spawned { id: String, kind: SessionKind },
    Closed { id: String, kind: SessionKind },
}

type Shared<T> = Arc<Mutex<T>>;

// ========== SessionManager ==========

pub struct SessionManager<P: PtySession + 'static> {
    config: ChatConfig,
    factory: PtyFactory<P>,
    chats: RwLock<HashMap<String, Shared<ChatSession<P>>>>,
    terminals: RwLock<HashMap<String, Shared<TerminalSession<P>>>>,
    event_tx: broadcast::Sender<ManagerEvent>,
}

impl SessionManager<NativePty> {
    /// Manager spawning real PTYs from `config.pty`.
    pub fn native(config: ChatConfig) -> Self {
        Self::new(config, Arc::new(|config: &ChatConfig| NativePty::new(&config.pty)))
    }
}

impl<P: PtySession + 'static> SessionManager<P> {
    pub fn new(config: ChatConfig, factory: PtyFactory<P>) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            factory,
            chats: RwLock::new(HashMap::new()),
            terminals: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Create and start a chat host. Fails if `id` is taken by a running
    /// chat or if the PTY cannot be opened.
    pub async fn spawn_chat(&self, id: &str) -> Result<Shared<ChatSession<P>>, PtyError> {
        let mut chats = self.chats.write().await;
        if let Some(existing) = chats.get(id) {
            if existing.lock().await.is_running().await {
                return Err(PtyError::AlreadyRunning);
            }
        }

        let mut session = ChatSession::new((self.factory)(&self.config), &self.config);
        session.start().await?;

        let session = Arc::new(Mutex::new(session));
        chats.insert(id.to_string(), Arc::clone(&session));
        drop(chats);

        info!(id = %id, "Chat session spawned");
        let _ = self.event_tx.send(ManagerEvent::Spawned {
            id: id.to_string(),
            kind: SessionKind::Chat,
        });
        Ok(session)
    }

    /// Create and start a terminal host. It is registered even if the PTY
    /// fails to open: the failure is in its output and
    /// [`TerminalSession::restart`] retries.
    pub async fn spawn_terminal(&self, id: &str) -> Result<Shared<TerminalSession<P>>, PtyError> {
        let mut terminals = self.terminals.write().await;
        if let Some(existing) = terminals.get(id) {
            if existing.lock().await.is_running().await {
                return Err(PtyError::AlreadyRunning);
            }
        }

        let mut session = TerminalSession::new((self.factory)(&self.config), &self.config);
        if let Err(e) = session.start().await {
            warn!(id = %id, error = %e, "Terminal session registered without a running PTY");
        }

        let session = Arc::new(Mutex::new(session));
        terminals.insert(id.to_string(), Arc::clone(&session));
        drop(terminals);

        info!(id = %id, "Terminal session spawned");
        let _ = self.event_tx.send(ManagerEvent::Spawned {
            id: id.to_string(),
            kind: SessionKind::Terminal,
        });
        Ok(session)
    }

    pub async fn chat(&self, id: &str) -> Option<Shared<ChatSession<P>>> {
        self.chats.read().await.get(id).cloned()
    }

    pub async fn terminal(&self, id: &str) -> Option<Shared<TerminalSession<P>>> {
        self.terminals.read().await.get(id).cloned()
    }

    /// Close and forget a session. Unknown ids are ignored.
    pub async fn close(&self, id: &str) -> Result<(), PtyError> {
        let chat = self.chats.write().await.remove(id);
        if let Some(session) = chat {
            session.lock().await.close().await?;
            info!(id = %id, "Chat session closed");
            let _ = self.event_tx.send(ManagerEvent::Closed {
                id: id.to_string(),
                kind: SessionKind::Chat,
            });
        }

        let terminal = self.terminals.write().await.remove(id);
        if let Some(session) = terminal {
            session.lock().await.close().await?;
            info!(id = %id, "Terminal session closed");
            let _ = self.event_tx.send(ManagerEvent::Closed {
                id: id.to_string(),
                kind: SessionKind::Terminal,
            });
        }
        Ok(())
    }

    /// All sessions, sorted by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for (id, session) in self.chats.read().await.iter() {
            let session = session.lock().await;
            infos.push(SessionInfo {
                id: id.clone(),
                kind: SessionKind::Chat,
                running: session.is_running().await,
                cwd: session.directory_tracker().current(),
            });
        }
        for (id, session) in self.terminals.read().await.iter() {
            let session = session.lock().await;
            infos.push(SessionInfo {
                id: id.clone(),
                kind: SessionKind::Terminal,
                running: session.is_running().await,
                cwd: session.directory_tracker().current(),
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.event_tx.subscribe()
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        info!("Shutting down all sessions...");

        let mut ids: Vec<String> = self.chats.read().await.keys().cloned().collect();
        ids.extend(self.terminals.read().await.keys().cloned());
        ids.sort();
        ids.dedup();

        for id in ids {
            if let Err(e) = self.close(&id).await {
                error!(id = %id, error = %e, "Error closing session");
            }
        }

        info!("All sessions shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{ScriptedHandle, ScriptedPty};
    use std::sync::Mutex as StdMutex;

    /// Factory that remembers a handle for every PTY it built.
    fn scripted_manager() -> (SessionManager<ScriptedPty>, Arc<StdMutex<Vec<ScriptedHandle>>>) {
        let handles = Arc::new(StdMutex::new(Vec::new()));
        let recorded = Arc::clone(&handles);
        let factory: PtyFactory<ScriptedPty> = Arc::new(move |_config: &ChatConfig| {
            let pty = ScriptedPty::new();
            recorded.lock().unwrap().push(pty.handle());
            pty
        });
        (SessionManager::new(ChatConfig::default(), factory), handles)
    }

    #[tokio::test]
    async fn test_spawn_and_list() {
        let (manager, handles) = scripted_manager();
        let mut events = manager.subscribe();

        manager.spawn_chat("chat").await.unwrap();
        manager.spawn_terminal("term").await.unwrap();
        assert_eq!(handles.lock().unwrap().len(), 2);

        let list = manager.list().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "chat");
        assert_eq!(list[0].kind, SessionKind::Chat);
        assert!(list[0].running);
        assert_eq!(list[1].kind, SessionKind::Terminal);

        assert_eq!(
            events.recv().await.unwrap(),
            ManagerEvent::Spawned {
                id: "chat".into(),
                kind: SessionKind::Chat
            }
        );
    }

    #[tokio::test]
    async fn test_running_id_is_rejected() {
        let (manager, _handles) = scripted_manager();
        manager.spawn_chat("a").await.unwrap();
        assert!(matches!(manager.spawn_chat("a").await, Err(PtyError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let (manager, handles) = scripted_manager();
        let first = manager.spawn_chat("one").await.unwrap();
        let second = manager.spawn_chat("two").await.unwrap();

        first.lock().await.submit_user_input("only here").await.unwrap();
        assert!(second.lock().await.snapshot().await.is_empty());

        let handles = handles.lock().unwrap().clone();
        assert_eq!(handles[0].written(), b"only here\r");
        assert!(handles[1].written().is_empty());
    }

    #[tokio::test]
    async fn test_close_and_shutdown() {
        let (manager, handles) = scripted_manager();
        manager.spawn_chat("a").await.unwrap();
        manager.spawn_terminal("b").await.unwrap();

        manager.close("a").await.unwrap();
        assert!(manager.chat("a").await.is_none());
        assert!(!handles.lock().unwrap()[0].is_running());

        manager.close("missing").await.unwrap();
        manager.shutdown().await;
        assert!(manager.list().await.is_empty());
        assert!(!handles.lock().unwrap()[1].is_running());
    }
}

//! `portable-pty` backed session

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::{new_session_id, PtyEvent, PtySession, Subscribers};
use crate::config::PtyConfig;
use crate::error::PtyError;

const READ_BUF_SIZE: usize = 4096;

pub struct NativePty {
    id: String,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    term: String,
    env: Vec<(String, String)>,
    master: std::sync::Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
    pid: Option<u32>,
    running: Arc<AtomicBool>,
    subscribers: Subscribers,
}

impl NativePty {
    pub fn new(config: &PtyConfig) -> Self {
        let (program, args) = config.program();
        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            id: new_session_id(),
            program,
            args,
            cwd: config.cwd.clone(),
            term: config.term.clone(),
            env,
            master: std::sync::Mutex::new(None),
            writer: Arc::new(Mutex::new(None)),
            killer: None,
            pid: None,
            running: Arc::new(AtomicBool::new(false)),
            subscribers: Subscribers::default(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }

        // Inherit the parent environment, then layer ours on top
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", &self.term);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Blocking read loop; reports the exit code once output is drained so
    /// subscribers always see `Exit` last.
    fn read_loop(
        id: String,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        running: Arc<AtomicBool>,
        subscribers: Subscribers,
    ) {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break, // EOF
                Ok(n) => subscribers.send(PtyEvent::Output(buf[..n].to_vec())),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a hung-up PTY
                    if running.load(Ordering::SeqCst) {
                        debug!(session = %id, error = %e, "PTY read ended");
                    }
                    break;
                }
            }
        }

        let exit_code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(e) => {
                warn!(session = %id, error = %e, "Failed to wait for child");
                -1
            }
        };
        running.store(false, Ordering::SeqCst);
        info!(session = %id, exit_code, "PTY exited");
        subscribers.send(PtyEvent::Exit(exit_code));
    }
}

#[async_trait]
impl PtySession for NativePty {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PtyError::AlreadyRunning);
        }

        info!(session = %self.id, program = %self.program, cwd = ?self.cwd, "Starting PTY session");

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut child = pair
            .slave
            .spawn_command(self.command())
            .map_err(|e| PtyError::Spawn {
                command: self.program.clone(),
                reason: e.to_string(),
            })?;
        // The slave end belongs to the child now
        drop(pair.slave);
        let killer = child.clone_killer();

        self.pid = child.process_id();
        info!(session = %self.id, pid = ?self.pid, "PTY spawned");

        let (writer, reader) = match attach(pair.master.as_ref()) {
            Ok(io) => io,
            Err(e) => {
                error!(session = %self.id, error = %e, "Failed to attach to PTY");
                reap_child(&self.id, child.as_mut());
                self.pid = None;
                return Err(e);
            }
        };
        *self.writer.lock().await = Some(writer);
        *self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(pair.master);
        self.killer = Some(killer);
        self.running.store(true, Ordering::SeqCst);

        let id = self.id.clone();
        let running = Arc::clone(&self.running);
        let subscribers = self.subscribers.clone();
        tokio::task::spawn_blocking(move || {
            Self::read_loop(id, reader, child, running, subscribers);
        });

        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PtyError::NotRunning);
        }

        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(PtyError::NotRunning)?;
        writer.write_all(data)?;
        writer.flush()?;
        debug!(session = %self.id, data_len = data.len(), "Wrote to PTY");
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let master = master.as_ref().ok_or(PtyError::NotRunning)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::io)?;
        debug!(session = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PtyError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!(session = %self.id, "Closing PTY session");
        *self.writer.lock().await = None;
        if let Some(mut killer) = self.killer.take() {
            if let Err(e) = killer.kill() {
                // Already gone is fine
                error!(session = %self.id, error = %e, "Failed to kill child");
            }
        }
        self.master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<PtyEvent> {
        self.subscribers.subscribe()
    }
}

/// Writer and reader ends of a freshly opened master.
fn attach(
    master: &(dyn MasterPty + Send),
) -> Result<(Box<dyn Write + Send>, Box<dyn Read + Send>), PtyError> {
    let writer = master.take_writer().map_err(PtyError::io)?;
    let reader = master.try_clone_reader().map_err(PtyError::io)?;
    Ok((writer, reader))
}

/// Kill and wait for a child that will never get a reader.
fn reap_child(id: &str, child: &mut (dyn Child + Send + Sync)) {
    if let Err(e) = child.kill() {
        warn!(session = %id, error = %e, "Failed to kill child");
    }
    match child.wait() {
        Ok(status) => debug!(session = %id, exit_code = status.exit_code(), "Child reaped"),
        Err(e) => warn!(session = %id, error = %e, "Failed to wait for child"),
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if let Some(mut killer) = self.killer.take() {
            let _ = killer.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_running_before_open() {
        let pty = NativePty::new(&PtyConfig::default());
        assert!(!pty.is_running());
        assert!(pty.id().starts_with("pty-"));
        assert_eq!(pty.pid(), None);
    }

    #[tokio::test]
    async fn test_write_requires_open_session() {
        let mut pty = NativePty::new(&PtyConfig::default());
        assert!(matches!(pty.write(b"ls\r").await, Err(PtyError::NotRunning)));
        assert!(matches!(pty.resize(80, 24).await, Err(PtyError::NotRunning)));
        // closing an idle session is a no-op
        assert!(pty.close().await.is_ok());
    }

    #[test]
    fn test_command_carries_term_and_env() {
        let mut config = PtyConfig {
            command: Some("echo".into()),
            args: vec!["hi".into()],
            term: "xterm".into(),
            ..PtyConfig::default()
        };
        config.env.insert("CHATTERM_TEST".into(), "1".into());

        let pty = NativePty::new(&config);
        let cmd = pty.command();
        assert_eq!(cmd.get_env("TERM").and_then(|v| v.to_str()), Some("xterm"));
        assert_eq!(cmd.get_env("CHATTERM_TEST").and_then(|v| v.to_str()), Some("1"));
        assert_eq!(
            cmd.get_argv().iter().map(|a| a.to_string_lossy().into_owned()).collect::<Vec<_>>(),
            vec!["echo".to_string(), "hi".to_string()]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_reap_child_leaves_no_process() {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .unwrap();
        let mut cmd = CommandBuilder::new("/bin/sleep");
        cmd.arg("30");
        let mut child = pair.slave.spawn_command(cmd).unwrap();
        drop(pair.slave);
        assert!(child.try_wait().unwrap().is_none());

        reap_child("test", child.as_mut());
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_round_trip() {
        let config = PtyConfig {
            command: Some("/bin/echo".into()),
            args: vec!["chatterm-native".into()],
            ..PtyConfig::default()
        };
        let mut pty = NativePty::new(&config);
        let mut rx = pty.subscribe();
        pty.open(80, 24).await.unwrap();

        let mut output = Vec::new();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            while let Some(event) = rx.recv().await {
                match event {
                    PtyEvent::Output(bytes) => output.extend(bytes),
                    PtyEvent::Exit(code) => return Some(code),
                }
            }
            None
        })
        .await
        .unwrap();

        assert_eq!(exit, Some(0));
        assert!(String::from_utf8_lossy(&output).contains("chatterm-native"));
        assert!(!pty.is_running());
    }
}

//! Error types for chatterm-core

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the PTY collaborator.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(String),

    #[error("failed to spawn {command}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty session is not running")]
    NotRunning,

    #[error("pty session is already running")]
    AlreadyRunning,
}

impl PtyError {
    pub(crate) fn io(err: impl std::fmt::Display) -> Self {
        PtyError::Io(std::io::Error::other(err.to_string()))
    }
}

/// Failures while reading `config.yaml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

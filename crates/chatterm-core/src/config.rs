//! Configuration
//!
//! Loaded from YAML (`~/.chatterm/config.yaml` by default). Every field has a
//! default, so an empty or partial file is valid:
//!
//! ```yaml
//! pty:
//!   shell: /bin/zsh
//!   cols: 160
//!   env:
//!     LANG: en_US.UTF-8
//! scanner:
//!   keep_sgr: true
//! classifier:
//!   noise_max_len: 2
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::stream::{DEFAULT_MAX_SEQUENCE_LEN, DEFAULT_NOISE_MAX_LEN};

pub const CONFIG_ENV: &str = "CHATTERM_CONFIG";
pub const SHELL_ENV: &str = "CHATTERM_SHELL";
pub const COLS_ENV: &str = "CHATTERM_COLS";
pub const ROWS_ENV: &str = "CHATTERM_ROWS";

/// `~/.chatterm`
pub fn chatterm_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatterm")
}

/// `~/.chatterm/logs`
pub fn logs_dir() -> PathBuf {
    chatterm_home().join("logs")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub pty: PtyConfig,
    pub scanner: ScannerConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Program to run instead of the shell
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Shell used when no command is given (`$SHELL` if unset)
    pub shell: Option<String>,
    /// Start the shell as a login shell
    pub login_shell: bool,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub term: String,
    /// Extra environment on top of the inherited one
    pub env: HashMap<String, String>,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            shell: None,
            login_shell: true,
            cwd: None,
            cols: 120,
            rows: 30,
            term: "xterm-256color".to_string(),
            env: HashMap::new(),
        }
    }
}

impl PtyConfig {
    /// Shell to spawn when no command is configured.
    pub fn resolved_shell(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            return "cmd.exe".to_string();
        }
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }

    /// Program and arguments to spawn.
    pub fn program(&self) -> (String, Vec<String>) {
        match &self.command {
            Some(command) => (command.clone(), self.args.clone()),
            None => {
                let shell = self.resolved_shell();
                let args = if self.login_shell && !cfg!(windows) {
                    vec!["-l".to_string()]
                } else {
                    Vec::new()
                };
                (shell, args)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub max_sequence_len: usize,
    pub keep_sgr: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_sequence_len: DEFAULT_MAX_SEQUENCE_LEN,
            keep_sgr: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub noise_max_len: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            noise_max_len: DEFAULT_NOISE_MAX_LEN,
        }
    }
}

impl ChatConfig {
    /// `$CHATTERM_CONFIG`, else `~/.chatterm/config.yaml`.
    pub fn default_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => chatterm_home().join("config.yaml"),
        }
    }

    /// Strict load.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Lenient load: any problem is logged and defaults are used.
    /// Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = if !path.exists() {
            info!(path = ?path, "No config found, using defaults");
            Self::default()
        } else {
            match Self::from_file(&path) {
                Ok(config) => {
                    info!(path = ?path, "Config loaded");
                    config
                }
                Err(e) => {
                    error!(error = %e, "Failed to load config, using defaults");
                    Self::default()
                }
            }
        };

        config.apply_env_from(|key| std::env::var(key).ok());
        config
    }

    /// Apply `CHATTERM_SHELL`, `CHATTERM_COLS` and `CHATTERM_ROWS`.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(shell) = lookup(SHELL_ENV).filter(|s| !s.is_empty()) {
            self.pty.shell = Some(shell);
        }
        if let Some(cols) = lookup(COLS_ENV) {
            match cols.trim().parse::<u16>() {
                Ok(cols) if cols > 0 => self.pty.cols = cols,
                _ => warn!(value = %cols, "Ignoring invalid {}", COLS_ENV),
            }
        }
        if let Some(rows) = lookup(ROWS_ENV) {
            match rows.trim().parse::<u16>() {
                Ok(rows) if rows > 0 => self.pty.rows = rows,
                _ => warn!(value = %rows, "Ignoring invalid {}", ROWS_ENV),
            }
        }
    }
}

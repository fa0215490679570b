//! chatterm - chat and terminal views over a PTY session
//!
//! Usage:
//!   chatterm chat [--cwd DIR] [-c CONFIG] [-- COMMAND ARGS...]
//!   chatterm term [--cwd DIR] [-c CONFIG] [-- COMMAND ARGS...]

mod chat_view;
mod keys;
mod logging;
mod term_view;

use std::path::PathBuf;

use anyhow::Result;
use chatterm_core::config::CONFIG_ENV;
use chatterm_core::ChatConfig;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chatterm")]
#[command(about = "Chat and terminal views over a PTY session")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Line-mode chat: typed lines become turns, output becomes replies
    Chat(SessionArgs),
    /// Raw terminal passthrough with working-directory tracking
    Term(SessionArgs),
}

#[derive(ClapArgs, Debug)]
struct SessionArgs {
    /// Working directory for the spawned process (`~` is expanded)
    #[arg(long)]
    cwd: Option<String>,

    /// Config file (YAML)
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    /// Program and arguments to run instead of the shell
    #[arg(last = true)]
    command: Vec<String>,
}

impl SessionArgs {
    fn load_config(&self) -> ChatConfig {
        let mut config = ChatConfig::load(self.config.as_deref());
        if let Some(cwd) = &self.cwd {
            config.pty.cwd = Some(expand_home(cwd));
        }
        if let Some((program, args)) = self.command.split_first() {
            config.pty.command = Some(program.clone());
            config.pty.args = args.to_vec();
        }
        config
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
            home.join(rest.trim_start_matches('/'))
        }
        _ => PathBuf::from(path),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Raw mode owns the screen in term; logs go to the file only
    let to_stderr = matches!(args.command, Command::Chat(_));
    let _guard = logging::init(to_stderr)?;

    match args.command {
        Command::Chat(session) => {
            let config = session.load_config();
            info!(command = ?config.pty.program(), "Starting chat view");
            chat_view::run(config).await
        }
        Command::Term(session) => {
            let config = session.load_config();
            info!(command = ?config.pty.program(), "Starting terminal view");
            term_view::run(config).await
        }
    }
}

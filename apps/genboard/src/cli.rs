use crate::logging::LogLevel;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "genboard",
    about = "Follow generation sessions from the terminal",
    author,
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// Backend base URL (e.g. http://127.0.0.1:8000). Overrides GENBOARD_API_BASE.
    #[arg(long, global = true)]
    pub api_base: Option<String>,

    /// Push channel URL. Derived from the API base when omitted.
    #[arg(long, global = true)]
    pub push_url: Option<String>,

    /// Bearer token sent with every request.
    #[arg(long, global = true, env = "GENBOARD_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Follow by polling only; never open the push channel.
    #[arg(long, global = true)]
    pub no_push: bool,
}

#[derive(Debug, Args)]
pub struct LoggingArgs {
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs to a file instead of stderr.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a session's timeline and follow it until it settles.
    Watch { session: String },
    /// Send a follow-up message, then follow the session.
    Chat { session: String, message: String },
    /// Start a streamed generation, then follow it and summarize the result.
    Create { session: String, prompt: String },
}

impl Command {
    pub fn session(&self) -> &str {
        match self {
            Command::Watch { session }
            | Command::Chat { session, .. }
            | Command::Create { session, .. } => session,
        }
    }
}

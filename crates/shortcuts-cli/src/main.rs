use std::{fs::OpenOptions, path::PathBuf, sync::Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use shortcut_manager::{EngineConfig, Server, config::default_config_path};

mod commands;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "shortcuts")]
#[command(about = "Launch and supervise shell shortcuts", long_about = None)]
struct Args {
    /// Path to the RON engine configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the daemon socket path
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Do not start a daemon when none is running
    #[arg(long, global = true)]
    no_spawn: bool,

    /// Set the log level
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Daemon,
    /// List shortcuts in display order
    List {
        /// Print the dictionary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Add a shortcut
    Add {
        name: String,
        cmd: String,
        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
        /// The shortcut opens an app whose end the host reports
        #[arg(long)]
        app: bool,
        /// Hook to apply, in order (repeatable)
        #[arg(long = "hook")]
        hooks: Vec<String>,
    },
    /// Change fields of a shortcut
    Edit {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        cmd: Option<String>,
        #[arg(long)]
        app: Option<bool>,
        /// Replace the hook list (repeatable)
        #[arg(long = "hook")]
        hooks: Vec<String>,
        /// Remove all hooks
        #[arg(long, conflicts_with = "hooks")]
        clear_hooks: bool,
    },
    /// Remove a shortcut
    Remove { id: String },
    /// Move a shortcut to a zero-based index in the display order
    Move { id: String, index: usize },
    /// Launch a shortcut
    Launch {
        id: String,
        /// Extra `NAME=VALUE` flag, appended as `-NAME 'VALUE'` (repeatable)
        #[arg(short, long = "flag", value_parser = parse_flag)]
        flags: Vec<(String, String)>,
        /// Wait for the run to end and exit with its status
        #[arg(short, long)]
        wait: bool,
    },
    /// Kill a running shortcut
    Kill { id: String },
    /// Show whether a shortcut is running, or list running shortcuts
    Status { id: Option<String> },
    /// Print lifecycle events and toasts until interrupted
    Watch {
        /// Shortcuts to watch; all when empty
        ids: Vec<String>,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Read or write settings
    Setting {
        #[command(subcommand)]
        action: SettingCommand,
    },
    /// Report that the app launched for a shortcut closed
    AppEnded {
        id: String,
        #[arg(default_value_t = 0, allow_negative_numbers = true)]
        status: i32,
    },
    /// Record a line in the daemon log
    Log {
        message: String,
        #[arg(long, default_value = "info")]
        level: String,
    },
    /// Stop the daemon
    Shutdown,
}

#[derive(Subcommand, Debug)]
enum SettingCommand {
    Get {
        key: String,
    },
    /// Values are parsed as JSON, falling back to a plain string
    Set {
        key: String,
        value: String,
    },
}

fn parse_flag(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {s:?}"))?;
    if name.is_empty() {
        return Err("flag name is empty".to_string());
    }
    Ok((name.to_string(), value.to_string()))
}

fn init_tracing(args: &Args) -> Result<()> {
    // Only initialize tracing if RUST_LOG is set or logging is explicitly requested
    if std::env::var("RUST_LOG").is_err() && args.log_level.is_none() && args.log_file.is_none() {
        return Ok(());
    }
    let log_level = args.log_level.unwrap_or(LogLevel::Info).as_str();

    let file_layer = match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {path:?}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    // Initialize tracing with custom format (no timestamps)
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .without_time()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("shortcut_manager={log_level}").parse()?)
                .add_directive(format!("shortcuts={log_level}").parse()?)
                .add_directive(format!("frontend={log_level}").parse()?)
                .add_directive(format!("toast={log_level}").parse()?),
        )
        .init();
    Ok(())
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = EngineConfig::load_or_default(&path)
        .with_context(|| format!("Failed to load config: {path:?}"))?;
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    let config = load_config(&args)?;

    if let Command::Daemon = args.command {
        info!("Starting shortcuts daemon");
        Server::new(config).run_blocking()?;
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let code = runtime.block_on(commands::run(&args, &config))?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert_eq!(
            parse_flag("h=Game Start").unwrap(),
            ("h".to_string(), "Game Start".to_string())
        );
        assert_eq!(parse_flag("i=a=b").unwrap(), ("i".to_string(), "a=b".to_string()));
        assert!(parse_flag("novalue").is_err());
        assert!(parse_flag("=x").is_err());
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let args = Args::parse_from([
            "shortcuts",
            "launch",
            "s1",
            "-f",
            "t=5",
            "--socket",
            "/tmp/x.sock",
            "--no-spawn",
        ]);
        assert!(args.no_spawn);
        assert_eq!(args.socket, Some(PathBuf::from("/tmp/x.sock")));
        match args.command {
            Command::Launch { id, flags, wait } => {
                assert_eq!(id, "s1");
                assert_eq!(flags, vec![("t".to_string(), "5".to_string())]);
                assert!(!wait);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_app_ended_accepts_negative_status() {
        let args = Args::parse_from(["shortcuts", "app-ended", "g1", "-1"]);
        match args.command {
            Command::AppEnded { id, status } => {
                assert_eq!(id, "g1");
                assert_eq!(status, -1);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

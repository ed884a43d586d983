//! Command-line arguments for `meshq`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "meshq",
    version,
    about = "Durable job queue for PhotoMesh builds.",
    long_about = None
)]
pub struct CliArgs {
    /// SQLite database file. Overrides `MESHQ_DATABASE_PATH`.
    #[arg(long, value_name = "PATH", global = true)]
    pub database: Option<PathBuf>,

    /// Logging level. If omitted, `RUST_LOG`, then `MESHQ_LOG`, then `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the queue until interrupted with Ctrl-C.
    Run,
    /// Add the projects of a JSON submission file to the queue.
    Enqueue {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print every project with its tasks as JSON.
    List,
    /// Queue a project again, optionally starting from one of its tasks.
    Rerun {
        project: u64,
        #[arg(long, value_name = "TASK_ID")]
        task: Option<u64>,
    },
    /// Swap the queue positions of two projects.
    Switch { first: u64, second: u64 },
    /// Print the latest log line of a task.
    Reason { task: u64 },
    /// Print every log line of a task.
    Logs { task: u64 },
    /// Delete a project and its tasks.
    Remove { project: u64 },
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

pub fn parse() -> CliArgs {
    CliArgs::parse()
}

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn filter(self) -> LevelFilter {
        match self {
            // No critical level in the tracing hierarchy; error is closest.
            LogLevel::Critical | LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "voxhaul",
    version,
    about = "Client for facilitating large-scale volumetric data ingest"
)]
pub struct Cli {
    /// Path to the ingest job configuration file.
    pub config_file: Option<PathBuf>,

    /// Token for API authentication. Falls back to INTERN_TOKEN, then the
    /// shared intern configuration file.
    #[arg(short = 'a', long)]
    pub api_token: Option<String>,

    /// ID of the ingest job, when joining an existing ingest job.
    #[arg(short = 'j', long)]
    pub job_id: Option<u64>,

    /// Absolute path to the logfile to use.
    #[arg(short = 'l', long)]
    pub log_file: Option<PathBuf>,

    /// Log level to use.
    #[arg(short = 'v', long, value_enum, default_value_t = LogLevel::Warning)]
    pub log_level: LogLevel,

    /// Cancel (and remove) an ingest job. This will not delete data already
    /// ingested, but prevents continuing the job.
    #[arg(short = 'c', long)]
    pub cancel: bool,

    /// Ignore all confirmation prompts.
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Leave the job in the uploading state for an operator to mark complete
    /// manually. If omitted, the client cleans up after a successful upload.
    #[arg(short = 'm', long)]
    pub manual_complete: bool,

    /// Number of upload workers to run.
    #[arg(
        short = 'p',
        long = "processes-nb",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..=512)
    )]
    pub processes_nb: u16,
}

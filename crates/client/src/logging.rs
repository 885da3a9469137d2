use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

/// Initialize logging: everything goes to a logfile (appended) and to stdout,
/// filtered by the CLI log level. Returns the logfile path for the banner.
pub fn init(cli: &Cli) -> anyhow::Result<PathBuf> {
    let path = match &cli.log_file {
        Some(path) => path.clone(),
        None => default_log_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;

    let filter = EnvFilter::builder()
        .with_default_directive(cli.log_level.filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stdout))
        .init();

    Ok(path)
}

fn default_log_path() -> anyhow::Result<PathBuf> {
    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Ok(PathBuf::from(home).join(".voxhaul").join(format!(
        "ingest_log{}_pid{}.log",
        stamp,
        std::process::id()
    )))
}

mod cli;
mod logging;
mod prompt;
mod shutdown;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser as _;
use tokio::sync::mpsc;
use tracing::{info, warn};

use voxhaul_core::{resolve_api_token, Configuration};
use voxhaul_engine::{
    AwsDataPlaneFactory, ControlPlane as _, Coordinator, EngineOptions, HttpBackend, WorkerPool,
};

use crate::cli::Cli;
use crate::shutdown::{spawn_ctrl_c_handler, ShutdownEvent};

#[cfg(feature = "prod-backend")]
const DEFAULT_CANCEL_HOST: &str = "api.voxhaul.io";

#[cfg(not(feature = "prod-backend"))]
const DEFAULT_CANCEL_HOST: &str = "127.0.0.1:8000";

#[cfg(feature = "prod-backend")]
const DEFAULT_CANCEL_PROTOCOL: &str = "https";

#[cfg(not(feature = "prod-backend"))]
const DEFAULT_CANCEL_PROTOCOL: &str = "http";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_path = match logging::init(&cli) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("ERROR: failed to set up logging: {err:#}");
            return ExitCode::from(1);
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            eprintln!("(log file: {})", log_path.display());
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let token = resolve_api_token(cli.api_token.as_deref())?;

    if cli.cancel {
        return cancel(&cli, &token).await;
    }

    let Some(config_path) = &cli.config_file else {
        anyhow::bail!("an ingest job configuration file is required");
    };
    let config = Arc::new(Configuration::from_file(config_path)?);
    let base = format!(
        "{}://{}",
        config.client.backend.protocol, config.client.backend.host
    );
    let backend = Arc::new(HttpBackend::new(&base, &token)?);

    let job_id = match cli.job_id {
        None => {
            prompt::print_estimated_job(&config);
            println!();
            if !prompt::confirm("Would you like to create a NEW ingest job?", cli.force).await? {
                println!("Exiting");
                return Ok(ExitCode::SUCCESS);
            }

            let job_id = backend.create(config.document()).await?;
            info!(job_id, "created ingest job");
            println!("Created ingest job {job_id}.");
            println!("Note: you need this ID to continue the job later!");

            if !prompt::confirm("Do you want to start uploading now?", cli.force).await? {
                println!(
                    "OK - your job is waiting for you. Resume by providing ingest job ID '{job_id}' to the client."
                );
                return Ok(ExitCode::SUCCESS);
            }
            job_id
        }
        Some(job_id) => {
            if !prompt::confirm(
                format!("Are you sure you want to resume ingest job {job_id}?"),
                cli.force,
            )
            .await?
            {
                println!("Exiting");
                return Ok(ExitCode::SUCCESS);
            }
            job_id
        }
    };

    let coordinator = Coordinator::new(
        backend,
        Arc::new(AwsDataPlaneFactory),
        config,
        job_id,
        EngineOptions::default(),
    );
    let pool = coordinator.spawn_workers(cli.processes_nb as usize).await?;

    let started = Instant::now();
    let job_complete = supervise(&coordinator, &pool).await?;

    info!("waiting for workers to close");
    let failures = pool.join_all().await;
    if failures > 0 {
        warn!(failures, "some workers ended with errors");
    }

    let elapsed_min = started.elapsed().as_secs_f64() / 60.0;
    if job_complete {
        info!("all upload tasks completed in {elapsed_min:.2} minutes");
        if cli.manual_complete {
            info!(
                "auto-complete disabled; this ingest job stays in the uploading state until marked complete manually"
            );
        } else {
            info!("marking ingest job as complete and cleaning up, please wait");
            coordinator.complete().await?;
            info!("cleanup done");
        }
    } else {
        info!("client exiting, run time {elapsed_min:.2} minutes");
    }

    Ok(ExitCode::SUCCESS)
}

/// Run the monitor loop, diverting on interrupts: the first ctrl-c prompts
/// for confirmation, a second one stops without asking. Returns true when
/// the monitor exited because the workers drained the queue.
async fn supervise(coordinator: &Coordinator, pool: &WorkerPool) -> anyhow::Result<bool> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    spawn_ctrl_c_handler(shutdown_tx);

    loop {
        tokio::select! {
            res = coordinator.monitor(pool) => {
                res?;
                return Ok(true);
            }
            event = shutdown_rx.recv() => {
                match event {
                    Some(ShutdownEvent::Graceful) => {
                        if prompt::confirm("Are you sure you want to quit uploading?", false)
                            .await?
                        {
                            info!("stopping upload engine");
                            pool.signal_stop();
                            return Ok(false);
                        }
                        println!("Continuing...");
                    }
                    Some(ShutdownEvent::Immediate) | None => {
                        info!("stopping upload engine");
                        pool.signal_stop();
                        return Ok(false);
                    }
                }
            }
        }
    }
}

async fn cancel(cli: &Cli, token: &str) -> anyhow::Result<ExitCode> {
    let Some(job_id) = cli.job_id else {
        anyhow::bail!("you must provide an ingest job ID to cancel");
    };

    let base = match &cli.config_file {
        Some(path) => {
            let config = Configuration::from_file(path)?;
            format!(
                "{}://{}",
                config.client.backend.protocol, config.client.backend.host
            )
        }
        None => format!("{DEFAULT_CANCEL_PROTOCOL}://{DEFAULT_CANCEL_HOST}"),
    };
    let backend = HttpBackend::new(&base, token)?;

    if !prompt::confirm(
        format!("Are you sure you want to cancel ingest job {job_id}?"),
        cli.force,
    )
    .await?
    {
        println!("Command ignored. Job not cancelled");
        return Ok(ExitCode::SUCCESS);
    }

    info!(job_id, "attempting to cancel ingest job");
    backend.cancel(job_id).await?;
    println!("Ingest job {job_id} successfully cancelled.");
    Ok(ExitCode::SUCCESS)
}

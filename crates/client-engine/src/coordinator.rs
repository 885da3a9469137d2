//! Worker pool supervision, job monitoring, and the completion phase.
//!
//! The coordinator spawns N workers (each with its own engine, join and
//! data-plane handles), then watches job progress through the control plane
//! until every worker has drained out. Workers share nothing but the remote
//! queue; the only coordinator-to-worker channel is a stop flag each worker
//! observes between tasks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use voxhaul_core::Configuration;

use crate::api::EngineOptions;
use crate::backend::{CompletionState, ControlPlane};
use crate::engine::{DataPlaneFactory, Engine};

/// Handles to a spawned set of workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<anyhow::Result<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl WorkerPool {
    /// Number of workers spawned.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when the pool holds no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// True when every worker task has ended.
    pub fn all_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    /// Ask every worker to stop after its current task.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for every worker and report failures. Returns the number of
    /// workers that ended with an error.
    pub async fn join_all(self) -> usize {
        let mut failures = 0;
        for (idx, handle) in self.handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(())) => info!(worker = idx, "worker finished gracefully"),
                Ok(Err(err)) => {
                    failures += 1;
                    error!(worker = idx, error = %format!("{err:#}"), "worker failed");
                }
                Err(err) => {
                    failures += 1;
                    error!(worker = idx, %err, "worker task panicked or was cancelled");
                }
            }
        }
        failures
    }
}

/// Parent-side supervisor for one ingest job.
pub struct Coordinator {
    backend: Arc<dyn ControlPlane>,
    factory: Arc<dyn DataPlaneFactory>,
    config: Arc<Configuration>,
    options: EngineOptions,
    job_id: u64,
}

impl Coordinator {
    /// Build a coordinator for `job_id`.
    pub fn new(
        backend: Arc<dyn ControlPlane>,
        factory: Arc<dyn DataPlaneFactory>,
        config: Arc<Configuration>,
        job_id: u64,
        options: EngineOptions,
    ) -> Self {
        Self {
            backend,
            factory,
            config,
            options,
            job_id,
        }
    }

    /// Spawn `count` workers, staggered to amortize control-plane ramp-up.
    /// Each worker joins the job itself and owns its queue/bucket handles.
    pub async fn spawn_workers(&self, count: usize) -> anyhow::Result<WorkerPool> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(count);

        for idx in 0..count {
            let mut engine = Engine::new(
                self.backend.clone(),
                self.factory.clone(),
                self.config.clone(),
                self.job_id,
                self.options.clone(),
            )?
            .with_worker_index(idx);
            let stop = stop_rx.clone();

            info!(worker = idx, "spawning upload worker");
            handles.push(tokio::spawn(async move {
                engine.join().await?;
                engine.run(stop).await
            }));

            if idx + 1 < count {
                tokio::time::sleep(self.options.spawn_stagger).await;
            }
        }

        Ok(WorkerPool { handles, stop_tx })
    }

    /// Watch job progress until every worker has exited. Keeps its own
    /// credential clock (rejoining on the same timeout as workers) and logs a
    /// smoothed upload rate from a rolling window of queue-depth deltas.
    pub async fn monitor(&self, pool: &WorkerPool) -> anyhow::Result<()> {
        self.backend.join(self.job_id).await?;
        let mut credential_birth = Instant::now();

        let units = self.config.mode().units();
        let mut window: VecDeque<i64> = VecDeque::new();
        let mut last_count: Option<u64> = None;
        let started = Instant::now();
        let mut last_log = Instant::now();

        loop {
            if credential_birth.elapsed() >= self.options.credential_timeout {
                warn!("credentials are expiring soon, attempting to renew");
                self.backend.join(self.job_id).await?;
                credential_birth = Instant::now();
                info!("credentials refreshed successfully");
            }

            let progress = match self.backend.get_job_status(self.job_id).await {
                Ok(progress) => Some(progress),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "job status unavailable");
                    None
                }
            };

            if let Some(progress) = &progress {
                match last_count {
                    None => last_count = Some(progress.current_message_count),
                    Some(prev) => {
                        if window.len() >= self.options.rate_window {
                            window.pop_front();
                        }
                        window.push_back(prev as i64 - progress.current_message_count as i64);
                        last_count = Some(progress.current_message_count);
                    }
                }
            }

            if last_log.elapsed() >= self.options.status_log_interval {
                last_log = Instant::now();
                let elapsed_min = started.elapsed().as_secs_f64() / 60.0;
                match &progress {
                    Some(progress) if progress.current_message_count != 0 => {
                        let avg = if window.is_empty() {
                            0.0
                        } else {
                            window.iter().sum::<i64>() as f64 / window.len() as f64
                        };
                        let per_minute =
                            avg * (60.0 / self.options.status_poll_interval.as_secs_f64());
                        info!(
                            "uploading ~{per_minute:.2} {units}/min - approx {} of {} {units} remaining - elapsed time {elapsed_min:.2} minutes",
                            progress.current_message_count, progress.total_message_count
                        );
                    }
                    Some(_) => {
                        info!(
                            "waiting to ensure all upload tasks have been processed, just a few minutes longer"
                        );
                    }
                    None => {
                        info!("uploading in progress: elapsed time {elapsed_min:.2} minutes");
                    }
                }
            }

            tokio::time::sleep(self.options.status_poll_interval).await;

            if pool.all_finished() {
                info!("all workers have exited; leaving the monitor loop");
                break;
            }
        }
        Ok(())
    }

    /// Drive the completion handshake until the service reports the job done.
    pub async fn complete(&self) -> anyhow::Result<()> {
        loop {
            match self.backend.complete(self.job_id).await? {
                CompletionState::Done => {
                    info!(job_id = self.job_id, "ingest job completed");
                    return Ok(());
                }
                CompletionState::Wait(secs) => {
                    info!(secs, "ingest service asked us to wait before completing");
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                }
                CompletionState::Polling => {
                    info!("ingest service is verifying the job; polling status");
                    loop {
                        let progress = self.backend.get_job_status(self.job_id).await?;
                        if let Some(status) = progress.status() {
                            if status.is_terminal() {
                                info!(?status, "ingest job reached a terminal state");
                                return Ok(());
                            }
                        }
                        tokio::time::sleep(self.options.status_poll_interval).await;
                    }
                }
            }
        }
    }
}

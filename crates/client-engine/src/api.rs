//! Tuning knobs shared by the worker engine and the coordinator.

use std::time::Duration;

/// Configuration for worker and coordinator loops.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Age at which a credential bundle is renewed; the service revokes at
    /// roughly one hour, so renew comfortably before that.
    pub credential_timeout: Duration,

    /// Consecutive empty polls before a worker decides the queue is drained.
    pub msg_wait_iterations: u32,

    /// Sleep after an empty work-queue poll.
    pub empty_poll_sleep: Duration,

    /// Sleep after an invalid-access-key upload failure, giving fresh
    /// credentials time to propagate.
    pub invalid_key_sleep: Duration,

    /// Consecutive credential-shaped upload failures before a worker aborts.
    pub error_abort_threshold: u32,

    /// Coordinator job-status poll interval.
    pub status_poll_interval: Duration,

    /// Coordinator progress-log interval.
    pub status_log_interval: Duration,

    /// Pause between worker spawns, amortizing control-plane ramp-up.
    pub spawn_stagger: Duration,

    /// Samples in the rolling upload-rate window.
    pub rate_window: usize,
}

impl EngineOptions {
    /// Default credential renewal age (55 minutes).
    pub const DEFAULT_CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(3300);
    /// Default empty-poll budget.
    pub const DEFAULT_MSG_WAIT_ITERATIONS: u32 = 20;
    /// Default sleep after an empty poll.
    pub const DEFAULT_EMPTY_POLL_SLEEP: Duration = Duration::from_secs(10);
    /// Default invalid-access-key sleep.
    pub const DEFAULT_INVALID_KEY_SLEEP: Duration = Duration::from_secs(5);
    /// Default abort threshold for credential-shaped failures.
    pub const DEFAULT_ERROR_ABORT_THRESHOLD: u32 = 20;
    /// Default status poll interval.
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Default progress-log interval.
    pub const DEFAULT_STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);
    /// Default worker spawn stagger.
    pub const DEFAULT_SPAWN_STAGGER: Duration = Duration::from_millis(500);
    /// Default rolling-rate window size.
    pub const DEFAULT_RATE_WINDOW: usize = 6;
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            credential_timeout: Self::DEFAULT_CREDENTIAL_TIMEOUT,
            msg_wait_iterations: Self::DEFAULT_MSG_WAIT_ITERATIONS,
            empty_poll_sleep: Self::DEFAULT_EMPTY_POLL_SLEEP,
            invalid_key_sleep: Self::DEFAULT_INVALID_KEY_SLEEP,
            error_abort_threshold: Self::DEFAULT_ERROR_ABORT_THRESHOLD,
            status_poll_interval: Self::DEFAULT_STATUS_POLL_INTERVAL,
            status_log_interval: Self::DEFAULT_STATUS_LOG_INTERVAL,
            spawn_stagger: Self::DEFAULT_SPAWN_STAGGER,
            rate_window: Self::DEFAULT_RATE_WINDOW,
        }
    }
}

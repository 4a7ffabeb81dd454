//! Runtime configuration of the controller

use std::time::Duration;

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default interval between periodic re-reconciles of a converged definition
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

const DEFAULT_ERROR_BACKOFF_BASE: Duration = Duration::from_secs(5);
const DEFAULT_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(300);
const DEFAULT_WATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_WATCH_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Controller tunables
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Reconcile workers running in parallel
    pub workers: usize,
    /// Re-reconcile converged definitions this often; `None` disables resync
    pub resync_interval: Option<Duration>,
    /// First retry delay after a retryable reconcile failure
    pub error_backoff_base: Duration,
    /// Upper bound for reconcile retry delays
    pub error_backoff_max: Duration,
    /// First delay before re-subscribing a broken watch
    pub watch_backoff_base: Duration,
    /// Upper bound for watch re-subscribe delays
    pub watch_backoff_max: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_interval: Some(DEFAULT_RESYNC_INTERVAL),
            error_backoff_base: DEFAULT_ERROR_BACKOFF_BASE,
            error_backoff_max: DEFAULT_ERROR_BACKOFF_MAX,
            watch_backoff_base: DEFAULT_WATCH_BACKOFF_BASE,
            watch_backoff_max: DEFAULT_WATCH_BACKOFF_MAX,
        }
    }
}

impl OperatorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_resync_interval(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval.filter(|d| !d.is_zero());
        self
    }

    pub fn with_error_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.error_backoff_base = base;
        self.error_backoff_max = max.max(base);
        self
    }

    pub fn with_watch_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.watch_backoff_base = base;
        self.watch_backoff_max = max.max(base);
        self
    }
}

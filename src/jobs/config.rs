use std::time::Duration;

use crate::config::{
    env_bool, env_duration_millis, env_duration_secs, env_u32, env_usize,
};

/// Longest delay a retry will ever be pushed out by.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Floor for the pause between polls of an empty queue.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Queue, retry and worker settings loaded from the environment.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// When false the queue starts in the disabled state and rejects all work.
    pub enabled: bool,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub lease_timeout: Duration,
    pub worker_count: usize,
    pub poll_interval: Duration,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("IMPORT_QUEUE_ENABLED", true),
            max_attempts: env_u32("IMPORT_MAX_ATTEMPTS", 3).max(1),
            backoff_base: env_duration_millis("IMPORT_BACKOFF_BASE_MS", 1_000),
            lease_timeout: env_duration_secs("IMPORT_LEASE_TIMEOUT_SECS", 300).max(Duration::from_secs(1)),
            worker_count: env_usize("IMPORT_WORKER_COUNT", 2).max(1),
            poll_interval: env_duration_millis("IMPORT_POLL_INTERVAL_MS", 2_000).max(MIN_POLL_INTERVAL),
        }
    }

    /// Delay before the next attempt of a job that has failed `attempts` times.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        backoff_delay(self.backoff_base, attempts)
    }

    /// Pause after finding the queue empty, never shorter than [`MIN_POLL_INTERVAL`].
    pub fn idle_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }

    /// How often a running worker renews its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_timeout / 3).max(Duration::from_millis(100))
    }

    /// How often the reaper looks for abandoned leases.
    pub fn reap_interval(&self) -> Duration {
        (self.lease_timeout / 2).max(Duration::from_millis(100))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            lease_timeout: Duration::from_secs(300),
            worker_count: 2,
            poll_interval: Duration::from_secs(2),
        }
    }
}

/// `base * 2^attempts`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

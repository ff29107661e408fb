use std::time::Duration;

use crate::config::{env_duration_millis, env_u64, env_usize};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Fetch limits and reporting knobs for the import pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_timeout: Duration,
    pub max_file_bytes: u64,
    /// Status messages copied into a terminal audit entry.
    pub audit_message_limit: usize,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            fetch_timeout: env_duration_millis("IMPORT_FETCH_TIMEOUT_MS", 30_000),
            max_file_bytes: env_u64("IMPORT_MAX_FILE_BYTES", DEFAULT_MAX_FILE_BYTES).max(1),
            audit_message_limit: env_usize("IMPORT_AUDIT_MESSAGE_LIMIT", 20),
        }
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            timeout: self.fetch_timeout,
            max_bytes: self.max_file_bytes,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            audit_message_limit: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub timeout: Duration,
    pub max_bytes: u64,
}

use std::env;
use std::time::Duration;

use crate::error::{Result, TrackerError};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BUCKET_SPAN: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
pub const MAX_SAMPLES_PER_BUCKET: u32 = 60;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub enabled: bool,
    pub process_id: u32,
    pub action_id: i64,
    pub machine_name: String,
    pub user_name: String,
    pub sample_interval: Duration,
    pub bucket_span: Duration,
    pub shutdown_grace: Duration,
}

impl TrackerConfig {
    pub fn new(action_id: i64) -> Self {
        Self {
            enabled: true,
            process_id: std::process::id(),
            action_id,
            machine_name: machine_name(),
            user_name: user_name(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            bucket_span: DEFAULT_BUCKET_SPAN,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sample_ms = self.sample_interval.as_millis();
        let bucket_ms = self.bucket_span.as_millis();

        if sample_ms == 0 {
            return Err(invalid("sample interval must be at least one millisecond"));
        }
        if bucket_ms == 0 {
            return Err(invalid("bucket span must be at least one millisecond"));
        }
        if bucket_ms % sample_ms != 0 {
            return Err(invalid(format!(
                "bucket span ({bucket_ms}ms) must be a whole multiple of the sample interval ({sample_ms}ms)"
            )));
        }
        if bucket_ms / sample_ms > u128::from(MAX_SAMPLES_PER_BUCKET) {
            return Err(invalid(format!(
                "at most {MAX_SAMPLES_PER_BUCKET} samples fit in one bucket, got {}",
                bucket_ms / sample_ms
            )));
        }
        if self.action_id <= 0 {
            return Err(invalid(format!("invalid action id: {}", self.action_id)));
        }
        Ok(())
    }

    /// Number of sampler ticks in one bucket; the ceiling for `active_seconds`.
    pub fn samples_per_bucket(&self) -> u32 {
        let ratio = self.bucket_span.as_millis() / self.sample_interval.as_millis().max(1);
        ratio.min(u128::from(MAX_SAMPLES_PER_BUCKET)) as u32
    }
}

fn invalid(message: impl Into<String>) -> TrackerError {
    TrackerError::InvalidConfig(message.into())
}

fn machine_name() -> String {
    env::var("COMPUTERNAME")
        .or_else(|_| env::var("HOSTNAME"))
        .unwrap_or_else(|_| "UNKNOWN".to_owned())
}

fn user_name() -> String {
    env::var("USERNAME")
        .or_else(|_| env::var("USER"))
        .unwrap_or_else(|_| "UNKNOWN".to_owned())
}

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_queue_size must be at least 1")]
    ZeroQueueSize,
    #[error("max_retries_per_minute must be at least 1")]
    ZeroMinuteCap,
}

/// How contention is handled when a detection is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// Queue requests (bounded, FIFO) and drain them serially.
    #[default]
    Queue,
    /// Skip requests that arrive while busy or cooling down.
    SingleSlot,
}

/// Timing and capacity knobs shared by both admission policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub admission: Admission,
    /// Minimum spacing between consecutive detections. For the single-slot
    /// policy this is also the base cooldown.
    pub min_time_between_detections_ms: u64,
    /// Queue bound; the oldest request is evicted when full. Unused by the
    /// single-slot policy.
    pub max_queue_size: usize,
    pub cooldown_after_success_ms: u64,
    pub cooldown_after_failure_ms: u64,
    /// Sliding 60-second attempt cap. Unused by the single-slot policy.
    pub max_retries_per_minute: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            admission: Admission::Queue,
            min_time_between_detections_ms: 2000,
            max_queue_size: 3,
            cooldown_after_success_ms: 5000,
            cooldown_after_failure_ms: 3000,
            max_retries_per_minute: 15,
        }
    }
}

impl SchedulerConfig {
    /// Defaults for the single-slot, poll-driven policy.
    pub fn single_slot() -> Self {
        Self {
            admission: Admission::SingleSlot,
            min_time_between_detections_ms: 1000,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize);
        }
        if self.max_retries_per_minute == 0 {
            return Err(ConfigError::ZeroMinuteCap);
        }
        Ok(())
    }

    pub fn min_time_between_detections(&self) -> Duration {
        Duration::from_millis(self.min_time_between_detections_ms)
    }

    pub fn cooldown_after_success(&self) -> Duration {
        Duration::from_millis(self.cooldown_after_success_ms)
    }

    pub fn cooldown_after_failure(&self) -> Duration {
        Duration::from_millis(self.cooldown_after_failure_ms)
    }
}

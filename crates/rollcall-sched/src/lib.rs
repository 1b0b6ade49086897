//! rollcall-sched — Detection scheduling for attendance capture.
//!
//! Decides when a capture may be attempted, serializes requests that arrive
//! while a detection is in flight, and arms cooldowns from each outcome.
//! Two admission policies share the same timing rules: a bounded FIFO queue
//! ([`DetectionScheduler`]) and a single slot that skips on contention
//! ([`SingleSlotScheduler`]).

pub mod config;
pub mod gate;
pub mod outcome;
pub mod queue;
pub mod scheduler;
pub mod status;

pub use config::{Admission, ConfigError, SchedulerConfig};
pub use gate::{DetectionGate, SingleSlotScheduler};
pub use outcome::{DetectionError, DetectionOutcome, DetectionTicket, Detector, SchedulerError};
pub use queue::DetectionScheduler;
pub use scheduler::Scheduler;
pub use status::{SchedulerSnapshot, SchedulerStatus, StatusBus, StatusUpdate, SubscriptionId};

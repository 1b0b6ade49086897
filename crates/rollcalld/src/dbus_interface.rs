use crate::daemon::{Daemon, DaemonError};
use rollcall_sched::{DetectionOutcome, SchedulerError};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Reply to `Submit`, serialized as JSON.
///
/// Rejections are an ordinary reply rather than a D-Bus error so clients can
/// show the "try again" message and back off by `retry_after_ms`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SubmitReply {
    Detected {
        detection: DetectionOutcome,
    },
    Rejected {
        reason: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
    Failed {
        message: String,
    },
}

impl From<Result<DetectionOutcome, SchedulerError>> for SubmitReply {
    fn from(result: Result<DetectionOutcome, SchedulerError>) -> Self {
        let err = match result {
            Ok(detection) => return Self::Detected { detection },
            Err(err) => err,
        };
        let message = err.to_string();
        match err {
            SchedulerError::RateLimited { retry_after } => Self::Rejected {
                reason: "rate_limited",
                message,
                retry_after_ms: Some(retry_after.as_millis() as u64),
            },
            SchedulerError::QueueOverflow => Self::Rejected {
                reason: "queue_overflow",
                message,
                retry_after_ms: None,
            },
            SchedulerError::Busy => Self::Rejected {
                reason: "busy",
                message,
                retry_after_ms: None,
            },
            SchedulerError::Cancelled => Self::Rejected {
                reason: "cancelled",
                message,
                retry_after_ms: None,
            },
            SchedulerError::Detection(_) => Self::Failed { message },
        }
    }
}

fn to_fdo(err: DaemonError) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    daemon: Arc<Daemon>,
}

impl AttendanceService {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a session over the given identities (all enrolled, if empty).
    /// Returns the session summary as JSON.
    async fn start_session(
        &self,
        name: &str,
        identity_ids: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, identities = identity_ids.len(), "start_session requested");
        let summary = self.daemon.start_session(name, &identity_ids).map_err(to_fdo)?;
        to_json(&summary)
    }

    /// End the active session and return its attendance records.
    async fn end_session(&self) -> zbus::fdo::Result<String> {
        tracing::info!("end_session requested");
        let summary = self.daemon.end_session().ok_or_else(|| to_fdo(DaemonError::NoSession))?;
        to_json(&summary)
    }

    /// Submit an encoded frame and wait for its outcome.
    async fn submit(&self, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::debug!(bytes = frame.len(), "submit requested");
        let ticket = self.daemon.submit(frame).map_err(to_fdo)?;
        to_json(&SubmitReply::from(ticket.await))
    }

    /// Return daemon and scheduler status.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.daemon.status())
    }

    /// Drop queued requests and clear cooldowns for the active session.
    async fn reset(&self) -> zbus::fdo::Result<()> {
        tracing::info!("reset requested");
        self.daemon.reset().map_err(to_fdo)
    }

    /// List attendance marked so far in the active session.
    async fn list_attendance(&self) -> zbus::fdo::Result<String> {
        let records = self.daemon.attendance().map_err(to_fdo)?;
        to_json(&records)
    }
}

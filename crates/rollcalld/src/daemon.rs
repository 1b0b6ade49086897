//! Daemon state: one attendance session and its scheduler at a time.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::gallery::GalleryStore;
use crate::session::{AttendanceRecord, AttendanceSession, SessionDetector, SessionSummary};
use rollcall_sched::{DetectionTicket, Scheduler, SchedulerSnapshot, SubscriptionId};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("no attendance session is active")]
    NoSession,
    #[error(transparent)]
    Scheduler(#[from] rollcall_sched::ConfigError),
}

struct ActiveSession {
    session: Arc<AttendanceSession>,
    scheduler: Scheduler<Vec<u8>, SessionDetector>,
    subscription: SubscriptionId,
    poller: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub gallery_entries: usize,
    pub session: Option<SessionInfo>,
    pub scheduler: Option<SchedulerSnapshot>,
}

pub struct Daemon {
    config: Config,
    gallery: GalleryStore,
    engine: EngineHandle,
    active: Mutex<Option<ActiveSession>>,
}

impl Daemon {
    pub fn new(config: Config, gallery: GalleryStore, engine: EngineHandle) -> Self {
        Self {
            config,
            gallery,
            engine,
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a session over the given identities (all, if empty). A session
    /// already running is ended first.
    pub fn start_session(
        &self,
        name: &str,
        identity_ids: &[String],
    ) -> Result<SessionSummary, DaemonError> {
        let session = Arc::new(AttendanceSession::new(name, self.gallery.select(identity_ids)));
        let detector = SessionDetector {
            session: Arc::clone(&session),
            engine: self.engine.clone(),
        };
        let scheduler = Scheduler::new(self.config.scheduler.clone(), detector)?;

        let session_id = session.id();
        let subscription = scheduler.status_bus().subscribe(move |update| {
            tracing::debug!(
                session = %session_id,
                status = ?update.status,
                queue_size = update.queue_size,
                cooldown_remaining_ms = update.cooldown_remaining_ms,
                message = %update.message,
                "scheduler status"
            );
        });

        let poller = self.config.poll_frame_path.clone().map(|path| {
            let scheduler = scheduler.clone();
            let period = self.config.poll_interval;
            tracing::info!(path = %path.display(), period_ms = period.as_millis() as u64, "polling frame file");
            tokio::spawn(async move {
                scheduler.run_polling(period, move || read_frame(path.clone())).await;
            })
        });

        let previous = self.active().replace(ActiveSession {
            session: Arc::clone(&session),
            scheduler,
            subscription,
            poller,
        });
        if let Some(previous) = previous {
            tracing::warn!(session = %previous.session.id(), "replacing active session");
            Self::dispose(previous);
        }

        tracing::info!(
            session = %session_id,
            name,
            gallery_entries = session.gallery().len(),
            admission = ?self.config.scheduler.admission,
            "attendance session started"
        );
        Ok(session.summary())
    }

    /// End the active session, cancelling anything still queued.
    pub fn end_session(&self) -> Option<SessionSummary> {
        let active = self.active().take()?;
        let session = Arc::clone(&active.session);
        Self::dispose(active);
        let summary = session.summary();
        tracing::info!(
            session = %summary.session_id,
            marked = summary.records.len(),
            "attendance session ended"
        );
        Some(summary)
    }

    fn dispose(active: ActiveSession) {
        if let Some(poller) = active.poller {
            poller.abort();
        }
        active.scheduler.reset();
        active.session.invalidate();
        active.scheduler.status_bus().unsubscribe(active.subscription);
    }

    fn scheduler(&self) -> Result<Scheduler<Vec<u8>, SessionDetector>, DaemonError> {
        self.active()
            .as_ref()
            .map(|a| a.scheduler.clone())
            .ok_or(DaemonError::NoSession)
    }

    pub fn submit(&self, frame: Vec<u8>) -> Result<DetectionTicket, DaemonError> {
        Ok(self.scheduler()?.submit(frame))
    }

    pub fn reset(&self) -> Result<(), DaemonError> {
        let guard = self.active();
        let active = guard.as_ref().ok_or(DaemonError::NoSession)?;
        active.scheduler.reset();
        active.session.invalidate();
        Ok(())
    }

    pub fn attendance(&self) -> Result<Vec<AttendanceRecord>, DaemonError> {
        self.active()
            .as_ref()
            .map(|a| a.session.records())
            .ok_or(DaemonError::NoSession)
    }

    pub fn status(&self) -> DaemonStatus {
        let active = self.active();
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            gallery_entries: self.gallery.len(),
            session: active.as_ref().map(|a| SessionInfo {
                session_id: a.session.id(),
                name: a.session.name().to_string(),
            }),
            scheduler: active.as_ref().map(|a| a.scheduler.status()),
        }
    }
}

/// The poll frame is re-read on every tick; a missing file just skips it.
async fn read_frame(path: PathBuf) -> Option<Vec<u8>> {
    match tokio::fs::read(&path).await {
        Ok(frame) => Some(frame),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "frame file not readable");
            None
        }
    }
}

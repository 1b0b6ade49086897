//! Attendance session: the active gallery subset plus the marks recorded so far.
//!
//! Duplicate attendance is keyed by (session, identity). A sighting of an
//! identity already marked in this session reports `already_marked` and
//! records nothing. A detection that started before the last
//! [`invalidate`](AttendanceSession::invalidate) records nothing either.

use crate::engine::{EngineError, EngineHandle};
use chrono::{DateTime, Utc};
use rollcall_core::pipeline::{Identification, PipelineError};
use rollcall_core::{GalleryEntry, MatchResult};
use rollcall_sched::{DetectionError, DetectionOutcome, Detector};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub session_id: Uuid,
    pub identity_id: String,
    pub display_name: String,
    pub distance: f32,
    pub marked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AttendanceSession {
    id: Uuid,
    name: String,
    started_at: DateTime<Utc>,
    gallery: Arc<[GalleryEntry]>,
    marks: Mutex<Marks>,
}

#[derive(Debug, Default)]
struct Marks {
    /// identity_id → index into `records`.
    index: HashMap<String, usize>,
    /// Arrival order, for listing.
    records: Vec<AttendanceRecord>,
    /// Bumped on scheduler reset and session end.
    epoch: u64,
}

/// Summary returned to clients when a session starts or ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub gallery_entries: usize,
    pub records: Vec<AttendanceRecord>,
}

impl AttendanceSession {
    pub fn new(name: impl Into<String>, gallery: Vec<GalleryEntry>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            started_at: Utc::now(),
            gallery: gallery.into(),
            marks: Mutex::new(Marks::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gallery(&self) -> Arc<[GalleryEntry]> {
        Arc::clone(&self.gallery)
    }

    fn marks(&self) -> MutexGuard<'_, Marks> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current epoch; capture it when a detection starts.
    pub fn epoch(&self) -> u64 {
        self.marks().epoch
    }

    /// Detections started before this call can no longer mark attendance.
    pub fn invalidate(&self) {
        let mut marks = self.marks();
        marks.epoch = marks.epoch.wrapping_add(1);
    }

    /// Mark the matched identity present, unless it already is. Returns
    /// `None` if the session was invalidated since `epoch`.
    pub fn record(&self, m: &MatchResult, epoch: u64) -> Option<DetectionOutcome> {
        let mut marks = self.marks();
        if marks.epoch != epoch {
            tracing::debug!(
                session = %self.id,
                identity_id = %m.identity_id,
                "detection outlived a reset; not marking"
            );
            return None;
        }
        let Marks { index, records, .. } = &mut *marks;

        if let Some(&i) = index.get(&m.identity_id) {
            tracing::info!(
                session = %self.id,
                identity_id = %m.identity_id,
                first_marked_at = %records[i].marked_at,
                "already marked in this session"
            );
            return Some(DetectionOutcome::AlreadyMarked {
                display_name: records[i].display_name.clone(),
            });
        }

        let record = AttendanceRecord {
            session_id: self.id,
            identity_id: m.identity_id.clone(),
            display_name: m.display_name.clone(),
            distance: m.distance,
            marked_at: Utc::now(),
        };
        tracing::info!(
            session = %self.id,
            identity_id = %record.identity_id,
            distance = record.distance,
            "attendance marked"
        );
        index.insert(record.identity_id.clone(), records.len());
        records.push(record);

        Some(DetectionOutcome::Recognized {
            identity_id: m.identity_id.clone(),
            display_name: m.display_name.clone(),
            confidence: m.confidence(),
        })
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.marks().records.clone()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            name: self.name.clone(),
            started_at: self.started_at,
            gallery_entries: self.gallery.len(),
            records: self.records(),
        }
    }

    /// Translate a pipeline result for a detection started at `epoch` into
    /// a scheduler outcome.
    pub fn resolve(
        &self,
        result: Result<Identification, EngineError>,
        epoch: u64,
    ) -> Result<DetectionOutcome, DetectionError> {
        match result {
            Ok(Identification::Matched(m)) => self
                .record(&m, epoch)
                .ok_or_else(|| DetectionError::new("session reset during detection")),
            Ok(Identification::NotRecognized) => Ok(DetectionOutcome::NotRecognized),
            Ok(Identification::NoSignature) => Ok(DetectionOutcome::NoFace),
            Err(EngineError::Pipeline(PipelineError::Decode(e))) => {
                Err(DetectionError::new(format!("frame could not be decoded: {e}")))
            }
            Err(e) => Err(DetectionError::new(e.to_string())),
        }
    }
}

/// The scheduler's detection function for one session.
#[derive(Clone)]
pub struct SessionDetector {
    pub session: Arc<AttendanceSession>,
    pub engine: EngineHandle,
}

impl Detector<Vec<u8>> for SessionDetector {
    fn detect(
        &self,
        frame: Vec<u8>,
    ) -> impl Future<Output = Result<DetectionOutcome, DetectionError>> + Send {
        let session = Arc::clone(&self.session);
        let engine = self.engine.clone();
        let epoch = session.epoch();
        async move {
            let result = engine.identify(frame, session.gallery()).await;
            session.resolve(result, epoch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(id: &str, name: &str, distance: f32) -> MatchResult {
        MatchResult {
            identity_id: id.into(),
            display_name: name.into(),
            distance,
        }
    }

    #[test]
    fn test_first_match_recognized_second_already_marked() {
        let session = AttendanceSession::new("CS101 morning", Vec::new());
        let epoch = session.epoch();

        match session.record(&matched("s-1", "Ada", 0.2), epoch) {
            Some(DetectionOutcome::Recognized { identity_id, confidence, .. }) => {
                assert_eq!(identity_id, "s-1");
                assert!((confidence - 0.8).abs() < 1e-6);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            session.record(&matched("s-1", "Ada", 0.1), epoch),
            Some(DetectionOutcome::AlreadyMarked { display_name: "Ada".into() })
        );

        let records = session.records();
        assert_eq!(records.len(), 1);
        assert!((records[0].distance - 0.2).abs() < 1e-6);
        assert_eq!(records[0].session_id, session.id());
    }

    #[test]
    fn test_sessions_do_not_share_marks() {
        let morning = AttendanceSession::new("morning", Vec::new());
        let evening = AttendanceSession::new("evening", Vec::new());
        morning.record(&matched("s-1", "Ada", 0.3), morning.epoch());
        assert!(matches!(
            evening.record(&matched("s-1", "Ada", 0.3), evening.epoch()),
            Some(DetectionOutcome::Recognized { .. })
        ));
        assert_ne!(morning.id(), evening.id());
    }

    #[test]
    fn test_resolve_maps_pipeline_results() {
        let session = AttendanceSession::new("lab", Vec::new());
        let epoch = session.epoch();
        assert_eq!(
            session.resolve(Ok(Identification::NoSignature), epoch),
            Ok(DetectionOutcome::NoFace)
        );
        assert_eq!(
            session.resolve(Ok(Identification::NotRecognized), epoch),
            Ok(DetectionOutcome::NotRecognized)
        );
        assert_eq!(
            session.resolve(Err(EngineError::ChannelClosed), epoch),
            Err(DetectionError::new("engine thread exited"))
        );
        assert!(session.records().is_empty());
    }

    #[test]
    fn test_match_started_before_invalidate_is_not_recorded() {
        let session = AttendanceSession::new("lab", Vec::new());
        let started = session.epoch();
        session.invalidate();

        assert_eq!(
            session.resolve(Ok(Identification::Matched(matched("s-1", "Ada", 0.2))), started),
            Err(DetectionError::new("session reset during detection"))
        );
        assert!(session.records().is_empty());

        // Detections started after the reset mark as usual.
        assert!(matches!(
            session.resolve(Ok(Identification::Matched(matched("s-1", "Ada", 0.2))), session.epoch()),
            Ok(DetectionOutcome::Recognized { .. })
        ));
        assert_eq!(session.records().len(), 1);
    }

    #[test]
    fn test_summary_lists_records_in_order() {
        let session = AttendanceSession::new(
            "seminar",
            vec![GalleryEntry::new("s-1", "Ada", vec![0.0, 0.0])],
        );
        let epoch = session.epoch();
        session.record(&matched("s-2", "Grace", 0.4), epoch);
        session.record(&matched("s-1", "Ada", 0.1), epoch);

        let summary = session.summary();
        assert_eq!(summary.name, "seminar");
        assert_eq!(summary.gallery_entries, 1);
        let ids: Vec<_> = summary.records.iter().map(|r| r.identity_id.as_str()).collect();
        assert_eq!(ids, vec!["s-2", "s-1"]);
    }
}

//! Queue-on-contention detection scheduler.
//!
//! Requests go into a bounded FIFO and a single drain task dispatches them
//! to the detector one at a time, honouring the cooldown, the minimum
//! spacing and the per-minute cap before every dispatch.
//!
//! There is no timeout on the detector: a detection call that never
//! resolves stalls the drain task, and queued requests wait until `reset()`.

use crate::config::SchedulerConfig;
use crate::outcome::{
    DetectionError, DetectionOutcome, DetectionTicket, Detector, Reply, SchedulerError,
};
use crate::status::{SchedulerSnapshot, SchedulerStatus, StatusBus, StatusUpdate};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Window for the per-minute attempt cap.
const RATE_WINDOW: Duration = Duration::from_secs(60);

struct PendingRequest<P> {
    payload: P,
    submitted_at: Instant,
    reply: Reply,
}

/// Why the drain loop cannot dispatch yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Cooldown,
    Spacing,
    MinuteCap,
}

struct SchedulerState<P> {
    queue: VecDeque<PendingRequest<P>>,
    is_processing: bool,
    last_detection_at: Option<Instant>,
    last_completed_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    detection_timestamps: VecDeque<Instant>,
    /// Reply for the request currently inside the detector.
    in_flight: Option<Reply>,
    /// Bumped by `reset()`; a drain task from an older generation exits.
    generation: u64,
}

impl<P> SchedulerState<P> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            is_processing: false,
            last_detection_at: None,
            last_completed_at: None,
            cooldown_until: None,
            detection_timestamps: VecDeque::new(),
            in_flight: None,
            generation: 0,
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn attempts_in_window(&self, now: Instant) -> usize {
        self.detection_timestamps
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < RATE_WINDOW)
            .count()
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(oldest) = self.detection_timestamps.front() {
            if now.saturating_duration_since(*oldest) >= RATE_WINDOW {
                self.detection_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until the oldest in-window attempt ages out, if the cap is reached.
    fn minute_cap_remaining(&self, now: Instant, cap: usize) -> Option<Duration> {
        if self.attempts_in_window(now) < cap {
            return None;
        }
        self.detection_timestamps
            .iter()
            .find(|t| now.saturating_duration_since(**t) < RATE_WINDOW)
            .map(|oldest| (*oldest + RATE_WINDOW).saturating_duration_since(now))
    }

    fn spacing_remaining(&self, now: Instant, spacing: Duration) -> Duration {
        [self.last_detection_at, self.last_completed_at]
            .into_iter()
            .flatten()
            .map(|t| (t + spacing).saturating_duration_since(now))
            .max()
            .unwrap_or_default()
    }

    /// Submission-time check: the hard cooldown and the minute cap reject.
    fn admission_block(&self, now: Instant, config: &SchedulerConfig) -> Option<Duration> {
        let cooldown = self.cooldown_remaining(now);
        let cap = self
            .minute_cap_remaining(now, config.max_retries_per_minute)
            .unwrap_or_default();
        let wait = cooldown.max(cap);
        (!wait.is_zero()).then_some(wait)
    }

    /// Drain-time check: cooldown, spacing and the minute cap all defer.
    fn dispatch_block(&self, now: Instant, config: &SchedulerConfig) -> Option<(Duration, Block)> {
        [
            (self.cooldown_remaining(now), Block::Cooldown),
            (
                self.spacing_remaining(now, config.min_time_between_detections()),
                Block::Spacing,
            ),
            (
                self.minute_cap_remaining(now, config.max_retries_per_minute)
                    .unwrap_or_default(),
                Block::MinuteCap,
            ),
        ]
        .into_iter()
        .filter(|(wait, _)| !wait.is_zero())
        .max_by_key(|(wait, _)| *wait)
    }

    fn update(&self, status: SchedulerStatus, message: impl Into<String>, now: Instant) -> StatusUpdate {
        let cooldown = self.cooldown_remaining(now);
        StatusUpdate {
            status,
            message: message.into(),
            queue_size: self.queue.len(),
            is_processing: self.is_processing,
            cooldown_remaining_ms: (!cooldown.is_zero()).then(|| cooldown.as_millis() as u64),
        }
    }
}

/// What the drain task should do next.
enum Step<P> {
    Exit,
    Wait(Duration),
    Dispatch(P),
}

struct Inner<P, D> {
    config: SchedulerConfig,
    detector: D,
    state: Mutex<SchedulerState<P>>,
    status: StatusBus,
}

impl<P, D> Inner<P, D> {
    fn lock(&self) -> MutexGuard<'_, SchedulerState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide the next drain step. Never holds the lock past return.
    fn next_step(&self, generation: u64) -> Step<P> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.generation != generation {
            return Step::Exit;
        }

        if state.queue.is_empty() {
            state.is_processing = false;
            let update = state.update(SchedulerStatus::Idle, "ready", now);
            drop(state);
            self.status.publish(&update);
            return Step::Exit;
        }

        if let Some((wait, block)) = state.dispatch_block(now, &self.config) {
            let (status, message) = match block {
                Block::MinuteCap => (
                    SchedulerStatus::RateLimited,
                    "too many attempts this minute, waiting",
                ),
                Block::Cooldown | Block::Spacing => (SchedulerStatus::Waiting, "waiting to detect"),
            };
            let update = state.update(status, message, now);
            drop(state);
            tracing::trace!(wait_ms = wait.as_millis() as u64, ?block, "drain deferred");
            self.status.publish(&update);
            return Step::Wait(wait);
        }

        let Some(request) = state.queue.pop_front() else {
            return Step::Exit;
        };
        state.prune_window(now);
        state.detection_timestamps.push_back(now);
        state.last_detection_at = Some(now);
        state.in_flight = Some(request.reply);

        let update = state.update(SchedulerStatus::Processing, "detecting", now);
        drop(state);
        tracing::debug!(
            waited_ms = now.saturating_duration_since(request.submitted_at).as_millis() as u64,
            queue_size = update.queue_size,
            "dispatching detection"
        );
        self.status.publish(&update);
        Step::Dispatch(request.payload)
    }

    /// Record an outcome, arm the next cooldown and resolve the ticket.
    /// Returns `false` if the scheduler was reset while the detector ran.
    fn complete(&self, generation: u64, result: Result<DetectionOutcome, DetectionError>) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        if state.generation != generation {
            drop(state);
            tracing::debug!("scheduler reset during detection; discarding result");
            return false;
        }

        let cooldown = match &result {
            Ok(outcome) if outcome.is_conclusive() => self.config.cooldown_after_success(),
            _ => self.config.cooldown_after_failure(),
        };
        let until = now + cooldown;
        state.cooldown_until = Some(state.cooldown_until.map_or(until, |prev| prev.max(until)));
        state.last_completed_at = Some(now);
        let reply = state.in_flight.take();

        let update = match &result {
            Ok(DetectionOutcome::Recognized { display_name, .. }) => {
                state.update(SchedulerStatus::Success, format!("marked {display_name}"), now)
            }
            Ok(DetectionOutcome::AlreadyMarked { display_name }) => state.update(
                SchedulerStatus::Success,
                format!("{display_name} already marked"),
                now,
            ),
            Ok(DetectionOutcome::NoFace) => state.update(SchedulerStatus::Failed, "no face detected", now),
            Ok(DetectionOutcome::NotRecognized) => {
                state.update(SchedulerStatus::Failed, "face not recognized", now)
            }
            Err(err) => state.update(SchedulerStatus::Failed, format!("detection failed: {err}"), now),
        };
        drop(state);

        match &result {
            Ok(outcome) => tracing::debug!(
                ?outcome,
                cooldown_ms = cooldown.as_millis() as u64,
                "detection complete"
            ),
            Err(err) => tracing::warn!(
                error = %err,
                cooldown_ms = cooldown.as_millis() as u64,
                "detection function failed"
            ),
        }

        if let Some(reply) = reply {
            let _ = reply.send(result.map_err(SchedulerError::from));
        }
        self.status.publish(&update);
        true
    }
}

/// Queue-on-contention scheduler. One instance per attendance session.
///
/// `submit` must be called from within a Tokio runtime; the drain task is
/// spawned on demand and exits when the queue empties.
pub struct DetectionScheduler<P, D> {
    inner: Arc<Inner<P, D>>,
}

impl<P, D> Clone for DetectionScheduler<P, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P, D> DetectionScheduler<P, D>
where
    P: Send + 'static,
    D: Detector<P>,
{
    pub fn new(config: SchedulerConfig, detector: D) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                detector,
                state: Mutex::new(SchedulerState::new()),
                status: StatusBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn status_bus(&self) -> &StatusBus {
        &self.inner.status
    }

    /// Enqueue a detection request.
    ///
    /// Rejected immediately with `RateLimited` while a cooldown is armed or
    /// the per-minute cap is reached. When the queue is full the oldest
    /// pending request is evicted with `QueueOverflow`.
    pub fn submit(&self, payload: P) -> DetectionTicket {
        let now = Instant::now();
        let mut state = self.inner.lock();

        if let Some(retry_after) = state.admission_block(now, &self.inner.config) {
            let update = state.update(
                SchedulerStatus::RateLimited,
                format!("try again in {}s", retry_after.as_millis().div_ceil(1000)),
                now,
            );
            drop(state);
            tracing::debug!(
                retry_after_ms = retry_after.as_millis() as u64,
                "submission rejected: rate limited"
            );
            self.inner.status.publish(&update);
            return DetectionTicket::rejected(SchedulerError::RateLimited { retry_after });
        }

        while state.queue.len() >= self.inner.config.max_queue_size {
            let Some(oldest) = state.queue.pop_front() else {
                break;
            };
            let _ = oldest.reply.send(Err(SchedulerError::QueueOverflow));
            tracing::warn!(
                max_queue_size = self.inner.config.max_queue_size,
                "detection queue full, evicted oldest request"
            );
        }

        let (reply, ticket) = DetectionTicket::channel();
        state.queue.push_back(PendingRequest {
            payload,
            submitted_at: now,
            reply,
        });

        let start_drain = !state.is_processing;
        if start_drain {
            state.is_processing = true;
        }
        let generation = state.generation;
        let update = state.update(SchedulerStatus::Queued, "queued for detection", now);
        drop(state);

        tracing::debug!(queue_size = update.queue_size, "detection queued");
        self.inner.status.publish(&update);

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.inner), generation));
        }
        ticket
    }

    /// Cancel everything and return to a fresh state.
    ///
    /// A detection already inside the detector keeps running; its result is
    /// discarded when it resolves.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.inner.lock();
        state.generation = state.generation.wrapping_add(1);
        let mut cancelled: Vec<Reply> = state.queue.drain(..).map(|r| r.reply).collect();
        cancelled.extend(state.in_flight.take());
        state.is_processing = false;
        state.last_detection_at = None;
        state.last_completed_at = None;
        state.cooldown_until = None;
        state.detection_timestamps.clear();
        let update = state.update(SchedulerStatus::Idle, "reset", now);
        drop(state);

        tracing::info!(cancelled = cancelled.len(), "detection scheduler reset");
        for reply in cancelled {
            let _ = reply.send(Err(SchedulerError::Cancelled));
        }
        self.inner.status.publish(&update);
    }

    /// Side-effect-free snapshot of the scheduler.
    pub fn status(&self) -> SchedulerSnapshot {
        let now = Instant::now();
        let state = self.inner.lock();
        SchedulerSnapshot {
            queue_size: state.queue.len(),
            is_processing: state.is_processing,
            cooldown_remaining_ms: state.cooldown_remaining(now).as_millis() as u64,
            detections_in_last_minute: state.attempts_in_window(now),
        }
    }

    /// Whether a submission made now would be dispatched without waiting.
    pub fn is_ready(&self) -> bool {
        let now = Instant::now();
        let state = self.inner.lock();
        !state.is_processing && state.dispatch_block(now, &self.inner.config).is_none()
    }
}

async fn drain<P, D>(inner: Arc<Inner<P, D>>, generation: u64)
where
    P: Send + 'static,
    D: Detector<P>,
{
    loop {
        match inner.next_step(generation) {
            Step::Exit => return,
            Step::Wait(wait) => tokio::time::sleep(wait).await,
            Step::Dispatch(payload) => {
                let result = inner.detector.detect(payload).await;
                if !inner.complete(generation, result) {
                    return;
                }
            }
        }
    }
}

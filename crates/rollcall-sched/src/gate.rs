//! Skip-on-contention detection: a single slot driven by an external poll.
//!
//! Nothing is queued. An attempt that arrives while a detection is in
//! flight, or before the armed cooldown has elapsed, is skipped.

use crate::config::SchedulerConfig;
use crate::outcome::{DetectionOutcome, DetectionTicket, Detector, Reply, SchedulerError};
use crate::status::{SchedulerSnapshot, SchedulerStatus, StatusBus, StatusUpdate};
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// `Idle → Processing → Idle (cooldown armed)`. Lives for one attendance
/// session and is reset when the session ends.
///
/// The base cooldown doubles as the minimum spacing between attempts: an
/// outcome cooldown shorter than it never lets attempts run closer together.
#[derive(Debug, Clone)]
pub struct DetectionGate {
    base_cooldown: Duration,
    cooldown: Duration,
    is_processing: bool,
    last_attempt_at: Option<Instant>,
    last_completed_at: Option<Instant>,
    recent_attempts: VecDeque<Instant>,
}

impl DetectionGate {
    pub fn new(base_cooldown: Duration) -> Self {
        Self {
            base_cooldown,
            cooldown: base_cooldown,
            is_processing: false,
            last_attempt_at: None,
            last_completed_at: None,
            recent_attempts: VecDeque::new(),
        }
    }

    /// True iff idle and both the spacing and the armed cooldown have elapsed.
    pub fn can_detect(&self) -> bool {
        !self.is_processing && self.time_until_next_detection().is_zero()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing
    }

    pub fn start_processing(&mut self) {
        let now = Instant::now();
        self.is_processing = true;
        self.last_attempt_at = Some(now);
        while let Some(oldest) = self.recent_attempts.front() {
            if now.saturating_duration_since(*oldest) >= RATE_WINDOW {
                self.recent_attempts.pop_front();
            } else {
                break;
            }
        }
        self.recent_attempts.push_back(now);
    }

    /// Finish the attempt and arm the next cooldown, measured from now.
    /// `None` re-arms the base cooldown.
    pub fn end_processing(&mut self, custom_cooldown: Option<Duration>) {
        self.is_processing = false;
        self.cooldown = custom_cooldown.unwrap_or(self.base_cooldown);
        self.last_completed_at = Some(Instant::now());
    }

    /// Longest of: spacing since the last attempt started, and the armed
    /// cooldown (never below the spacing) since it completed.
    pub fn time_until_next_detection(&self) -> Duration {
        let spacing = self
            .last_attempt_at
            .map(|at| self.base_cooldown.saturating_sub(at.elapsed()))
            .unwrap_or_default();
        let cooldown = self
            .last_completed_at
            .map(|at| self.cooldown.max(self.base_cooldown).saturating_sub(at.elapsed()))
            .unwrap_or_default();
        spacing.max(cooldown)
    }

    pub fn attempts_in_last_minute(&self) -> usize {
        let now = Instant::now();
        self.recent_attempts
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < RATE_WINDOW)
            .count()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.base_cooldown);
    }
}

struct SlotState {
    gate: DetectionGate,
    in_flight: Option<Reply>,
    generation: u64,
}

struct SlotInner<D> {
    config: SchedulerConfig,
    detector: D,
    state: Mutex<SlotState>,
    status: StatusBus,
}

impl<D> SlotInner<D> {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, gate: &DetectionGate, status: SchedulerStatus, message: impl Into<String>) -> StatusUpdate {
        let remaining = gate.time_until_next_detection();
        StatusUpdate {
            status,
            message: message.into(),
            queue_size: 0,
            is_processing: gate.is_processing(),
            cooldown_remaining_ms: (!remaining.is_zero()).then(|| remaining.as_millis() as u64),
        }
    }
}

/// Single-slot scheduler: the same cooldown rules as
/// [`DetectionScheduler`](crate::DetectionScheduler), without the queue or
/// the per-minute cap.
pub struct SingleSlotScheduler<P, D> {
    inner: Arc<SlotInner<D>>,
    _payload: PhantomData<fn(P)>,
}

impl<P, D> Clone for SingleSlotScheduler<P, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _payload: PhantomData,
        }
    }
}

impl<P, D> SingleSlotScheduler<P, D>
where
    P: Send + 'static,
    D: Detector<P>,
{
    pub fn new(config: SchedulerConfig, detector: D) -> Self {
        let gate = DetectionGate::new(config.min_time_between_detections());
        Self {
            inner: Arc::new(SlotInner {
                config,
                detector,
                state: Mutex::new(SlotState {
                    gate,
                    in_flight: None,
                    generation: 0,
                }),
                status: StatusBus::new(),
            }),
            _payload: PhantomData,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn status_bus(&self) -> &StatusBus {
        &self.inner.status
    }

    pub fn can_detect(&self) -> bool {
        self.inner.lock().gate.can_detect()
    }

    /// Attempt a detection now. Resolves with `Busy` or `RateLimited`
    /// instead of waiting when the slot is not free.
    pub fn submit(&self, payload: P) -> DetectionTicket {
        let mut state = self.inner.lock();
        if state.gate.is_processing() {
            drop(state);
            tracing::trace!("detection skipped: slot busy");
            return DetectionTicket::rejected(SchedulerError::Busy);
        }
        let retry_after = state.gate.time_until_next_detection();
        if !retry_after.is_zero() {
            let update = self.inner.update(
                &state.gate,
                SchedulerStatus::RateLimited,
                format!("try again in {}s", retry_after.as_millis().div_ceil(1000)),
            );
            drop(state);
            tracing::trace!(retry_after_ms = retry_after.as_millis() as u64, "detection skipped: cooling down");
            self.inner.status.publish(&update);
            return DetectionTicket::rejected(SchedulerError::RateLimited { retry_after });
        }

        let (reply, ticket) = DetectionTicket::channel();
        state.gate.start_processing();
        state.in_flight = Some(reply);
        let generation = state.generation;
        let update = self.inner.update(&state.gate, SchedulerStatus::Processing, "detecting");
        drop(state);
        self.inner.status.publish(&update);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.detector.detect(payload).await;
            let cooldown = match &result {
                Ok(outcome) if outcome.is_conclusive() => inner.config.cooldown_after_success(),
                _ => inner.config.cooldown_after_failure(),
            };

            let mut state = inner.lock();
            if state.generation != generation {
                drop(state);
                tracing::debug!("gate reset during detection; discarding result");
                return;
            }
            state.gate.end_processing(Some(cooldown));
            let reply = state.in_flight.take();
            let update = match &result {
                Ok(DetectionOutcome::Recognized { display_name, .. }) => {
                    inner.update(&state.gate, SchedulerStatus::Success, format!("marked {display_name}"))
                }
                Ok(DetectionOutcome::AlreadyMarked { display_name }) => inner.update(
                    &state.gate,
                    SchedulerStatus::Success,
                    format!("{display_name} already marked"),
                ),
                Ok(DetectionOutcome::NoFace) => {
                    inner.update(&state.gate, SchedulerStatus::Failed, "no face detected")
                }
                Ok(DetectionOutcome::NotRecognized) => {
                    inner.update(&state.gate, SchedulerStatus::Failed, "face not recognized")
                }
                Err(err) => inner.update(
                    &state.gate,
                    SchedulerStatus::Failed,
                    format!("detection failed: {err}"),
                ),
            };
            drop(state);

            if let Err(err) = &result {
                tracing::warn!(error = %err, "detection function failed");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result.map_err(SchedulerError::from));
            }
            inner.status.publish(&update);
        });
        ticket
    }

    pub fn reset(&self) {
        let (cancelled, update) = {
            let mut state = self.inner.lock();
            state.generation = state.generation.wrapping_add(1);
            state.gate.reset();
            let cancelled = state.in_flight.take();
            (cancelled, self.inner.update(&state.gate, SchedulerStatus::Idle, "reset"))
        };
        tracing::info!(cancelled = cancelled.is_some(), "detection gate reset");
        if let Some(reply) = cancelled {
            let _ = reply.send(Err(SchedulerError::Cancelled));
        }
        self.inner.status.publish(&update);
    }

    pub fn status(&self) -> SchedulerSnapshot {
        let state = self.inner.lock();
        SchedulerSnapshot {
            queue_size: 0,
            is_processing: state.gate.is_processing(),
            cooldown_remaining_ms: state.gate.time_until_next_detection().as_millis() as u64,
            detections_in_last_minute: state.gate.attempts_in_last_minute(),
        }
    }

    /// Drive the gate from a fixed-interval timer until the future is dropped.
    ///
    /// `next_frame` is only called on ticks where the gate is open; a tick
    /// that lands inside a cooldown or an in-flight attempt is skipped.
    pub async fn run_polling<F, Fut>(&self, period: Duration, next_frame: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<P>>,
    {
        drive_polling(period, || self.can_detect(), |p| self.submit(p), next_frame).await
    }
}

/// Fixed-interval poll loop shared by both admission policies.
pub(crate) async fn drive_polling<P, F, Fut>(
    period: Duration,
    is_open: impl Fn() -> bool,
    submit: impl Fn(P) -> DetectionTicket,
    mut next_frame: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<P>>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !is_open() {
            continue;
        }
        let Some(payload) = next_frame().await else {
            tracing::trace!("poll tick without a frame");
            continue;
        };
        // The outcome reaches observers through the status bus.
        drop(submit(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::DetectionError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_gate_cycle() {
        let mut gate = DetectionGate::new(Duration::from_millis(1000));
        assert!(gate.can_detect());
        assert_eq!(gate.time_until_next_detection(), Duration::ZERO);

        gate.start_processing();
        assert!(!gate.can_detect());
        assert!(gate.is_processing());

        tokio::time::advance(Duration::from_millis(300)).await;
        gate.end_processing(Some(Duration::from_millis(3000)));
        assert!(!gate.can_detect());
        assert_eq!(gate.time_until_next_detection(), Duration::from_millis(3000));

        tokio::time::advance(Duration::from_millis(2999)).await;
        assert!(!gate.can_detect());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(gate.can_detect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_default_cooldown_and_reset() {
        let mut gate = DetectionGate::new(Duration::from_millis(1000));
        gate.start_processing();
        gate.end_processing(None);
        assert_eq!(gate.time_until_next_detection(), Duration::from_millis(1000));
        assert_eq!(gate.attempts_in_last_minute(), 1);

        gate.reset();
        assert!(gate.can_detect());
        assert_eq!(gate.attempts_in_last_minute(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_spacing_floor_after_short_cooldown() {
        let mut gate = DetectionGate::new(Duration::from_millis(1000));
        let started = Instant::now();
        gate.start_processing();
        tokio::time::advance(Duration::from_millis(1500)).await;
        gate.end_processing(Some(Duration::from_millis(200)));

        assert_eq!(gate.last_attempt_at, Some(started));
        assert_eq!(gate.last_completed_at, Some(Instant::now()));
        assert_eq!(gate.time_until_next_detection(), Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!gate.can_detect());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(gate.can_detect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_short_failure_cooldown_keeps_spacing() {
        let config = SchedulerConfig {
            cooldown_after_failure_ms: 200,
            ..SchedulerConfig::single_slot()
        };
        let detector = |_: u8| async { Ok::<_, DetectionError>(DetectionOutcome::NoFace) };
        let scheduler = SingleSlotScheduler::new(config, detector);

        assert_eq!(scheduler.submit(1).await, Ok(DetectionOutcome::NoFace));
        tokio::time::advance(Duration::from_millis(300)).await;
        match scheduler.submit(2).await {
            Err(SchedulerError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_millis(700));
            }
            other => panic!("expected spacing to hold, got {other:?}"),
        }

        tokio::time::advance(Duration::from_millis(700)).await;
        assert_eq!(scheduler.submit(3).await, Ok(DetectionOutcome::NoFace));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_skips_when_busy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let detector = move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok::<_, DetectionError>(DetectionOutcome::NoFace)
            }
        };
        let scheduler = SingleSlotScheduler::new(SchedulerConfig::single_slot(), detector);

        let first = scheduler.submit(1);
        assert_eq!(scheduler.submit(2).await, Err(SchedulerError::Busy));
        assert_eq!(first.await, Ok(DetectionOutcome::NoFace));

        // Failure cooldown (3000 ms) is armed from completion.
        match scheduler.submit(3).await {
            Err(SchedulerError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Duration::from_millis(3000));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        tokio::time::advance(Duration::from_millis(3000)).await;
        assert_eq!(scheduler.submit(4).await, Ok(DetectionOutcome::NoFace));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_reset_discards_in_flight() {
        let detector = |_: u8| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, DetectionError>(DetectionOutcome::AlreadyMarked {
                display_name: "Ada".into(),
            })
        };
        let scheduler = SingleSlotScheduler::new(SchedulerConfig::single_slot(), detector);

        let stale = scheduler.submit(1);
        assert!(scheduler.status().is_processing);
        scheduler.reset();
        assert!(!scheduler.status().is_processing);
        assert_eq!(stale.await, Err(SchedulerError::Cancelled));

        let fresh = scheduler.submit(2);
        assert!(scheduler.status().is_processing);
        assert!(fresh.await.unwrap().is_conclusive());
        assert_eq!(scheduler.status().cooldown_remaining_ms, 5000);

        // The stale attempt finishes around now and must not disturb the gate.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.status().cooldown_remaining_ms, 4990);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_skips_ticks_during_cooldown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let detector = move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, DetectionError>(DetectionOutcome::NotRecognized) }
        };
        let config = SchedulerConfig {
            cooldown_after_failure_ms: 2500,
            ..SchedulerConfig::single_slot()
        };
        let scheduler = SingleSlotScheduler::new(config, detector);

        let poller = scheduler.clone();
        let _ = tokio::time::timeout(
            Duration::from_millis(5500),
            poller.run_polling(Duration::from_millis(1000), || async { Some(0) }),
        )
        .await;

        // Ticks at 0..=5000 ms; attempts at 0, 3000 (cooldown 2500 from ~0).
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

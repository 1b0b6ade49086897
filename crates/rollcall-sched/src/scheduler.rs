use crate::config::{Admission, ConfigError, SchedulerConfig};
use crate::gate::{drive_polling, SingleSlotScheduler};
use crate::outcome::{DetectionTicket, Detector};
use crate::queue::DetectionScheduler;
use crate::status::{SchedulerSnapshot, StatusBus};
use std::future::Future;
use std::time::Duration;

/// One scheduler per attendance session, with the admission policy chosen
/// by [`SchedulerConfig::admission`].
pub enum Scheduler<P, D> {
    Queued(DetectionScheduler<P, D>),
    SingleSlot(SingleSlotScheduler<P, D>),
}

impl<P, D> Clone for Scheduler<P, D> {
    fn clone(&self) -> Self {
        match self {
            Self::Queued(s) => Self::Queued(s.clone()),
            Self::SingleSlot(s) => Self::SingleSlot(s.clone()),
        }
    }
}

impl<P, D> Scheduler<P, D>
where
    P: Send + 'static,
    D: Detector<P>,
{
    pub fn new(config: SchedulerConfig, detector: D) -> Result<Self, ConfigError> {
        config.validate()?;
        tracing::debug!(?config, "creating detection scheduler");
        Ok(match config.admission {
            Admission::Queue => Self::Queued(DetectionScheduler::new(config, detector)),
            Admission::SingleSlot => Self::SingleSlot(SingleSlotScheduler::new(config, detector)),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        match self {
            Self::Queued(s) => s.config(),
            Self::SingleSlot(s) => s.config(),
        }
    }

    pub fn submit(&self, payload: P) -> DetectionTicket {
        match self {
            Self::Queued(s) => s.submit(payload),
            Self::SingleSlot(s) => s.submit(payload),
        }
    }

    pub fn reset(&self) {
        match self {
            Self::Queued(s) => s.reset(),
            Self::SingleSlot(s) => s.reset(),
        }
    }

    pub fn status(&self) -> SchedulerSnapshot {
        match self {
            Self::Queued(s) => s.status(),
            Self::SingleSlot(s) => s.status(),
        }
    }

    /// Whether an attempt made now would be dispatched straight away.
    pub fn is_ready(&self) -> bool {
        match self {
            Self::Queued(s) => s.is_ready(),
            Self::SingleSlot(s) => s.can_detect(),
        }
    }

    pub fn status_bus(&self) -> &StatusBus {
        match self {
            Self::Queued(s) => s.status_bus(),
            Self::SingleSlot(s) => s.status_bus(),
        }
    }

    /// Poll `next_frame` every `period` and submit whenever the scheduler
    /// is ready. Runs until the future is dropped.
    pub async fn run_polling<F, Fut>(&self, period: Duration, next_frame: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Option<P>>,
    {
        match self {
            Self::Queued(s) => drive_polling(period, || s.is_ready(), |p| s.submit(p), next_frame).await,
            Self::SingleSlot(s) => s.run_polling(period, next_frame).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{DetectionError, DetectionOutcome, SchedulerError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn no_face(_: u8) -> Result<DetectionOutcome, DetectionError> {
        Ok(DetectionOutcome::NoFace)
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_selects_variant() {
        let queued = Scheduler::new(SchedulerConfig::default(), no_face).unwrap();
        assert!(matches!(queued, Scheduler::Queued(_)));

        let slot = Scheduler::new(SchedulerConfig::single_slot(), no_face).unwrap();
        assert!(matches!(slot, Scheduler::SingleSlot(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let config = SchedulerConfig {
            max_queue_size: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            Scheduler::new(config, no_face),
            Err(ConfigError::ZeroQueueSize)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_variants_share_cooldown_semantics() {
        for config in [SchedulerConfig::default(), SchedulerConfig::single_slot()] {
            let scheduler = Scheduler::new(config, no_face).unwrap();
            assert!(scheduler.is_ready());
            assert_eq!(scheduler.submit(1).await, Ok(DetectionOutcome::NoFace));
            assert!(!scheduler.is_ready());

            tokio::time::advance(Duration::from_millis(1000)).await;
            assert!(matches!(
                scheduler.submit(2).await,
                Err(SchedulerError::RateLimited { .. })
            ));

            scheduler.reset();
            assert!(scheduler.is_ready());
            assert_eq!(scheduler.submit(3).await, Ok(DetectionOutcome::NoFace));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_polling_skips_ticks_until_ready() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let detector = move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, DetectionError>(DetectionOutcome::NotRecognized) }
        };
        let scheduler = Scheduler::new(SchedulerConfig::default(), detector).unwrap();

        let frames = Arc::new(AtomicUsize::new(0));
        let pulled = Arc::clone(&frames);
        let _ = tokio::time::timeout(
            Duration::from_millis(5500),
            scheduler.run_polling(Duration::from_millis(1000), move || {
                pulled.fetch_add(1, Ordering::SeqCst);
                async { Some(0) }
            }),
        )
        .await;

        // Failure cooldown is 3000 ms, so only the ticks at 0 and 3000 ms
        // pull a frame.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(frames.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.status().queue_size, 0);
    }
}

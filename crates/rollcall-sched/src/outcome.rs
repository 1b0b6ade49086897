//! Detection outcomes, scheduler errors and the ticket returned by `submit`.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

/// Conclusive or inconclusive result of one detection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DetectionOutcome {
    Recognized {
        identity_id: String,
        display_name: String,
        confidence: f32,
    },
    AlreadyMarked {
        display_name: String,
    },
    NoFace,
    NotRecognized,
}

impl DetectionOutcome {
    /// Whether the outcome identified someone (arms the success cooldown).
    pub fn is_conclusive(&self) -> bool {
        matches!(self, Self::Recognized { .. } | Self::AlreadyMarked { .. })
    }
}

/// The detection function itself failed. The scheduler does not interpret
/// the cause.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct DetectionError(pub String);

impl DetectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("detection rate limited, try again in {}s", whole_secs(.retry_after))]
    RateLimited { retry_after: Duration },
    #[error("detection queue full, request dropped")]
    QueueOverflow,
    #[error("detection cancelled")]
    Cancelled,
    #[error("a detection is already in progress")]
    Busy,
    #[error("detection failed: {0}")]
    Detection(#[from] DetectionError),
}

impl SchedulerError {
    /// Rate-limit, overflow and busy rejections are transient; the caller
    /// should simply try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::QueueOverflow | Self::Busy
        )
    }
}

fn whole_secs(d: &Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

/// Caller-supplied detection function.
///
/// Any `Fn(P) -> impl Future<Output = Result<DetectionOutcome, DetectionError>>`
/// closure qualifies.
pub trait Detector<P>: Send + Sync + 'static {
    fn detect(
        &self,
        payload: P,
    ) -> impl Future<Output = Result<DetectionOutcome, DetectionError>> + Send;
}

impl<P, F, Fut> Detector<P> for F
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<DetectionOutcome, DetectionError>> + Send,
{
    fn detect(
        &self,
        payload: P,
    ) -> impl Future<Output = Result<DetectionOutcome, DetectionError>> + Send {
        self(payload)
    }
}

pub(crate) type Reply = oneshot::Sender<Result<DetectionOutcome, SchedulerError>>;

/// Handle to a submitted detection request.
///
/// Resolves once the request is processed, evicted, cancelled or rejected.
/// Dropping the ticket does not withdraw the request.
#[derive(Debug)]
pub struct DetectionTicket {
    rx: oneshot::Receiver<Result<DetectionOutcome, SchedulerError>>,
}

impl DetectionTicket {
    pub(crate) fn channel() -> (Reply, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub(crate) fn rejected(err: SchedulerError) -> Self {
        let (tx, ticket) = Self::channel();
        let _ = tx.send(Err(err));
        ticket
    }
}

impl Future for DetectionTicket {
    type Output = Result<DetectionOutcome, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the request was discarded by a reset.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SchedulerError::Cancelled)))
    }
}

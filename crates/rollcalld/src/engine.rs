use rollcall_core::pipeline::{self, Identification, PipelineError};
use rollcall_core::{EuclideanMatcher, GalleryEntry, SignatureExtractor};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from the scheduler's detection function to the engine thread.
struct IdentifyRequest {
    frame: Vec<u8>,
    gallery: Arc<[GalleryEntry]>,
    reply: oneshot::Sender<Result<Identification, PipelineError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<IdentifyRequest>,
}

impl EngineHandle {
    /// Decode the frame, extract its signature and match it against `gallery`.
    pub async fn identify(
        &self,
        frame: Vec<u8>,
        gallery: Arc<[GalleryEntry]>,
    ) -> Result<Identification, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IdentifyRequest {
                frame,
                gallery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Decoding and the extractor are blocking, so they stay off the async
/// runtime. Requests are served one at a time in arrival order.
pub fn spawn_engine(
    mut extractor: Box<dyn SignatureExtractor>,
    matcher: EuclideanMatcher,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<IdentifyRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(threshold = matcher.threshold(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                let result =
                    pipeline::identify(extractor.as_mut(), &matcher, &req.frame, &req.gallery);
                match &result {
                    Ok(identification) => tracing::debug!(
                        frame_bytes = req.frame.len(),
                        gallery = req.gallery.len(),
                        ?identification,
                        "frame identified"
                    ),
                    Err(err) => tracing::warn!(error = %err, "frame pipeline failed"),
                }
                let _ = req.reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

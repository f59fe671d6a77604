use facetrace_core::{AnalyzeError, Detection, FaceAnalyzer};
use facetrace_hw::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    ModelLoad(#[source] AnalyzeError),
    #[error("detection failed: {0}")]
    Detection(#[source] AnalyzeError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the detection loop to the engine thread.
enum EngineRequest {
    Detect {
        frame: Arc<Frame>,
        reply: oneshot::Sender<Result<Vec<Detection>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    ready: watch::Receiver<bool>,
}

impl EngineHandle {
    /// Whether both models have finished loading. Flips to `true` once.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Run one detection pass on the engine thread.
    pub async fn detect(&self, frame: Arc<Frame>) -> Result<Vec<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// `load` runs on the engine thread, so the caller returns immediately and
/// the compositor can start before the models are in memory. The returned
/// receiver resolves once with the load outcome.
pub fn spawn_engine<A, L>(load: L) -> (EngineHandle, oneshot::Receiver<Result<(), EngineError>>)
where
    A: FaceAnalyzer + 'static,
    L: FnOnce() -> Result<A, AnalyzeError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let (ready_tx, ready_rx) = watch::channel(false);
    let (loaded_tx, loaded_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("facetrace-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let started = std::time::Instant::now();
            let mut analyzer = match load() {
                Ok(analyzer) => analyzer,
                Err(e) => {
                    tracing::error!(error = %e, "failed to load detection models");
                    let _ = loaded_tx.send(Err(EngineError::ModelLoad(e)));
                    return;
                }
            };
            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "detection models loaded");
            ready_tx.send_replace(true);
            let _ = loaded_tx.send(Ok(()));

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { frame, reply } => {
                        let result = analyzer
                            .analyze(&frame.image)
                            .map_err(EngineError::Detection);
                        // Caller may have given up (teardown); nothing to do then.
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    (EngineHandle { tx, ready: ready_rx }, loaded_rx)
}

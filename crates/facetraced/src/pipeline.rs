//! Pipeline controller: acquires devices and wires capture, detection,
//! compositing and recording together.

use crate::compositor::CompositorLoop;
use crate::config::Config;
use crate::detection::DetectionLoop;
use crate::encoder::FfmpegEncoder;
use crate::engine::{spawn_engine, EngineError, EngineHandle};
use crate::recorder::{EncodingSession, Recorder, RecorderHandle};
use facetrace_core::LandmarkDetector;
use facetrace_hw::{AudioInput, Camera, Frame, MediaDevices, MediaError};
use facetrace_store::{ArtifactId, ArtifactStore};
use image::RgbaImage;
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

/// How long shutdown waits for an in-progress recording to be saved.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(10);
const SETTLE_POLL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("media acquisition failed: {0}")]
    Media(#[from] MediaError),
}

/// Snapshot reported by the `Status` D-Bus method.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub version: &'static str,
    pub camera: String,
    pub width: u32,
    pub height: u32,
    pub models_loaded: bool,
    pub recording: bool,
    pub audio: Option<AudioInput>,
    pub container: Option<&'static str>,
}

/// Clone-safe source of [`PipelineStatus`].
#[derive(Clone)]
pub struct StatusReporter {
    camera: String,
    width: u32,
    height: u32,
    audio: Option<AudioInput>,
    container: Option<&'static str>,
    engine: EngineHandle,
    recorder: RecorderHandle,
}

impl StatusReporter {
    pub async fn status(&self) -> PipelineStatus {
        PipelineStatus {
            version: env!("CARGO_PKG_VERSION"),
            camera: self.camera.clone(),
            width: self.width,
            height: self.height,
            models_loaded: self.engine.is_ready(),
            recording: self.recorder.is_recording().await.unwrap_or(false),
            audio: self.audio.clone(),
            container: self.container,
        }
    }
}

pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    recorder: RecorderHandle,
    reporter: StatusReporter,
    model_load: Option<oneshot::Receiver<Result<(), EngineError>>>,
    tasks: Vec<JoinHandle<()>>,
    recorder_task: JoinHandle<()>,
}

impl Pipeline {
    /// Acquire devices and start every stage.
    ///
    /// Only acquisition failures are returned. Model loading finishes in the
    /// background; see [`model_load`](Self::model_load).
    pub async fn start(config: &Config, store: ArtifactStore) -> Result<Self, PipelineError> {
        let media = MediaDevices::acquire(&config.media_request())?;
        let camera_info = (
            media.camera.device_path.clone(),
            media.camera.width,
            media.camera.height,
        );
        let audio = media.audio;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (frames_tx, frames_rx) = watch::channel::<Option<Arc<Frame>>>(None);
        let (overlay_tx, overlay_rx) = watch::channel(Arc::new(RgbaImage::new(0, 0)));
        let (composite_tx, composite_rx) = watch::channel::<Option<Arc<Frame>>>(None);

        spawn_capture(media.camera, frames_tx, shutdown_rx.clone());

        let model_dir = config.model_dir.clone();
        tracing::info!(dir = %model_dir.display(), "loading detection models");
        let (engine, model_load) = spawn_engine(move || LandmarkDetector::load(&model_dir));

        let compositor = CompositorLoop::new(
            frames_rx.clone(),
            overlay_rx,
            composite_tx,
            shutdown_rx.clone(),
            config.frame_interval(),
        );
        let detection = DetectionLoop::new(
            engine.clone(),
            frames_rx,
            overlay_tx,
            shutdown_rx,
            config.detect_interval,
        );
        let tasks = vec![tokio::spawn(compositor.run()), tokio::spawn(detection.run())];

        let (session, container) =
            match FfmpegEncoder::new(config.ffmpeg.clone(), composite_rx, audio.clone(), config.fps)
                .await
            {
                Ok(encoder) => {
                    let mime = encoder.container().mime();
                    (Some(Box::new(encoder) as Box<dyn EncodingSession>), Some(mime))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "recording unavailable");
                    (None, None)
                }
            };

        let (recorder, recorder_task) = Recorder::new(session, Arc::new(store)).spawn();

        let reporter = StatusReporter {
            camera: camera_info.0,
            width: camera_info.1,
            height: camera_info.2,
            audio,
            container,
            engine,
            recorder: recorder.clone(),
        };

        tracing::info!("pipeline started");
        Ok(Self {
            shutdown_tx,
            recorder,
            reporter,
            model_load: Some(model_load),
            tasks,
            recorder_task,
        })
    }

    pub fn recorder(&self) -> RecorderHandle {
        self.recorder.clone()
    }

    pub fn subscribe_saved(&self) -> broadcast::Receiver<ArtifactId> {
        self.recorder.subscribe_saved()
    }

    pub fn status_reporter(&self) -> StatusReporter {
        self.reporter.clone()
    }

    pub async fn status(&self) -> PipelineStatus {
        self.reporter.status().await
    }

    /// Resolves only if model loading fails; pends forever once loaded.
    pub async fn model_load(&mut self) -> EngineError {
        let error = match self.model_load.take() {
            Some(rx) => match rx.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(EngineError::ChannelClosed),
            },
            None => None,
        };
        match error {
            Some(e) => e,
            None => std::future::pending().await,
        }
    }

    /// Stop the loops, finish any active recording, and wait for tasks.
    pub async fn shutdown(self) {
        tracing::info!("pipeline shutting down");
        self.shutdown_tx.send_replace(true);

        if let Ok(true) = self.recorder.stop().await {
            tracing::info!("saving in-progress recording");
        }
        let settled = tokio::time::timeout(FINALIZE_TIMEOUT, async {
            while let Ok(state) = self.recorder.state().await {
                if state.is_settled() {
                    break;
                }
                tokio::time::sleep(SETTLE_POLL).await;
            }
        })
        .await;
        if settled.is_err() {
            tracing::warn!("recording was not saved before shutdown");
        }

        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        // Other handles (D-Bus) may still be alive; the recorder has nothing left to do.
        self.recorder_task.abort();
        tracing::info!("pipeline stopped");
    }
}

/// Camera frames → live watch channel, on a dedicated OS thread.
///
/// The thread notices shutdown at the next frame; it is not joined.
fn spawn_capture(
    camera: Camera,
    frames_tx: watch::Sender<Option<Arc<Frame>>>,
    shutdown: watch::Receiver<bool>,
) {
    std::thread::Builder::new()
        .name("facetrace-capture".into())
        .spawn(move || {
            tracing::info!(device = %camera.device_path, "capture thread started");
            let mut frames = 0u64;
            let result = camera.run_capture(|frame| {
                if *shutdown.borrow() {
                    return ControlFlow::Break(());
                }
                frames += 1;
                frames_tx.send_replace(Some(Arc::new(frame)));
                ControlFlow::Continue(())
            });
            match result {
                Ok(()) => tracing::info!(frames, "capture thread stopped"),
                Err(e) => tracing::error!(error = %e, frames, "camera capture failed"),
            }
        })
        .expect("failed to spawn capture thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use facetrace_hw::AudioBackend;

    #[test]
    fn test_status_reports_audio_backend_and_device() {
        let status = PipelineStatus {
            version: "0.1.0",
            camera: "/dev/video0".into(),
            width: 640,
            height: 480,
            models_loaded: true,
            recording: false,
            audio: Some(AudioInput {
                backend: AudioBackend::Pulse,
                device: "default".into(),
            }),
            container: Some("video/webm"),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["audio"]["backend"], "pulse");
        assert_eq!(json["audio"]["device"], "default");

        let silent = PipelineStatus { audio: None, ..status };
        assert!(serde_json::to_value(&silent).unwrap()["audio"].is_null());
    }
}

//! Detection loop: latest live frame → engine → overlay snapshot.

use crate::engine::EngineHandle;
use facetrace_core::OverlayRenderer;
use facetrace_hw::Frame;
use image::RgbaImage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const STATS_EVERY: u64 = 300;

/// Where one iteration of the loop ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Shutdown was signalled; the loop exits.
    Cancelled,
    /// No usable frame yet, or the models are still loading.
    WaitingForFrame,
    /// The overlay was redrawn with this many faces and published.
    Drawn(usize),
    /// The detector failed; the previous overlay stays up.
    Skipped,
}

pub struct DetectionLoop {
    engine: EngineHandle,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    overlay_tx: watch::Sender<Arc<RgbaImage>>,
    renderer: OverlayRenderer,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
    iterations: u64,
    detect_time: Duration,
}

impl DetectionLoop {
    pub fn new(
        engine: EngineHandle,
        frames: watch::Receiver<Option<Arc<Frame>>>,
        overlay_tx: watch::Sender<Arc<RgbaImage>>,
        shutdown: watch::Receiver<bool>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            frames,
            overlay_tx,
            renderer: OverlayRenderer::new(),
            shutdown,
            interval,
            iterations: 0,
            detect_time: Duration::ZERO,
        }
    }

    /// Run until shutdown is signalled (or its sender goes away).
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "detection loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if self.tick().await == LoopState::Cancelled {
                break;
            }
        }

        tracing::info!(iterations = self.iterations, "detection loop stopped");
    }

    /// One iteration: guards, then detect, then draw.
    pub async fn tick(&mut self) -> LoopState {
        if *self.shutdown.borrow() {
            return LoopState::Cancelled;
        }

        let Some(frame) = self.frames.borrow().clone() else {
            return LoopState::WaitingForFrame;
        };
        if !frame.has_dimensions() {
            return LoopState::WaitingForFrame;
        }
        if self.renderer.resize(frame.width(), frame.height()) {
            tracing::debug!(width = frame.width(), height = frame.height(), "overlay resized");
        }

        if !self.engine.is_ready() {
            return LoopState::WaitingForFrame;
        }

        let started = Instant::now();
        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = self.engine.detect(frame) => result,
            // The engine's reply is dropped if it arrives after this.
            _ = shutdown.wait_for(|stop| *stop) => return LoopState::Cancelled,
        };
        self.record_timing(started.elapsed());

        match result {
            Ok(detections) => {
                self.renderer.render(&detections);
                self.overlay_tx.send_replace(self.renderer.snapshot());
                LoopState::Drawn(detections.len())
            }
            Err(e) => {
                tracing::warn!(error = %e, "detection pass failed, keeping previous overlay");
                LoopState::Skipped
            }
        }
    }

    fn record_timing(&mut self, elapsed: Duration) {
        self.iterations += 1;
        self.detect_time += elapsed;
        if self.iterations % STATS_EVERY == 0 {
            tracing::debug!(
                passes = self.iterations,
                avg_detect_ms = self.detect_time.as_secs_f64() * 1000.0 / STATS_EVERY as f64,
                "detection timing"
            );
            self.detect_time = Duration::ZERO;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::tests::{frame, one_face, ScriptedAnalyzer};
    use facetrace_core::{AnalyzeError, DetectorError};
    use std::collections::VecDeque;

    struct Harness {
        frames_tx: watch::Sender<Option<Arc<Frame>>>,
        overlay_rx: watch::Receiver<Arc<RgbaImage>>,
        shutdown_tx: watch::Sender<bool>,
        detection: DetectionLoop,
    }

    async fn harness(passes: Vec<Vec<facetrace_core::Detection>>) -> Harness {
        harness_with(ScriptedAnalyzer::faces(passes)).await
    }

    async fn harness_with(analyzer: ScriptedAnalyzer) -> Harness {
        let (engine, loaded) = spawn_engine(move || Ok(analyzer));
        loaded.await.unwrap().unwrap();
        let (frames_tx, frames_rx) = watch::channel(None);
        let (overlay_tx, overlay_rx) = watch::channel(Arc::new(RgbaImage::new(0, 0)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let detection = DetectionLoop::new(
            engine,
            frames_rx,
            overlay_tx,
            shutdown_rx,
            Duration::from_millis(16),
        );
        Harness {
            frames_tx,
            overlay_rx,
            shutdown_tx,
            detection,
        }
    }

    #[tokio::test]
    async fn test_face_then_no_face_clears_overlay() {
        let mut h = harness(vec![vec![one_face()], vec![]]).await;

        h.frames_tx.send_replace(Some(frame(64, 64)));
        assert_eq!(h.detection.tick().await, LoopState::Drawn(1));
        let first = h.overlay_rx.borrow().clone();
        assert_eq!(first.dimensions(), (64, 64));
        assert!(first.pixels().any(|p| p[3] != 0));

        h.frames_tx.send_replace(Some(frame(64, 64)));
        assert_eq!(h.detection.tick().await, LoopState::Drawn(0));
        let second = h.overlay_rx.borrow().clone();
        assert!(second.pixels().all(|p| p[3] == 0));
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_previous_overlay() {
        let failure = AnalyzeError::Detector(DetectorError::InferenceFailed("session lost".into()));
        let mut h = harness_with(ScriptedAnalyzer {
            script: VecDeque::from([Ok(vec![one_face()]), Err(failure)]),
        })
        .await;

        h.frames_tx.send_replace(Some(frame(64, 64)));
        assert_eq!(h.detection.tick().await, LoopState::Drawn(1));
        let drawn = h.overlay_rx.borrow_and_update().clone();

        h.frames_tx.send_replace(Some(frame(64, 64)));
        assert_eq!(h.detection.tick().await, LoopState::Skipped);
        assert!(!h.overlay_rx.has_changed().unwrap());
        let kept = h.overlay_rx.borrow().clone();
        assert!(Arc::ptr_eq(&drawn, &kept));
        assert!(kept.pixels().any(|p| p[3] != 0));

        // The loop recovers on the next good pass.
        h.frames_tx.send_replace(Some(frame(64, 64)));
        assert_eq!(h.detection.tick().await, LoopState::Drawn(0));
    }

    #[tokio::test]
    async fn test_waits_without_frame_or_dimensions() {
        let mut h = harness(vec![vec![one_face()]]).await;
        assert_eq!(h.detection.tick().await, LoopState::WaitingForFrame);

        h.frames_tx.send_replace(Some(frame(0, 0)));
        assert_eq!(h.detection.tick().await, LoopState::WaitingForFrame);
        assert_eq!(h.overlay_rx.borrow().dimensions(), (0, 0));
    }

    #[tokio::test]
    async fn test_waits_until_models_ready() {
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let (engine, loaded) = spawn_engine(move || {
            let _ = gate_rx.recv();
            Ok(ScriptedAnalyzer::faces(vec![vec![one_face()]]))
        });
        let (frames_tx, frames_rx) = watch::channel(Some(frame(32, 32)));
        let (overlay_tx, _overlay_rx) = watch::channel(Arc::new(RgbaImage::new(0, 0)));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut detection =
            DetectionLoop::new(engine, frames_rx, overlay_tx, shutdown_rx, Duration::from_millis(16));

        assert_eq!(detection.tick().await, LoopState::WaitingForFrame);

        gate_tx.send(()).unwrap();
        loaded.await.unwrap().unwrap();
        assert_eq!(detection.tick().await, LoopState::Drawn(1));
        drop(frames_tx);
    }

    #[tokio::test]
    async fn test_shutdown_cancels() {
        let mut h = harness(vec![]).await;
        h.frames_tx.send_replace(Some(frame(16, 16)));
        h.shutdown_tx.send_replace(true);
        assert_eq!(h.detection.tick().await, LoopState::Cancelled);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let h = harness(vec![]).await;
        let task = tokio::spawn(h.detection.run());
        h.shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("detection loop did not stop")
            .unwrap();
    }
}

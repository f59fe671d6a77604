//! Compositor loop: live frame + overlay snapshot → composited stream, at a fixed rate.

use facetrace_core::Compositor;
use facetrace_hw::Frame;
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

pub struct CompositorLoop {
    compositor: Compositor,
    frames: watch::Receiver<Option<Arc<Frame>>>,
    overlay: watch::Receiver<Arc<RgbaImage>>,
    output: watch::Sender<Option<Arc<Frame>>>,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
}

impl CompositorLoop {
    pub fn new(
        frames: watch::Receiver<Option<Arc<Frame>>>,
        overlay: watch::Receiver<Arc<RgbaImage>>,
        output: watch::Sender<Option<Arc<Frame>>>,
        shutdown: watch::Receiver<bool>,
        interval: Duration,
    ) -> Self {
        Self {
            compositor: Compositor::new(),
            frames,
            overlay,
            output,
            shutdown,
            interval,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "compositor loop started");

        let mut published = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *self.shutdown.borrow() {
                break;
            }
            if self.tick() {
                published += 1;
            }
        }

        tracing::info!(frames = published, "compositor loop stopped");
    }

    /// Compose and publish one frame. Returns `false` when there is no
    /// usable live frame yet.
    pub fn tick(&mut self) -> bool {
        let Some(live) = self.frames.borrow().clone() else {
            return false;
        };
        if !live.has_dimensions() {
            return false;
        }
        let overlay = self.overlay.borrow().clone();

        let surface = self.compositor.compose(&live.image, &overlay);
        let composed = Frame {
            image: surface.clone(),
            timestamp: live.timestamp,
            sequence: live.sequence,
        };
        self.output.send_replace(Some(Arc::new(composed)));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba};

    struct Harness {
        frames_tx: watch::Sender<Option<Arc<Frame>>>,
        overlay_tx: watch::Sender<Arc<RgbaImage>>,
        output_rx: watch::Receiver<Option<Arc<Frame>>>,
        shutdown_tx: watch::Sender<bool>,
        compositor: CompositorLoop,
    }

    fn harness() -> Harness {
        let (frames_tx, frames_rx) = watch::channel(None);
        let (overlay_tx, overlay_rx) = watch::channel(Arc::new(RgbaImage::new(0, 0)));
        let (output_tx, output_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Harness {
            frames_tx,
            overlay_tx,
            output_rx,
            shutdown_tx,
            compositor: CompositorLoop::new(
                frames_rx,
                overlay_rx,
                output_tx,
                shutdown_rx,
                Duration::from_millis(33),
            ),
        }
    }

    fn live(width: u32, height: u32) -> Arc<Frame> {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 7]));
        Arc::new(Frame::new(image, 3))
    }

    #[test]
    fn test_no_frame_publishes_nothing() {
        let mut h = harness();
        assert!(!h.compositor.tick());
        h.frames_tx.send_replace(Some(live(0, 0)));
        assert!(!h.compositor.tick());
        assert!(h.output_rx.borrow().is_none());
    }

    #[test]
    fn test_zero_overlay_yields_raw_frame() {
        let mut h = harness();
        let frame = live(20, 10);
        h.frames_tx.send_replace(Some(frame.clone()));
        assert!(h.compositor.tick());

        let out = h.output_rx.borrow().clone().unwrap();
        assert_eq!(out.image, frame.image);
        assert_eq!(out.sequence, 3);
    }

    #[test]
    fn test_overlay_pixels_reach_output() {
        let mut h = harness();
        h.frames_tx.send_replace(Some(live(20, 10)));
        let mut overlay = RgbaImage::new(20, 10);
        overlay.put_pixel(4, 4, Rgba([0, 255, 0, 255]));
        h.overlay_tx.send_replace(Arc::new(overlay));

        h.compositor.tick();
        let out = h.output_rx.borrow().clone().unwrap();
        assert_eq!(*out.image.get_pixel(4, 4), Rgb([0, 255, 0]));
        assert_eq!(*out.image.get_pixel(5, 4), Rgb([5, 4, 7]));
    }

    #[tokio::test]
    async fn test_run_publishes_until_shutdown() {
        let h = harness();
        h.frames_tx.send_replace(Some(live(8, 8)));
        let mut output_rx = h.output_rx.clone();
        let task = tokio::spawn(h.compositor.run());

        tokio::time::timeout(Duration::from_secs(5), output_rx.changed())
            .await
            .expect("no composited frame published")
            .unwrap();

        h.shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("compositor loop did not stop")
            .unwrap();
    }
}

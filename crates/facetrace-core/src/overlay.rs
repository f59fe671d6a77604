//! Overlay rendering: face boxes and landmark polylines on a transparent layer.

use crate::types::{BoundingBox, Detection, LandmarkGroup, Point};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::sync::Arc;

pub const BOX_COLOR: Rgba<u8> = Rgba([0x00, 0xff, 0x00, 0xff]);
pub const LANDMARK_COLOR: Rgba<u8> = Rgba([0xff, 0x00, 0x00, 0xff]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Clear `surface` and draw every detection onto it, in the order given.
///
/// Each detection gets a 2px box outline followed by 1px polylines for the
/// nine landmark groups; eye and lip groups are closed.
pub fn render(surface: &mut RgbaImage, detections: &[Detection]) {
    for pixel in surface.pixels_mut() {
        *pixel = TRANSPARENT;
    }

    for detection in detections {
        draw_box(surface, &detection.bbox);
        for group in LandmarkGroup::ALL {
            draw_polyline(surface, detection.landmarks.group(group), group.is_closed());
        }
    }
}

fn draw_box(surface: &mut RgbaImage, bbox: &BoundingBox) {
    let x = bbox.x.round() as i32;
    let y = bbox.y.round() as i32;
    let w = bbox.width.round() as i32;
    let h = bbox.height.round() as i32;
    if w < 1 || h < 1 {
        return;
    }

    // Two nested 1px outlines straddling the box edge, like a centred 2px stroke.
    draw_hollow_rect_mut(
        surface,
        Rect::at(x - 1, y - 1).of_size(w as u32 + 2, h as u32 + 2),
        BOX_COLOR,
    );
    draw_hollow_rect_mut(surface, Rect::at(x, y).of_size(w as u32, h as u32), BOX_COLOR);
}

fn draw_polyline(surface: &mut RgbaImage, points: &[Point], closed: bool) {
    for pair in points.windows(2) {
        draw_line_segment_mut(surface, (pair[0].x, pair[0].y), (pair[1].x, pair[1].y), LANDMARK_COLOR);
    }
    if closed && points.len() > 2 {
        let (first, last) = (points[0], points[points.len() - 1]);
        draw_line_segment_mut(surface, (last.x, last.y), (first.x, first.y), LANDMARK_COLOR);
    }
}

/// Owns the overlay surface and keeps it sized to the live frame.
pub struct OverlayRenderer {
    surface: RgbaImage,
}

impl OverlayRenderer {
    /// Start with a 0×0 surface; nothing is drawn until the first valid frame size arrives.
    pub fn new() -> Self {
        Self { surface: RgbaImage::new(0, 0) }
    }

    /// Match the surface to the frame size. Returns `true` when it was reallocated.
    pub fn resize(&mut self, width: u32, height: u32) -> bool {
        if self.surface.dimensions() == (width, height) {
            return false;
        }
        self.surface = RgbaImage::new(width, height);
        true
    }

    pub fn render(&mut self, detections: &[Detection]) {
        render(&mut self.surface, detections);
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    /// Immutable copy for readers on other tasks.
    pub fn snapshot(&self) -> Arc<RgbaImage> {
        Arc::new(self.surface.clone())
    }
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self::new()
    }
}

//! Face-crop geometry shared by the detector and the landmark predictor.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Integer crop rectangle, always inside the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Bilinear resize into a fresh buffer.
pub fn resize_bilinear(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    if src.dimensions() == (width, height) {
        return src.clone();
    }
    imageops::resize(src, width, height, FilterType::Triangle)
}

/// Grow `bbox` by `margin` (fraction of its size) on every side and clamp to the frame.
///
/// Returns `None` when the clamped region is empty (box entirely off-frame).
pub fn expand_and_clamp(
    bbox: &BoundingBox,
    margin: f32,
    frame_width: u32,
    frame_height: u32,
) -> Option<CropRect> {
    let dx = bbox.width * margin;
    let dy = bbox.height * margin;
    let x0 = (bbox.x - dx).floor().max(0.0);
    let y0 = (bbox.y - dy).floor().max(0.0);
    let x1 = (bbox.x + bbox.width + dx).ceil().min(frame_width as f32);
    let y1 = (bbox.y + bbox.height + dy).ceil().min(frame_height as f32);

    if x1 <= x0 || y1 <= y0 {
        return None;
    }

    Some(CropRect {
        x: x0 as u32,
        y: y0 as u32,
        width: (x1 - x0) as u32,
        height: (y1 - y0) as u32,
    })
}

/// Cut `rect` out of `frame` and resize it to a `size`×`size` square.
pub fn crop_square(frame: &RgbImage, rect: CropRect, size: u32) -> RgbImage {
    let view = imageops::crop_imm(frame, rect.x, rect.y, rect.width, rect.height).to_image();
    resize_bilinear(&view, size, size)
}

//! Merge the live frame and the overlay into one opaque surface.

use image::{RgbImage, RgbaImage};

/// Owns the composited surface; one `compose` call per compositor tick.
pub struct Compositor {
    surface: RgbImage,
}

impl Compositor {
    pub fn new() -> Self {
        Self { surface: RgbImage::new(0, 0) }
    }

    /// Draw `live` at native resolution, then alpha-blend `overlay` on top.
    ///
    /// A 0×0 overlay leaves the raw frame untouched. If the overlay was drawn
    /// for a different frame size only the overlapping region is blended.
    pub fn compose(&mut self, live: &RgbImage, overlay: &RgbaImage) -> &RgbImage {
        if self.surface.dimensions() == live.dimensions() {
            self.surface.copy_from_slice(live.as_raw());
        } else {
            self.surface = live.clone();
        }

        let width = self.surface.width().min(overlay.width());
        let height = self.surface.height().min(overlay.height());
        for y in 0..height {
            for x in 0..width {
                let src = overlay.get_pixel(x, y);
                let alpha = src[3] as u32;
                if alpha == 0 {
                    continue;
                }
                let dst = self.surface.get_pixel_mut(x, y);
                for c in 0..3 {
                    dst[c] = ((src[c] as u32 * alpha + dst[c] as u32 * (255 - alpha) + 127) / 255)
                        as u8;
                }
            }
        }

        &self.surface
    }

    pub fn surface(&self) -> &RgbImage {
        &self.surface
    }
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new()
    }
}

//! 68-point facial landmark predictor via ONNX Runtime.
//!
//! Takes a detected face box, crops it (with margin) to a 112×112 RGB patch
//! and regresses 68 (x, y) points normalized to the patch.

use crate::crop::{self, CropRect};
use crate::types::{BoundingBox, LandmarkError, Landmarks, Point, LANDMARK_COUNT};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 112;
/// Fraction of the face box added on each side before cropping.
const LANDMARK_CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    BoxOutsideFrame,
    #[error(transparent)]
    Landmarks(#[from] LandmarkError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Landmark regression model.
pub struct LandmarkPredictor {
    session: Session,
}

impl LandmarkPredictor {
    /// Load the landmark ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, PredictorError> {
        if !model_path.exists() {
            return Err(PredictorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded landmark model"
        );

        Ok(Self { session })
    }

    /// Predict the 68-point landmark set for one face box.
    pub fn predict(
        &mut self,
        frame: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Landmarks, PredictorError> {
        let rect = crop::expand_and_clamp(face, LANDMARK_CROP_MARGIN, frame.width(), frame.height())
            .ok_or(PredictorError::BoxOutsideFrame)?;
        let patch = crop::crop_square(frame, rect, LANDMARK_INPUT_SIZE as u32);
        let input = Self::preprocess(&patch);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PredictorError::InferenceFailed(format!("landmark extraction: {e}")))?;

        if raw.len() != LANDMARK_COUNT * 2 {
            return Err(PredictorError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_COUNT * 2,
                raw.len()
            )));
        }

        to_frame_coordinates(raw, rect).map_err(PredictorError::from)
    }

    /// 112×112 RGB patch into a [0, 1] NCHW float tensor.
    fn preprocess(patch: &RgbImage) -> Array4<f32> {
        let size = LANDMARK_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in patch.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        tensor
    }
}

/// Map crop-normalized (x, y) pairs back into frame pixel coordinates.
fn to_frame_coordinates(raw: &[f32], rect: CropRect) -> Result<Landmarks, LandmarkError> {
    let points = raw
        .chunks_exact(2)
        .map(|xy| {
            Point::new(
                rect.x as f32 + xy[0] * rect.width as f32,
                rect.y as f32 + xy[1] * rect.height as f32,
            )
        })
        .collect();
    Landmarks::new(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let patch = RgbImage::new(LANDMARK_INPUT_SIZE as u32, LANDMARK_INPUT_SIZE as u32);
        let tensor = LandmarkPredictor::preprocess(&patch);
        assert_eq!(tensor.shape(), &[1, 3, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_channel_order() {
        let patch = RgbImage::from_pixel(
            LANDMARK_INPUT_SIZE as u32,
            LANDMARK_INPUT_SIZE as u32,
            Rgb([255, 0, 51]),
        );
        let tensor = LandmarkPredictor::preprocess(&patch);
        assert!((tensor[[0, 0, 5, 7]] - 1.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 1, 5, 7]], 0.0);
        assert!((tensor[[0, 2, 5, 7]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_to_frame_coordinates() {
        let mut raw = vec![0.0f32; LANDMARK_COUNT * 2];
        raw[0] = 0.5;
        raw[1] = 0.25;
        raw[2] = 1.0;
        raw[3] = 1.0;
        let rect = CropRect { x: 100, y: 40, width: 200, height: 80 };

        let lms = to_frame_coordinates(&raw, rect).unwrap();
        assert_eq!(lms.points()[0], Point::new(200.0, 60.0));
        assert_eq!(lms.points()[1], Point::new(300.0, 120.0));
        assert_eq!(lms.points()[2], Point::new(100.0, 40.0));
    }

    #[test]
    fn test_to_frame_coordinates_wrong_length() {
        let raw = vec![0.0f32; 10];
        let rect = CropRect { x: 0, y: 0, width: 10, height: 10 };
        assert!(to_frame_coordinates(&raw, rect).is_err());
    }
}

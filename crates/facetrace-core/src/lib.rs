//! facetrace-core: face landmark detection, overlay rendering and compositing.
//!
//! Detection is two ONNX Runtime models chained together: SCRFD for face
//! boxes and a 68-point landmark regressor run on each box.

pub mod compositor;
pub mod crop;
pub mod detector;
pub mod landmarks;
pub mod overlay;
pub mod types;

use std::path::{Path, PathBuf};
use thiserror::Error;

pub use compositor::Compositor;
pub use detector::{DetectorError, FaceDetector};
pub use landmarks::{LandmarkPredictor, PredictorError};
pub use overlay::OverlayRenderer;
pub use types::{BoundingBox, Detection, LandmarkGroup, Landmarks, Point, LANDMARK_COUNT};

/// File name of the coarse face detector inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the landmark predictor inside the model directory.
pub const LANDMARK_MODEL_FILE: &str = "landmarks_68.onnx";

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("landmarks: {0}")]
    Landmarks(#[from] PredictorError),
}

/// Turns one frame into zero or more face detections.
pub trait FaceAnalyzer {
    fn analyze(&mut self, frame: &image::RgbImage) -> Result<Vec<Detection>, AnalyzeError>;
}

/// SCRFD boxes refined with the 68-point landmark model.
pub struct LandmarkDetector {
    detector: FaceDetector,
    predictor: LandmarkPredictor,
}

impl LandmarkDetector {
    /// Load both models from `model_dir`. Either failing fails the whole load.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzeError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let predictor = LandmarkPredictor::load(&model_dir.join(LANDMARK_MODEL_FILE))?;
        Ok(Self { detector, predictor })
    }
}

impl FaceAnalyzer for LandmarkDetector {
    fn analyze(&mut self, frame: &image::RgbImage) -> Result<Vec<Detection>, AnalyzeError> {
        let boxes = self.detector.detect(frame)?;
        let mut detections = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            match self.predictor.predict(frame, &bbox) {
                Ok(landmarks) => detections.push(Detection { bbox, landmarks }),
                // A box hanging entirely off the frame has nothing to regress.
                Err(PredictorError::BoxOutsideFrame) => {
                    tracing::debug!(?bbox, "skipping face box outside frame");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(detections)
    }
}

/// Default model directory: `$XDG_DATA_HOME/facetrace/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrace/models")
}

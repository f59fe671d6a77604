use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

/// Number of points produced by the landmark predictor.
pub const LANDMARK_COUNT: usize = 68;

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// A single 2D point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LandmarkError {
    #[error("expected {LANDMARK_COUNT} landmark points, got {0}")]
    WrongCount(usize),
}

/// The 68-point facial landmark set, in predictor order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmarks {
    points: Vec<Point>,
}

impl Landmarks {
    /// Wrap a point set, rejecting anything that is not exactly 68 points.
    pub fn new(points: Vec<Point>) -> Result<Self, LandmarkError> {
        if points.len() != LANDMARK_COUNT {
            return Err(LandmarkError::WrongCount(points.len()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Points belonging to one semantic group.
    pub fn group(&self, group: LandmarkGroup) -> &[Point] {
        &self.points[group.range()]
    }
}

/// Semantic grouping of the 68 landmark indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LandmarkGroup {
    Jaw,
    RightEyebrow,
    LeftEyebrow,
    NoseBridge,
    NoseBottom,
    RightEye,
    LeftEye,
    OuterLip,
    InnerLip,
}

impl LandmarkGroup {
    /// All groups, in drawing order.
    pub const ALL: [LandmarkGroup; 9] = [
        LandmarkGroup::Jaw,
        LandmarkGroup::RightEyebrow,
        LandmarkGroup::LeftEyebrow,
        LandmarkGroup::NoseBridge,
        LandmarkGroup::NoseBottom,
        LandmarkGroup::RightEye,
        LandmarkGroup::LeftEye,
        LandmarkGroup::OuterLip,
        LandmarkGroup::InnerLip,
    ];

    /// Index range of this group within the 68-point set.
    pub fn range(self) -> Range<usize> {
        match self {
            LandmarkGroup::Jaw => 0..17,
            LandmarkGroup::RightEyebrow => 17..22,
            LandmarkGroup::LeftEyebrow => 22..27,
            LandmarkGroup::NoseBridge => 27..31,
            LandmarkGroup::NoseBottom => 31..36,
            LandmarkGroup::RightEye => 36..42,
            LandmarkGroup::LeftEye => 42..48,
            LandmarkGroup::OuterLip => 48..60,
            LandmarkGroup::InnerLip => 60..68,
        }
    }

    /// Whether the polyline for this group joins its last point back to the first.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            LandmarkGroup::RightEye
                | LandmarkGroup::LeftEye
                | LandmarkGroup::OuterLip
                | LandmarkGroup::InnerLip
        )
    }
}

/// One located face: its box plus the full landmark set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
}

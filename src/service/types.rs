//! Service layer types

use std::fmt;

use serde::Serialize;

use crate::engine::ComputeDevice;
pub use crate::engine::BoundingBox;

pub const NO_FACE_MESSAGE: &str = "No face detected in image";
pub const INVALID_CROP_MESSAGE: &str = "Invalid face crop";

/// Expression classes in model output order. The 5-class model uses the
/// first five.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Surprise,
    Fear,
    Disgust,
    Anger,
    Contempt,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Fear,
        Emotion::Disgust,
        Emotion::Anger,
        Emotion::Contempt,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Labels covered by a model with `class_count` outputs
    pub fn labels(class_count: usize) -> &'static [Emotion] {
        &Self::ALL[..class_count.min(Self::ALL.len())]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "Neutral",
            Emotion::Happy => "Happy",
            Emotion::Sad => "Sad",
            Emotion::Surprise => "Surprise",
            Emotion::Fear => "Fear",
            Emotion::Disgust => "Disgust",
            Emotion::Anger => "Anger",
            Emotion::Contempt => "Contempt",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassProbability {
    pub emotion: Emotion,
    pub probability: f32,
}

/// Outcome of one prediction
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionResult {
    NoFace {
        message: String,
    },
    InvalidCrop {
        message: String,
    },
    Prediction {
        emotion: Emotion,
        class_index: usize,
        valence: f32,
        arousal: f32,
        /// One entry per class, in label order
        probabilities: Vec<ClassProbability>,
        bbox: BoundingBox,
    },
}

impl PredictionResult {
    pub fn no_face() -> Self {
        Self::NoFace {
            message: NO_FACE_MESSAGE.to_string(),
        }
    }

    pub fn invalid_crop() -> Self {
        Self::InvalidCrop {
            message: INVALID_CROP_MESSAGE.to_string(),
        }
    }
}

/// Health snapshot
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub ready: bool,
    pub device: ComputeDevice,
    pub class_count: usize,
}

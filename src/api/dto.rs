//! REST API request/response data transfer objects

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::service::{BoundingBox, ClassProbability, HealthStatus, PredictionResult};

/// Base64 detect request
#[derive(Debug, Deserialize)]
pub struct Base64ImageRequest {
    pub image: String,
}

/// Emotion detect response
#[derive(Debug, Serialize)]
pub struct EmotionResponse {
    pub emotion: Option<String>,
    pub valence: Option<f32>,
    pub arousal: Option<f32>,
    pub emotion_probabilities: Option<ProbabilitiesDto>,
    pub face_detected: bool,
    pub face_bbox: Option<BoundingBox>,
    pub message: Option<String>,
}

impl EmotionResponse {
    fn without_face(message: String) -> Self {
        Self {
            emotion: None,
            valence: None,
            arousal: None,
            emotion_probabilities: None,
            face_detected: false,
            face_bbox: None,
            message: Some(message),
        }
    }
}

impl From<PredictionResult> for EmotionResponse {
    fn from(result: PredictionResult) -> Self {
        match result {
            PredictionResult::NoFace { message } | PredictionResult::InvalidCrop { message } => {
                Self::without_face(message)
            }
            PredictionResult::Prediction {
                emotion,
                valence,
                arousal,
                probabilities,
                bbox,
                ..
            } => Self {
                emotion: Some(emotion.to_string()),
                valence: Some(valence),
                arousal: Some(arousal),
                emotion_probabilities: Some(ProbabilitiesDto(probabilities)),
                face_detected: true,
                face_bbox: Some(bbox),
                message: None,
            },
        }
    }
}

/// Label to probability object, keys in label order
#[derive(Debug)]
pub struct ProbabilitiesDto(pub Vec<ClassProbability>);

impl Serialize for ProbabilitiesDto {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for p in &self.0 {
            map.serialize_entry(p.emotion.as_str(), &p.probability)?;
        }
        map.end()
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
    pub n_classes: usize,
}

impl From<HealthStatus> for HealthResponse {
    fn from(health: HealthStatus) -> Self {
        Self {
            status: if health.ready { "healthy" } else { "unhealthy" }.to_string(),
            model_loaded: health.ready,
            device: health.device.to_string(),
            n_classes: health.class_count,
        }
    }
}

/// Service description served at `/`
#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub name: String,
    pub version: String,
    pub endpoints: BTreeMap<String, String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ComputeDevice;
    use crate::service::Emotion;
    use serde_json::json;

    #[test]
    fn test_prediction_response() {
        let result = PredictionResult::Prediction {
            emotion: Emotion::Sad,
            class_index: 2,
            valence: -0.5,
            arousal: 0.25,
            probabilities: vec![
                ClassProbability { emotion: Emotion::Neutral, probability: 0.25 },
                ClassProbability { emotion: Emotion::Happy, probability: 0.25 },
                ClassProbability { emotion: Emotion::Sad, probability: 0.5 },
            ],
            bbox: BoundingBox::new(1, 2, 30, 40),
        };

        let value = serde_json::to_value(EmotionResponse::from(result)).unwrap();
        assert_eq!(
            value,
            json!({
                "emotion": "Sad",
                "valence": -0.5,
                "arousal": 0.25,
                "emotion_probabilities": {"Neutral": 0.25, "Happy": 0.25, "Sad": 0.5},
                "face_detected": true,
                "face_bbox": [1, 2, 30, 40],
                "message": null
            })
        );
    }

    #[test]
    fn test_probabilities_keep_label_order() {
        let dto = ProbabilitiesDto(vec![
            ClassProbability { emotion: Emotion::Surprise, probability: 0.5 },
            ClassProbability { emotion: Emotion::Anger, probability: 0.5 },
        ]);
        assert_eq!(serde_json::to_string(&dto).unwrap(), r#"{"Surprise":0.5,"Anger":0.5}"#);
    }

    #[test]
    fn test_faceless_responses() {
        for result in [PredictionResult::no_face(), PredictionResult::invalid_crop()] {
            let expected = match &result {
                PredictionResult::NoFace { message } | PredictionResult::InvalidCrop { message } => message.clone(),
                _ => unreachable!(),
            };
            let value = serde_json::to_value(EmotionResponse::from(result)).unwrap();
            assert_eq!(value["face_detected"], json!(false));
            assert_eq!(value["message"], json!(expected));
            for key in ["emotion", "valence", "arousal", "emotion_probabilities", "face_bbox"] {
                assert!(value[key].is_null(), "{} should be null", key);
            }
        }
    }

    #[test]
    fn test_health_response() {
        let response = HealthResponse::from(HealthStatus {
            ready: true,
            device: ComputeDevice::Cuda { index: 1 },
            class_count: 8,
        });
        assert_eq!(response.status, "healthy");
        assert_eq!(response.device, "cuda:1");
        assert_eq!(response.n_classes, 8);
    }
}

//! Emotion Service - Core business logic
//!
//! Runs one image through localization, cropping, preprocessing, the emotion
//! network and score normalization. Calls are synchronous; the HTTP layer
//! moves them onto the blocking pool.

use std::time::Instant;

use anyhow::Context;
use image::{DynamicImage, RgbImage};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::engine::{
    preprocess::{crop, preprocess},
    FaceLocalizer, ModelHandle, OrderedImage,
};
use crate::error::PipelineError;
use crate::utils::math::{argmax, clamp_unit, softmax};

use super::types::*;

#[derive(Debug, Default)]
struct Gate {
    in_flight: usize,
    closed: bool,
}

/// Emotion inference service
pub struct EmotionService {
    localizer: Box<dyn FaceLocalizer>,
    model: ModelHandle,
    image_size: u32,
    gate: Mutex<Gate>,
    idle: Condvar,
}

/// Holds a slot in the gate for the duration of one prediction
struct InFlight<'a> {
    service: &'a EmotionService,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut gate = self.service.gate.lock();
        gate.in_flight -= 1;
        if gate.in_flight == 0 {
            self.service.idle.notify_all();
        }
    }
}

impl EmotionService {
    /// Create a new emotion service
    pub fn new(localizer: Box<dyn FaceLocalizer>, model: ModelHandle, image_size: u32) -> Self {
        Self {
            localizer,
            model,
            image_size,
            gate: Mutex::new(Gate::default()),
            idle: Condvar::new(),
        }
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn health(&self) -> HealthStatus {
        let closed = self.gate.lock().closed;
        HealthStatus {
            ready: !closed && self.model.is_ready(),
            device: self.model.device(),
            class_count: self.model.class_count(),
        }
    }

    /// Predict the emotion of the first face found in `image`.
    ///
    /// No face and a degenerate face box are results, not errors.
    pub fn predict(&self, image: &RgbImage) -> Result<PredictionResult, PipelineError> {
        let _slot = self.enter()?;
        let start = Instant::now();
        let (width, height) = image.dimensions();

        let ordered = OrderedImage::from_rgb(image, self.localizer.channel_order());
        let faces = self
            .localizer
            .detect(&ordered)
            .context("face localization failed")
            .map_err(internal)?;

        let Some(face) = faces.first() else {
            warn!("No face detected in {}x{} image", width, height);
            return Ok(PredictionResult::no_face());
        };
        if faces.len() > 1 {
            debug!("{} faces found, using the first", faces.len());
        }

        let bbox = face.clamp_to(width, height);
        if bbox.is_empty() {
            warn!("Face box {:?} is empty after clamping to {}x{}", face, width, height);
            return Ok(PredictionResult::invalid_crop());
        }

        let face_crop = DynamicImage::ImageRgb8(crop(image, &bbox));
        let input = preprocess(&face_crop, self.image_size, self.model.candle_device())
            .context("preprocessing failed")
            .map_err(internal)?;

        let scores = self.model.forward(&input).map_err(|e| {
            if let PipelineError::Internal(ref detail) = e {
                error!("Inference failed: {:#}", detail);
            }
            e
        })?;

        let finite = scores.valence.is_finite()
            && scores.arousal.is_finite()
            && scores.logits.iter().all(|v| v.is_finite());
        if !finite {
            return Err(internal(anyhow::anyhow!(
                "network produced non-finite scores: {:?}",
                scores
            )));
        }

        let probs = softmax(&scores.logits);
        if probs.iter().any(|p| !p.is_finite()) {
            return Err(internal(anyhow::anyhow!("softmax produced non-finite probabilities")));
        }
        let class_index = argmax(&probs);
        let emotion = Emotion::from_index(class_index)
            .ok_or_else(|| internal(anyhow::anyhow!("class index {} has no label", class_index)))?;

        let probabilities = Emotion::labels(probs.len())
            .iter()
            .zip(&probs)
            .map(|(&emotion, &probability)| ClassProbability { emotion, probability })
            .collect();

        let result = PredictionResult::Prediction {
            emotion,
            class_index,
            valence: clamp_unit(scores.valence),
            arousal: clamp_unit(scores.arousal),
            probabilities,
            bbox,
        };

        debug!("Predicted {} in {:?}", emotion, start.elapsed());
        Ok(result)
    }

    /// Refuse new predictions, wait for running ones, then release the model
    pub fn shutdown(&self) {
        let mut gate = self.gate.lock();
        gate.closed = true;
        if gate.in_flight > 0 {
            info!("Waiting for {} in-flight predictions", gate.in_flight);
        }
        while gate.in_flight > 0 {
            self.idle.wait(&mut gate);
        }
        drop(gate);

        self.model.cleanup();
    }

    fn enter(&self) -> Result<InFlight<'_>, PipelineError> {
        let mut gate = self.gate.lock();
        if gate.closed {
            return Err(PipelineError::ServiceUnavailable);
        }
        gate.in_flight += 1;
        Ok(InFlight { service: self })
    }
}

fn internal(e: anyhow::Error) -> PipelineError {
    error!("{:#}", e);
    PipelineError::Internal(e)
}

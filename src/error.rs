//! Error taxonomy
//!
//! Expected pipeline outcomes (no face, invalid crop) are result variants in
//! [`crate::service::PredictionResult`], never errors.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions that abort process startup
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("model weights not found at {}", path.display())]
    WeightsNotFound { path: PathBuf },

    #[error("failed to read model weights from {}: {source}", path.display())]
    WeightsFormat {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("unsupported class count {0}, expected 5 or 8")]
    UnsupportedClassCount(usize),

    #[error("unsupported input size {size}: {reason}")]
    UnsupportedInputSize { size: u32, reason: String },

    #[error("failed to construct emotion network: {0}")]
    Network(#[source] candle_core::Error),

    #[error("failed to load face detector: {0}")]
    Detector(#[source] anyhow::Error),
}

/// Device capability query failure; never fatal
#[derive(Debug, Error)]
pub enum DeviceQueryError {
    #[error("device query could not be spawned: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("device query exited with {0}")]
    ExitStatus(std::process::ExitStatus),

    #[error("malformed device row {row:?}")]
    MalformedRow { row: String },

    #[error("{0}")]
    Unavailable(String),
}

/// Inbound image could not be turned into pixels; a client error
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid base64 image: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    #[error("Failed to decode image: {0}")]
    InvalidImage(#[from] image::ImageError),

    #[error("File must be an image")]
    NotAnImage,
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::InvalidBase64(_) => "INVALID_BASE64",
            DecodeError::InvalidImage(_) => "INVALID_IMAGE",
            DecodeError::NotAnImage => "INVALID_CONTENT_TYPE",
        }
    }
}

/// Failures that abort a single `predict` call
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Model not initialized")]
    ServiceUnavailable,

    #[error("internal pipeline failure: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl From<candle_core::Error> for PipelineError {
    fn from(e: candle_core::Error) -> Self {
        PipelineError::Internal(e.into())
    }
}

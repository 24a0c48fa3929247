//! Service layer module

pub mod emotion_service;
pub mod types;

pub use emotion_service::EmotionService;
pub use types::*;

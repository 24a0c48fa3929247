//! Emotion service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// `auto`, `cpu` or `cuda`
    pub device: String,
    /// Number of expression classes of the loaded weights (5 or 8)
    pub class_count: usize,
    /// Side length of the square model input
    pub image_size: u32,
    /// OpenVINO device the face detector is compiled for
    pub detector_device: String,
    pub detector_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory holding `emonet_{class_count}.safetensors`
    pub weights_dir: PathBuf,
    pub detector: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    pub fn log_level(&self) -> tracing::Level {
        self.logging.level.parse().unwrap_or(tracing::Level::INFO)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            body_limit_bytes: 20 * 1024 * 1024,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "auto".to_string(),
            class_count: 8,
            image_size: 256,
            detector_device: "CPU".to_string(),
            detector_threshold: 0.5,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            weights_dir: PathBuf::from("pretrained"),
            detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

//! Emotion model lifecycle
//!
//! The model is loaded once at startup, shared by every request and released
//! at shutdown. Forward passes are serialized through a mutex on the handle;
//! releasing takes the same lock, so it waits for an in-flight pass to finish.

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::device::ComputeDevice;
use super::weights::{StateDict, DISTRIBUTED_PREFIX};
use crate::error::{PipelineError, StartupError};

/// Raw outputs of one forward pass
pub struct NetworkOutput {
    /// `[1, class_count]` expression logits
    pub expression: Tensor,
    /// `[1]`
    pub valence: Tensor,
    /// `[1]`
    pub arousal: Tensor,
}

/// A pretrained emotion network in inference mode
pub trait EmotionNetwork: Send {
    fn forward(&self, input: &Tensor) -> candle_core::Result<NetworkOutput>;
}

/// Constructs a network whose parameters are read through `vb`
pub trait NetworkBuilder {
    fn build(&self, vb: VarBuilder, class_count: usize) -> candle_core::Result<Box<dyn EmotionNetwork>>;

    /// Reject square input sizes the network cannot reduce to its head
    fn check_input_size(&self, _size: u32) -> Result<(), String> {
        Ok(())
    }
}

/// Network outputs copied back to the host
#[derive(Debug, Clone, PartialEq)]
pub struct RawScores {
    pub logits: Vec<f32>,
    pub valence: f32,
    pub arousal: f32,
}

static FIXED_SHAPE_TUNING: Once = Once::new();

/// Enable accelerator kernels tuned for repeated fixed-shape inputs. Only the
/// first call has an effect.
fn enable_fixed_shape_tuning() {
    FIXED_SHAPE_TUNING.call_once(|| {
        #[cfg(feature = "cuda")]
        candle_core::cuda_backend::set_gemm_reduced_precision_f32(true);
        info!("Enabled fixed-shape kernel tuning");
    });
}

/// Only the two published weight sets exist
pub fn validate_class_count(class_count: usize) -> Result<(), StartupError> {
    match class_count {
        5 | 8 => Ok(()),
        other => Err(StartupError::UnsupportedClassCount(other)),
    }
}

/// Loaded emotion model bound to a device
pub struct ModelHandle {
    weights_path: PathBuf,
    device: ComputeDevice,
    candle_device: Device,
    class_count: usize,
    network: Mutex<Option<Box<dyn EmotionNetwork>>>,
}

impl ModelHandle {
    /// Load weights and build the network on `device`.
    ///
    /// A missing weights file and an input size the network cannot handle
    /// are fatal. Key mismatches between the file and the network are logged
    /// and tolerated.
    pub fn load(
        weights_path: &Path,
        device: ComputeDevice,
        candle_device: Device,
        class_count: usize,
        input_size: u32,
        builder: &dyn NetworkBuilder,
    ) -> Result<Self, StartupError> {
        validate_class_count(class_count)?;
        builder
            .check_input_size(input_size)
            .map_err(|reason| StartupError::UnsupportedInputSize { size: input_size, reason })?;

        info!("Loading model from {}", weights_path.display());
        let start = Instant::now();

        let state_dict = StateDict::load(weights_path)?.strip_prefix(DISTRIBUTED_PREFIX);
        if state_dict.is_empty() {
            warn!("{} holds no tensors", state_dict.source().display());
        }
        debug!("Read {} tensors from {}", state_dict.len(), state_dict.source().display());
        let weights_path = state_dict.source().to_path_buf();

        let binder = state_dict.into_binder();
        let vb = binder.var_builder(DType::F32, &candle_device);
        let network = builder.build(vb, class_count).map_err(StartupError::Network)?;

        let report = binder.report();
        if report.is_exact() {
            info!("Bound {} parameters", report.loaded);
        } else {
            warn!(
                "Lenient weight binding: {} loaded, {} missing, {} unexpected, {} shape mismatches",
                report.loaded,
                report.missing.len(),
                report.unexpected.len(),
                report.mismatched.len()
            );
            debug!("Missing keys: {:?}", report.missing);
            debug!("Unexpected keys: {:?}", report.unexpected);
        }

        if device.is_accelerator() {
            enable_fixed_shape_tuning();
        }

        info!("Model loaded on {} in {:?}", device, start.elapsed());

        Ok(Self {
            weights_path,
            device,
            candle_device,
            class_count,
            network: Mutex::new(Some(network)),
        })
    }

    /// File the weights were actually read from
    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }

    /// Device tensors must be placed on before [`forward`](Self::forward)
    pub fn candle_device(&self) -> &Device {
        &self.candle_device
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn is_ready(&self) -> bool {
        self.network.lock().is_some()
    }

    /// Run one forward pass. Passes are serialized on this handle.
    pub fn forward(&self, input: &Tensor) -> Result<RawScores, PipelineError> {
        let guard = self.network.lock();
        let network = guard.as_ref().ok_or(PipelineError::ServiceUnavailable)?;

        let output = network.forward(input)?;
        drop(guard);

        let logits: Vec<f32> = output
            .expression
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1()?;
        if logits.len() != self.class_count {
            return Err(PipelineError::Internal(anyhow::anyhow!(
                "network produced {} logits, expected {}",
                logits.len(),
                self.class_count
            )));
        }

        Ok(RawScores {
            logits,
            valence: first_scalar(&output.valence)?,
            arousal: first_scalar(&output.arousal)?,
        })
    }

    /// Release the network. Waits for an in-flight forward pass; calling it
    /// again is a no-op.
    pub fn cleanup(&self) {
        let released = self.network.lock().take();
        let Some(network) = released else {
            debug!("Model already released");
            return;
        };
        drop(network);

        if self.device.is_accelerator() {
            if let Err(e) = self.candle_device.synchronize() {
                warn!("Failed to flush {} after release: {}", self.device, e);
            }
        }
        info!("Released emotion model on {}", self.device);
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn first_scalar(t: &Tensor) -> Result<f32, PipelineError> {
    let values: Vec<f32> = t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    values
        .first()
        .copied()
        .ok_or_else(|| PipelineError::Internal(anyhow::anyhow!("empty regression output")))
}

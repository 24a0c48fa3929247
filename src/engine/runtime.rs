//! OpenVINO runtime wrappers
//!
//! The face detector is compiled once at startup and kept for the process
//! lifetime; infer requests are created per call so concurrent detections do
//! not share mutable state.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use openvino::{CompiledModel, Core};
use parking_lot::Mutex;
use tracing::info;

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for SafeCore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
#[derive(Clone)]
pub struct SafeCompiledModel(pub Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    /// OpenVINO CompiledModel methods are thread-safe in C++, but Rust bindings
    /// require &mut self.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

/// OpenVINO core bound to one device name (e.g. `CPU`, `GPU`)
pub struct OpenVinoRuntime {
    core: Mutex<SafeCore>,
    device: String,
}

impl OpenVinoRuntime {
    pub fn new(device: &str) -> anyhow::Result<Self> {
        let core = Core::new().context("Failed to initialize OpenVINO")?;
        Ok(Self {
            core: Mutex::new(SafeCore(core)),
            device: device.to_string(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Read and compile a model file (ONNX or IR)
    pub fn compile(&self, path: &Path) -> anyhow::Result<SafeCompiledModel> {
        let path_str = path
            .to_str()
            .with_context(|| format!("Model path is not valid UTF-8: {}", path.display()))?;
        if !path.exists() {
            anyhow::bail!("Model file not found: {}", path.display());
        }

        info!("Compiling {} for {}", path.display(), self.device);
        let start = Instant::now();

        // Core methods require &mut self in the Rust bindings
        let mut core = self.core.lock();
        let model = core.read_model_from_file(path_str, "")?;
        let compiled = core.compile_model(&model, self.device.as_str().into())?;

        info!("Compiled {} in {:?}", path.display(), start.elapsed());
        Ok(SafeCompiledModel(Arc::new(compiled)))
    }
}

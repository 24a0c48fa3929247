//! Pretrained weight loading
//!
//! Weights are a map of parameter name to tensor, stored as safetensors or
//! as a PyTorch `.pth` checkpoint. Checkpoints saved from data-parallel training carry a `module.` prefix on every key,
//! which is removed before binding. Binding is lenient: parameters absent
//! from the file keep their initializer, extra entries are ignored, and both
//! are only counted in a [`BindReport`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Shape, Tensor};
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{Init, VarBuilder};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StartupError;

/// Prefix added by distributed training wrappers
pub const DISTRIBUTED_PREFIX: &str = "module.";

/// Weight file for a given class count
pub fn weights_path_for(dir: &Path, class_count: usize) -> PathBuf {
    dir.join(format!("emonet_{}.safetensors", class_count))
}

/// Extension of PyTorch checkpoints, read when no safetensors file exists
pub const CHECKPOINT_EXTENSION: &str = "pth";

/// Named tensors read from a weight file
pub struct StateDict {
    tensors: HashMap<String, Tensor>,
    source: PathBuf,
}

impl StateDict {
    /// Read weights onto the CPU.
    ///
    /// `path` is normally a safetensors file. When it is absent, a PyTorch
    /// checkpoint next to it (same stem, `.pth`) is read instead.
    pub fn load(path: &Path) -> Result<Self, StartupError> {
        let checkpoint = path.with_extension(CHECKPOINT_EXTENSION);
        let source = if path.exists() {
            path
        } else if checkpoint.exists() {
            debug!("{} not found, reading {}", path.display(), checkpoint.display());
            checkpoint.as_path()
        } else {
            return Err(StartupError::WeightsNotFound {
                path: path.to_path_buf(),
            });
        };

        let format_error = |source_err: candle_core::Error| StartupError::WeightsFormat {
            path: source.to_path_buf(),
            source: source_err,
        };

        let tensors: HashMap<String, Tensor> = if is_checkpoint(source) {
            candle_core::pickle::read_all(source)
                .map_err(format_error)?
                .into_iter()
                .collect()
        } else {
            candle_core::safetensors::load(source, &Device::Cpu).map_err(format_error)?
        };

        let mut dict = Self::from_tensors(tensors);
        dict.source = source.to_path_buf();
        Ok(dict)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self {
            tensors,
            source: PathBuf::new(),
        }
    }

    /// File the tensors were read from; empty when built in memory
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Remove the distributed-training prefix from every key carrying it
    pub fn strip_prefix(self, prefix: &str) -> Self {
        let tensors = self
            .tensors
            .into_iter()
            .map(|(name, tensor)| match name.strip_prefix(prefix) {
                Some(stripped) => (stripped.to_string(), tensor),
                None => (name, tensor),
            })
            .collect();
        Self {
            tensors,
            source: self.source,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Wrap into a lenient binder shared between the var builder and the caller
    pub fn into_binder(self) -> Arc<LenientBinder> {
        Arc::new(LenientBinder {
            tensors: self.tensors,
            state: Mutex::new(BindState::default()),
        })
    }
}

fn is_checkpoint(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == CHECKPOINT_EXTENSION || ext == "pt")
}

/// Outcome of a lenient bind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    /// Parameters found in the file with a matching shape
    pub loaded: usize,
    /// Parameters the network asked for that the file does not have
    pub missing: Vec<String>,
    /// Entries in the file the network never asked for
    pub unexpected: Vec<String>,
    /// Entries present under the right name but with a different shape
    pub mismatched: Vec<String>,
}

impl BindReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

#[derive(Default)]
struct BindState {
    consumed: HashSet<String>,
    loaded: usize,
    missing: Vec<String>,
    mismatched: Vec<String>,
}

/// Serves parameters to a `VarBuilder`, falling back to the initializer on any
/// miss instead of failing.
pub struct LenientBinder {
    tensors: HashMap<String, Tensor>,
    state: Mutex<BindState>,
}

impl LenientBinder {
    /// Var builder reading through this binder
    pub fn var_builder(self: &Arc<Self>, dtype: DType, device: &Device) -> VarBuilder<'static> {
        let backend: Box<dyn SimpleBackend> = Box::new(SharedBinder(self.clone()));
        VarBuilder::from_backend(backend, dtype, device.clone())
    }

    /// Summarize what the network consumed so far
    pub fn report(&self) -> BindReport {
        let state = self.state.lock();
        let mut unexpected: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| !state.consumed.contains(*name))
            .cloned()
            .collect();
        unexpected.sort();

        let mut missing = state.missing.clone();
        missing.sort();
        let mut mismatched = state.mismatched.clone();
        mismatched.sort();

        BindReport {
            loaded: state.loaded,
            missing,
            unexpected,
            mismatched,
        }
    }

    fn fetch(
        &self,
        shape: Shape,
        name: &str,
        init: Init,
        dtype: DType,
        device: &Device,
    ) -> candle_core::Result<Tensor> {
        let mut state = self.state.lock();

        if let Some(tensor) = self.tensors.get(name) {
            state.consumed.insert(name.to_string());
            if tensor.shape() == &shape {
                state.loaded += 1;
                return tensor.to_device(device)?.to_dtype(dtype);
            }
            state.mismatched.push(name.to_string());
        } else {
            state.missing.push(name.to_string());
        }

        Ok(init.var(shape, dtype, device)?.as_detached_tensor())
    }
}

struct SharedBinder(Arc<LenientBinder>);

impl SimpleBackend for SharedBinder {
    fn get(
        &self,
        s: Shape,
        name: &str,
        h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        self.0.fetch(s, name, h, dtype, dev)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.0.tensors.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(shape: &[usize]) -> Tensor {
        Tensor::ones(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_weights_path() {
        let path = weights_path_for(Path::new("pretrained"), 8);
        assert_eq!(path, PathBuf::from("pretrained/emonet_8.safetensors"));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = StateDict::load(Path::new("/nonexistent/emonet_8.safetensors"))
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::WeightsNotFound { .. }));
    }

    #[test]
    fn test_falls_back_to_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = dir.path().join("emonet_8.pth");
        std::fs::write(&checkpoint, b"not a pickle archive").unwrap();

        let err = StateDict::load(&weights_path_for(dir.path(), 8)).err().unwrap();
        match err {
            StartupError::WeightsFormat { path, .. } => assert_eq!(path, checkpoint),
            other => panic!("expected a format error for the checkpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_safetensors_preferred_over_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = weights_path_for(dir.path(), 8);
        let tensors = HashMap::from([("fc.bias".to_string(), tensor(&[8]))]);
        candle_core::safetensors::save(&tensors, &path).unwrap();
        std::fs::write(dir.path().join("emonet_8.pth"), b"garbage").unwrap();

        let dict = StateDict::load(&path).unwrap();
        assert_eq!(dict.source(), path.as_path());
        assert!(dict.contains("fc.bias"));
    }

    #[test]
    fn test_strip_prefix() {
        let dict = StateDict::from_tensors(HashMap::from([
            ("module.conv1.weight".to_string(), tensor(&[2])),
            ("fc.bias".to_string(), tensor(&[2])),
        ]))
        .strip_prefix(DISTRIBUTED_PREFIX);

        assert_eq!(dict.len(), 2);
        assert!(dict.contains("conv1.weight"));
        assert!(dict.contains("fc.bias"));
        assert!(!dict.contains("module.conv1.weight"));
    }

    #[test]
    fn test_lenient_bind_counts_misses() {
        let binder = StateDict::from_tensors(HashMap::from([
            ("head.weight".to_string(), tensor(&[4, 3])),
            ("head.bias".to_string(), tensor(&[5])),
            ("stale.weight".to_string(), tensor(&[1])),
        ]))
        .into_binder();

        let vb = binder.var_builder(DType::F32, &Device::Cpu);
        let layer = candle_nn::linear(3, 4, vb.pp("head")).unwrap();
        let _extra = vb.get_with_hints(2, "other", Init::Const(0.)).unwrap();

        let report = binder.report();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.mismatched, vec!["head.bias".to_string()]);
        assert_eq!(report.missing, vec!["other".to_string()]);
        assert_eq!(report.unexpected, vec!["stale.weight".to_string()]);
        assert!(!report.is_exact());

        // bound weight is used, the mismatched bias keeps its initializer shape
        let weight: Vec<Vec<f32>> = layer.weight().to_vec2().unwrap();
        assert!(weight.iter().flatten().all(|v| *v == 1.0));
        assert_eq!(layer.bias().unwrap().dims(), &[4]);
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = weights_path_for(dir.path(), 5);
        let tensors = HashMap::from([("module.fc.weight".to_string(), tensor(&[2, 2]))]);
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let dict = StateDict::load(&path).unwrap().strip_prefix(DISTRIBUTED_PREFIX);
        assert!(dict.contains("fc.weight"));
    }
}

//! Inference engine module
//!
//! - Device selection (once, at startup)
//! - Emotion model lifecycle on candle
//! - SCRFD face localization on OpenVINO
//! - Deterministic crop preprocessing

pub mod device;
pub mod weights;
pub mod model;
pub mod emonet;
pub mod runtime;
pub mod detector;
pub mod preprocess;

pub use device::{select_device, ComputeDevice, DeviceDescriptor, DeviceProbe};
pub use model::{EmotionNetwork, ModelHandle, NetworkBuilder};
pub use emonet::EmoNetBuilder;
pub use runtime::OpenVinoRuntime;
pub use detector::{BoundingBox, ChannelOrder, FaceLocalizer, OrderedImage, ScrfdLocalizer};

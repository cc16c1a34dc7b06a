//! presence-core: Face descriptor pipeline.
//!
//! Turns face landmarks into normalized geometry descriptors, compares them
//! by cosine similarity and drives a landmark model (SCRFD via ONNX Runtime)
//! over live camera frames.

pub mod descriptor;
pub mod detector;
pub mod scrfd;
pub mod types;

pub use descriptor::DescriptorError;
pub use detector::{DetectionInvoker, DetectorError, LandmarkModel, RetryPolicy};
pub use scrfd::{ScrfdError, ScrfdLandmarkModel};
pub use types::{
    CosineMatcher, Descriptor, EncodedDescriptor, FaceLandmarks, Keypoint, MatchResult,
    DEFAULT_MATCH_THRESHOLD,
};

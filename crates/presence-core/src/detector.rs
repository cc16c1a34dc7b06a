//! Detection invoker: runs the landmark model over live frames and yields
//! exactly one descriptor or a classified failure.

use crate::descriptor::{self, DescriptorError};
use crate::types::{Descriptor, FaceLandmarks};
use async_trait::async_trait;
use presence_hw::{CameraError, Frame, FrameSource};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("face landmark model is not loaded")]
    ModelUnavailable,
    #[error("no face detected after {attempts} attempt(s); position your face clearly in front of the camera")]
    NoFaceDetected { attempts: u32 },
    #[error("{count} faces detected; make sure only one face is visible")]
    MultipleFacesDetected { count: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
}

/// A loaded face-landmark model.
///
/// Implementations adapt their native output into [`FaceLandmarks`] with a
/// fixed keypoint count and order, so descriptors from one model are always
/// comparable with each other.
#[async_trait]
pub trait LandmarkModel: Send {
    fn name(&self) -> &str;
    async fn estimate_faces(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, DetectorError>;
}

/// Bounds on how long a single capture may try.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Model calls allowed when no face is found.
    pub max_attempts: u32,
    /// Pause between attempts that found no face.
    pub retry_delay: Duration,
    /// Wait for the first decoded frame before the first attempt.
    pub ready_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(5),
        }
    }
}

pub struct DetectionInvoker {
    model: Option<Box<dyn LandmarkModel>>,
    policy: RetryPolicy,
}

impl DetectionInvoker {
    /// An invoker with no model yet; detection fails with `ModelUnavailable`
    /// until [`install_model`](Self::install_model) is called.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { model: None, policy }
    }

    pub fn with_model(model: Box<dyn LandmarkModel>, policy: RetryPolicy) -> Self {
        Self {
            model: Some(model),
            policy,
        }
    }

    pub fn install_model(&mut self, model: Box<dyn LandmarkModel>) {
        tracing::info!(model = model.name(), "landmark model installed");
        self.model = Some(model);
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref().map(|m| m.name())
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Capture exactly one face descriptor from `source`.
    ///
    /// Zero faces are retried up to `max_attempts` with `retry_delay` between
    /// attempts. More than one face fails immediately: another frame cannot
    /// tell which face is the user.
    pub async fn detect_one(
        &mut self,
        source: &mut dyn FrameSource,
    ) -> Result<Descriptor, DetectorError> {
        let model = self.model.as_mut().ok_or(DetectorError::ModelUnavailable)?;

        if !source.is_ready() && !source.wait_ready(self.policy.ready_timeout).await {
            tracing::warn!(
                timeout_ms = self.policy.ready_timeout.as_millis() as u64,
                "frame source not ready; attempting detection anyway"
            );
        }

        let max_attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let frame = source.grab().await?;
            let mut faces = model.estimate_faces(&frame).await?;

            match faces.len() {
                0 => {
                    tracing::debug!(attempt, max_attempts, "no face detected");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
                1 => {
                    let face = faces.swap_remove(0);
                    tracing::debug!(
                        attempt,
                        keypoints = face.keypoints.len(),
                        score = ?face.score,
                        "face detected"
                    );
                    return Ok(descriptor::encode(&face.keypoints)?);
                }
                count => {
                    tracing::debug!(count, "multiple faces in frame");
                    return Err(DetectorError::MultipleFacesDetected { count });
                }
            }
        }

        Err(DetectorError::NoFaceDetected {
            attempts: max_attempts,
        })
    }
}

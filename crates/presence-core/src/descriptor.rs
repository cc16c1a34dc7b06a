//! Descriptor codec: landmark geometry to a unit vector, and to/from the
//! base64 transport form stored in profiles.

use crate::types::{Descriptor, EncodedDescriptor, Keypoint};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use thiserror::Error;

/// Values per keypoint in the flattened vector: x, y, z.
pub const VALUES_PER_KEYPOINT: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("landmark set is empty")]
    EmptyLandmarkSet,
    #[error("landmark vector has zero or non-finite norm")]
    DegenerateVector,
    #[error("descriptor dimensions differ ({left} vs {right})")]
    DimensionMismatch { left: usize, right: usize },
    #[error("invalid descriptor encoding: {0}")]
    InvalidEncoding(String),
}

/// Flatten keypoints as `[x0, y0, z0, x1, y1, z1, ...]` (missing depth is
/// 0.0) and divide by the Euclidean norm.
pub fn encode(keypoints: &[Keypoint]) -> Result<Descriptor, DescriptorError> {
    if keypoints.is_empty() {
        return Err(DescriptorError::EmptyLandmarkSet);
    }

    let raw: Vec<f32> = keypoints
        .iter()
        .flat_map(|kp| [kp.x, kp.y, kp.z.unwrap_or(0.0)])
        .collect();

    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= 0.0 {
        return Err(DescriptorError::DegenerateVector);
    }

    Ok(Descriptor::from_values(raw.iter().map(|v| v / norm).collect()))
}

/// Base64 (standard alphabet, padded) of the little-endian float buffer.
pub fn to_transport(descriptor: &Descriptor) -> EncodedDescriptor {
    let bytes: Vec<u8> = descriptor
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    EncodedDescriptor::from(BASE64_STANDARD.encode(bytes))
}

/// Inverse of [`to_transport`]; bit-exact for any descriptor it produced.
pub fn from_transport(encoded: &EncodedDescriptor) -> Result<Descriptor, DescriptorError> {
    let bytes = BASE64_STANDARD
        .decode(encoded.as_str())
        .map_err(|e| DescriptorError::InvalidEncoding(e.to_string()))?;

    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(DescriptorError::InvalidEncoding(format!(
            "{} bytes is not a non-empty float buffer",
            bytes.len()
        )));
    }

    let mut values = Vec::with_capacity(bytes.len() / 4);
    for chunk in bytes.chunks_exact(4) {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !v.is_finite() {
            return Err(DescriptorError::InvalidEncoding(
                "descriptor contains NaN or infinite values".into(),
            ));
        }
        values.push(v);
    }

    Ok(Descriptor::from_values(values))
}

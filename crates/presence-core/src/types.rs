use crate::descriptor::DescriptorError;
use serde::{Deserialize, Serialize};

/// Default cosine similarity required to accept a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.85;

/// One facial landmark in frame coordinates. `z` is present only for
/// models that estimate depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub z: Option<f32>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: None }
    }

    pub fn with_depth(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z: Some(z) }
    }
}

/// Landmarks for one detected face, in the model's fixed keypoint order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceLandmarks {
    pub keypoints: Vec<Keypoint>,
    /// Detector confidence, when the model reports one.
    pub score: Option<f32>,
}

/// L2-normalized landmark-geometry vector for one face.
///
/// Only the descriptor codec builds these, so every instance has unit norm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub(crate) fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Always processes every dimension. A zero vector scores 0.0.
    pub fn similarity(&self, other: &Descriptor) -> Result<f32, DescriptorError> {
        if self.len() != other.len() {
            return Err(DescriptorError::DimensionMismatch {
                left: self.len(),
                right: other.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        Ok(if denom > 0.0 { dot / denom } else { 0.0 })
    }
}

/// Transport form of a [`Descriptor`]: base64 of its little-endian `f32` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedDescriptor(String);

impl EncodedDescriptor {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for EncodedDescriptor {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for EncodedDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of comparing a live descriptor against the stored one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity [-1, 1].
    pub similarity: f32,
}

/// The one similarity rule used everywhere: cosine similarity against a
/// fixed acceptance threshold.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    threshold: f32,
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl CosineMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn score(&self, a: &Descriptor, b: &Descriptor) -> Result<f32, DescriptorError> {
        a.similarity(b)
    }

    pub fn is_match(&self, a: &Descriptor, b: &Descriptor) -> Result<bool, DescriptorError> {
        Ok(self.compare(a, b)?.matched)
    }

    pub fn compare(&self, candidate: &Descriptor, stored: &Descriptor) -> Result<MatchResult, DescriptorError> {
        let similarity = candidate.similarity(stored)?;
        Ok(MatchResult {
            matched: similarity >= self.threshold,
            similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(values: &[f32]) -> Descriptor {
        Descriptor::from_values(values.to_vec())
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = raw(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = raw(&[1.0, 0.0]);
        let b = raw(&[0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = raw(&[1.0, 0.0]);
        let b = raw(&[-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = raw(&[0.0, 0.0]);
        let b = raw(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = raw(&[1.0, 0.0, 0.0]);
        let b = raw(&[1.0, 0.0]);
        let err = CosineMatcher::default().compare(&a, &b).unwrap_err();
        assert_eq!(err, DescriptorError::DimensionMismatch { left: 3, right: 2 });
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let stored = raw(&[1.0, 0.0]);
        let candidate = raw(&[0.6, 0.8]);
        let score = CosineMatcher::default().score(&candidate, &stored).unwrap();
        assert!((score - 0.6).abs() < 1e-6);

        assert!(CosineMatcher::new(score).is_match(&candidate, &stored).unwrap());
        assert!(!CosineMatcher::default().is_match(&candidate, &stored).unwrap());
    }

    #[test]
    fn test_match_at_090_accepts_under_default_threshold() {
        let stored = raw(&[1.0, 0.0, 0.0]);
        let candidate = raw(&[0.9, (1.0f32 - 0.81).sqrt(), 0.0]);
        let result = CosineMatcher::default().compare(&candidate, &stored).unwrap();
        assert!((result.similarity - 0.9).abs() < 1e-5);
        assert!(result.matched);
    }

    #[test]
    fn test_score_is_symmetric() {
        let a = raw(&[0.3, -0.2, 0.9, 0.1]);
        let b = raw(&[0.5, 0.4, -0.1, 0.7]);
        let m = CosineMatcher::default();
        assert_eq!(m.score(&a, &b).unwrap().to_bits(), m.score(&b, &a).unwrap().to_bits());
        assert_eq!(m.is_match(&a, &b).unwrap(), m.is_match(&b, &a).unwrap());
    }
}

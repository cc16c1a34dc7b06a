//! SCRFD face detector adapted to the [`LandmarkModel`] contract.
//!
//! Every detection yields five 2D keypoints in a fixed order: left eye,
//! right eye, nose tip, left mouth corner, right mouth corner.

use crate::detector::{DetectorError, LandmarkModel};
use crate::types::{FaceLandmarks, Keypoint};
use async_trait::async_trait;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use presence_hw::Frame;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: usize = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_STD: f32 = 128.0;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// Keypoints reported per face.
pub const SCRFD_KEYPOINTS: usize = 5;

#[derive(Error, Debug)]
pub enum ScrfdError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("incompatible SCRFD model: {0}")]
    IncompatibleModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD (ONNX) landmark model. Runs inference inline on the caller's task.
pub struct ScrfdLandmarkModel {
    session: Session,
    heads: [HeadOutputs; 3],
    score_threshold: f32,
    name: String,
}

impl ScrfdLandmarkModel {
    pub fn load(model_path: &Path) -> Result<Self, ScrfdError> {
        if !model_path.exists() {
            return Err(ScrfdError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(ScrfdError::IncompatibleModel(format!(
                "expected 9 outputs (score/bbox/kps for 3 strides), got {}",
                output_names.len()
            )));
        }

        let heads = locate_heads(&output_names);
        let name = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "scrfd".to_string());

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?heads,
            "loaded SCRFD landmark model"
        );

        Ok(Self {
            session,
            heads,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            name,
        })
    }

    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, ScrfdError> {
        let letterbox = Letterbox::fit(frame.width as usize, frame.height as usize, INPUT_SIZE);
        let input = to_input_tensor(frame, &letterbox);
        let heads = self.heads;
        let threshold = self.score_threshold;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in heads.iter().zip(STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| ScrfdError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(head.score, "scores")?;
            let boxes = extract(head.bbox, "boxes")?;
            let kps = extract(head.kps, "keypoints")?;
            candidates.extend(decode_level(scores, boxes, kps, stride, threshold, &letterbox));
        }

        let kept = suppress_overlaps(candidates, NMS_IOU_THRESHOLD);
        Ok(kept.into_iter().map(Candidate::into_landmarks).collect())
    }
}

#[async_trait]
impl LandmarkModel for ScrfdLandmarkModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn estimate_faces(&mut self, frame: &Frame) -> Result<Vec<FaceLandmarks>, DetectorError> {
        if frame.width == 0 || frame.height == 0 || frame.data.len() < (frame.width * frame.height) as usize {
            return Err(DetectorError::InferenceFailed(format!(
                "frame buffer does not match {}x{}",
                frame.width, frame.height
            )));
        }
        self.infer(frame)
            .map_err(|e| DetectorError::InferenceFailed(e.to_string()))
    }
}

/// Map output names like `score_8` / `bbox_16` / `kps_32` to stride slots;
/// exports with numeric names use the conventional layout
/// `[scores 8/16/32, boxes 8/16/32, kps 8/16/32]`.
fn locate_heads(names: &[String]) -> [HeadOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<HeadOutputs>> = STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match by_name {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => std::array::from_fn(|level| HeadOutputs {
            score: level,
            bbox: level + 3,
            kps: level + 6,
        }),
    }
}

/// Uniform scale plus centering offsets from source frame to model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    offset_x: usize,
    offset_y: usize,
    scaled_w: usize,
    scaled_h: usize,
}

impl Letterbox {
    fn fit(src_w: usize, src_h: usize, target: usize) -> Self {
        let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
        let scaled_w = ((src_w as f32 * scale).round() as usize).min(target);
        let scaled_h = ((src_h as f32 * scale).round() as usize).min(target);
        Self {
            scale,
            offset_x: (target - scaled_w) / 2,
            offset_y: (target - scaled_h) / 2,
            scaled_w,
            scaled_h,
        }
    }

    /// Model-input coordinates back to source-frame coordinates.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Bilinear-resample the grayscale frame into a normalized NCHW tensor.
/// Padding normalizes to 0.0; the gray channel is replicated into RGB.
fn to_input_tensor(frame: &Frame, lb: &Letterbox) -> Array4<f32> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    let pixel = |x: usize, y: usize| frame.data[y * w + x] as f32;

    for dy in 0..lb.scaled_h {
        let sy = ((dy as f32 + 0.5) / lb.scale - 0.5).clamp(0.0, (h - 1) as f32);
        let (y0, fy) = (sy.floor() as usize, sy.fract());
        let y1 = (y0 + 1).min(h - 1);

        for dx in 0..lb.scaled_w {
            let sx = ((dx as f32 + 0.5) / lb.scale - 0.5).clamp(0.0, (w - 1) as f32);
            let (x0, fx) = (sx.floor() as usize, sx.fract());
            let x1 = (x0 + 1).min(w - 1);

            let top = pixel(x0, y0) + (pixel(x1, y0) - pixel(x0, y0)) * fx;
            let bottom = pixel(x0, y1) + (pixel(x1, y1) - pixel(x0, y1)) * fx;
            let value = (top + (bottom - top) * fy - PIXEL_MEAN) / PIXEL_STD;

            let (ty, tx) = (dy + lb.offset_y, dx + lb.offset_x);
            for channel in 0..3 {
                tensor[[0, channel, ty, tx]] = value;
            }
        }
    }

    tensor
}

#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    keypoints: [(f32, f32); SCRFD_KEYPOINTS],
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    fn into_landmarks(self) -> FaceLandmarks {
        FaceLandmarks {
            keypoints: self.keypoints.iter().map(|&(x, y)| Keypoint::new(x, y)).collect(),
            score: Some(self.score),
        }
    }
}

/// Decode one stride level. Anchors sit on a `stride`-spaced grid with
/// [`ANCHORS_PER_CELL`] anchors per cell; offsets are in stride units.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    threshold: f32,
    lb: &Letterbox,
) -> Vec<Candidate> {
    let grid_w = INPUT_SIZE / stride;
    let anchors = (INPUT_SIZE / stride) * grid_w * ANCHORS_PER_CELL;
    let s = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let b = boxes.get(idx * 4..idx * 4 + 4)?;
            let k = kps.get(idx * 2 * SCRFD_KEYPOINTS..(idx + 1) * 2 * SCRFD_KEYPOINTS)?;

            let cell = idx / ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let (x1, y1) = lb.to_source(ax - b[0] * s, ay - b[1] * s);
            let (x2, y2) = lb.to_source(ax + b[2] * s, ay + b[3] * s);
            let keypoints = std::array::from_fn(|i| lb.to_source(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s));

            Some(Candidate {
                x1,
                y1,
                x2,
                y2,
                score,
                keypoints,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest score first.
fn suppress_overlaps(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

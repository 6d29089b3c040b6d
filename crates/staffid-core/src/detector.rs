//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image to 640×640, runs the three-stride anchor-free
//! SCRFD head and post-processes with NMS. The caller receives faces sorted
//! by confidence; only the first is used downstream.

use crate::frame::FaceImage;
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
pub const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUT_COUNT: usize = 9;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download det_10g.onnx from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied by the letterbox resize, for mapping back.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw head outputs for one stride.
struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        let stride_outputs = map_stride_outputs(&output_names)?;
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_outputs,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
        })
    }

    /// Override the minimum detection confidence.
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces, returning bounding boxes sorted by descending confidence.
    pub fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width == 0 || image.height == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(image.width as usize, image.height as usize, SCRFD_INPUT_SIZE);
        let input = preprocess(image, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let idx = self.stride_outputs[slot];
            let extract = |pos: usize, what: &str| {
                outputs[pos]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let tensors = StrideTensors {
                scores: extract(idx.score, "scores")?,
                bboxes: extract(idx.bbox, "bboxes")?,
                kps: extract(idx.kps, "kps")?,
            };
            candidates.extend(decode_stride(&tensors, stride, &letterbox, self.confidence_threshold));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(count = faces.len(), "SCRFD detections after NMS");
        Ok(faces)
    }
}

/// Letterbox an RGB image into a normalized NCHW tensor.
///
/// Padding is filled with the mean so it normalizes to 0.0.
fn preprocess(image: &FaceImage, letterbox: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    let width = image.width as usize;
    let height = image.height as usize;
    let new_w = ((width as f32 * letterbox.scale).round() as usize).min(size);
    let new_h = ((height as f32 * letterbox.scale).round() as usize).min(size);
    let pad_x = letterbox.pad_x.floor() as usize;
    let pad_y = letterbox.pad_y.floor() as usize;
    let inv_scale = 1.0 / letterbox.scale;

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let inside = y >= pad_y && y < pad_y + new_h && x >= pad_x && x < pad_x + new_w;
            let rgb = if inside {
                let src_x = ((x - pad_x) as f32 + 0.5) * inv_scale - 0.5;
                let src_y = ((y - pad_y) as f32 + 0.5) * inv_scale - 0.5;
                bilinear_rgb(image, src_x, src_y)
            } else {
                [SCRFD_MEAN; 3]
            };

            for (c, value) in rgb.iter().enumerate() {
                tensor[[0, c, y, x]] = (value - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    tensor
}

/// Bilinear RGB sample with edge clamping.
fn bilinear_rgb(image: &FaceImage, src_x: f32, src_y: f32) -> [f32; 3] {
    let max_x = image.width as usize - 1;
    let max_y = image.height as usize - 1;

    let x0 = (src_x.floor().max(0.0) as usize).min(max_x);
    let y0 = (src_y.floor().max(0.0) as usize).min(max_y);
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);
    let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

    let (tl, tr) = (image.pixel(x0, y0), image.pixel(x1, y0));
    let (bl, br) = (image.pixel(x0, y1), image.pixel(x1, y1));

    std::array::from_fn(|c| {
        tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + tr[c] as f32 * fx * (1.0 - fy)
            + bl[c] as f32 * (1.0 - fx) * fy
            + br[c] as f32 * fx * fy
    })
}

/// Map output tensors to stride slots.
///
/// Exports that name their heads `score_8`, `bbox_16`, `kps_32`, ... are
/// mapped by name. Anything else uses the standard positional layout:
/// `[0-2]` scores, `[3-5]` bboxes, `[6-8]` kps, each for strides 8/16/32.
/// Every returned position is a valid index into `names`.
fn map_stride_outputs(names: &[String]) -> Result<[StrideOutputs; 3], DetectorError> {
    if names.len() < SCRFD_OUTPUT_COUNT {
        return Err(DetectorError::InferenceFailed(format!(
            "SCRFD model requires {SCRFD_OUTPUT_COUNT} outputs (3 strides × score/bbox/kps), got {}",
            names.len()
        )));
    }

    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(slots) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            Ok([slots[0], slots[1], slots[2]])
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            Ok(std::array::from_fn(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            }))
        }
    }
}

/// Decode detections for a single stride level into source-image coordinates.
fn decode_stride(
    tensors: &StrideTensors<'_>,
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = tensors.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let Some(offsets) = tensors.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let (x1, y1) = letterbox.to_source(anchor_x - offsets[0] * s, anchor_y - offsets[1] * s);
        let (x2, y2) = letterbox.to_source(anchor_x + offsets[2] * s, anchor_y + offsets[3] * s);

        let landmarks = tensors.kps.get(idx * 10..idx * 10 + 10).map(|kps| {
            std::array::from_fn(|i| {
                letterbox.to_source(anchor_x + kps[i * 2] * s, anchor_y + kps[i * 2 + 1] * s)
            })
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|kept| iou(kept, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

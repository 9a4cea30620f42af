//! SCRFD face detector via ONNX Runtime.
//!
//! One model serves two roles: at a small input size it is the cheap
//! per-frame region detector that gates recognition, at the full 640 input
//! it is the accurate detector used by the verification oracle.

use crate::oracle::RegionDetector;
use crate::types::FaceRegion;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

pub const SCRFD_FULL_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (place det_10g.onnx in the model directory)")]
    ModelNotFound(String),
    #[error("input size {0} must be a non-zero multiple of 32")]
    InvalidInputSize(u32),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Mapping from letterboxed model space back to frame space.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input_size: u32) -> Self {
        let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((input_size as f32 - new_w) / 2.0).floor(),
            pad_y: ((input_size as f32 - new_h) / 2.0).floor(),
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox). Keypoint outputs are unused.
type StrideOutputs = (usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_size: u32,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD model at full input resolution.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        Self::load_with_input_size(model_path, SCRFD_FULL_INPUT_SIZE)
    }

    /// Load the SCRFD model with a custom square input size.
    ///
    /// Smaller inputs (e.g. 320) run several times faster and miss small
    /// faces, which is what the per-frame gate wants.
    pub fn load_with_input_size(model_path: &Path, input_size: u32) -> Result<Self, DetectorError> {
        if input_size == 0 || input_size % 32 != 0 {
            return Err(DetectorError::InvalidInputSize(input_size));
        }
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::info!(
            path = %model_path.display(),
            input_size,
            ?stride_outputs,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            input_size,
            stride_outputs,
        })
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(frame, self.input_size);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[slot];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores/{stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes/{stride}: {e}")))?;

            candidates.extend(decode_stride(
                StrideTensors { scores, boxes },
                stride,
                self.input_size as usize,
                &letterbox,
            ));
        }

        Ok(non_max_suppression(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl RegionDetector for FaceDetector {
    fn detect_regions(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
        self.detect(frame)
    }
}

/// Letterbox the frame into a square NCHW tensor, replicating gray into RGB.
fn preprocess(frame: &GrayImage, input_size: u32) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width(), frame.height(), input_size);
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).clamp(1, input_size);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).clamp(1, input_size);
    let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let size = input_size as usize;
    // Padding is filled with the mean so it normalises to zero.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let off_x = letterbox.pad_x as u32;
    let off_y = letterbox.pad_y as u32;

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + off_x) as usize, (y + off_y) as usize);
        if tx >= size || ty >= size {
            continue;
        }
        let normalized = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        for channel in 0..3 {
            tensor[[0, channel, ty, tx]] = normalized;
        }
    }

    (tensor, letterbox)
}

/// Resolve which output tensor holds which stride's scores and boxes.
///
/// Exports named `score_8`, `bbox_16` etc. are mapped by name;
/// anything else uses the standard positional layout.
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some((
                position("score", stride)?,
                position("bbox", stride)?,
            ))
        })
        .collect();

    match by_name.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::debug!(?names, "SCRFD outputs unnamed, using positional layout");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    boxes: &'a [f32],
}

/// Decode one stride level into frame-space regions above the score cutoff.
fn decode_stride(
    tensors: StrideTensors<'_>,
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
) -> Vec<FaceRegion> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut regions = Vec::new();
    for idx in 0..anchors {
        let score = tensors.scores.get(idx).copied().unwrap_or(0.0);
        if score <= SCRFD_CONFIDENCE_THRESHOLD {
            continue;
        }
        let Some(dist) = tensors.boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.to_frame(ax - dist[0] * step, ay - dist[1] * step);
        let (x2, y2) = letterbox.to_frame(ax + dist[2] * step, ay + dist[3] * step);

        regions.push(FaceRegion::new(x1, y1, x2 - x1, y2 - y1, score));
    }
    regions
}

/// Greedy NMS; the result is ordered by descending confidence.
fn non_max_suppression(mut regions: Vec<FaceRegion>, iou_threshold: f32) -> Vec<FaceRegion> {
    regions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceRegion> = Vec::with_capacity(regions.len());
    for region in regions {
        if kept.iter().all(|k| k.iou(&region) <= iou_threshold) {
            kept.push(region);
        }
    }
    kept
}

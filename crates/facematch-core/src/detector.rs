//! Face detection port and the SCRFD ONNX backend.
//!
//! The SCRFD backend decodes three strides of anchor-free predictions,
//! suppresses overlaps with NMS and aligns each face onto a square RGB crop.

use crate::alignment;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
/// Side of the aligned crop handed to the embedding model.
pub const ALIGNED_FACE_SIZE: u32 = 160;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; place the SCRFD model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// How a detector treats an image without faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    /// Zero faces is a failure.
    Strict,
    /// Zero faces falls back to the whole image as a single crop.
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
    Gray,
}

impl ChannelOrder {
    pub fn channels(&self) -> usize {
        match self {
            ChannelOrder::Rgb | ChannelOrder::Bgr => 3,
            ChannelOrder::Gray => 1,
        }
    }
}

/// Interleaved pixel buffer of a face crop.
#[derive(Debug, Clone)]
pub enum FacePixels {
    U8(Vec<u8>),
    /// Floating-point samples, normally within [0, 1].
    F32(Vec<f32>),
}

impl FacePixels {
    /// Number of samples, across all channels.
    pub(crate) fn len(&self) -> usize {
        match self {
            FacePixels::U8(v) => v.len(),
            FacePixels::F32(v) => v.len(),
        }
    }
}

/// One face region as returned by a detector backend.
#[derive(Debug, Clone)]
pub struct FaceCrop {
    pub width: u32,
    pub height: u32,
    pub order: ChannelOrder,
    pub pixels: FacePixels,
    /// Detector confidence, when the backend reports one.
    pub confidence: Option<f32>,
}

impl FaceCrop {
    pub fn from_rgb(image: RgbImage, confidence: Option<f32>) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            order: ChannelOrder::Rgb,
            pixels: FacePixels::U8(image.into_raw()),
            confidence,
        }
    }
}

/// Face detection and alignment capability.
///
/// Implementations return faces in their own order; callers must not assume
/// any ranking. Stateful backends (lazy sessions) take `&mut self`.
pub trait FaceDetector {
    fn detect(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<Vec<FaceCrop>, DetectorError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

struct LoadedScrfd {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

/// SCRFD-based face detector. The ONNX session is loaded on first use.
pub struct ScrfdDetector {
    model_path: PathBuf,
    confidence_threshold: f32,
    model: Option<LoadedScrfd>,
}

impl ScrfdDetector {
    pub fn new(model_path: impl Into<PathBuf>, confidence_threshold: f32) -> Self {
        Self {
            model_path: model_path.into(),
            confidence_threshold,
            model: None,
        }
    }

    fn loaded(&mut self) -> Result<&mut LoadedScrfd, DetectorError> {
        if self.model.is_none() {
            self.model = Some(load_scrfd(&self.model_path)?);
        }
        self.model
            .as_mut()
            .ok_or_else(|| DetectorError::InferenceFailed("SCRFD session unavailable".into()))
    }

    /// Detect faces, returning bounding boxes sorted by confidence.
    pub fn detect_boxes(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let threshold = self.confidence_threshold;
        let (input, letterbox) = preprocess(image);

        let model = self.loaded()?;
        let outputs = model
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = model.stride_indices[stride_pos];

            let extract = |idx: usize, what: &str| {
                outputs[idx].try_extract_tensor::<f32>().map_err(|e| {
                    DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                })
            };
            let (_, scores) = extract(score_idx, "scores")?;
            let (_, bboxes) = extract(bbox_idx, "bboxes")?;
            let (_, kps) = extract(kps_idx, "kps")?;

            all_detections.extend(decode_stride(
                scores, bboxes, kps, stride, &letterbox, threshold,
            ));
        }

        let mut result = nms(all_detections, SCRFD_NMS_THRESHOLD);
        result.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        tracing::debug!(faces = result.len(), "SCRFD detection finished");

        Ok(result)
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(
        &mut self,
        image: &RgbImage,
        mode: DetectionMode,
    ) -> Result<Vec<FaceCrop>, DetectorError> {
        let boxes = self.detect_boxes(image)?;
        crops_from_boxes(image, &boxes, mode)
    }
}

/// Turn detections into face crops, applying the zero-face policy of `mode`.
fn crops_from_boxes(
    image: &RgbImage,
    boxes: &[BoundingBox],
    mode: DetectionMode,
) -> Result<Vec<FaceCrop>, DetectorError> {
    if boxes.is_empty() {
        return match mode {
            DetectionMode::Strict => Err(DetectorError::NoFaceDetected),
            DetectionMode::Lenient => {
                let whole = imageops::resize(
                    image,
                    ALIGNED_FACE_SIZE,
                    ALIGNED_FACE_SIZE,
                    FilterType::Triangle,
                );
                Ok(vec![FaceCrop::from_rgb(whole, None)])
            }
        };
    }

    Ok(boxes
        .iter()
        .map(|face| FaceCrop::from_rgb(crop_face(image, face), Some(face.confidence)))
        .collect())
}

fn load_scrfd(model_path: &Path) -> Result<LoadedScrfd, DetectorError> {
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

    tracing::info!(
        path = %model_path.display(),
        outputs = ?output_names,
        "loaded SCRFD model"
    );

    if output_names.len() < 9 {
        return Err(DetectorError::InferenceFailed(format!(
            "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
            output_names.len()
        )));
    }

    let stride_indices = discover_output_indices(&output_names);
    tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

    Ok(LoadedScrfd {
        session,
        stride_indices,
    })
}

/// Align a detection with landmarks; crop and resize one without.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    if let Some(landmarks) = face.landmarks.as_ref() {
        return alignment::align_face(image, landmarks, ALIGNED_FACE_SIZE);
    }

    let (w, h) = image.dimensions();
    let x = face.x.max(0.0).min(w.saturating_sub(1) as f32) as u32;
    let y = face.y.max(0.0).min(h.saturating_sub(1) as f32) as u32;
    let cw = (face.width.max(1.0) as u32).min(w - x);
    let ch = (face.height.max(1.0) as u32).min(h - y);
    let region = imageops::crop_imm(image, x, y, cw, ch).to_image();
    imageops::resize(&region, ALIGNED_FACE_SIZE, ALIGNED_FACE_SIZE, FilterType::Triangle)
}

/// Letterbox an RGB image into a NCHW float tensor normalized for SCRFD.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width().max(1) as f32, image.height().max(1) as f32);
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width).min(size / height);

    let new_w = ((width * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (size - new_w as f32) / 2.0;
    let pad_y = (size - new_h as f32) / 2.0;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Padding stays at 0.0, i.e. SCRFD_MEAN after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let (pad_x_start, pad_y_start) = (pad_x.floor() as usize, pad_y.floor() as usize);

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + pad_x_start, y as usize + pad_y_start);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports name tensors either "score_8", "bbox_16", ... or with generic
/// numbers. Unrecognized names fall back to the standard positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::debug!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::debug!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unletterbox = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let (x1, y1) = unletterbox(anchor_cx - d[0] * s, anchor_cy - d[1] * s);
        let (x2, y2) = unletterbox(anchor_cx + d[2] * s, anchor_cy + d[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| -> [(f32, f32); 5] {
            std::array::from_fn(|i| {
                unletterbox(anchor_cx + k[i * 2] * s, anchor_cy + k[i * 2 + 1] * s)
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

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

//! Face detection.
//!
//! [`FaceDetect`] is the seam the rest of the pipeline talks to. The shipped
//! implementation is [`ScrfdDetector`]: SCRFD via ONNX Runtime with 3-stride
//! anchor decoding and NMS post-processing.

use crate::types::{BoundingBox, DetectParams};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const DETECTOR_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds face regions in a grayscale image.
///
/// Implementations return boxes in their native order; callers that need a
/// single face take the first one. For [`ScrfdDetector`] that is the highest
/// scoring detection.
pub trait FaceDetect: Send {
    fn detect(
        &mut self,
        image: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<BoundingBox>, DetectorError>;
}

impl<T: FaceDetect + ?Sized> FaceDetect for Box<T> {
    fn detect(
        &mut self,
        image: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        (**self).detect(image, params)
    }
}

/// How the source image was placed inside the square model input.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// SCRFD face detector backed by an ONNX Runtime session.
pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Build an ONNX Runtime session for the SCRFD model at `model_path`.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.is_file() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(DETECTOR_THREADS)?
            .commit_from_file(model_path)?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 2 * SCRFD_STRIDES.len() {
            return Err(DetectorError::InferenceFailed(format!(
                "expected score and box outputs for {} strides, model has {} outputs",
                SCRFD_STRIDES.len(),
                names.len()
            )));
        }

        let stride_indices = discover_output_indices(&names);
        tracing::info!(
            path = %model_path.display(),
            ?stride_indices,
            "face detector ready"
        );

        Ok(Self {
            session,
            stride_indices,
        })
    }

    /// Letterbox a grayscale image into the SCRFD NCHW input tensor.
    ///
    /// The luma plane is replicated into all three channels; padding is the
    /// mean value, which normalizes to zero.
    fn preprocess(image: &GrayImage) -> (Array4<f32>, LetterboxInfo) {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / image.width() as f32).min(side / image.height() as f32);
        let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
        let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) as f32 / 2.0;
        let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) as f32 / 2.0;

        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
        let (left, top) = (pad_x.floor() as usize, pad_y.floor() as usize);

        let tensor = Array4::from_shape_fn(
            (1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE),
            |(_, _, y, x)| {
                let pixel = match (x.checked_sub(left), y.checked_sub(top)) {
                    (Some(rx), Some(ry)) if rx < new_w as usize && ry < new_h as usize => {
                        resized.get_pixel(rx as u32, ry as u32).0[0] as f32
                    }
                    _ => SCRFD_MEAN,
                };
                (pixel - SCRFD_MEAN) / SCRFD_STD
            },
        );

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetect for ScrfdDetector {
    fn detect(
        &mut self,
        image: &GrayImage,
        params: &DetectParams,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = Self::preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_indices) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = tensor(score_idx, "scores")?;
            let bboxes = tensor(bbox_idx, "bboxes")?;
            candidates.extend(decode_stride(scores, bboxes, stride, &letterbox, params.min_confidence));
        }

        Ok(finalize(candidates, params))
    }
}

/// Greedy suppression of overlapping boxes, then the minimum size filter.
///
/// The result is in descending confidence order.
fn finalize(mut candidates: Vec<BoundingBox>, params: &DetectParams) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.overlap(&candidate) <= SCRFD_NMS_THRESHOLD) {
            kept.push(candidate);
        }
    }
    kept.retain(|b| b.min_side() >= params.min_face_size);
    kept
}

/// Locate the score and box tensors of each stride.
///
/// Exports that name their outputs `score_<stride>` / `bbox_<stride>` are
/// mapped by name; anything else is read as the stock layout with scores in
/// outputs 0..3 and boxes in 3..6.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut mapping = [(0, 3), (1, 4), (2, 5)];
    for (slot, &stride) in mapping.iter_mut().zip(SCRFD_STRIDES.iter()) {
        match (position("score", stride), position("bbox", stride)) {
            (Some(score), Some(bbox)) => *slot = (score, bbox),
            _ => {
                tracing::debug!(?names, "unrecognized SCRFD output names, using stock layout");
                return [(0, 3), (1, 4), (2, 5)];
            }
        }
    }
    mapping
}

/// Decode one stride's anchors into boxes in source-image coordinates.
///
/// Anchors sit on a square grid, two per cell; `bboxes` holds left, top,
/// right and bottom distances from the anchor in units of the stride.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells = SCRFD_INPUT_SIZE / stride;
    let anchors = cells * cells * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;
    let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
    let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

    scores
        .iter()
        .take(anchors)
        .zip(bboxes.chunks_exact(4))
        .enumerate()
        .filter(|(_, (&score, _))| score > threshold)
        .map(|(i, (&score, d))| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % cells) as f32 * step;
            let cy = (cell / cells) as f32 * step;
            let left = unmap_x(cx - d[0] * step);
            let top = unmap_y(cy - d[1] * step);
            let right = unmap_x(cx + d[2] * step);
            let bottom = unmap_y(cy + d[3] * step);
            BoundingBox {
                x: left,
                y: top,
                width: right - left,
                height: bottom - top,
                confidence: score,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: side, height: side, confidence }
    }

    #[test]
    fn test_finalize_keeps_best_of_overlapping_pair() {
        let kept = finalize(
            vec![
                face(0.0, 0.0, 100.0, 0.8),
                face(5.0, 5.0, 100.0, 0.9),
                face(200.0, 200.0, 80.0, 0.7),
            ],
            &DetectParams::STRICT,
        );
        let scores: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
        assert!(finalize(Vec::new(), &DetectParams::STRICT).is_empty());
    }

    #[test]
    fn test_finalize_drops_small_faces_only_under_strict() {
        let dets = vec![face(0.0, 0.0, 120.0, 0.9), face(300.0, 300.0, 40.0, 0.95)];
        let strict = finalize(dets.clone(), &DetectParams::STRICT);
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].width, 120.0);

        let lenient = finalize(dets, &DetectParams::LENIENT);
        assert_eq!(lenient.len(), 2);
        assert_eq!(lenient[0].width, 40.0);
    }

    #[test]
    fn test_decode_stride_maps_back_through_letterbox() {
        // One anchor at cell (1, 1) of stride 32, offsets of one stride each way.
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let dets = decode_stride(&scores, &bboxes, 32, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = dets[0];
        assert!((d.x - 0.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.y - (0.0 - 80.0) / 2.0).abs() < 1e-4, "y = {}", d.y);
        assert!((d.width - 32.0).abs() < 1e-4);
        assert!((d.height - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let grid = SCRFD_INPUT_SIZE / 32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        scores[0] = 0.4;
        let bboxes = vec![1.0f32; anchors * 4];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, 32, &letterbox, 0.5).is_empty());
        assert_eq!(decode_stride(&scores, &bboxes, 32, &letterbox, 0.3).len(), 1);
    }

    #[test]
    fn test_output_indices_by_name() {
        let names: Vec<String> = [8, 16, 32]
            .iter()
            .flat_map(|s| [format!("bbox_{s}"), format!("kps_{s}"), format!("score_{s}")])
            .collect();
        assert_eq!(discover_output_indices(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_output_indices_fall_back_to_stock_layout() {
        let names: Vec<String> = (0..9).map(|i| format!("out{i}")).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_preprocess_centers_portrait_horizontally() {
        let image = GrayImage::from_pixel(160, 320, image::Luma([0]));
        let (tensor, letterbox) = ScrfdDetector::preprocess(&image);
        assert!((letterbox.pad_x - 160.0).abs() < 1e-6);
        assert_eq!(letterbox.pad_y, 0.0);
        let black = (0.0 - SCRFD_MEAN) / SCRFD_STD;
        assert_eq!(tensor[[0, 1, 320, 100]], 0.0);
        assert!((tensor[[0, 1, 320, 320]] - black).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let image = GrayImage::from_pixel(320, 160, image::Luma([255]));
        let (tensor, letterbox) = ScrfdDetector::preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert!((letterbox.scale - 2.0).abs() < 1e-6);
        assert!((letterbox.pad_y - 160.0).abs() < 1e-6);
        // Top padding row normalizes to 0, image rows to (255 - mean) / std.
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 0, 320, 320]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }
}

//! Face detection backends.
//!
//! [`ScrfdDetector`] runs the SCRFD model (3-stride anchor-free decoding with
//! its own confidence NMS) via ONNX Runtime. [`FullFrameDetector`] reports the
//! whole frame as one face, for pre-cropped kiosk captures. Both sit behind
//! [`FaceDetector`] and are picked by [`DetectorBackend`] at construction.

use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Capability: find face regions in a frame. Boxes carry no confidence.
pub trait FaceDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Which detector implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DetectorBackend {
    #[default]
    Scrfd,
    FullFrame,
}

impl std::str::FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrfd" => Ok(Self::Scrfd),
            "full-frame" => Ok(Self::FullFrame),
            other => Err(format!("unknown detector backend: {other} (expected scrfd or full-frame)")),
        }
    }
}

/// Build the configured detector.
pub fn load_detector(
    backend: DetectorBackend,
    model_path: &Path,
) -> Result<Box<dyn FaceDetector + Send>, DetectorError> {
    match backend {
        DetectorBackend::Scrfd => Ok(Box::new(ScrfdDetector::load(model_path)?)),
        DetectorBackend::FullFrame => {
            tracing::info!("using full-frame detector");
            Ok(Box::new(FullFrameDetector))
        }
    }
}

/// Reports the entire frame as a single face region.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullFrameDetector;

impl FaceDetector for FullFrameDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(BoundingBox::new(0, 0, frame.width(), frame.height())
            .into_iter()
            .collect())
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputIndices = (usize, usize);

/// A decoded detection before integer rounding.
#[derive(Debug, Clone, Copy)]
struct ScoredBox {
    bbox: BoundingBox,
    score: f32,
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    input_size: usize,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Preprocess an RGB frame into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, frame: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let size = self.input_size;
        let (width, height) = (frame.width() as f32, frame.height() as f32);
        let scale = (size as f32 / width).min(size as f32 / height);

        let new_w = ((width * scale).round() as u32).clamp(1, size as u32);
        let new_h = ((height * scale).round() as u32).clamp(1, size as u32);
        let pad_x = (size as u32 - new_w) as f32 / 2.0;
        let pad_y = (size as u32 - new_h) as f32 / 2.0;

        let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        // Pad with SCRFD_MEAN so padding normalizes to 0.0.
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        for y in 0..size {
            for x in 0..size {
                let inside = y >= pad_y_start
                    && y < pad_y_start + new_h as usize
                    && x >= pad_x_start
                    && x < pad_x_start + new_w as usize;
                for c in 0..3 {
                    let pixel = if inside {
                        resized.get_pixel((x - pad_x_start) as u32, (y - pad_y_start) as u32)[c] as f32
                    } else {
                        SCRFD_MEAN
                    };
                    tensor[[0, c, y, x]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, LetterboxInfo { scale, pad_x, pad_y })
    }
}

impl FaceDetector for ScrfdDetector {
    /// Detect faces, returning boxes clipped to the frame, most confident first.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = self.preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                (frame.width(), frame.height()),
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept = confidence_nms(all_detections, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "SCRFD detections");
        Ok(kept.into_iter().map(|d| d.bbox).collect())
    }
}

/// Discover output tensor ordering by name.
///
/// Named exports ("score_8", "bbox_16", ...) are mapped by name; anything
/// else falls back to the standard positional ordering
/// `[0-2] = scores, [3-5] = bboxes`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [s8, s16, s32]
        }
        _ => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

/// Decode detections for a single stride level into frame coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    frame_size: (u32, u32),
    threshold: f32,
) -> Vec<ScoredBox> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let stride_f = stride as f32;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride_f;
        let anchor_cy = (anchor_idx / grid) as f32 * stride_f;

        // [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let off = idx * 4;
        let Some(d) = bboxes.get(off..off + 4) else {
            continue;
        };
        let x1 = (anchor_cx - d[0] * stride_f - letterbox.pad_x) / letterbox.scale;
        let y1 = (anchor_cy - d[1] * stride_f - letterbox.pad_y) / letterbox.scale;
        let x2 = (anchor_cx + d[2] * stride_f - letterbox.pad_x) / letterbox.scale;
        let y2 = (anchor_cy + d[3] * stride_f - letterbox.pad_y) / letterbox.scale;

        if let Some(bbox) = clip_to_frame(x1, y1, x2, y2, frame_size) {
            detections.push(ScoredBox { bbox, score });
        }
    }

    detections
}

/// Round a float box to integer pixels, clipped to the frame.
fn clip_to_frame(x1: f32, y1: f32, x2: f32, y2: f32, (width, height): (u32, u32)) -> Option<BoundingBox> {
    let left = x1.round().clamp(0.0, width as f32) as i32;
    let top = y1.round().clamp(0.0, height as f32) as i32;
    let right = x2.round().clamp(0.0, width as f32) as i32;
    let bottom = y2.round().clamp(0.0, height as f32) as i32;
    if right <= left || bottom <= top {
        return None;
    }
    BoundingBox::new(left, top, (right - left) as u32, (bottom - top) as u32)
}

/// Model-level NMS: keep the most confident of each overlapping cluster.
fn confidence_nms(mut detections: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<ScoredBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.bbox.iou(&det.bbox) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scored(x: i32, y: i32, w: u32, h: u32, score: f32) -> ScoredBox {
        ScoredBox {
            bbox: BoundingBox::new(x, y, w, h).unwrap(),
            score,
        }
    }

    #[test]
    fn test_confidence_nms_suppresses_overlapping() {
        let detections = vec![
            scored(5, 5, 100, 100, 0.8),
            scored(0, 0, 100, 100, 0.9),
            scored(200, 200, 50, 50, 0.7),
        ];
        let result = confidence_nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_nms_empty() {
        assert!(confidence_nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_clip_to_frame() {
        let b = clip_to_frame(-10.0, -5.0, 50.4, 40.6, (100, 100)).unwrap();
        assert_eq!(b, BoundingBox::new(0, 0, 50, 41).unwrap());

        let b = clip_to_frame(90.0, 90.0, 130.0, 130.0, (100, 100)).unwrap();
        assert_eq!(b, BoundingBox::new(90, 90, 10, 10).unwrap());

        assert!(clip_to_frame(120.0, 0.0, 150.0, 10.0, (100, 100)).is_none());
    }

    #[test]
    fn test_decode_stride_maps_letterbox_back() {
        // One anchor at grid cell (1, 1) of stride 32 with offsets of 1 stride.
        let stride = 32;
        let grid = SCRFD_INPUT_SIZE / stride;
        let mut scores = vec![0.0f32; grid * grid * SCRFD_ANCHORS_PER_CELL];
        let mut bboxes = vec![0.0f32; scores.len() * 4];
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, stride, SCRFD_INPUT_SIZE, &letterbox, (320, 320), 0.5);

        assert_eq!(dets.len(), 1);
        // Anchor center (32, 32), box [0, 64] in input space, [0, 32] in frame space.
        assert_eq!(dets[0].bbox, BoundingBox::new(0, 0, 32, 32).unwrap());
    }

    #[test]
    fn test_letterbox_coordinate_roundtrip() {
        let width = 320.0f32;
        let height = 240.0f32;
        let scale = (640.0 / width).min(640.0 / height);
        let pad_x = (640.0 - (width * scale).round()) / 2.0;
        let pad_y = (640.0 - (height * scale).round()) / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        let orig_x = 100.0f32;
        let orig_y = 50.0f32;
        let recovered_x = (orig_x * scale + pad_x - letterbox.pad_x) / letterbox.scale;
        let recovered_y = (orig_y * scale + pad_y - letterbox.pad_y) / letterbox.scale;

        assert!((recovered_x - orig_x).abs() < 0.1, "x: {recovered_x} vs {orig_x}");
        assert!((recovered_y - orig_y).abs() < 0.1, "y: {recovered_y} vs {orig_y}");
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_full_frame_detector() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([10, 20, 30]));
        let boxes = FullFrameDetector.detect(&frame).unwrap();
        assert_eq!(boxes, vec![BoundingBox::new(0, 0, 64, 48).unwrap()]);

        assert!(FullFrameDetector.detect(&RgbImage::new(0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("scrfd".parse::<DetectorBackend>(), Ok(DetectorBackend::Scrfd));
        assert_eq!("full-frame".parse::<DetectorBackend>(), Ok(DetectorBackend::FullFrame));
        assert!("haar".parse::<DetectorBackend>().is_err());
    }
}

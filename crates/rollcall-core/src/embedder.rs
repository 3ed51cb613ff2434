//! Face embedding extraction via ONNX Runtime.
//!
//! Runs an ArcFace-style model (w600k_r50 by default) on normalized RGB face
//! crops and returns L2-normalized embeddings.

use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("embedder produced a {actual}-dim vector, expected {expected}")]
    UnexpectedDimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl EmbedderError {
    /// Dimension drift means a mismatched model pairing rather than a bad crop.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnexpectedDimension { .. } | Self::ModelNotFound(_))
    }
}

/// Capability: turn a normalized face crop into an embedding.
///
/// Every call within a process lifetime must produce the same dimension.
pub trait Embedder {
    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, EmbedderError>;
}

/// ArcFace-style embedder backed by an ONNX session.
pub struct OnnxEmbedder {
    session: Session,
    input_size: u32,
    model_version: String,
    dimension: Option<usize>,
}

impl OnnxEmbedder {
    /// Load the embedding model. `input_size` is the square crop side the model expects.
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            session,
            input_size,
            model_version,
            dimension: None,
        })
    }

    /// RGB crop to NCHW float tensor, resizing if the crop is not model-sized.
    fn preprocess(crop: &RgbImage, size: u32) -> Array4<f32> {
        let resized;
        let crop = if crop.dimensions() == (size, size) {
            crop
        } else {
            resized = image::imageops::resize(crop, size, size, FilterType::Triangle);
            &resized
        };

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (x, y, pixel) in crop.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }
        tensor
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, EmbedderError> {
        let input = Self::preprocess(crop, self.input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let values = l2_normalize(raw_data.to_vec());
        check_dimension(&mut self.dimension, values.len())?;

        Ok(Embedding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }
}

/// Record the first observed dimension and reject any later deviation.
pub fn check_dimension(known: &mut Option<usize>, actual: usize) -> Result<(), EmbedderError> {
    if actual == 0 {
        return Err(EmbedderError::InferenceFailed("model produced an empty embedding".into()));
    }
    match *known {
        None => {
            *known = Some(actual);
            Ok(())
        }
        Some(expected) if expected == actual => Ok(()),
        Some(expected) => Err(EmbedderError::UnexpectedDimension { expected, actual }),
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

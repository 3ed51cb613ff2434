//! End-to-end frame recognition: detect, filter, suppress, crop, score,
//! embed, then match with frame-level uniqueness.

use crate::builder::ReferenceSetBuilder;
use crate::crop;
use crate::detector::{load_detector, DetectorError, FaceDetector};
use crate::embedder::{Embedder, EmbedderError, OnnxEmbedder};
use crate::frame::FrameRecognizer;
use crate::matcher::{IdentityMatcher, MatchError};
use crate::quality::QualityGate;
use crate::reference::ReferenceSet;
use crate::samples::{EnrollError, EnrollSummary, SampleLibrary};
use crate::settings::{Settings, SettingsError};
use crate::suppressor::GeometrySuppressor;
use crate::types::{BoundingBox, FaceCandidate, FrameResult, IdentityDirectory};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input image: {0}")]
    Input(#[from] image::ImageError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("match: {0}")]
    Match(#[from] MatchError),
    #[error("settings: {0}")]
    Settings(#[from] SettingsError),
}

impl PipelineError {
    /// Misconfiguration (mismatched models, bad settings) as opposed to bad input.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::Match(_) | Self::Settings(_) => true,
            Self::Embedder(e) => e.is_configuration(),
            Self::Detector(DetectorError::ModelNotFound(_)) => true,
            Self::Input(_) | Self::Detector(_) => false,
        }
    }
}

/// Owns the detector and embedder backends plus every decision stage.
pub struct AttendancePipeline {
    detector: Box<dyn FaceDetector + Send>,
    embedder: Box<dyn Embedder + Send>,
    suppressor: GeometrySuppressor,
    quality: QualityGate,
    recognizer: FrameRecognizer<IdentityMatcher>,
    crop_size: u32,
    min_face_size: u32,
    directory: Option<Arc<dyn IdentityDirectory + Send + Sync>>,
}

impl AttendancePipeline {
    /// Load the configured ONNX backends.
    pub fn from_settings(settings: &Settings) -> Result<Self, PipelineError> {
        settings.validate()?;
        let detector = load_detector(settings.detector_backend, &settings.detector_model_path())?;
        let embedder = OnnxEmbedder::load(&settings.embedder_model_path(), settings.crop_size)?;
        Ok(Self::new(detector, Box::new(embedder), settings))
    }

    /// Assemble a pipeline around already-constructed backends.
    pub fn new(
        detector: Box<dyn FaceDetector + Send>,
        embedder: Box<dyn Embedder + Send>,
        settings: &Settings,
    ) -> Self {
        Self {
            detector,
            embedder,
            suppressor: GeometrySuppressor::new(settings.overlap_threshold),
            quality: QualityGate::new(settings.quality_threshold),
            recognizer: FrameRecognizer::new(
                IdentityMatcher::new(settings.distance_threshold, settings.min_confidence),
                settings.quality_threshold,
            ),
            crop_size: settings.crop_size,
            min_face_size: settings.min_face_size,
            directory: None,
        }
    }

    /// Attach display names to accepted matches.
    pub fn with_directory(mut self, directory: Arc<dyn IdentityDirectory + Send + Sync>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Recognize an encoded image (JPEG, PNG, ...).
    pub fn recognize_bytes(&mut self, reference: &ReferenceSet, bytes: &[u8]) -> Result<FrameResult, PipelineError> {
        let frame = image::load_from_memory(bytes)?.to_rgb8();
        self.recognize_frame(reference, &frame)
    }

    pub fn recognize_path(&mut self, reference: &ReferenceSet, path: &Path) -> Result<FrameResult, PipelineError> {
        let frame = image::open(path)?.to_rgb8();
        self.recognize_frame(reference, &frame)
    }

    /// Full per-frame recognition. Fails only on detector failure or misconfiguration.
    pub fn recognize_frame(&mut self, reference: &ReferenceSet, frame: &RgbImage) -> Result<FrameResult, PipelineError> {
        let candidates = self.candidates(frame)?;
        let mut result = self.recognizer.recognize_frame(reference, &candidates)?;

        if let Some(directory) = &self.directory {
            for entry in &mut result.entries {
                if let Some(m) = entry.matched.as_mut() {
                    m.display_name = directory.lookup(&m.identity_key).map(|r| r.display_name);
                }
            }
        }

        tracing::info!(
            faces = result.len(),
            recognized = result.matched_identities().count(),
            "frame processed"
        );
        Ok(result)
    }

    /// Detect, filter and suppress boxes, then score and embed each crop.
    ///
    /// Crops below the quality threshold are not embedded. A failed
    /// extraction leaves that candidate without an embedding; a dimension
    /// change aborts the frame.
    pub fn candidates(&mut self, frame: &RgbImage) -> Result<Vec<FaceCandidate>, PipelineError> {
        let detected = self.detector.detect(frame)?;
        let sized: Vec<BoundingBox> = detected
            .into_iter()
            .filter(|b| self.is_large_enough(b))
            .collect();
        let boxes = self.suppressor.suppress(&sized);

        let mut candidates = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let crop = crop::extract_face(frame, &bbox, self.crop_size);
            let quality = self.quality.score(&crop);

            let embedding = if self.quality.is_acceptable(quality) {
                match self.embedder.embed(&crop) {
                    Ok(embedding) => Some(embedding),
                    Err(e) if e.is_configuration() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(?bbox, error = %e, "embedding extraction failed for candidate");
                        None
                    }
                }
            } else {
                None
            };

            candidates.push(FaceCandidate {
                bbox,
                quality,
                embedding,
            });
        }

        Ok(candidates)
    }

    /// Boxes crossing the frame edge are kept; the crop is clamped to the frame.
    fn is_large_enough(&self, bbox: &BoundingBox) -> bool {
        let big_enough = bbox.width >= self.min_face_size && bbox.height >= self.min_face_size;
        if !big_enough {
            tracing::debug!(?bbox, min = self.min_face_size, "dropping small detection");
        }
        big_enough
    }

    /// A builder sharing this pipeline's backends.
    pub fn reference_builder(&mut self) -> ReferenceSetBuilder<'_> {
        ReferenceSetBuilder::new(&mut *self.detector, &mut *self.embedder, self.crop_size)
    }

    /// Normalize and store enrollment images for `key`.
    pub fn enroll_samples(
        &mut self,
        library: &SampleLibrary,
        key: &str,
        images: &[PathBuf],
        min_samples: usize,
    ) -> Result<EnrollSummary, EnrollError> {
        library.add_samples(key, images, &mut *self.detector, self.crop_size, min_samples)
    }
}

//! On-disk enrollment samples: `<root>/<identity>/<image>`.

use crate::builder::{largest_box, IdentitySamples};
use crate::crop;
use crate::detector::FaceDetector;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SAMPLE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("invalid identity key: {0:?}")]
    InvalidIdentity(String),
    #[error("enrollment needs at least {required} images, got {given}")]
    TooFewSamples { required: usize, given: usize },
    #[error("none of the images for {0} could be processed")]
    NoUsableSamples(String),
    #[error("sample i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample encode: {0}")]
    Image(#[from] image::ImageError),
}

/// Outcome of adding samples for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollSummary {
    pub written: Vec<PathBuf>,
    pub failed: usize,
}

/// Collect `root/<identity>/*.{jpg,jpeg,png,bmp}`, sorted by identity then file name.
///
/// A missing root is an empty mapping. Identity directories without any
/// image are still listed so the build can report them.
pub fn scan_sample_dir(root: &Path) -> Result<IdentitySamples, std::io::Error> {
    let mut samples = IdentitySamples::new();
    if !root.exists() {
        return Ok(samples);
    }

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(identity) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 identity directory");
            continue;
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(entry.path())?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_sample_image(p))
            .collect();
        paths.sort();
        samples.insert(identity, paths);
    }

    Ok(samples)
}

fn is_sample_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SAMPLE_EXTENSIONS.iter().any(|s| e.eq_ignore_ascii_case(s)))
}

/// Identity keys become directory names, so they must be a single plain path component.
pub fn validate_identity_key(key: &str) -> Result<(), EnrollError> {
    let ok = !key.is_empty()
        && key != "."
        && key != ".."
        && !key.chars().any(|c| c == '/' || c == '\\' || c.is_control());
    if ok {
        Ok(())
    } else {
        Err(EnrollError::InvalidIdentity(key.to_string()))
    }
}

/// The enrollment sample tree.
#[derive(Debug, Clone)]
pub struct SampleLibrary {
    root: PathBuf,
}

impl SampleLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scan(&self) -> Result<IdentitySamples, std::io::Error> {
        scan_sample_dir(&self.root)
    }

    pub fn identity_dir(&self, key: &str) -> Result<PathBuf, EnrollError> {
        validate_identity_key(key)?;
        Ok(self.root.join(key))
    }

    /// Normalize `images` into face crops and store them under `key`.
    ///
    /// Each image contributes its largest detected face, or the whole image
    /// if no face is found. Unreadable images are skipped. If nothing could
    /// be written and the identity directory was created by this call, it is
    /// removed again.
    pub fn add_samples(
        &self,
        key: &str,
        images: &[PathBuf],
        detector: &mut dyn FaceDetector,
        crop_size: u32,
        min_samples: usize,
    ) -> Result<EnrollSummary, EnrollError> {
        let dir = self.identity_dir(key)?;
        if images.len() < min_samples {
            return Err(EnrollError::TooFewSamples {
                required: min_samples,
                given: images.len(),
            });
        }

        let created = !dir.exists();
        std::fs::create_dir_all(&dir)?;
        let mut next_index = std::fs::read_dir(&dir)?.count();

        let mut summary = EnrollSummary {
            written: Vec::new(),
            failed: 0,
        };

        for source in images {
            let frame = match image::open(source) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %source.display(), error = %e, "skipping unreadable enrollment image");
                    summary.failed += 1;
                    continue;
                }
            };

            let boxes = match detector.detect(&frame) {
                Ok(boxes) => boxes,
                Err(e) => {
                    tracing::warn!(path = %source.display(), error = %e, "face detection failed on enrollment image");
                    summary.failed += 1;
                    continue;
                }
            };

            let crop = match largest_box(&boxes) {
                Some(bbox) => crop::extract_face(&frame, bbox, crop_size),
                None => {
                    tracing::debug!(path = %source.display(), "no face found, storing whole image");
                    crop::normalize_sample(&frame, crop_size)
                }
            };

            let target = loop {
                let candidate = dir.join(format!("sample_{next_index:04}.png"));
                next_index += 1;
                if !candidate.exists() {
                    break candidate;
                }
            };
            crop.save(&target)?;
            summary.written.push(target);
        }

        if summary.written.is_empty() {
            if created {
                std::fs::remove_dir_all(&dir)?;
            }
            return Err(EnrollError::NoUsableSamples(key.to_string()));
        }

        tracing::info!(identity = key, written = summary.written.len(), failed = summary.failed, "samples enrolled");
        Ok(summary)
    }

    /// Delete an identity's samples. Returns false if there were none.
    pub fn remove(&self, key: &str) -> Result<bool, EnrollError> {
        let dir = self.identity_dir(key)?;
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!(identity = key, "samples removed");
        Ok(true)
    }
}

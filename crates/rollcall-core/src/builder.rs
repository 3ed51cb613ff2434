//! Reference set builds from enrollment samples.
//!
//! A build is a full recompute: every sample of every identity is loaded,
//! re-detected, cropped and embedded into a fresh [`ReferenceSet`], which
//! then replaces the current one in a single swap.

use crate::crop;
use crate::detector::FaceDetector;
use crate::embedder::{Embedder, EmbedderError};
use crate::reference::{ReferenceSet, ReferenceSetError, ReferenceSetHandle, ReferenceStore};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identity key to its ordered sample image paths.
pub type IdentitySamples = BTreeMap<String, Vec<PathBuf>>;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("embedder misconfigured: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("invalid reference set: {0}")]
    ReferenceSet(#[from] ReferenceSetError),
}

/// Summary of one rebuild.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RebuildReport {
    /// True when a non-empty set was produced and swapped in.
    pub success: bool,
    pub processed_count: usize,
    pub failed_count: usize,
    pub per_identity_counts: BTreeMap<String, usize>,
    /// Identities with no usable sample; absent from the new set.
    pub skipped_identities: Vec<String>,
    /// Whether the new set reached the durable store.
    pub persisted: bool,
    pub message: String,
}

/// Per-sample failure. Logged and counted, never fatal on its own.
#[derive(Error, Debug)]
enum SampleError {
    #[error("load: {0}")]
    Load(#[from] image::ImageError),
    #[error("detect: {0}")]
    Detect(#[from] crate::detector::DetectorError),
    #[error("embed: {0}")]
    Embed(#[from] EmbedderError),
}

/// Builds reference sets with borrowed detector and embedder backends.
pub struct ReferenceSetBuilder<'a> {
    detector: &'a mut dyn FaceDetector,
    embedder: &'a mut dyn Embedder,
    crop_size: u32,
}

impl<'a> ReferenceSetBuilder<'a> {
    pub fn new(detector: &'a mut dyn FaceDetector, embedder: &'a mut dyn Embedder, crop_size: u32) -> Self {
        Self {
            detector,
            embedder,
            crop_size,
        }
    }

    /// Build a new set without touching any shared state.
    ///
    /// The returned report has `success` set when the set is non-empty;
    /// `persisted` is always false here.
    pub fn build(&mut self, samples: &IdentitySamples) -> Result<(ReferenceSet, RebuildReport), BuildError> {
        let mut identities: BTreeMap<String, Vec<Embedding>> = BTreeMap::new();
        let mut report = RebuildReport::default();

        for (identity, paths) in samples {
            let mut embeddings = Vec::with_capacity(paths.len());

            for path in paths {
                match self.embed_sample(path) {
                    Ok(embedding) => {
                        report.processed_count += 1;
                        embeddings.push(embedding);
                    }
                    Err(SampleError::Embed(e)) if e.is_configuration() => return Err(e.into()),
                    Err(e) => {
                        report.failed_count += 1;
                        tracing::warn!(identity = %identity, path = %path.display(), error = %e, "skipping sample");
                    }
                }
            }

            if embeddings.is_empty() {
                tracing::warn!(identity = %identity, samples = paths.len(), "no usable samples, identity excluded");
                report.skipped_identities.push(identity.clone());
            } else {
                report.per_identity_counts.insert(identity.clone(), embeddings.len());
                identities.insert(identity.clone(), embeddings);
            }
        }

        let set = ReferenceSet::from_identities(identities)?;
        report.success = !set.is_empty();
        report.message = if report.success {
            format!(
                "built {} identities from {} samples ({} failed)",
                set.identity_count(),
                report.processed_count,
                report.failed_count
            )
        } else {
            "no usable identities; previous reference set retained".to_string()
        };

        Ok((set, report))
    }

    /// Build and atomically swap into `handle`, then persist to `store`.
    ///
    /// Rebuilds through the same handle are serialized. On zero identities
    /// the current set is left in place and the report says so.
    pub fn rebuild(
        &mut self,
        handle: &ReferenceSetHandle,
        store: Option<&dyn ReferenceStore>,
        samples: &IdentitySamples,
    ) -> Result<RebuildReport, BuildError> {
        let _guard = handle.lock_rebuild();

        let (set, mut report) = self.build(samples)?;
        if !report.success {
            tracing::warn!(
                failed = report.failed_count,
                skipped = report.skipped_identities.len(),
                "rebuild produced no identities, keeping previous reference set"
            );
            return Ok(report);
        }

        let previous = handle.replace(set);
        let current = handle.snapshot();
        tracing::info!(
            identities = current.identity_count(),
            samples = current.sample_count(),
            previous_identities = previous.identity_count(),
            "reference set swapped"
        );

        if let Some(store) = store {
            match store.save(&current) {
                Ok(()) => report.persisted = true,
                Err(e) => tracing::warn!(error = %e, "failed to persist reference set"),
            }
        }

        Ok(report)
    }

    fn embed_sample(&mut self, path: &Path) -> Result<Embedding, SampleError> {
        let image = image::open(path)?.to_rgb8();
        let crop = self.sample_crop(&image)?;
        Ok(self.embedder.embed(&crop)?)
    }

    /// Largest detected face, or the whole image when none is found.
    fn sample_crop(&mut self, image: &RgbImage) -> Result<RgbImage, SampleError> {
        let boxes = self.detector.detect(image)?;
        Ok(match largest_box(&boxes) {
            Some(bbox) => crop::extract_face(image, bbox, self.crop_size),
            None => crop::normalize_sample(image, self.crop_size),
        })
    }
}

/// The box with the greatest area; the first one wins ties.
pub fn largest_box(boxes: &[BoundingBox]) -> Option<&BoundingBox> {
    boxes.iter().fold(None, |best: Option<&BoundingBox>, b| match best {
        Some(cur) if cur.area() >= b.area() => Some(cur),
        _ => Some(b),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::matcher::{IdentityMatcher, Matcher};
    use crate::reference::StoreError;
    use image::Rgb;
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Never finds a face, forcing the whole-image fallback.
    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    /// Reports fixed boxes regardless of content.
    struct FixedBoxes(Vec<BoundingBox>);

    impl FaceDetector for FixedBoxes {
        fn detect(&mut self, _: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Embeds a crop as its normalized mean color.
    struct MeanColor;

    impl Embedder for MeanColor {
        fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, EmbedderError> {
            let mut sum = [0.0f32; 3];
            for p in crop.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32 + 1.0;
                }
            }
            Ok(Embedding::new(sum.to_vec()))
        }
    }

    /// Produces a different dimension on every call.
    struct Drifting(usize);

    impl Embedder for Drifting {
        fn embed(&mut self, _: &RgbImage) -> Result<Embedding, EmbedderError> {
            self.0 += 1;
            if self.0 > 1 {
                return Err(EmbedderError::UnexpectedDimension { expected: 1, actual: self.0 });
            }
            Ok(Embedding::new(vec![1.0]))
        }
    }

    /// Enter and exit times of one embed call, tagged with the builder id.
    type EmbedLog = Arc<Mutex<Vec<(usize, Instant, Instant)>>>;

    /// Sleeps inside every embed call and records when it ran.
    struct Slow {
        id: usize,
        log: EmbedLog,
        started: Option<mpsc::Sender<()>>,
    }

    impl Embedder for Slow {
        fn embed(&mut self, _: &RgbImage) -> Result<Embedding, EmbedderError> {
            let enter = Instant::now();
            if let Some(tx) = self.started.take() {
                let _ = tx.send(());
            }
            thread::sleep(Duration::from_millis(40));
            self.log.lock().unwrap().push((self.id, enter, Instant::now()));
            Ok(Embedding::new(vec![1.0, self.id as f32, 0.5]))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Option<ReferenceSet>>,
        fail: bool,
    }

    impl ReferenceStore for MemoryStore {
        fn load(&self) -> Result<Option<ReferenceSet>, StoreError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save(&self, set: &ReferenceSet) -> Result<(), StoreError> {
            if self.fail {
                return Err(StoreError::Corrupt("disk full".into()));
            }
            *self.saved.lock().unwrap() = Some(set.clone());
            Ok(())
        }
    }

    fn write_png(dir: &Path, name: &str, color: [u8; 3]) -> PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(32, 32, Rgb(color)).save(&path).unwrap();
        path
    }

    fn write_garbage(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"not an image").unwrap();
        path
    }

    fn samples(entries: Vec<(&str, Vec<PathBuf>)>) -> IdentitySamples {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_build_counts_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples(vec![
            ("S1", vec![write_png(dir.path(), "a.png", [200, 10, 10]), write_png(dir.path(), "b.png", [190, 20, 10])]),
            ("S2", vec![write_png(dir.path(), "c.png", [10, 10, 200]), write_garbage(dir.path(), "d.jpg")]),
        ]);

        let (mut det, mut emb) = (NoFaces, MeanColor);
        let (set, report) = ReferenceSetBuilder::new(&mut det, &mut emb, 16).build(&input).unwrap();

        assert!(report.success);
        assert_eq!(report.processed_count, 3);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.per_identity_counts["S1"], 2);
        assert_eq!(report.per_identity_counts["S2"], 1);
        assert!(report.skipped_identities.is_empty());
        assert!(!report.persisted);
        assert_eq!(set.sample_count(), 3);
    }

    #[test]
    fn test_all_failed_identity_is_absent_and_never_matches() {
        let dir = tempfile::tempdir().unwrap();
        let s1 = write_png(dir.path(), "s1.png", [200, 10, 10]);
        let input = samples(vec![
            ("S1", vec![s1]),
            ("BROKEN", vec![write_garbage(dir.path(), "x.jpg"), dir.path().join("missing.png")]),
        ]);

        let (mut det, mut emb) = (NoFaces, MeanColor);
        let (set, report) = ReferenceSetBuilder::new(&mut det, &mut emb, 16).build(&input).unwrap();

        assert!(!set.contains("BROKEN"));
        assert!(set.embeddings("BROKEN").is_none());
        assert_eq!(report.skipped_identities, vec!["BROKEN".to_string()]);
        assert_eq!(report.failed_count, 2);

        let matcher = IdentityMatcher::default();
        for query in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [0.5, 0.5, 0.5]] {
            let outcome = matcher.match_embedding(&Embedding::new(query.to_vec()), &set).unwrap();
            assert_ne!(outcome.identity_key.as_deref(), Some("BROKEN"));
        }
    }

    #[test]
    fn test_largest_detected_face_is_used() {
        let dir = tempfile::tempdir().unwrap();
        // Left quarter red, rest blue.
        let path = dir.path().join("split.png");
        RgbImage::from_fn(100, 50, |x, _| if x < 25 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) })
            .save(&path)
            .unwrap();

        let mut det = FixedBoxes(vec![
            BoundingBox::new(2, 10, 20, 20).unwrap(),
            BoundingBox::new(40, 5, 40, 40).unwrap(),
        ]);
        let mut emb = MeanColor;
        let (set, _) = ReferenceSetBuilder::new(&mut det, &mut emb, 16)
            .build(&samples(vec![("S1", vec![path])]))
            .unwrap();

        let stored = &set.embeddings("S1").unwrap()[0];
        assert!(stored.values[2] > stored.values[0] * 10.0, "{:?}", stored.values);
    }

    #[test]
    fn test_rebuild_swaps_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples(vec![("S1", vec![write_png(dir.path(), "a.png", [120, 60, 30])])]);
        let handle = ReferenceSetHandle::default();
        let store = MemoryStore::default();

        let (mut det, mut emb) = (NoFaces, MeanColor);
        let report = ReferenceSetBuilder::new(&mut det, &mut emb, 16)
            .rebuild(&handle, Some(&store), &input)
            .unwrap();

        assert!(report.success);
        assert!(report.persisted);
        assert!(handle.is_trained());
        assert_eq!(store.load().unwrap().unwrap(), *handle.snapshot());
    }

    #[test]
    fn test_rebuild_total_failure_retains_previous_set() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ReferenceSetHandle::default();
        let (mut det, mut emb) = (NoFaces, MeanColor);

        let good = samples(vec![("S1", vec![write_png(dir.path(), "a.png", [120, 60, 30])])]);
        ReferenceSetBuilder::new(&mut det, &mut emb, 16).rebuild(&handle, None, &good).unwrap();
        let before = handle.snapshot();

        let bad = samples(vec![("S2", vec![write_garbage(dir.path(), "b.jpg")])]);
        let report = ReferenceSetBuilder::new(&mut det, &mut emb, 16).rebuild(&handle, None, &bad).unwrap();

        assert!(!report.success);
        assert_eq!(report.failed_count, 1);
        assert_eq!(*handle.snapshot(), *before);
        assert!(handle.snapshot().contains("S1"));
    }

    #[test]
    fn test_rebuild_empty_samples_is_failure() {
        let handle = ReferenceSetHandle::default();
        let (mut det, mut emb) = (NoFaces, MeanColor);
        let report = ReferenceSetBuilder::new(&mut det, &mut emb, 16)
            .rebuild(&handle, None, &IdentitySamples::new())
            .unwrap();
        assert!(!report.success);
        assert!(!handle.is_trained());
    }

    #[test]
    fn test_rebuild_store_failure_keeps_swap() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples(vec![("S1", vec![write_png(dir.path(), "a.png", [120, 60, 30])])]);
        let handle = ReferenceSetHandle::default();
        let store = MemoryStore { fail: true, ..Default::default() };

        let (mut det, mut emb) = (NoFaces, MeanColor);
        let report = ReferenceSetBuilder::new(&mut det, &mut emb, 16)
            .rebuild(&handle, Some(&store), &input)
            .unwrap();

        assert!(report.success);
        assert!(!report.persisted);
        assert!(handle.snapshot().contains("S1"));
    }

    #[test]
    fn test_concurrent_rebuilds_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples(vec![(
            "NEW",
            vec![write_png(dir.path(), "a.png", [10, 20, 30]), write_png(dir.path(), "b.png", [30, 20, 10])],
        )]);

        let mut old = BTreeMap::new();
        old.insert("OLD".to_string(), vec![Embedding::new(vec![0.0, 0.0, 1.0])]);
        let handle = Arc::new(ReferenceSetHandle::new(ReferenceSet::from_identities(old).unwrap()));
        let log: EmbedLog = Arc::default();

        let spawn = |id: usize, started: Option<mpsc::Sender<()>>| {
            let (handle, log, input) = (Arc::clone(&handle), Arc::clone(&log), input.clone());
            thread::spawn(move || {
                let (mut det, mut emb) = (NoFaces, Slow { id, log, started });
                ReferenceSetBuilder::new(&mut det, &mut emb, 16)
                    .rebuild(&handle, None, &input)
                    .unwrap()
            })
        };

        let (tx, rx) = mpsc::channel();
        let first = spawn(1, Some(tx));
        rx.recv().unwrap();

        // Mid-build: readers still see the previous set.
        let during = handle.snapshot();
        assert!(during.contains("OLD"));
        assert!(!during.contains("NEW"));

        let second = spawn(2, None);
        assert!(first.join().unwrap().success);
        assert!(second.join().unwrap().success);

        let log = log.lock().unwrap();
        let window = |id: usize| {
            let calls = log.iter().filter(|(who, _, _)| *who == id);
            let start = calls.clone().map(|(_, enter, _)| *enter).min().unwrap();
            let end = calls.map(|(_, _, exit)| *exit).max().unwrap();
            (start, end)
        };
        let (start1, end1) = window(1);
        let (start2, end2) = window(2);
        assert!(end1 <= start2 || end2 <= start1, "build windows overlap");

        let after = handle.snapshot();
        assert!(after.contains("NEW"));
        assert!(!after.contains("OLD"));
    }

    #[test]
    fn test_dimension_drift_aborts_and_retains_previous() {
        let dir = tempfile::tempdir().unwrap();
        let input = samples(vec![(
            "S1",
            vec![write_png(dir.path(), "a.png", [1, 2, 3]), write_png(dir.path(), "b.png", [4, 5, 6])],
        )]);
        let handle = ReferenceSetHandle::default();

        let (mut det, mut emb) = (NoFaces, Drifting(0));
        let err = ReferenceSetBuilder::new(&mut det, &mut emb, 16)
            .rebuild(&handle, None, &input)
            .unwrap_err();

        assert!(matches!(err, BuildError::Embedder(EmbedderError::UnexpectedDimension { .. })));
        assert!(!handle.is_trained());
    }

    #[test]
    fn test_largest_box() {
        assert!(largest_box(&[]).is_none());
        let boxes = [
            BoundingBox::new(0, 0, 10, 10).unwrap(),
            BoundingBox::new(0, 0, 20, 5).unwrap(),
            BoundingBox::new(5, 5, 10, 10).unwrap(),
        ];
        // 100 vs 100 vs 100: first wins.
        assert_eq!(largest_box(&boxes), Some(&boxes[0]));
        let boxes = [BoundingBox::new(0, 0, 3, 3).unwrap(), BoundingBox::new(0, 0, 4, 4).unwrap()];
        assert_eq!(largest_box(&boxes), Some(&boxes[1]));
    }
}

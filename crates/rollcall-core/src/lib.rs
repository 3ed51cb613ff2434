//! rollcall-core — Classroom attendance face matching.
//!
//! Turns a camera frame into the set of enrolled identities present:
//! geometric suppression of duplicate detections, crop quality gating,
//! cosine-distance identity matching with frame-level uniqueness, and
//! atomic reference-set rebuilds from enrollment samples. Detection and
//! embedding run on SCRFD and ArcFace via ONNX Runtime.

pub mod builder;
pub mod crop;
pub mod detector;
pub mod embedder;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod reference;
pub mod samples;
pub mod settings;
pub mod suppressor;
pub mod types;

pub use builder::{BuildError, IdentitySamples, RebuildReport, ReferenceSetBuilder};
pub use detector::{DetectorBackend, FaceDetector};
pub use embedder::Embedder;
pub use frame::FrameRecognizer;
pub use matcher::{IdentityMatcher, MatchError, Matcher};
pub use pipeline::{AttendancePipeline, PipelineError};
pub use quality::QualityGate;
pub use reference::{ReferenceSet, ReferenceSetHandle, ReferenceStore, StoreError};
pub use samples::{scan_sample_dir, SampleLibrary};
pub use settings::Settings;
pub use suppressor::GeometrySuppressor;
pub use types::{BoundingBox, Embedding, FaceCandidate, FaceMatch, FrameEntry, FrameResult, IdentityDirectory, IdentityRecord};

use crate::detector::DetectorBackend;
use crate::matcher::{DEFAULT_DISTANCE_THRESHOLD, DEFAULT_MIN_CONFIDENCE};
use crate::quality::DEFAULT_QUALITY_THRESHOLD;
use crate::suppressor::DEFAULT_OVERLAP_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable naming an optional TOML settings file.
pub const CONFIG_ENV: &str = "ROLLCALL_CONFIG";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Pipeline and storage settings.
///
/// Loaded from defaults, then the TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    pub detector_backend: DetectorBackend,
    /// Root of the per-identity enrollment sample directories.
    pub samples_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// The daemon only opens image files by path from under this directory.
    pub capture_dir: PathBuf,
    /// Side of the square normalized face crop.
    pub crop_size: u32,
    /// Detections smaller than this on either side are dropped.
    pub min_face_size: u32,
    pub overlap_threshold: f32,
    pub quality_threshold: f32,
    /// Cosine distance below which a match is accepted.
    pub distance_threshold: f32,
    /// Minimum display confidence (percent) for a match.
    pub min_confidence: f32,
    /// Images required to enroll an identity.
    pub min_enroll_samples: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "w600k_r50.onnx".to_string(),
            detector_backend: DetectorBackend::default(),
            samples_dir: data_dir.join("samples"),
            db_path: data_dir.join("rollcall.db"),
            capture_dir: data_dir.join("captures"),
            crop_size: 112,
            min_face_size: 80,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_enroll_samples: 3,
        }
    }
}

impl Settings {
    /// Load settings from the file named by `ROLLCALL_CONFIG` (if set) and
    /// `ROLLCALL_*` environment variables, then validate.
    pub fn load() -> Result<Self, SettingsError> {
        let mut settings = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML settings file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded settings file");
        Ok(settings)
    }

    /// Apply `ROLLCALL_*` overrides read through `var`.
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = var("ROLLCALL_EMBEDDER_MODEL") {
            self.embedder_model = v;
        }
        if let Some(v) = var("ROLLCALL_SAMPLES_DIR") {
            self.samples_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = var("ROLLCALL_CAPTURE_DIR") {
            self.capture_dir = PathBuf::from(v);
        }
        override_parsed(&var, "ROLLCALL_DETECTOR_BACKEND", &mut self.detector_backend);
        override_parsed(&var, "ROLLCALL_CROP_SIZE", &mut self.crop_size);
        override_parsed(&var, "ROLLCALL_MIN_FACE_SIZE", &mut self.min_face_size);
        override_parsed(&var, "ROLLCALL_OVERLAP_THRESHOLD", &mut self.overlap_threshold);
        override_parsed(&var, "ROLLCALL_QUALITY_THRESHOLD", &mut self.quality_threshold);
        override_parsed(&var, "ROLLCALL_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        override_parsed(&var, "ROLLCALL_MIN_CONFIDENCE", &mut self.min_confidence);
        override_parsed(&var, "ROLLCALL_MIN_ENROLL_SAMPLES", &mut self.min_enroll_samples);
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        unit_range("overlap_threshold", self.overlap_threshold)?;
        unit_range("quality_threshold", self.quality_threshold)?;
        if !(0.0..=2.0).contains(&self.distance_threshold) {
            return Err(invalid("distance_threshold", "must be within [0, 2]"));
        }
        if !(0.0..=100.0).contains(&self.min_confidence) {
            return Err(invalid("min_confidence", "must be within [0, 100]"));
        }
        if self.crop_size == 0 {
            return Err(invalid("crop_size", "must be positive"));
        }
        if self.min_enroll_samples == 0 {
            return Err(invalid("min_enroll_samples", "must be positive"));
        }
        Ok(())
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }

    /// Resolve `path` (relative paths against `capture_dir`) to an existing
    /// file under `capture_dir`. Symlinks and `..` are resolved first.
    pub fn capture_path(&self, path: &Path) -> Option<PathBuf> {
        let root = self.capture_dir.canonicalize().ok()?;
        let resolved = root.join(path).canonicalize().ok()?;
        (resolved.starts_with(&root) && resolved.is_file()).then_some(resolved)
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn override_parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable setting override"),
    }
}

fn unit_range(name: &'static str, value: f32) -> Result<(), SettingsError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(name, "must be within [0, 1]"))
    }
}

fn invalid(name: &'static str, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        name,
        reason: reason.to_string(),
    }
}

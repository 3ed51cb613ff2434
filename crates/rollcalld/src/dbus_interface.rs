use rollcall_core::{PipelineError, RebuildReport, ReferenceSetHandle, Settings};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, PoisonError};
use zbus::{fdo, interface};

use crate::engine::{EngineError, EngineHandle, ImageSource};
use crate::rebuild::{LastReport, RebuildHandle};

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    rebuilder: RebuildHandle,
    reference: Arc<ReferenceSetHandle>,
    last_report: LastReport,
    settings: Settings,
}

#[derive(Serialize)]
struct Status {
    version: &'static str,
    is_trained: bool,
    identities: usize,
    samples: usize,
    dimension: Option<usize>,
    last_rebuild: Option<RebuildReport>,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        rebuilder: RebuildHandle,
        reference: Arc<ReferenceSetHandle>,
        last_report: LastReport,
        settings: Settings,
    ) -> Self {
        Self {
            engine,
            rebuilder,
            reference,
            last_report,
            settings,
        }
    }

    async fn recognize(&self, source: ImageSource) -> fdo::Result<String> {
        let result = self.engine.recognize(source).await.map_err(to_fdo)?;
        to_json(&result)
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Recognize faces in an encoded image. Returns the frame result as JSON.
    async fn recognize_image(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "recognize_image requested");
        self.recognize(ImageSource::Bytes(image)).await
    }

    /// Recognize faces in an image file under the configured capture directory.
    ///
    /// Any bus client may call this, so paths that resolve outside
    /// `capture_dir` are refused.
    async fn recognize_file(&self, path: &str) -> fdo::Result<String> {
        tracing::info!(path, "recognize_file requested");
        let Some(resolved) = self.settings.capture_path(Path::new(path)) else {
            tracing::warn!(path, capture_dir = %self.settings.capture_dir.display(), "refusing path outside capture directory");
            return Err(fdo::Error::AccessDenied(format!(
                "{path} is not a file under {}",
                self.settings.capture_dir.display()
            )));
        };
        self.recognize(ImageSource::Path(resolved)).await
    }

    /// Rebuild the reference set from enrollment samples and wait for the report.
    async fn rebuild(&self) -> fdo::Result<String> {
        tracing::info!("rebuild requested");
        let report = self.rebuilder.rebuild().await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Queue a rebuild and return immediately.
    async fn request_rebuild(&self) -> fdo::Result<()> {
        tracing::info!("background rebuild requested");
        self.rebuilder.request().map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let set = self.reference.snapshot();
        let status = Status {
            version: env!("CARGO_PKG_VERSION"),
            is_trained: !set.is_empty(),
            identities: set.identity_count(),
            samples: set.sample_count(),
            dimension: set.dimension(),
            last_rebuild: self
                .last_report
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        };
        to_json(&status)
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialize: {e}")))
}

fn to_fdo(e: EngineError) -> fdo::Error {
    match e {
        EngineError::Pipeline(PipelineError::Input(err)) => fdo::Error::InvalidArgs(err.to_string()),
        EngineError::ChannelClosed => fdo::Error::ServiceUnknown("engine thread exited".into()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

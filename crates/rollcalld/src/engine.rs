use rollcall_core::{AttendancePipeline, BuildError, FrameResult, PipelineError, RebuildReport, ReferenceSetHandle};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::rebuild::RebuildHandle;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("rebuild failed: {0}")]
    Build(#[from] BuildError),
    #[error("cannot scan sample directory: {0}")]
    Samples(#[source] std::io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Where the frame to recognize comes from.
pub enum ImageSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        source: ImageSource,
        reply: oneshot::Sender<Result<FrameResult, EngineError>>,
    },
}

/// Clone-safe handle to the recognition thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Recognize every face in one frame against the current reference set.
    pub async fn recognize(&self, source: ImageSource) -> Result<FrameResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                source,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the recognition engine on a dedicated OS thread.
///
/// The thread owns its own detector and embedder. Matching always runs on a
/// snapshot of `reference`, so a concurrent rebuild never blocks it. If the
/// set is still empty at the first request, one blocking rebuild runs first.
pub fn spawn_engine(
    mut pipeline: AttendancePipeline,
    reference: Arc<ReferenceSetHandle>,
    rebuilder: RebuildHandle,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut lazy_build_attempted = false;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { source, reply } => {
                        if !lazy_build_attempted && !reference.is_trained() {
                            lazy_build_attempted = true;
                            lazy_build(&rebuilder);
                        }
                        let snapshot = reference.snapshot();
                        let result = match source {
                            ImageSource::Bytes(bytes) => pipeline.recognize_bytes(&snapshot, &bytes),
                            ImageSource::Path(path) => pipeline.recognize_path(&snapshot, &path),
                        };
                        if let Err(e) = &result {
                            if e.is_configuration() {
                                tracing::error!(error = %e, "recognition misconfigured");
                            }
                        }
                        let _ = reply.send(result.map_err(EngineError::from));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn lazy_build(rebuilder: &RebuildHandle) {
    tracing::info!("reference set empty, building before first recognition");
    match rebuilder.rebuild_blocking() {
        Ok(RebuildReport { success: true, .. }) => {}
        Ok(report) => tracing::warn!(message = %report.message, "initial build produced no identities"),
        Err(e) => tracing::warn!(error = %e, "initial build failed"),
    }
}

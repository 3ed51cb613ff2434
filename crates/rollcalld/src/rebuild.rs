use rollcall_core::{AttendancePipeline, RebuildReport, ReferenceSetHandle, ReferenceStore, SampleLibrary};
use rollcall_store::SqliteStore;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::engine::EngineError;

/// Most recent rebuild outcome, shared with the status endpoint.
pub type LastReport = Arc<Mutex<Option<RebuildReport>>>;

struct RebuildRequest {
    /// `None` for fire-and-forget requests.
    reply: Option<oneshot::Sender<Result<RebuildReport, EngineError>>>,
}

/// Clone-safe handle to the rebuild thread. Requests run one at a time in order.
#[derive(Clone)]
pub struct RebuildHandle {
    tx: mpsc::Sender<RebuildRequest>,
}

impl RebuildHandle {
    /// Rebuild and wait for the report.
    pub async fn rebuild(&self) -> Result<RebuildReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RebuildRequest { reply: Some(reply_tx) })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Queue a rebuild without waiting.
    ///
    /// A full queue already holds a rebuild that will see the same samples,
    /// so the request is dropped.
    pub fn request(&self) -> Result<(), EngineError> {
        match self.tx.try_send(RebuildRequest { reply: None }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("rebuild already queued, coalescing request");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(EngineError::ChannelClosed),
        }
    }

    /// Rebuild from a non-async thread and wait for the report.
    pub fn rebuild_blocking(&self) -> Result<RebuildReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(RebuildRequest { reply: Some(reply_tx) })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the rebuild worker on its own OS thread with its own models.
pub fn spawn_rebuilder(
    mut pipeline: AttendancePipeline,
    library: SampleLibrary,
    reference: Arc<ReferenceSetHandle>,
    store: Arc<SqliteStore>,
    last_report: LastReport,
) -> Result<RebuildHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<RebuildRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-rebuild".into())
        .spawn(move || {
            tracing::info!(samples = %library.root().display(), "rebuild thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = run_rebuild(&mut pipeline, &library, &reference, store.as_ref());
                match &result {
                    Ok(report) => {
                        tracing::info!(
                            success = report.success,
                            processed = report.processed_count,
                            failed = report.failed_count,
                            persisted = report.persisted,
                            "rebuild finished"
                        );
                        *last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
                    }
                    Err(e) => tracing::error!(error = %e, "rebuild aborted"),
                }
                if let Some(reply) = req.reply {
                    let _ = reply.send(result);
                }
            }
            tracing::info!("rebuild thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(RebuildHandle { tx })
}

fn run_rebuild(
    pipeline: &mut AttendancePipeline,
    library: &SampleLibrary,
    reference: &ReferenceSetHandle,
    store: &SqliteStore,
) -> Result<RebuildReport, EngineError> {
    let samples = library.scan().map_err(EngineError::Samples)?;
    let store: &dyn ReferenceStore = store;
    Ok(pipeline.reference_builder().rebuild(reference, Some(store), &samples)?)
}

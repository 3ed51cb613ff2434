use anyhow::{Context, Result};
use rollcall_core::{AttendancePipeline, ReferenceSet, ReferenceSetHandle, ReferenceStore, SampleLibrary, Settings};
use rollcall_store::SqliteStore;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;
mod rebuild;

const BUS_NAME: &str = "org.rollcall.Attendance1";
const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let settings = Settings::load().context("loading settings")?;
    let store = Arc::new(
        SqliteStore::open(&settings.db_path)
            .with_context(|| format!("opening database {}", settings.db_path.display()))?,
    );

    let initial = match store.load() {
        Ok(Some(set)) => set,
        Ok(None) => {
            tracing::info!("no persisted reference set, will build on first request");
            ReferenceSet::empty()
        }
        Err(e) => {
            tracing::warn!(error = %e, "persisted reference set unreadable, will rebuild on first request");
            ReferenceSet::empty()
        }
    };
    let reference = Arc::new(ReferenceSetHandle::new(initial));
    let last_report = Arc::new(Mutex::new(None));

    // Recognition and rebuilds each own a model pair so neither waits on the other.
    let directory: Arc<SqliteStore> = Arc::clone(&store);
    let recognizer = AttendancePipeline::from_settings(&settings)
        .context("loading models for recognition")?
        .with_directory(directory);
    let rebuild_pipeline = AttendancePipeline::from_settings(&settings).context("loading models for rebuilds")?;

    let rebuilder = rebuild::spawn_rebuilder(
        rebuild_pipeline,
        SampleLibrary::new(&settings.samples_dir),
        Arc::clone(&reference),
        Arc::clone(&store),
        Arc::clone(&last_report),
    )?;
    let engine = engine::spawn_engine(recognizer, Arc::clone(&reference), rebuilder.clone())?;

    let service = dbus_interface::AttendanceService::new(engine, rebuilder, reference, last_report, settings);
    let bus = if std::env::var_os("ROLLCALL_SESSION_BUS").is_some() {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = bus
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

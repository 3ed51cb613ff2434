use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    AttendancePipeline, FrameResult, RebuildReport, ReferenceSetHandle, ReferenceStore, SampleLibrary, Settings,
};
use rollcall_store::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall classroom attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize enrolled identities in one or more images
    Recognize {
        /// Image files to process
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Print the raw frame result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Enroll an identity from sample photos and rebuild
    Enroll {
        /// Identity key (e.g., student number)
        identity: String,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Sample photos of the person
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Remove an identity and its samples, then rebuild
    Remove {
        identity: String,
    },
    /// Rebuild the reference set from all enrollment samples
    Rebuild,
    /// List enrolled identities
    List,
    /// Show reference set and daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn request_rebuild(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings::load().context("loading settings")?;
    let store = Arc::new(
        SqliteStore::open(&settings.db_path)
            .with_context(|| format!("opening database {}", settings.db_path.display()))?,
    );
    let library = SampleLibrary::new(&settings.samples_dir);

    match cli.command {
        Commands::Recognize { images, json } => {
            let mut pipeline = AttendancePipeline::from_settings(&settings)?.with_directory(store.clone());
            let handle = ReferenceSetHandle::new(store.load()?.unwrap_or_default());
            if !handle.is_trained() {
                println!("No reference set stored yet, building from samples...");
                let report = rebuild(&mut pipeline, &library, &handle, &store)?;
                print_report(&report);
            }

            let reference = handle.snapshot();
            for path in &images {
                let result = pipeline
                    .recognize_path(&reference, path)
                    .with_context(|| format!("recognizing {}", path.display()))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                } else {
                    print_frame(path, &result);
                }
            }
        }
        Commands::Enroll { identity, name, images } => {
            let mut pipeline = AttendancePipeline::from_settings(&settings)?;
            let summary = pipeline.enroll_samples(&library, &identity, &images, settings.min_enroll_samples)?;
            store.upsert_identity(&identity, &name)?;
            println!(
                "Enrolled {identity} ({name}): {} samples stored, {} skipped",
                summary.written.len(),
                summary.failed
            );

            let handle = ReferenceSetHandle::new(store.load()?.unwrap_or_default());
            let report = rebuild(&mut pipeline, &library, &handle, &store)?;
            print_report(&report);
            notify_daemon().await;
        }
        Commands::Remove { identity } => {
            let had_samples = library.remove(&identity)?;
            let had_record = store.remove_identity(&identity)?;
            if !had_samples && !had_record {
                bail!("identity {identity} is not enrolled");
            }
            println!("Removed {identity}");

            let mut pipeline = AttendancePipeline::from_settings(&settings)?;
            let handle = ReferenceSetHandle::new(store.load()?.unwrap_or_default());
            let report = rebuild(&mut pipeline, &library, &handle, &store)?;
            print_report(&report);
            if !report.success {
                println!("The previous reference set is still in use until a successful rebuild.");
            }
            notify_daemon().await;
        }
        Commands::Rebuild => {
            let mut pipeline = AttendancePipeline::from_settings(&settings)?;
            let handle = ReferenceSetHandle::new(store.load()?.unwrap_or_default());
            let report = rebuild(&mut pipeline, &library, &handle, &store)?;
            print_report(&report);
            notify_daemon().await;
        }
        Commands::List => {
            let samples = library.scan()?;
            let identities = store.list_identities()?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for record in identities {
                let count = samples.get(&record.key).map_or(0, Vec::len);
                println!("{:<16} {:<32} {count} samples", record.key, record.display_name);
            }
        }
        Commands::Status => {
            match store.last_build()? {
                Some(info) => println!(
                    "Stored reference set: {} identities, {} samples, {}-dim, built {}",
                    info.identity_count, info.sample_count, info.dimension, info.built_at
                ),
                None => println!("Stored reference set: none (untrained)"),
            }
            match daemon_status().await {
                Ok(status) => println!("rollcalld: {status}"),
                Err(e) => println!("rollcalld: not connected ({e})"),
            }
        }
    }

    Ok(())
}

fn rebuild(
    pipeline: &mut AttendancePipeline,
    library: &SampleLibrary,
    handle: &ReferenceSetHandle,
    store: &SqliteStore,
) -> Result<RebuildReport> {
    let samples = library.scan().context("scanning sample directory")?;
    let store: &dyn ReferenceStore = store;
    Ok(pipeline.reference_builder().rebuild(handle, Some(store), &samples)?)
}

fn print_report(report: &RebuildReport) {
    println!("{}", report.message);
    for (identity, count) in &report.per_identity_counts {
        println!("  {identity}: {count} embeddings");
    }
    if !report.skipped_identities.is_empty() {
        println!("  skipped (no usable samples): {}", report.skipped_identities.join(", "));
    }
    if report.success && !report.persisted {
        println!("  warning: reference set was not saved to the database");
    }
}

fn print_frame(path: &std::path::Path, result: &FrameResult) {
    println!("{}: {} face(s)", path.display(), result.len());
    for entry in &result.entries {
        let b = entry.bbox;
        let region = format!("[{},{} {}x{}]", b.x, b.y, b.width, b.height);
        match &entry.matched {
            Some(m) => println!(
                "  {region} {} {}({:.1}%, distance {:.3})",
                m.identity_key,
                m.display_name.as_deref().map(|n| format!("{n} ")).unwrap_or_default(),
                m.confidence,
                m.distance
            ),
            None => println!("  {region} unknown"),
        }
    }
}

async fn connect() -> zbus::Result<zbus::Connection> {
    if std::env::var_os("ROLLCALL_SESSION_BUS").is_some() {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
}

async fn daemon_status() -> zbus::Result<String> {
    let conn = connect().await?;
    AttendanceProxy::new(&conn).await?.status().await
}

async fn request_daemon_rebuild() -> zbus::Result<()> {
    let conn = connect().await?;
    AttendanceProxy::new(&conn).await?.request_rebuild().await
}

/// Ask a running daemon to pick up sample changes. Best effort.
async fn notify_daemon() {
    match request_daemon_rebuild().await {
        Ok(()) => println!("rollcalld notified"),
        Err(e) => tracing::debug!(error = %e, "daemon not reachable, skipping notification"),
    }
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facetrace_hw::{audio, Camera};
use facetrace_store::{ArtifactStore, ArtifactSummary};
use futures::StreamExt;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facetrace.Recorder1",
    default_service = "org.facetrace.Recorder1",
    default_path = "/org/facetrace/Recorder1"
)]
trait Recorder1 {
    fn start_recording(&self) -> zbus::Result<bool>;
    fn stop_recording(&self) -> zbus::Result<bool>;
    fn is_recording(&self) -> zbus::Result<bool>;
    fn list_artifacts(&self) -> zbus::Result<String>;
    fn delete_artifact(&self, position: u32) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn artifact_saved(&self, id: i64) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "facetrace", about = "facetrace recording controls and gallery")]
struct Cli {
    /// Artifact database (default: $XDG_DATA_HOME/facetrace/artifacts.db)
    #[arg(long, global = true, env = "FACETRACE_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Control recording on the running daemon
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// List stored recordings
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete the recording at a gallery position
    Delete { position: usize },
    /// Write the recording at a gallery position to a file
    Export { position: usize, path: PathBuf },
    /// Reprint the gallery whenever the daemon saves a recording
    Watch,
    /// List cameras and audio capture inputs
    Devices,
    /// Show daemon status
    Status,
    /// Capture one frame straight from a camera (bypasses the daemon)
    Snapshot {
        path: PathBuf,
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
    },
}

#[derive(Subcommand)]
enum RecordAction {
    Start,
    Stop,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(facetrace_store::default_db_path);

    match cli.command {
        Commands::Record { action } => {
            let proxy = daemon().await?;
            let recording = match action {
                RecordAction::Start => proxy.start_recording().await?,
                RecordAction::Stop => proxy.stop_recording().await?,
                RecordAction::Status => proxy.is_recording().await?,
            };
            println!("{}", if recording { "recording" } else { "idle" });
        }
        Commands::List { json } => {
            let store = open_store(&db_path).await?;
            let summaries = store.summaries().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_gallery(&summaries);
            }
        }
        Commands::Delete { position } => {
            let store = open_store(&db_path).await?;
            match store.delete_at(position).await? {
                Some(id) => println!("Deleted recording {id} (position {position})"),
                None => println!("No recording at position {position}"),
            }
        }
        Commands::Export { position, path } => {
            let store = open_store(&db_path).await?;
            let Some(artifact) = store.get_at(position).await? else {
                bail!("no recording at position {position}");
            };
            std::fs::write(&path, &artifact.data)
                .with_context(|| format!("writing {}", path.display()))?;
            println!(
                "Wrote recording {} ({}, {} bytes) to {}",
                artifact.id,
                artifact.mime,
                artifact.data.len(),
                path.display()
            );
        }
        Commands::Watch => {
            let store = open_store(&db_path).await?;
            let proxy = daemon().await?;
            let mut saved = proxy.receive_artifact_saved().await?;
            print_gallery(&store.summaries().await?);
            while let Some(signal) = saved.next().await {
                let args = signal.args()?;
                println!("\nSaved recording {}", args.id);
                print_gallery(&store.summaries().await?);
            }
        }
        Commands::Devices => {
            let cameras = Camera::list_devices();
            println!("Cameras:");
            if cameras.is_empty() {
                println!("  (none)");
            }
            for dev in cameras {
                println!("  {}  {} [{}] {}", dev.path, dev.name, dev.driver, dev.bus);
            }
            let inputs = audio::list_inputs();
            println!("Audio inputs:");
            if inputs.is_empty() {
                println!("  (none)");
            }
            for input in inputs {
                println!("  {input}");
            }
        }
        Commands::Status => match daemon().await {
            Ok(proxy) => {
                let status = proxy.status().await?;
                let value: serde_json::Value = serde_json::from_str(&status)?;
                println!("{}", serde_json::to_string_pretty(&value)?);
            }
            Err(e) => {
                tracing::debug!(error = %e, "daemon unreachable");
                println!("facetraced: not connected");
            }
        },
        Commands::Snapshot {
            path,
            device,
            width,
            height,
        } => {
            let camera = Camera::open(&device, width, height)?;
            let frame = camera.capture_frame()?;
            frame
                .image
                .save(&path)
                .with_context(|| format!("saving {}", path.display()))?;
            println!(
                "Saved {}x{} frame from {} to {}",
                frame.width(),
                frame.height(),
                device,
                path.display()
            );
        }
    }

    Ok(())
}

async fn daemon() -> Result<Recorder1Proxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let proxy = Recorder1Proxy::new(&conn).await?;
    Ok(proxy)
}

async fn open_store(path: &Path) -> Result<ArtifactStore> {
    ArtifactStore::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))
}

fn print_gallery(summaries: &[ArtifactSummary]) {
    if summaries.is_empty() {
        println!("No recordings");
        return;
    }
    println!("{:>4}  {:>6}  {:<19}  {:>10}  MIME", "POS", "ID", "CREATED", "BYTES");
    for (position, summary) in summaries.iter().enumerate() {
        println!(
            "{:>4}  {:>6}  {:<19}  {:>10}  {}",
            position,
            summary.id,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.size,
            summary.mime
        );
    }
}

use anyhow::{Context, Result};
use facetrace_store::ArtifactStore;
use tracing_subscriber::EnvFilter;

mod compositor;
mod config;
mod dbus_interface;
mod detection;
mod encoder;
mod engine;
mod pipeline;
mod recorder;

use config::Config;
use dbus_interface::{FacetraceService, BUS_NAME, OBJECT_PATH};
use pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facetraced starting");

    let config = Config::from_env();
    tracing::debug!(?config, "configuration loaded");

    let store = ArtifactStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening artifact store at {}", config.db_path.display()))?;

    let mut pipeline = Pipeline::start(&config, store.clone()).await?;

    let service = FacetraceService::new(pipeline.recorder(), store, pipeline.status_reporter());
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;
    let forwarder = tokio::spawn(dbus_interface::forward_saved(
        conn.clone(),
        pipeline.subscribe_saved(),
    ));

    let status = pipeline.status().await;
    tracing::info!(
        bus = BUS_NAME,
        camera = %status.camera,
        width = status.width,
        height = status.height,
        audio = ?status.audio,
        container = ?status.container,
        "facetraced ready"
    );

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("waiting for ctrl-c"),
        error = pipeline.model_load() => Err(anyhow::Error::new(error)),
    };
    match &outcome {
        Ok(()) => tracing::info!("facetraced shutting down"),
        Err(e) => tracing::error!(error = %e, "facetraced stopping"),
    }

    pipeline.shutdown().await;
    forwarder.abort();
    drop(conn);

    outcome
}

use crate::pipeline::StatusReporter;
use crate::recorder::RecorderHandle;
use facetrace_store::{ArtifactId, ArtifactStore};
use tokio::sync::broadcast;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.facetrace.Recorder1";
pub const OBJECT_PATH: &str = "/org/facetrace/Recorder1";

/// D-Bus interface for the facetrace recording daemon.
///
/// Bus name: org.facetrace.Recorder1
/// Object path: /org/facetrace/Recorder1
pub struct FacetraceService {
    recorder: RecorderHandle,
    store: ArtifactStore,
    reporter: StatusReporter,
}

impl FacetraceService {
    pub fn new(recorder: RecorderHandle, store: ArtifactStore, reporter: StatusReporter) -> Self {
        Self {
            recorder,
            store,
            reporter,
        }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.facetrace.Recorder1")]
impl FacetraceService {
    /// Begin recording the composited stream. Returns whether a recording is now active.
    async fn start_recording(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start_recording requested");
        self.recorder.start().await.map_err(failed)?;
        self.recorder.is_recording().await.map_err(failed)
    }

    /// Stop the active recording. Returns whether a recording is still active.
    async fn stop_recording(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop_recording requested");
        self.recorder.stop().await.map_err(failed)?;
        self.recorder.is_recording().await.map_err(failed)
    }

    async fn is_recording(&self) -> zbus::fdo::Result<bool> {
        self.recorder.is_recording().await.map_err(failed)
    }

    /// Gallery listing as a JSON array of artifact summaries.
    async fn list_artifacts(&self) -> zbus::fdo::Result<String> {
        let summaries = self.store.summaries().await.map_err(|e| {
            tracing::warn!(error = %e, "list_artifacts failed");
            failed(e)
        })?;
        serde_json::to_string(&summaries).map_err(failed)
    }

    /// Delete the artifact at `position` in the gallery listing.
    async fn delete_artifact(&self, position: u32) -> zbus::fdo::Result<bool> {
        tracing::info!(position, "delete_artifact requested");
        let deleted = self.store.delete_at(position as usize).await.map_err(|e| {
            tracing::warn!(error = %e, position, "delete_artifact failed");
            failed(e)
        })?;
        Ok(deleted.is_some())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.reporter.status().await).map_err(failed)
    }

    /// Emitted once for every recording that reaches the store.
    #[zbus(signal)]
    async fn artifact_saved(emitter: &SignalEmitter<'_>, id: i64) -> zbus::Result<()>;
}

/// Forward saved-artifact notifications as `ArtifactSaved` signals until the
/// recorder goes away.
pub async fn forward_saved(conn: zbus::Connection, mut saved: broadcast::Receiver<ArtifactId>) {
    let emitter = match SignalEmitter::new(&conn, OBJECT_PATH) {
        Ok(emitter) => emitter,
        Err(e) => {
            tracing::error!(error = %e, "invalid object path for signals");
            return;
        }
    };

    loop {
        match saved.recv().await {
            Ok(id) => {
                if let Err(e) = FacetraceService::artifact_saved(&emitter, id.0).await {
                    tracing::warn!(error = %e, id = %id, "failed to emit ArtifactSaved");
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "ArtifactSaved notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

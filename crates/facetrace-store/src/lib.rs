//! facetrace-store: recorded artifacts persisted in a local SQLite database.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use thiserror::Error;

pub use store::ArtifactStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to create store directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Store-assigned identifier. Monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub i64);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One assembled recording, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub data: Vec<u8>,
    pub mime: String,
}

impl Artifact {
    pub fn new(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            data,
            mime: mime.into(),
        }
    }
}

/// An artifact as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub id: ArtifactId,
    pub mime: String,
    pub created_at: DateTime<Utc>,
    pub data: Vec<u8>,
}

/// Gallery row: everything but the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub id: ArtifactId,
    pub mime: String,
    pub created_at: DateTime<Utc>,
    pub size: usize,
}

/// Where finished recordings are persisted.
pub trait ArtifactSink: Send + Sync + 'static {
    fn put(&self, artifact: Artifact)
        -> impl Future<Output = Result<ArtifactId, StoreError>> + Send;
}

/// Default database path: `$XDG_DATA_HOME/facetrace/artifacts.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facetrace/artifacts.db")
}

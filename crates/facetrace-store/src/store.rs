//! SQLite-backed artifact store.
//!
//! All queries run on the `tokio-rusqlite` connection thread. Ids come from
//! a counter row in `store_meta` rather than SQLite's rowid, so deleting the
//! newest artifact never frees its id for reuse.

use crate::{Artifact, ArtifactId, ArtifactSink, ArtifactSummary, StoreError, StoredArtifact};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::future::Future;
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS artifacts (
    id          INTEGER PRIMARY KEY,
    mime        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    data        BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS store_meta (
    key    TEXT PRIMARY KEY,
    value  INTEGER NOT NULL
);
INSERT OR IGNORE INTO store_meta (key, value)
    SELECT 'next_id', COALESCE(MAX(id), 0) + 1 FROM artifacts;
";

#[derive(Clone)]
pub struct ArtifactStore {
    conn: Connection,
}

impl ArtifactStore {
    /// Open (or create) the store at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).await?;
        let store = Self { conn };
        store.init().await?;
        tracing::info!(path = %path.display(), "artifact store opened");
        Ok(store)
    }

    /// Private in-memory store; contents vanish with the last clone.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Persist one artifact and return its new id.
    pub async fn put(&self, artifact: Artifact) -> Result<ArtifactId, StoreError> {
        let created_at = Utc::now().to_rfc3339();
        let size = artifact.data.len();
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id: i64 = tx.query_row(
                    "SELECT value FROM store_meta WHERE key = 'next_id'",
                    [],
                    |row| row.get(0),
                )?;
                tx.execute(
                    "INSERT INTO artifacts (id, mime, created_at, data) VALUES (?1, ?2, ?3, ?4)",
                    params![id, artifact.mime, created_at, artifact.data],
                )?;
                tx.execute(
                    "UPDATE store_meta SET value = ?1 WHERE key = 'next_id'",
                    params![id + 1],
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await?;

        tracing::info!(id, size, "artifact stored");
        Ok(ArtifactId(id))
    }

    /// Every artifact, oldest first.
    pub async fn list_all(&self) -> Result<Vec<StoredArtifact>, StoreError> {
        let artifacts = self
            .conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id, mime, created_at, data FROM artifacts ORDER BY id")?;
                let rows = stmt.query_map([], stored_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(artifacts)
    }

    /// Gallery listing in the same order as [`list_all`](Self::list_all), without blobs.
    pub async fn summaries(&self) -> Result<Vec<ArtifactSummary>, StoreError> {
        let summaries = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, mime, created_at, length(data) FROM artifacts ORDER BY id",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ArtifactSummary {
                        id: ArtifactId(row.get(0)?),
                        mime: row.get(1)?,
                        created_at: timestamp_column(row, 2)?,
                        size: row.get::<_, i64>(3)? as usize,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        Ok(summaries)
    }

    /// Delete the artifact at `position` in the current enumeration.
    ///
    /// Positions past the end delete nothing and return `None`.
    pub async fn delete_at(&self, position: usize) -> Result<Option<ArtifactId>, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let id = id_at(&tx, position)?;
                if let Some(id) = id {
                    tx.execute("DELETE FROM artifacts WHERE id = ?1", params![id])?;
                }
                tx.commit()?;
                Ok(id)
            })
            .await?;

        match deleted {
            Some(id) => tracing::info!(id, position, "artifact deleted"),
            None => tracing::debug!(position, "delete past end of gallery, nothing removed"),
        }
        Ok(deleted.map(ArtifactId))
    }

    /// Read the artifact at `position` in the current enumeration.
    pub async fn get_at(&self, position: usize) -> Result<Option<StoredArtifact>, StoreError> {
        let artifact = self
            .conn
            .call(move |conn| {
                let Some(id) = id_at(conn, position)? else {
                    return Ok(None);
                };
                let artifact = conn
                    .query_row(
                        "SELECT id, mime, created_at, data FROM artifacts WHERE id = ?1",
                        params![id],
                        stored_from_row,
                    )
                    .optional()?;
                Ok(artifact)
            })
            .await?;
        Ok(artifact)
    }
}

impl ArtifactSink for ArtifactStore {
    fn put(&self, artifact: Artifact) -> impl Future<Output = Result<ArtifactId, StoreError>> + Send {
        ArtifactStore::put(self, artifact)
    }
}

/// Walk ids in enumeration order, counting positions.
fn id_at(conn: &rusqlite::Connection, position: usize) -> rusqlite::Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT id FROM artifacts ORDER BY id")?;
    let mut rows = stmt.query([])?;
    let mut index = 0usize;
    while let Some(row) = rows.next()? {
        if index == position {
            return Ok(Some(row.get(0)?));
        }
        index += 1;
    }
    Ok(None)
}

fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<StoredArtifact> {
    Ok(StoredArtifact {
        id: ArtifactId(row.get(0)?),
        mime: row.get(1)?,
        created_at: timestamp_column(row, 2)?,
        data: row.get(3)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(bytes: &[u8]) -> Artifact {
        Artifact::new(bytes.to_vec(), "video/webm")
    }

    async fn store_with(n: u8) -> ArtifactStore {
        let store = ArtifactStore::open_in_memory().await.unwrap();
        for i in 0..n {
            store.put(artifact(&[i; 4])).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_put_then_list_keeps_order() {
        let store = ArtifactStore::open_in_memory().await.unwrap();
        let a = store.put(artifact(b"first")).await.unwrap();
        let b = store.put(artifact(b"second")).await.unwrap();
        assert!(b > a);

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, a);
        assert_eq!(all[0].data, b"first");
        assert_eq!(all[1].id, b);
        assert_eq!(all[1].data, b"second");
        assert_eq!(all[1].mime, "video/webm");
    }

    #[tokio::test]
    async fn test_summaries_report_size_without_blob() {
        let store = ArtifactStore::open_in_memory().await.unwrap();
        store
            .put(Artifact::new(vec![0; 1234], "video/x-matroska"))
            .await
            .unwrap();
        let summaries = store.summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].size, 1234);
        assert_eq!(summaries[0].mime, "video/x-matroska");
    }

    #[tokio::test]
    async fn test_delete_at_removes_exactly_that_position() {
        let store = store_with(3).await;
        let before = store.list_all().await.unwrap();

        let deleted = store.delete_at(1).await.unwrap();
        assert_eq!(deleted, Some(before[1].id));

        let after = store.list_all().await.unwrap();
        let ids: Vec<ArtifactId> = after.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![before[0].id, before[2].id]);
        assert_eq!(after[0].data, before[0].data);
        assert_eq!(after[1].data, before[2].data);
    }

    #[tokio::test]
    async fn test_delete_out_of_range_is_noop() {
        let store = store_with(2).await;
        assert_eq!(store.delete_at(2).await.unwrap(), None);
        assert_eq!(store.delete_at(usize::MAX).await.unwrap(), None);
        assert_eq!(store.list_all().await.unwrap().len(), 2);

        let empty = ArtifactStore::open_in_memory().await.unwrap();
        assert_eq!(empty.delete_at(0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ids_never_reused_after_delete() {
        let store = store_with(2).await;
        let newest = store.list_all().await.unwrap()[1].id;
        store.delete_at(1).await.unwrap();

        let next = store.put(artifact(b"again")).await.unwrap();
        assert!(next > newest, "{next} should be past {newest}");
    }

    #[tokio::test]
    async fn test_get_at() {
        let store = store_with(3).await;
        let third = store.get_at(2).await.unwrap().unwrap();
        assert_eq!(third.data, vec![2; 4]);
        assert!(store.get_at(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_counter() {
        let dir = std::env::temp_dir().join(format!("facetrace-store-test-{}", std::process::id()));
        let path = dir.join("artifacts.db");
        let _ = std::fs::remove_dir_all(&dir);

        let first = {
            let store = ArtifactStore::open(&path).await.unwrap();
            let id = store.put(artifact(b"one")).await.unwrap();
            store.delete_at(0).await.unwrap();
            id
        };

        let store = ArtifactStore::open(&path).await.unwrap();
        let second = store.put(artifact(b"two")).await.unwrap();
        assert!(second > first);

        let _ = std::fs::remove_dir_all(&dir);
    }
}

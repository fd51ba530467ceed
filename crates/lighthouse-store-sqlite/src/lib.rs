#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **lighthouse-store-sqlite** – SQLite-based storage driver for Lighthouse.
//!
//! A single-file embedded backend using sqlx with the database in
//! write-ahead-logging mode, giving the same append/scan semantics as the
//! segmented log driver. WAL recovery discards partial transactions on open,
//! so the store resumes from the highest intact sequence after a crash.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::info;

use lighthouse_event_core::{EventBackend, FsyncPolicy, SealedFrame};

/// A persistent storage backend using SQLite in WAL mode.
///
/// Frames are stored keyed by their dense sequence with side columns for
/// aggregate, event type, and timestamp so range queries can be served from
/// indices without decoding the opaque record bytes.
#[derive(Debug)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Opens or creates a database at `path`, configured for WAL mode.
    ///
    /// `fsync_policy` maps onto SQLite's synchronous pragma: per-write
    /// durability uses `FULL`, everything else `NORMAL`.
    pub async fn open<P: AsRef<Path>>(path: P, fsync_policy: FsyncPolicy) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(match fsync_policy {
                FsyncPolicy::PerWrite => SqliteSynchronous::Full,
                _ => SqliteSynchronous::Normal,
            });
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let backend = Self { pool };
        backend.migrate().await?;
        info!(path = %path.as_ref().display(), "sqlite event store opened");
        Ok(backend)
    }

    /// Opens an in-memory database, useful for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let backend = Self { pool };
        backend.migrate().await?;
        Ok(backend)
    }

    /// Run database migrations to ensure the schema is current.
    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_frames (
                sequence INTEGER PRIMARY KEY,
                frame BLOB NOT NULL,
                aggregate_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp_ns INTEGER NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_frames_aggregate ON event_frames(aggregate_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_frames_type ON event_frames(event_type)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_frames_timestamp ON event_frames(timestamp_ns)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn tail_in_tx(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS tail FROM event_frames")
            .fetch_one(&mut **tx)
            .await?;
        Ok(row.get::<i64, _>("tail") as u64)
    }
}

#[async_trait]
impl EventBackend for SqliteBackend {
    async fn append(&self, sequence: u64, frame: &SealedFrame) -> Result<()> {
        self.append_batch(sequence, std::slice::from_ref(frame)).await
    }

    async fn append_batch(&self, first_sequence: u64, frames: &[SealedFrame]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let tail = Self::tail_in_tx(&mut tx).await?;
        if first_sequence != tail + 1 {
            bail!(
                "non-contiguous append: expected sequence {}, got {first_sequence}",
                tail + 1
            );
        }
        for (offset, frame) in frames.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO event_frames
                (sequence, frame, aggregate_id, event_type, timestamp_ns)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind((first_sequence + offset as u64) as i64)
            .bind(&frame.bytes)
            .bind(&frame.aggregate_id)
            .bind(&frame.event_type)
            .bind(frame.timestamp_ns as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, sequence: u64) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT frame FROM event_frames WHERE sequence = ?")
            .bind(sequence as i64)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("frame")))
    }

    async fn scan(&self, from_sequence: u64, limit: usize) -> Result<Vec<Vec<u8>>> {
        let rows = sqlx::query(
            "SELECT frame FROM event_frames WHERE sequence >= ? ORDER BY sequence LIMIT ?",
        )
        .bind(from_sequence as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("frame")).collect())
    }

    async fn tail_sequence(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(MAX(sequence), 0) AS tail FROM event_frames")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("tail") as u64)
    }

    async fn sync(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(FULL)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disk_usage(&self) -> Result<u64> {
        let row = sqlx::query(
            "SELECT page_count * page_size AS bytes FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("bytes") as u64)
    }

    async fn segment_count(&self) -> Result<usize> {
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> SealedFrame {
        SealedFrame {
            bytes: format!("frame-{n}-payload").into_bytes(),
            aggregate_id: format!("agent:{n}"),
            event_type: "command_received".to_string(),
            timestamp_ns: n * 1_000,
        }
    }

    #[tokio::test]
    async fn append_read_round_trip() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        for n in 1..=5 {
            backend.append(n, &frame(n)).await.unwrap();
        }
        assert_eq!(backend.tail_sequence().await.unwrap(), 5);
        assert_eq!(backend.read(3).await.unwrap().unwrap(), frame(3).bytes);
        assert!(backend.read(6).await.unwrap().is_none());

        let scanned = backend.scan(4, 10).await.unwrap();
        assert_eq!(scanned, vec![frame(4).bytes, frame(5).bytes]);
    }

    #[tokio::test]
    async fn rejects_non_contiguous_sequences() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.append(1, &frame(1)).await.unwrap();
        assert!(backend.append(5, &frame(5)).await.is_err());
        assert_eq!(backend.tail_sequence().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_is_transactional() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .append_batch(1, &[frame(1), frame(2), frame(3)])
            .await
            .unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 3);

        assert!(backend.append_batch(9, &[frame(9)]).await.is_err());
        assert_eq!(backend.tail_sequence().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let backend = SqliteBackend::open(&path, FsyncPolicy::PerWrite).await.unwrap();
            for n in 1..=10 {
                backend.append(n, &frame(n)).await.unwrap();
            }
            backend.close().await;
        }
        let backend = SqliteBackend::open(&path, FsyncPolicy::PerWrite).await.unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 10);
        assert_eq!(backend.read(7).await.unwrap().unwrap(), frame(7).bytes);
    }

    #[tokio::test]
    async fn empty_store_has_zero_tail() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        assert_eq!(backend.tail_sequence().await.unwrap(), 0);
        assert_eq!(backend.segment_count().await.unwrap(), 1);
    }
}

//! Durable FIFO queue of opaque byte batches.
//!
//! A single-writer, multi-reader file-backed FIFO with no auto-commit: a
//! caller must `task_done` an entry it `get_nowait`'d before it is actually
//! removed, so a crash between the two loses nothing. Backed by an embedded
//! SQL store in WAL mode, adapting `agent/src/database/db_queue.rs`'s
//! pending/sent schema shape to store opaque JSON batches instead of typed
//! metric rows.

use rusqlite::{params, Connection};
use shared::error::FlowError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tokio::time::sleep;

/// Returned by `get_nowait` when the queue has no pending entries.
#[derive(Debug)]
pub struct Empty;

pub struct DurableQueue {
    path: PathBuf,
}

impl DurableQueue {
    /// Open (creating if absent) the durable queue at `path`, retrying with
    /// exponential backoff (3 tries, 1s → cap 8s, ×2) before giving up.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref().to_path_buf();
        let mut attempt = 0u32;
        loop {
            match Self::try_open(&path) {
                Ok(()) => return Ok(Self { path }),
                Err(e) if attempt >= 2 => {
                    return Err(FlowError::Persistence(format!(
                        "failed to open durable queue at {}: {e}",
                        path.display()
                    )))
                }
                Err(_) => {
                    let delay = shared::utils::calculate_backoff_delay(attempt, 1000, 8000);
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Open with a backup path fallback: try `main_path`, then `backup_path`
    /// if given; a fatal "persistence unavailable" error otherwise.
    pub async fn open_with_backup(
        main_path: impl AsRef<Path>,
        backup_path: Option<impl AsRef<Path>>,
    ) -> Result<Self, FlowError> {
        match Self::open(main_path).await {
            Ok(queue) => Ok(queue),
            Err(primary_err) => match backup_path {
                Some(backup) => Self::open(backup).await,
                None => Err(primary_err),
            },
        }
    }

    fn try_open(path: &Path) -> rusqlite::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
                        Some(e.to_string()),
                    )
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS fifo_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload BLOB NOT NULL,
                acked BOOLEAN NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        Ok(())
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    /// Append a batch. Never blocks on a reader.
    pub async fn put_nowait(&self, payload: Vec<u8>) -> Result<(), FlowError> {
        let path = self.path.clone();
        task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            conn.execute(
                "INSERT INTO fifo_queue (payload, acked, created_at) VALUES (?1, 0, strftime('%s','now'))",
                params![payload],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| FlowError::Persistence(format!("put_nowait join error: {e}")))?
        .map_err(|e| FlowError::Persistence(format!("put_nowait failed: {e}")))
    }

    /// Return the oldest unacked, not-yet-fetched batch along with its id, or
    /// `Empty` if none is pending. Does not remove the entry — `task_done`
    /// commits the removal.
    pub async fn get_nowait(&self) -> Result<(i64, Vec<u8>), Empty> {
        let path = self.path.clone();
        let result = task::spawn_blocking(move || -> rusqlite::Result<Option<(i64, Vec<u8>)>> {
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "busy_timeout", 5000)?;
            let mut stmt = conn.prepare(
                "SELECT id, payload FROM fifo_queue WHERE acked = 0 ORDER BY id ASC LIMIT 1",
            )?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(Some((row.get(0)?, row.get(1)?))),
                None => Ok(None),
            }
        })
        .await;

        match result {
            Ok(Ok(Some(entry))) => Ok(entry),
            _ => Err(Empty),
        }
    }

    /// Acknowledge and remove entry `id`, committing the earlier `get_nowait`.
    pub async fn task_done(&self, id: i64) -> Result<(), FlowError> {
        let path = self.path.clone();
        task::spawn_blocking(move || -> rusqlite::Result<()> {
            let conn = Connection::open(&path)?;
            conn.execute("DELETE FROM fifo_queue WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
        .map_err(|e| FlowError::Persistence(format!("task_done join error: {e}")))?
        .map_err(|e| FlowError::Persistence(format!("task_done failed: {e}")))
    }

    /// Number of pending (un-acked) entries.
    pub async fn len(&self) -> Result<i64, FlowError> {
        let path = self.path.clone();
        task::spawn_blocking(move || -> rusqlite::Result<i64> {
            let conn = Connection::open(&path)?;
            conn.query_row("SELECT COUNT(*) FROM fifo_queue WHERE acked = 0", [], |r| r.get(0))
        })
        .await
        .map_err(|e| FlowError::Persistence(format!("len join error: {e}")))?
        .map_err(|e| FlowError::Persistence(format!("len failed: {e}")))
    }
}

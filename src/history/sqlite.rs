use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use super::{DiagnosisLog, HistoryEntry};
use crate::consts::DEFAULT_HISTORY_MAX_ENTRIES;

/// SQLite-backed diagnosis history, pruned to the newest `max_entries`.
pub struct SqliteHistory {
    conn: Mutex<Connection>,
    max_entries: usize,
}

impl SqliteHistory {
    /// Open or create the history table. Use `":memory:"` for tests.
    pub fn open(path: &str, max_entries: usize) -> Result<Self> {
        if path != ":memory:"
            && let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("failed to open history database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS diagnoses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
                request_id TEXT NOT NULL,
                image_digest TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
        )
        .context("failed to create history table")?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_entries,
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:", DEFAULT_HISTORY_MAX_ENTRIES)
    }

    fn decode(rows: Vec<(String, String, String)>) -> Result<Vec<HistoryEntry>> {
        rows.into_iter()
            .map(|(request_id, image_digest, payload)| {
                Ok(HistoryEntry {
                    request_id,
                    image_digest,
                    result: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DiagnosisLog for SqliteHistory {
    async fn record(&self, entry: HistoryEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.result)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO diagnoses (request_id, image_digest, payload) VALUES (?1, ?2, ?3)",
            [&entry.request_id, &entry.image_digest, &payload],
        )?;
        conn.execute(
            "DELETE FROM diagnoses WHERE id NOT IN (
                SELECT id FROM diagnoses ORDER BY id DESC LIMIT ?1
            )",
            [self.max_entries as i64],
        )?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let rows = {
            let conn = self.conn.lock().unwrap();
            // Newest `limit`, returned in chronological order
            let mut stmt = conn.prepare(
                "SELECT request_id, image_digest, payload FROM (
                    SELECT id, request_id, image_digest, payload
                    FROM diagnoses ORDER BY id DESC LIMIT ?1
                ) ORDER BY id ASC",
            )?;
            let rows: Vec<(String, String, String)> = stmt
                .query_map([limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<_, _>>()?;
            rows
        };
        Self::decode(rows)
    }

    async fn all(&self) -> Result<Vec<HistoryEntry>> {
        let rows = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT request_id, image_digest, payload FROM diagnoses ORDER BY id ASC",
            )?;
            let rows: Vec<(String, String, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<_, _>>()?;
            rows
        };
        Self::decode(rows)
    }

    async fn count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM diagnoses", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM diagnoses", [])?;
        Ok(())
    }
}

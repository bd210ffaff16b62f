use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::types::PendingSubmission;
use crate::db::{parse_datetime, Database};

/// SQLite mirror of the in-memory queue. Rows are ordered by insertion sequence.
#[derive(Clone)]
pub struct QueueStore {
  db: Arc<Database>,
}

impl QueueStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  /// All pending submissions in enqueue order.
  pub fn load(&self) -> Result<Vec<PendingSubmission>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, payload, metadata, enqueued_at, attempts FROM upload_queue ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>, String, String, u32)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to load upload queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read upload queue row: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, metadata, enqueued_at, attempts)| {
        let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata)
          .map_err(|e| eyre!("Failed to deserialize metadata of {}: {}", id, e))?;
        Ok(PendingSubmission {
          id: Uuid::parse_str(&id).map_err(|e| eyre!("Invalid submission id {}: {}", id, e))?,
          payload,
          metadata,
          enqueued_at: parse_datetime(&enqueued_at)?,
          attempts,
        })
      })
      .collect()
  }

  pub fn insert(&self, submission: &PendingSubmission) -> Result<()> {
    let metadata = serde_json::to_string(&submission.metadata)
      .map_err(|e| eyre!("Failed to serialize metadata: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT INTO upload_queue (id, payload, metadata, enqueued_at, attempts)
         VALUES (?, ?, ?, ?, ?)",
        params![
          submission.id.to_string(),
          submission.payload,
          metadata,
          submission.enqueued_at.to_rfc3339(),
          submission.attempts
        ],
      )
      .map_err(|e| eyre!("Failed to persist submission {}: {}", submission.id, e))?;
    Ok(())
  }

  pub fn remove(&self, id: Uuid) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM upload_queue WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to remove submission {}: {}", id, e))?;
    Ok(())
  }

  pub fn record_attempt(&self, id: Uuid, attempts: u32, error: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE upload_queue SET attempts = ?, last_error = ? WHERE id = ?",
        params![attempts, error, id.to_string()],
      )
      .map_err(|e| eyre!("Failed to record attempt for {}: {}", id, e))?;
    Ok(())
  }
}

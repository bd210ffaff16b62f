//! Cache storage trait and SQLite implementation.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::keys::RequestKey;
use super::traits::{AssetClass, CacheEntry, CacheNamespace, Strategy};
use crate::db::{parse_datetime, Database};

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Create a namespace if it does not exist yet.
  fn create_namespace(&self, namespace: &CacheNamespace) -> Result<()>;

  /// All namespaces currently stored.
  fn list_namespaces(&self) -> Result<Vec<CacheNamespace>>;

  /// Delete a namespace together with all of its entries.
  fn delete_namespace(&self, name: &str) -> Result<()>;

  /// Get a single entry.
  fn get_entry(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any previous one for the same key.
  fn put_entry(&self, namespace: &str, entry: &CacheEntry) -> Result<()>;

  /// Cache version that was last activated.
  fn active_version(&self) -> Result<Option<String>>;

  fn set_active_version(&self, version: &str) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the database is unavailable - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn create_namespace(&self, _namespace: &CacheNamespace) -> Result<()> {
    Ok(())
  }

  fn list_namespaces(&self) -> Result<Vec<CacheNamespace>> {
    Ok(Vec::new())
  }

  fn delete_namespace(&self, _name: &str) -> Result<()> {
    Ok(())
  }

  fn get_entry(&self, _namespace: &str, _key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put_entry(&self, _namespace: &str, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn active_version(&self) -> Result<Option<String>> {
    Ok(None)
  }

  fn set_active_version(&self, _version: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

const ACTIVE_VERSION_KEY: &str = "active_version";

impl CacheStorage for SqliteStorage {
  fn create_namespace(&self, namespace: &CacheNamespace) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name, asset_class, version, created_at)
         VALUES (?, ?, ?, ?)",
        params![
          namespace.name,
          namespace.class.as_str(),
          namespace.version,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to create namespace {}: {}", namespace.name, e))?;
    Ok(())
  }

  fn list_namespaces(&self) -> Result<Vec<CacheNamespace>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT name, asset_class, version FROM cache_namespaces ORDER BY created_at")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read namespace row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, class, version)| {
        let class: AssetClass = class.parse().map_err(|e: String| eyre!(e))?;
        Ok(CacheNamespace {
          name,
          class,
          version,
        })
      })
      .collect()
  }

  fn delete_namespace(&self, name: &str) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    tx.execute("DELETE FROM cache_namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn get_entry(&self, namespace: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT url, status, headers, body, strategy, stored_at FROM cache_entries
         WHERE namespace = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, Vec<u8>, String, String)> = stmt
      .query_row(params![namespace, key.as_str()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let Some((url, status, headers, body, strategy, stored_at)) = row else {
      return Ok(None);
    };

    let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
    let strategy: Strategy = strategy.parse().map_err(|e: String| eyre!(e))?;

    Ok(Some(CacheEntry {
      request_key: RequestKey::from_stored(key.as_str().to_string()),
      url,
      status,
      headers,
      body,
      strategy,
      stored_at: parse_datetime(&stored_at)?,
    }))
  }

  fn put_entry(&self, namespace: &str, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.lock()?;
    let changed = conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries
           (namespace, request_key, url, status, headers, body, strategy, stored_at)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8
         WHERE EXISTS (SELECT 1 FROM cache_namespaces WHERE name = ?1)",
        params![
          namespace,
          entry.request_key.as_str(),
          entry.url,
          entry.status,
          headers,
          entry.body,
          entry.strategy.as_str(),
          entry.stored_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    if changed == 0 {
      return Err(eyre!("Cache namespace {} does not exist", namespace));
    }
    Ok(())
  }

  fn active_version(&self) -> Result<Option<String>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT value FROM cache_meta WHERE key = ?",
        params![ACTIVE_VERSION_KEY],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active cache version: {}", e))
  }

  fn set_active_version(&self, version: &str) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?, ?)",
        params![ACTIVE_VERSION_KEY, version],
      )
      .map_err(|e| eyre!("Failed to store active cache version: {}", e))?;
    Ok(())
  }
}

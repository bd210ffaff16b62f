use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::db::Database;

/// Access/refresh credentials issued at login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
  pub access_token: String,
  pub refresh_token: String,
}

impl TokenPair {
  pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
    Self {
      access_token: access_token.into(),
      refresh_token: refresh_token.into(),
    }
  }
}

impl fmt::Debug for TokenPair {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TokenPair")
      .field("access_token", &"<redacted>")
      .field("refresh_token", &"<redacted>")
      .finish()
  }
}

/// Durable slot for the current [`TokenPair`].
#[derive(Clone)]
pub struct TokenStore {
  db: Arc<Database>,
}

impl TokenStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  pub fn load(&self) -> Result<Option<TokenPair>> {
    let conn = self.db.lock()?;
    conn
      .query_row(
        "SELECT access_token, refresh_token FROM credentials WHERE id = 1",
        [],
        |row| {
          Ok(TokenPair {
            access_token: row.get(0)?,
            refresh_token: row.get(1)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to load credentials: {}", e))
  }

  pub fn save(&self, tokens: &TokenPair) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO credentials (id, access_token, refresh_token, updated_at)
         VALUES (1, ?, ?, ?)",
        params![
          tokens.access_token,
          tokens.refresh_token,
          Utc::now().to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to store credentials: {}", e))?;
    Ok(())
  }

  pub fn clear(&self) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM credentials", [])
      .map_err(|e| eyre!("Failed to clear credentials: {}", e))?;
    Ok(())
  }
}

pub mod schema;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Handle to the agent's SQLite database.
///
/// Constructed once at startup and shared as `Arc<Database>` with every
/// store and queue that persists anything.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offsync").join("offsync.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }

  /// Lock the connection for a sequence of statements.
  pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read setting {}: {}", key, e))
  }

  pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write setting {}: {}", key, e))?;
    Ok(())
  }

  /// Append a JSON document to a durable list. Returns the item's sequence number.
  pub fn list_push(&self, list: &str, payload: &str) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO list_items (list_key, payload) VALUES (?, ?)",
        params![list, payload],
      )
      .map_err(|e| eyre!("Failed to append to list {}: {}", list, e))?;
    Ok(conn.last_insert_rowid())
  }

  /// All items of a list in insertion order.
  pub fn list_items(&self, list: &str) -> Result<Vec<(i64, String)>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT seq, payload FROM list_items WHERE list_key = ? ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare list query: {}", e))?;

    let items = stmt
      .query_map(params![list], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to read list {}: {}", list, e))?
      .collect::<rusqlite::Result<Vec<(i64, String)>>>()
      .map_err(|e| eyre!("Failed to read list {}: {}", list, e))?;

    Ok(items)
  }

  pub fn list_remove(&self, seq: i64) -> Result<bool> {
    let removed = self
      .lock()?
      .execute("DELETE FROM list_items WHERE seq = ?", params![seq])
      .map_err(|e| eyre!("Failed to remove list item {}: {}", seq, e))?;
    Ok(removed > 0)
  }
}

/// Format a timestamp the way every table stores it.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339()
}

/// Parse a timestamp written by `format_timestamp`.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

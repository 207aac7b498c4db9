//! Persisted cache backends: SQLite and a no-op for cache-off mode.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Mutex;

use super::types::{AvatarRecord, StatusRecord};

/// Storage backend for cached fetch results.
///
/// Writes are fire-and-forget from the caller's point of view: the in-memory
/// mirror logs store errors instead of propagating them.
pub trait CacheStore: Send + Sync {
  fn load_statuses(&self) -> Result<Vec<(String, String, StatusRecord)>>;
  fn save_status(&self, repo: &str, commit: &str, record: &StatusRecord) -> Result<()>;
  fn remove_statuses(&self, repo: &str) -> Result<()>;

  fn load_avatars(&self) -> Result<Vec<(String, AvatarRecord)>>;
  fn save_avatar(&self, email: &str, record: &AvatarRecord) -> Result<()>;
  fn remove_avatar(&self, email: &str) -> Result<()>;

  fn clear(&self) -> Result<()>;
}

/// Backend that persists nothing. Used when caching is disabled.
pub struct NoopStore;

impl CacheStore for NoopStore {
  fn load_statuses(&self) -> Result<Vec<(String, String, StatusRecord)>> {
    Ok(Vec::new())
  }

  fn save_status(&self, _repo: &str, _commit: &str, _record: &StatusRecord) -> Result<()> {
    Ok(())
  }

  fn remove_statuses(&self, _repo: &str) -> Result<()> {
    Ok(())
  }

  fn load_avatars(&self) -> Result<Vec<(String, AvatarRecord)>> {
    Ok(Vec::new())
  }

  fn save_avatar(&self, _email: &str, _record: &AvatarRecord) -> Result<()> {
    Ok(())
  }

  fn remove_avatar(&self, _email: &str) -> Result<()> {
    Ok(())
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-backed cache store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open an in-memory store (tests).
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory db: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("gitpulse").join("cache.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables. Records are stored as serialized JSON blobs.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS status_cache (
    repo TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    status_id TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (repo, commit_hash, status_id)
);

CREATE INDEX IF NOT EXISTS idx_status_cache_repo ON status_cache(repo);

CREATE TABLE IF NOT EXISTS avatar_cache (
    email TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStore for SqliteStore {
  fn load_statuses(&self) -> Result<Vec<(String, String, StatusRecord)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT repo, commit_hash, data FROM status_cache")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query statuses: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(
      rows
        .into_iter()
        .filter_map(|(repo, commit, data)| {
          let record: StatusRecord = serde_json::from_slice(&data).ok()?;
          Some((repo, commit, record))
        })
        .collect(),
    )
  }

  fn save_status(&self, repo: &str, commit: &str, record: &StatusRecord) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data =
      serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize status: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO status_cache (repo, commit_hash, status_id, data, cached_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![repo, commit, record.id, data],
      )
      .map_err(|e| eyre!("Failed to store status: {}", e))?;

    Ok(())
  }

  fn remove_statuses(&self, repo: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM status_cache WHERE repo = ?", params![repo])
      .map_err(|e| eyre!("Failed to remove statuses: {}", e))?;

    Ok(())
  }

  fn load_avatars(&self) -> Result<Vec<(String, AvatarRecord)>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT email, data FROM avatar_cache")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
      .map_err(|e| eyre!("Failed to query avatars: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(
      rows
        .into_iter()
        .filter_map(|(email, data)| {
          let record: AvatarRecord = serde_json::from_slice(&data).ok()?;
          Some((email, record))
        })
        .collect(),
    )
  }

  fn save_avatar(&self, email: &str, record: &AvatarRecord) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let data =
      serde_json::to_vec(record).map_err(|e| eyre!("Failed to serialize avatar: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO avatar_cache (email, data, cached_at)
         VALUES (?, ?, datetime('now'))",
        params![email, data],
      )
      .map_err(|e| eyre!("Failed to store avatar: {}", e))?;

    Ok(())
  }

  fn remove_avatar(&self, email: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM avatar_cache WHERE email = ?", params![email])
      .map_err(|e| eyre!("Failed to remove avatar: {}", e))?;

    Ok(())
  }

  fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch("DELETE FROM status_cache; DELETE FROM avatar_cache;")
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(id: &str) -> StatusRecord {
    StatusRecord {
      id: id.to_string(),
      name: "build".to_string(),
      status: "success".to_string(),
      reference: "main".to_string(),
      web_url: "https://ci.example/1".to_string(),
      event: "push".to_string(),
      detail: true,
      allow_failure: false,
    }
  }

  #[test]
  fn test_status_roundtrip_and_replace() {
    let store = SqliteStore::open_in_memory().unwrap();

    store.save_status("/r", "abc", &record("1")).unwrap();
    store.save_status("/r", "abc", &record("2")).unwrap();

    let mut updated = record("1");
    updated.status = "failed".to_string();
    store.save_status("/r", "abc", &updated).unwrap();

    let loaded = store.load_statuses().unwrap();
    assert_eq!(loaded.len(), 2);
    let one = loaded.iter().find(|(_, _, r)| r.id == "1").unwrap();
    assert_eq!(one.2.status, "failed");
  }

  #[test]
  fn test_remove_statuses_for_repo() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save_status("/a", "abc", &record("1")).unwrap();
    store.save_status("/b", "def", &record("2")).unwrap();

    store.remove_statuses("/a").unwrap();

    let loaded = store.load_statuses().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].0, "/b");
  }

  #[test]
  fn test_avatar_roundtrip() {
    let store = SqliteStore::open_in_memory().unwrap();
    let rec = AvatarRecord {
      image: "/tmp/a.png".to_string(),
      timestamp: 123,
      identicon: false,
    };

    store.save_avatar("a@b.c", &rec).unwrap();
    let loaded = store.load_avatars().unwrap();
    assert_eq!(loaded, vec![("a@b.c".to_string(), rec)]);

    store.remove_avatar("a@b.c").unwrap();
    assert!(store.load_avatars().unwrap().is_empty());
  }

  #[test]
  fn test_clear_empties_both_tables() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save_status("/a", "abc", &record("1")).unwrap();
    store
      .save_avatar(
        "a@b.c",
        &AvatarRecord {
          image: "x".to_string(),
          timestamp: 0,
          identicon: true,
        },
      )
      .unwrap();

    store.clear().unwrap();

    assert!(store.load_statuses().unwrap().is_empty());
    assert!(store.load_avatars().unwrap().is_empty());
  }
}

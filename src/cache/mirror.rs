//! In-memory mirrors of the persisted cache.
//!
//! Read APIs are served synchronously from these maps; successful fetches
//! update the map first and then write through to the store. Store failures
//! are logged and dropped - persistence is best-effort, never blocking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::queue::now_ms;

use super::store::CacheStore;
use super::types::{AvatarRecord, StatusRecord};

/// repo -> commit -> status id -> record
type StatusMap = HashMap<String, HashMap<String, BTreeMap<String, StatusRecord>>>;

pub struct StatusCache {
  entries: Mutex<StatusMap>,
  store: Arc<dyn CacheStore>,
}

impl StatusCache {
  /// Hydrate the mirror from the store. A failed load starts empty.
  pub fn load(store: Arc<dyn CacheStore>) -> Self {
    let mut entries: StatusMap = HashMap::new();
    match store.load_statuses() {
      Ok(rows) => {
        for (repo, commit, record) in rows {
          entries
            .entry(repo)
            .or_default()
            .entry(commit)
            .or_default()
            .insert(record.id.clone(), record);
        }
      }
      Err(e) => warn!(error = %e, "failed to load status cache, starting empty"),
    }

    Self {
      entries: Mutex::new(entries),
      store,
    }
  }

  /// Insert or refresh one record. Returns false when an identical record
  /// was already cached (no event needed).
  pub fn upsert(&self, repo: &str, commit: &str, record: StatusRecord) -> bool {
    let changed = {
      let mut entries = match self.entries.lock() {
        Ok(guard) => guard,
        Err(_) => return false,
      };
      let slot = entries
        .entry(repo.to_string())
        .or_default()
        .entry(commit.to_string())
        .or_default();
      match slot.get(&record.id) {
        Some(existing) if *existing == record => false,
        _ => {
          slot.insert(record.id.clone(), record.clone());
          true
        }
      }
    };

    if changed {
      if let Err(e) = self.store.save_status(repo, commit, &record) {
        warn!(repo, commit, error = %e, "failed to persist status record");
      }
    }
    changed
  }

  /// All cached statuses for a commit, ordered by status id.
  pub fn get(&self, repo: &str, commit: &str) -> Vec<StatusRecord> {
    self
      .entries
      .lock()
      .ok()
      .and_then(|entries| {
        entries
          .get(repo)
          .and_then(|commits| commits.get(commit))
          .map(|statuses| statuses.values().cloned().collect())
      })
      .unwrap_or_default()
  }

  /// Drop all cached statuses for one repository.
  pub fn remove_repo(&self, repo: &str) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.remove(repo);
    }
    if let Err(e) = self.store.remove_statuses(repo) {
      warn!(repo, error = %e, "failed to remove persisted statuses");
    }
  }

  pub fn clear(&self) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.clear();
    }
    if let Err(e) = self.store.clear() {
      warn!(error = %e, "failed to clear persisted cache");
    }
  }
}

pub struct AvatarCache {
  entries: Mutex<HashMap<String, AvatarRecord>>,
  store: Arc<dyn CacheStore>,
}

impl AvatarCache {
  pub fn load(store: Arc<dyn CacheStore>) -> Self {
    let entries = match store.load_avatars() {
      Ok(rows) => rows.into_iter().collect(),
      Err(e) => {
        warn!(error = %e, "failed to load avatar cache, starting empty");
        HashMap::new()
      }
    };

    Self {
      entries: Mutex::new(entries),
      store,
    }
  }

  pub fn get(&self, email: &str) -> Option<AvatarRecord> {
    self.entries.lock().ok()?.get(email).cloned()
  }

  /// Store a fetched avatar. The timestamp always moves to now, but an
  /// identicon never replaces a previously found real avatar - the old
  /// image is kept and only its timestamp refreshes.
  ///
  /// Returns true when the stored image actually changed.
  pub fn save(&self, email: &str, image: String, identicon: bool) -> bool {
    let now = now_ms();
    let (record, changed) = {
      let mut entries = match self.entries.lock() {
        Ok(guard) => guard,
        Err(_) => return false,
      };
      let (record, changed) = match entries.get(email) {
        Some(existing) if !existing.identicon && identicon => (
          AvatarRecord {
            image: existing.image.clone(),
            timestamp: now,
            identicon: false,
          },
          false,
        ),
        Some(existing) => {
          let changed = existing.image != image || existing.identicon != identicon;
          (
            AvatarRecord {
              image,
              timestamp: now,
              identicon,
            },
            changed,
          )
        }
        None => (
          AvatarRecord {
            image,
            timestamp: now,
            identicon,
          },
          true,
        ),
      };
      entries.insert(email.to_string(), record.clone());
      (record, changed)
    };

    if let Err(e) = self.store.save_avatar(email, &record) {
      warn!(email, error = %e, "failed to persist avatar record");
    }
    changed
  }

  /// Single-key eviction, used when a stored image file turns out to be
  /// unreadable.
  pub fn evict(&self, email: &str) -> Option<AvatarRecord> {
    let removed = self.entries.lock().ok()?.remove(email);
    if let Err(e) = self.store.remove_avatar(email) {
      warn!(email, error = %e, "failed to remove persisted avatar");
    }
    removed
  }

  pub fn clear(&self) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.clear();
    }
    if let Err(e) = self.store.clear() {
      warn!(error = %e, "failed to clear persisted cache");
    }
  }
}

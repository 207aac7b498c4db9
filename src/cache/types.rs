//! Normalized record shapes shared by the providers and the cache.

use serde::{Deserialize, Serialize};

/// One CI/CD check/job/pipeline run for a commit, normalized across
/// providers. Multiple records per commit coexist (one per job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
  /// Provider-assigned id, unique within (repo, commit)
  pub id: String,
  pub name: String,
  pub status: String,
  #[serde(rename = "ref")]
  pub reference: String,
  pub web_url: String,
  pub event: String,
  /// Whether this came from a detail fetch (named check-runs) or a list scan
  pub detail: bool,
  pub allow_failure: bool,
}

/// Cached avatar for an author email. Exactly one record per email,
/// refreshed wholesale on a new successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarRecord {
  /// Path of the stored image file
  pub image: String,
  /// Epoch ms of the last save
  pub timestamp: i64,
  /// True when the image is a generated placeholder rather than a real avatar
  pub identicon: bool,
}

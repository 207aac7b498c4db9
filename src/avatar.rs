//! Author avatar fetching.
//!
//! Resolution order depends on the repository's provider: GitHub resolves
//! through a commit lookup, GitLab through user search, and everything else
//! (including lookup misses) falls back to Gravatar. Gravatar itself is
//! tried twice: first asking for a 404 when no real avatar exists, then
//! asking for a generated identicon. Images land on disk under a stable
//! per-email filename; the cache records the path.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{AvatarCache, AvatarRecord, CacheStore};
use crate::event::{Emitter, UpdateEvent};
use crate::providers::{github, gitlab, gravatar, Credentials, ParsedTarget, Provider};
use crate::queue::{now_ms, QueueItem};
use crate::registry::RepoEntry;
use crate::scheduler::{Completion, FetchScheduler, Job, JobRunner};
use crate::transport::{HttpResponse, HttpTransport, ProviderRequest};

/// Refetch a real avatar after two weeks.
pub const AVATAR_REFRESH_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Identicons refresh sooner, in case a real avatar has appeared since.
pub const IDENTICON_REFRESH_MS: i64 = 4 * 24 * 60 * 60 * 1000;

#[derive(Clone, PartialEq, Eq)]
enum AvatarStep {
  /// Resolve an image URL (provider lookup) or probe Gravatar directly.
  Lookup,
  /// Fetch the resolved image itself.
  Download { url: String },
}

#[derive(Clone)]
pub struct AvatarJob {
  pub email: String,
  pub repo: String,
  pub provider: Provider,
  pub remote_url: String,
  pub credentials: Option<Credentials>,
  /// Commits authored by this email, for the GitHub commit lookup.
  pub commits: Vec<String>,
  step: AvatarStep,
  /// Whether the current Gravatar attempt accepts a generated identicon.
  identicon: bool,
}

impl AvatarJob {
  /// Gravatar fallback for this job, first without the identicon.
  fn gravatar_fallback(&self) -> AvatarJob {
    AvatarJob {
      provider: Provider::Gravatar,
      step: AvatarStep::Lookup,
      identicon: false,
      ..self.clone()
    }
  }

  /// GitHub looks up one commit at a time; advance to the next candidate
  /// before giving up on the provider.
  fn next_commit_lookup(&self) -> Option<AvatarJob> {
    if self.provider != Provider::GitHub || self.commits.len() < 2 {
      return None;
    }
    let mut next = self.clone();
    next.commits.remove(0);
    next.step = AvatarStep::Lookup;
    Some(next)
  }
}

impl std::fmt::Debug for AvatarJob {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AvatarJob")
      .field("email", &self.email)
      .field("repo", &self.repo)
      .field("provider", &self.provider)
      .finish()
  }
}

impl QueueItem for AvatarJob {
  type Key = (String, String);

  fn identity(&self) -> Self::Key {
    (self.email.clone(), self.repo.clone())
  }

  fn merge_from(&mut self, newer: Self) {
    for commit in newer.commits {
      if !self.commits.contains(&commit) {
        self.commits.push(commit);
      }
    }
    self.remote_url = newer.remote_url;
    self.credentials = newer.credentials;
  }
}

impl Job for AvatarJob {
  fn provider(&self) -> Provider {
    self.provider
  }
}

pub struct AvatarRunner {
  cache: AvatarCache,
  emitter: Emitter,
  avatar_dir: PathBuf,
  targets: Mutex<HashMap<String, Option<ParsedTarget>>>,
}

impl AvatarRunner {
  fn new(store: Arc<dyn CacheStore>, avatar_dir: PathBuf) -> Self {
    Self {
      cache: AvatarCache::load(store),
      emitter: Emitter::new(),
      avatar_dir,
      targets: Mutex::new(HashMap::new()),
    }
  }

  fn resolve_target(&self, provider: Provider, remote_url: &str) -> Option<ParsedTarget> {
    let mut targets = self.targets.lock().ok()?;
    if let Some(memoized) = targets.get(remote_url) {
      return memoized.clone();
    }

    let target = match provider {
      Provider::GitHub => github::match_remote_url(remote_url),
      Provider::GitLab => gitlab::match_remote_url(remote_url),
      _ => None,
    };
    targets.insert(remote_url.to_string(), target.clone());
    target
  }

  /// Write the image to disk and record it. Returns whether the cached
  /// image changed, so the caller knows to announce it.
  fn store_image(&self, email: &str, response: &HttpResponse, identicon: bool) -> bool {
    // A stale real avatar probes Gravatar again and may get an identicon
    // back. The real image must survive that, and both live at the same
    // per-email path - so the acceptance check has to come before the
    // file write. Only the timestamp refreshes.
    if identicon {
      if let Some(existing) = self.cache.get(email) {
        if !existing.identicon {
          self.cache.save(email, existing.image, true);
          return false;
        }
      }
    }

    let filename = format!(
      "{}.{}",
      gravatar::email_hash(email),
      extension_for(response.header("content-type"))
    );
    let path = self.avatar_dir.join(filename);

    if let Err(e) = std::fs::write(&path, &response.body) {
      warn!(email, path = %path.display(), error = %e, "failed to write avatar image");
      return false;
    }

    self
      .cache
      .save(email, path.to_string_lossy().into_owned(), identicon)
  }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
  match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
    Some("image/jpeg") => "jpg",
    Some("image/gif") => "gif",
    Some("image/webp") => "webp",
    _ => "png",
  }
}

#[async_trait]
impl JobRunner for AvatarRunner {
  type Item = AvatarJob;

  fn prepare(&self, item: &AvatarJob) -> Result<ProviderRequest, String> {
    if let AvatarStep::Download { url } = &item.step {
      let parsed = url::Url::parse(url).map_err(|e| format!("bad avatar URL {}: {}", url, e))?;
      let origin = match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), parsed.host_str().unwrap_or(""), port),
        None => format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or("")),
      };
      let path = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
      };
      return Ok(ProviderRequest {
        origin,
        path,
        headers: Vec::new(),
      });
    }

    match item.provider {
      Provider::Gravatar => Ok(gravatar::build_request(&item.email, item.identicon)),
      Provider::GitHub => {
        let target = self
          .resolve_target(Provider::GitHub, &item.remote_url)
          .ok_or_else(|| format!("remote URL {} matches no provider pattern", item.remote_url))?;
        let commit = item
          .commits
          .first()
          .ok_or_else(|| format!("no known commits for author {}", item.email))?;
        Ok(github::build_commit_request(
          &target,
          item.credentials.as_ref(),
          commit,
        ))
      }
      Provider::GitLab => {
        let origin = match self.resolve_target(Provider::GitLab, &item.remote_url) {
          Some(ParsedTarget::Repo { origin, .. }) => origin,
          _ => {
            return Err(format!(
              "remote URL {} matches no provider pattern",
              item.remote_url
            ))
          }
        };
        Ok(gitlab::build_user_search(
          &origin,
          item.credentials.as_ref(),
          &item.email,
        ))
      }
      Provider::Jenkins => Err("jenkins has no avatar source".to_string()),
    }
  }

  async fn complete(&self, item: &AvatarJob, response: &HttpResponse) -> Completion<AvatarJob> {
    // Image responses: downloads, plus Gravatar where the probe itself
    // returns the image.
    if matches!(item.step, AvatarStep::Download { .. }) || item.provider == Provider::Gravatar {
      let identicon = item.provider == Provider::Gravatar && item.identicon;
      if self.store_image(&item.email, response, identicon) {
        self.emitter.emit(UpdateEvent::AvatarChanged {
          email: item.email.clone(),
        });
      }
      return Completion::Done {
        followups: Vec::new(),
      };
    }

    let avatar_url = match item.provider {
      Provider::GitHub => github::parse_commit_avatar(&response.body),
      Provider::GitLab => gitlab::parse_user_avatar(&response.body),
      _ => Ok(None),
    };

    match avatar_url {
      Ok(Some(url)) => {
        let mut next = item.clone();
        next.step = AvatarStep::Download { url };
        Completion::Done {
          followups: vec![next],
        }
      }
      Ok(None) => {
        debug!(email = %item.email, provider = %item.provider, "no avatar at provider");
        Completion::Done {
          followups: vec![item
            .next_commit_lookup()
            .unwrap_or_else(|| item.gravatar_fallback())],
        }
      }
      Err(message) => Completion::Malformed { message },
    }
  }

  fn not_found_followup(&self, item: &AvatarJob) -> Option<AvatarJob> {
    match (item.provider, &item.step) {
      // Gravatar 404 with d=404 set: retry accepting an identicon.
      (Provider::Gravatar, _) if !item.identicon => {
        let mut next = item.clone();
        next.identicon = true;
        Some(next)
      }
      (Provider::Gravatar, _) => None,
      // Unknown commit: try the next candidate before leaving GitHub.
      (Provider::GitHub, AvatarStep::Lookup) => {
        Some(item.next_commit_lookup().unwrap_or_else(|| item.gravatar_fallback()))
      }
      // Provider lookup or image URL went away: fall back to Gravatar.
      _ => Some(item.gravatar_fallback()),
    }
  }

  fn on_idle(&self) {
    if let Ok(mut targets) = self.targets.lock() {
      targets.clear();
    }
  }
}

pub struct AvatarManager {
  scheduler: FetchScheduler<AvatarRunner>,
}

impl AvatarManager {
  pub fn new(
    store: Arc<dyn CacheStore>,
    transport: Arc<dyn HttpTransport>,
    avatar_dir: PathBuf,
  ) -> Self {
    Self {
      scheduler: FetchScheduler::new(AvatarRunner::new(store, avatar_dir), transport),
    }
  }

  pub fn default_avatar_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("gitpulse").join("avatars"))
  }

  pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
    self.scheduler.spawn()
  }

  /// Queue an avatar fetch unless the cached image is still fresh. Real
  /// avatars are kept for two weeks, identicons for four days.
  pub fn fetch(&self, repo: &RepoEntry, email: &str) -> Result<()> {
    if let Some(record) = self.scheduler.runner().cache.get(email) {
      let refresh_after = if record.identicon {
        IDENTICON_REFRESH_MS
      } else {
        AVATAR_REFRESH_MS
      };
      if now_ms() - record.timestamp < refresh_after {
        return Ok(());
      }
    }

    // Jenkins carries no author identity; GitHub needs a commit to look
    // up. Everything without a provider source starts at Gravatar.
    let provider = match repo.provider {
      Provider::GitHub if !repo.commits.is_empty() => Provider::GitHub,
      Provider::GitLab => Provider::GitLab,
      _ => Provider::Gravatar,
    };

    self.scheduler.enqueue(
      AvatarJob {
        email: email.to_string(),
        repo: repo.path.clone(),
        provider,
        remote_url: repo.remote_url.clone(),
        credentials: repo.credentials.clone(),
        commits: repo.commits.clone(),
        step: AvatarStep::Lookup,
        identicon: false,
      },
      false,
    )
  }

  /// Cached avatar record for an email, synchronously. Reads never touch
  /// the network; pair with [`fetch`](Self::fetch), which applies the
  /// freshness policy and queues the refresh with the repository's
  /// provider config.
  pub fn get_avatar(&self, email: &str) -> Option<AvatarRecord> {
    self.scheduler.runner().cache.get(email)
  }

  /// Drop a cached avatar and its image file, e.g. when the file turned
  /// out to be unreadable.
  pub fn evict(&self, email: &str) {
    if let Some(record) = self.scheduler.runner().cache.evict(email) {
      if let Err(e) = std::fs::remove_file(&record.image) {
        debug!(email, image = %record.image, error = %e, "failed to remove avatar image");
      }
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
    self.scheduler.runner().emitter.subscribe()
  }

  pub fn clear_cache(&self) {
    self.scheduler.runner().cache.clear();
  }

  pub fn dispose(&self) {
    self.scheduler.dispose();
  }

  #[cfg(test)]
  async fn tick(&self) -> Result<bool> {
    self.scheduler.tick(now_ms()).await
  }

  #[cfg(test)]
  fn queued(&self) -> usize {
    self.scheduler.queue_len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NoopStore, SqliteStore};
  use crate::transport::testing::{response, MockTransport};

  fn entry(remote: &str, provider: Provider, commits: &[&str]) -> RepoEntry {
    RepoEntry {
      path: "/work/widgets".to_string(),
      remote_url: remote.to_string(),
      provider,
      credentials: None,
      commits: commits.iter().map(|c| c.to_string()).collect(),
      authors: vec!["dev@acme.org".to_string()],
      detail: true,
    }
  }

  fn manager(
    store: Arc<dyn CacheStore>,
    responses: Vec<Result<HttpResponse>>,
  ) -> (AvatarManager, Arc<MockTransport>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let transport = MockTransport::new(responses);
    let manager = AvatarManager::new(
      store,
      Arc::clone(&transport) as Arc<dyn HttpTransport>,
      dir.path().to_path_buf(),
    );
    (manager, transport, dir)
  }

  #[tokio::test]
  async fn test_gravatar_fetch_stores_image_file() {
    let (manager, transport, dir) = manager(
      Arc::new(NoopStore),
      vec![response(200, &[("content-type", "image/png")], b"pngbytes")],
    );
    let mut events = manager.subscribe();

    manager
      .fetch(
        &entry("https://ci.acme.org/job/widgets", Provider::Jenkins, &[]),
        "dev@acme.org",
      )
      .unwrap();
    assert!(manager.tick().await.unwrap());

    // Probe went to Gravatar with the hard 404 fallback.
    let requests = transport.requests();
    assert_eq!(requests[0].origin, "https://secure.gravatar.com");
    assert!(requests[0].path.ends_with("d=404"));

    let record = manager.get_avatar("dev@acme.org").unwrap();
    assert!(!record.identicon);
    let expected = dir
      .path()
      .join(format!("{}.png", gravatar::email_hash("dev@acme.org")));
    assert_eq!(record.image, expected.to_string_lossy());
    assert_eq!(std::fs::read(&expected).unwrap(), b"pngbytes");
    assert_eq!(
      events.recv().await.unwrap(),
      UpdateEvent::AvatarChanged {
        email: "dev@acme.org".to_string()
      }
    );
  }

  #[tokio::test]
  async fn test_gravatar_miss_retries_with_identicon() {
    let (manager, transport, _dir) = manager(
      Arc::new(NoopStore),
      vec![
        response(404, &[], b""),
        response(200, &[("content-type", "image/png")], b"identicon"),
      ],
    );

    manager
      .fetch(
        &entry("https://ci.acme.org/job/widgets", Provider::Jenkins, &[]),
        "dev@acme.org",
      )
      .unwrap();
    assert!(manager.tick().await.unwrap());
    assert!(manager.tick().await.unwrap());

    let requests = transport.requests();
    assert!(requests[0].path.ends_with("d=404"));
    assert!(requests[1].path.ends_with("d=identicon"));
    assert!(manager.get_avatar("dev@acme.org").unwrap().identicon);
  }

  #[tokio::test]
  async fn test_github_lookup_then_download() {
    let commit = br#"{"author": {"avatar_url": "https://avatars.example.com/u/7?v=4"}}"#;
    let (manager, transport, _dir) = manager(
      Arc::new(NoopStore),
      vec![
        response(200, &[], commit),
        response(200, &[("content-type", "image/jpeg")], b"jpegbytes"),
      ],
    );

    manager
      .fetch(
        &entry(
          "https://github.com/acme/widgets.git",
          Provider::GitHub,
          &["abc123"],
        ),
        "dev@acme.org",
      )
      .unwrap();
    assert!(manager.tick().await.unwrap());
    assert!(manager.tick().await.unwrap());

    let requests = transport.requests();
    assert_eq!(requests[0].path, "/repos/acme/widgets/commits/abc123");
    assert_eq!(requests[1].origin, "https://avatars.example.com");
    assert_eq!(requests[1].path, "/u/7?v=4");

    let record = manager.get_avatar("dev@acme.org").unwrap();
    assert!(record.image.ends_with(".jpg"));
  }

  #[tokio::test]
  async fn test_github_without_avatar_falls_back_to_gravatar() {
    let (manager, transport, _dir) = manager(
      Arc::new(NoopStore),
      vec![
        response(200, &[], br#"{"author": null}"#),
        response(200, &[("content-type", "image/png")], b"pngbytes"),
      ],
    );

    manager
      .fetch(
        &entry(
          "https://github.com/acme/widgets.git",
          Provider::GitHub,
          &["abc123"],
        ),
        "dev@acme.org",
      )
      .unwrap();
    assert!(manager.tick().await.unwrap());
    assert!(manager.tick().await.unwrap());

    let requests = transport.requests();
    assert_eq!(requests[1].origin, "https://secure.gravatar.com");
  }

  #[tokio::test]
  async fn test_identicon_retry_preserves_real_avatar_file() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir
      .path()
      .join(format!("{}.png", gravatar::email_hash("dev@acme.org")));
    std::fs::write(&image, b"realbytes").unwrap();

    // A real avatar old enough to be refreshed.
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let before = now_ms() - 15 * 24 * 60 * 60 * 1000;
    store
      .save_avatar(
        "dev@acme.org",
        &AvatarRecord {
          image: image.to_string_lossy().into_owned(),
          timestamp: before,
          identicon: false,
        },
      )
      .unwrap();

    // The refresh probe misses and Gravatar answers with an identicon.
    let transport = MockTransport::new(vec![
      response(404, &[], b""),
      response(200, &[("content-type", "image/png")], b"identiconbytes"),
    ]);
    let manager = AvatarManager::new(
      store,
      Arc::clone(&transport) as Arc<dyn HttpTransport>,
      dir.path().to_path_buf(),
    );

    manager
      .fetch(
        &entry("https://ci.acme.org/job/widgets", Provider::Jenkins, &[]),
        "dev@acme.org",
      )
      .unwrap();
    assert!(manager.tick().await.unwrap());
    assert!(manager.tick().await.unwrap());

    // The real image survives on disk and in the record; only the
    // timestamp moved.
    let record = manager.get_avatar("dev@acme.org").unwrap();
    assert!(!record.identicon);
    assert_eq!(record.image, image.to_string_lossy());
    assert_eq!(std::fs::read(&image).unwrap(), b"realbytes");
    assert!(record.timestamp > before);
  }

  #[tokio::test]
  async fn test_github_tries_next_candidate_commit() {
    let (manager, transport, _dir) = manager(
      Arc::new(NoopStore),
      vec![
        response(200, &[], br#"{"author": null}"#),
        response(
          200,
          &[],
          br#"{"author": {"avatar_url": "https://avatars.example.com/u/7"}}"#,
        ),
        response(200, &[("content-type", "image/png")], b"pngbytes"),
      ],
    );

    manager
      .fetch(
        &entry(
          "https://github.com/acme/widgets.git",
          Provider::GitHub,
          &["abc123", "def456"],
        ),
        "dev@acme.org",
      )
      .unwrap();
    for _ in 0..3 {
      assert!(manager.tick().await.unwrap());
    }

    let requests = transport.requests();
    assert_eq!(requests[0].path, "/repos/acme/widgets/commits/abc123");
    assert_eq!(requests[1].path, "/repos/acme/widgets/commits/def456");
    assert_eq!(requests[2].origin, "https://avatars.example.com");
  }

  #[tokio::test]
  async fn test_fresh_avatar_is_not_refetched() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store
      .save_avatar(
        "dev@acme.org",
        &AvatarRecord {
          image: "/imgs/a.png".to_string(),
          timestamp: now_ms() - 24 * 60 * 60 * 1000,
          identicon: false,
        },
      )
      .unwrap();
    let (manager, _transport, _dir) = manager(store, vec![]);

    manager
      .fetch(
        &entry("https://ci.acme.org/job/widgets", Provider::Jenkins, &[]),
        "dev@acme.org",
      )
      .unwrap();
    assert_eq!(manager.queued(), 0);
  }

  #[tokio::test]
  async fn test_stale_identicon_is_refetched() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    // Five days old: fresh for a real avatar, stale for an identicon.
    store
      .save_avatar(
        "dev@acme.org",
        &AvatarRecord {
          image: "/imgs/a.png".to_string(),
          timestamp: now_ms() - 5 * 24 * 60 * 60 * 1000,
          identicon: true,
        },
      )
      .unwrap();
    let (manager, _transport, _dir) = manager(store, vec![]);

    manager
      .fetch(
        &entry("https://ci.acme.org/job/widgets", Provider::Jenkins, &[]),
        "dev@acme.org",
      )
      .unwrap();
    assert_eq!(manager.queued(), 1);
  }

  #[tokio::test]
  async fn test_evict_removes_image_file() {
    let (manager, _transport, dir) = manager(
      Arc::new(NoopStore),
      vec![response(200, &[("content-type", "image/png")], b"pngbytes")],
    );

    manager
      .fetch(
        &entry("https://ci.acme.org/job/widgets", Provider::Jenkins, &[]),
        "dev@acme.org",
      )
      .unwrap();
    manager.tick().await.unwrap();

    let image = dir
      .path()
      .join(format!("{}.png", gravatar::email_hash("dev@acme.org")));
    assert!(image.exists());

    manager.evict("dev@acme.org");
    assert!(manager.get_avatar("dev@acme.org").is_none());
    assert!(!image.exists());
  }
}

//! CI/CD status fetching: one scheduler instance servicing all configured
//! repositories, writing through the status cache and announcing changes.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, StatusCache, StatusRecord};
use crate::event::{Emitter, UpdateEvent};
use crate::providers::{ci_adapter, Credentials, ParsedTarget, Provider};
use crate::queue::QueueItem;
use crate::registry::RepoEntry;
use crate::scheduler::{Completion, FetchScheduler, Job, JobRunner};
use crate::transport::{HttpResponse, HttpTransport, ProviderRequest};

/// Upper bound on statuses fetched per commit across pagination.
pub const MAXIMUM_STATUSES: u32 = 1000;

const PAGE_SIZE: u32 = 100;

/// One pending status fetch for a (repo, commit) pair.
#[derive(Clone)]
pub struct StatusJob {
  pub repo: String,
  pub hash: String,
  /// Commit hashes accepted as matches when scanning list responses.
  pub candidates: Vec<String>,
  pub remote_url: String,
  pub provider: Provider,
  pub credentials: Option<Credentials>,
  pub detail: bool,
  pub page: u32,
  /// Whether any earlier page of this scan produced a match.
  matched: bool,
}

// Credentials stay out of the debug output, which ends up in log lines.
impl std::fmt::Debug for StatusJob {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StatusJob")
      .field("repo", &self.repo)
      .field("hash", &self.hash)
      .field("page", &self.page)
      .finish()
  }
}

impl QueueItem for StatusJob {
  type Key = (String, String);

  fn identity(&self) -> Self::Key {
    (self.repo.clone(), self.hash.clone())
  }

  fn merge_from(&mut self, newer: Self) {
    for candidate in newer.candidates {
      if !self.candidates.contains(&candidate) {
        self.candidates.push(candidate);
      }
    }
    self.remote_url = newer.remote_url;
    self.provider = newer.provider;
    self.credentials = newer.credentials;
    self.detail = newer.detail;
  }
}

impl Job for StatusJob {
  fn provider(&self) -> Provider {
    self.provider
  }
}

pub struct StatusRunner {
  cache: StatusCache,
  emitter: Emitter,
  /// remote URL -> match result, memoized per busy period. A None entry
  /// is a structurally unmatchable remote, warned about exactly once.
  targets: Mutex<HashMap<String, Option<ParsedTarget>>>,
}

impl StatusRunner {
  fn new(store: Arc<dyn CacheStore>) -> Self {
    Self {
      cache: StatusCache::load(store),
      emitter: Emitter::new(),
      targets: Mutex::new(HashMap::new()),
    }
  }

  fn resolve_target(&self, provider: Provider, remote_url: &str) -> Option<ParsedTarget> {
    let mut targets = self.targets.lock().ok()?;
    if let Some(memoized) = targets.get(remote_url) {
      return memoized.clone();
    }

    let target = ci_adapter(provider).and_then(|adapter| (adapter.match_remote_url)(remote_url));
    if target.is_none() {
      warn!(%provider, remote_url, "remote URL matches no provider pattern, skipping repository");
    }
    targets.insert(remote_url.to_string(), target.clone());
    target
  }
}

#[async_trait]
impl JobRunner for StatusRunner {
  type Item = StatusJob;

  fn prepare(&self, item: &StatusJob) -> Result<ProviderRequest, String> {
    let adapter = ci_adapter(item.provider)
      .ok_or_else(|| format!("no CI adapter for provider {}", item.provider))?;
    let target = self
      .resolve_target(item.provider, &item.remote_url)
      .ok_or_else(|| format!("remote URL {} matches no provider pattern", item.remote_url))?;

    Ok((adapter.build_request)(
      &target,
      item.credentials.as_ref(),
      &item.hash,
      item.page,
      item.detail,
    ))
  }

  async fn complete(&self, item: &StatusJob, response: &HttpResponse) -> Completion<StatusJob> {
    let adapter = match ci_adapter(item.provider) {
      Some(adapter) => adapter,
      None => {
        return Completion::Malformed {
          message: format!("no CI adapter for provider {}", item.provider),
        }
      }
    };

    let records = match (adapter.parse_body)(&response.body, &item.candidates, item.detail) {
      Ok(records) => records,
      Err(message) => return Completion::Malformed { message },
    };

    let matched = item.matched || !records.is_empty();
    let mut changed = false;
    for record in records {
      changed |= self.cache.upsert(&item.repo, &item.hash, record);
    }
    if changed {
      self.emitter.emit(UpdateEvent::StatusesChanged {
        repo: item.repo.clone(),
      });
    }

    let pagination = (adapter.parse_pagination)(response);
    if pagination.has_more {
      if pagination.next_page.saturating_mul(PAGE_SIZE) > MAXIMUM_STATUSES {
        info!(
          repo = %item.repo,
          hash = %item.hash,
          "maximum number of statuses reached, stopping pagination"
        );
      } else {
        let mut next = item.clone();
        next.page = pagination.next_page;
        next.matched = matched;
        return Completion::Done {
          followups: vec![next],
        };
      }
    }

    if !matched {
      if item.page <= 1 {
        debug!(repo = %item.repo, hash = %item.hash, "commit not recognized yet, will retry");
        return Completion::Empty;
      }
      debug!(repo = %item.repo, hash = %item.hash, "no matching statuses in scanned pages");
    }

    Completion::Done {
      followups: Vec::new(),
    }
  }

  fn on_idle(&self) {
    if let Ok(mut targets) = self.targets.lock() {
      targets.clear();
    }
  }
}

/// Public face of status fetching: read from cache, queue fetches, listen
/// for changes.
pub struct StatusManager {
  scheduler: FetchScheduler<StatusRunner>,
}

impl StatusManager {
  pub fn new(store: Arc<dyn CacheStore>, transport: Arc<dyn HttpTransport>) -> Self {
    Self {
      scheduler: FetchScheduler::new(StatusRunner::new(store), transport),
    }
  }

  pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
    self.scheduler.spawn()
  }

  /// Queue a status fetch for one commit. A repo whose remote matches no
  /// provider pattern is skipped up front and never enters the queue.
  pub fn fetch(&self, repo: &RepoEntry, hash: &str, candidates: &[String]) -> Result<()> {
    let runner = self.scheduler.runner();
    if runner
      .resolve_target(repo.provider, &repo.remote_url)
      .is_none()
    {
      return Ok(());
    }

    let mut candidates = candidates.to_vec();
    if !candidates.iter().any(|c| c == hash) {
      candidates.insert(0, hash.to_string());
    }

    self.scheduler.enqueue(
      StatusJob {
        repo: repo.path.clone(),
        hash: hash.to_string(),
        candidates,
        remote_url: repo.remote_url.clone(),
        provider: repo.provider,
        credentials: repo.credentials.clone(),
        detail: repo.detail,
        page: 1,
        matched: false,
      },
      false,
    )
  }

  /// Cached statuses for a commit, synchronously. Reads never touch the
  /// network; pair with [`fetch`](Self::fetch) to queue a background
  /// refresh - refreshing needs the provider config a bare cache key
  /// does not carry.
  pub fn get_statuses(&self, repo: &str, commit: &str) -> Vec<StatusRecord> {
    self.scheduler.runner().cache.get(repo, commit)
  }

  pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
    self.scheduler.runner().emitter.subscribe()
  }

  pub fn remove_repo(&self, repo: &str) {
    self.scheduler.runner().cache.remove_repo(repo);
  }

  pub fn clear_cache(&self) {
    self.scheduler.runner().cache.clear();
  }

  pub fn dispose(&self) {
    self.scheduler.dispose();
  }

  #[cfg(test)]
  async fn tick(&self) -> Result<bool> {
    self.scheduler.tick(crate::queue::now_ms()).await
  }

  #[cfg(test)]
  fn queued(&self) -> usize {
    self.scheduler.queue_len()
  }
}

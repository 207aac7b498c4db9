//! The fetch scheduler: a single-task polling loop over the request queue,
//! per-provider rate-limit state and the dispatch outcome state machine.
//!
//! One scheduler instance serializes to one network call at a time; the
//! CI-status and avatar managers each own an independent instance. The
//! domain half (request building, body handling, cache writes) lives behind
//! the [`JobRunner`] trait so the machine itself stays provider-agnostic.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::providers::{parse_rate_limit, Provider, RateLimit};
use crate::queue::{now_ms, Pending, QueueItem, RequestQueue};
use crate::transport::{HttpResponse, HttpTransport, ProviderRequest};

/// Interval between queue polls while there is pending work.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Total tries for a retryable-not-found outcome before giving up.
pub const MAX_ATTEMPTS: u32 = 4;

/// Provider pause after a 5xx response.
const SERVER_ERROR_PAUSE_MS: i64 = 600_000;
/// Provider pause after a transport-level failure.
const TRANSPORT_ERROR_PAUSE_MS: i64 = 300_000;
/// Provider pause after a rate-limit response without a parseable reset.
const RATE_LIMIT_FALLBACK_MS: i64 = 600_000;

/// A queue item the scheduler can dispatch.
pub trait Job: QueueItem {
  /// Rate-limit class shared by all requests to the same provider.
  fn provider(&self) -> Provider;
}

/// How a 200 response body was handled by the domain runner.
pub enum Completion<T> {
  /// Records parsed, cached and announced; optional follow-up requests
  /// (next page, avatar source fallback) to enqueue immediately.
  Done { followups: Vec<T> },
  /// Well-formed response with no matching records: retry, bounded.
  Empty,
  /// Malformed body - it will not self-correct, so the item is dropped.
  Malformed { message: String },
}

/// Domain half of the machine. The scheduler owns timing, rate limits and
/// retries; the runner owns requests, parsing, cache writes and events.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
  type Item: Job;

  /// Build the HTTP request for an item. An error means structural
  /// misconfiguration (the remote URL matches no provider pattern): the
  /// item is dropped with a log line and no network call is made.
  fn prepare(&self, item: &Self::Item) -> Result<ProviderRequest, String>;

  /// Consume a 200 response.
  async fn complete(&self, item: &Self::Item, response: &HttpResponse) -> Completion<Self::Item>;

  /// Replacement item to enqueue on a 404 instead of dropping (Gravatar's
  /// identicon retry). Default: 404 is terminal.
  fn not_found_followup(&self, _item: &Self::Item) -> Option<Self::Item> {
    None
  }

  /// The queue drained: release memoized remote-URL lookups.
  fn on_idle(&self) {}
}

struct Inner<R: JobRunner> {
  queue: Mutex<RequestQueue<R::Item>>,
  wake: Arc<Notify>,
  /// provider -> epoch ms until which dispatch is paused. Per-instance,
  /// never persisted; restarts begin unpaused.
  rate_limits: Mutex<HashMap<Provider, i64>>,
  runner: R,
  transport: Arc<dyn HttpTransport>,
  disposed: AtomicBool,
}

pub struct FetchScheduler<R: JobRunner> {
  inner: Arc<Inner<R>>,
}

impl<R: JobRunner> Clone for FetchScheduler<R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<R: JobRunner> FetchScheduler<R> {
  pub fn new(runner: R, transport: Arc<dyn HttpTransport>) -> Self {
    let wake = Arc::new(Notify::new());
    Self {
      inner: Arc::new(Inner {
        queue: Mutex::new(RequestQueue::new(Arc::clone(&wake))),
        wake,
        rate_limits: Mutex::new(HashMap::new()),
        runner,
        transport,
        disposed: AtomicBool::new(false),
      }),
    }
  }

  pub fn runner(&self) -> &R {
    &self.inner.runner
  }

  /// Queue a request; merges with an already-pending request for the same
  /// identity key.
  pub fn enqueue(&self, item: R::Item, immediate: bool) -> Result<()> {
    self.lock_queue()?.add(item, immediate);
    Ok(())
  }

  /// Stop the polling loop. In-flight completions after this point are
  /// discarded: no cache write, no requeue, no event.
  pub fn dispose(&self) {
    self.inner.disposed.store(true, Ordering::SeqCst);
    self.inner.wake.notify_one();
  }

  pub fn is_disposed(&self) -> bool {
    self.inner.disposed.load(Ordering::SeqCst)
  }

  /// Epoch ms until which a provider is paused (0 when unpaused).
  pub fn rate_limited_until(&self, provider: Provider) -> Result<i64> {
    Ok(
      self
        .lock_rate_limits()?
        .get(&provider)
        .copied()
        .unwrap_or(0),
    )
  }

  /// Run the polling loop until disposal: tick every [`POLL_INTERVAL`]
  /// while the queue holds work, park on the wake signal when it drains.
  pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
    let scheduler = self.clone();
    tokio::spawn(async move { scheduler.run_loop().await })
  }

  async fn run_loop(&self) {
    loop {
      if self.is_disposed() {
        break;
      }

      let has_items = self.lock_queue().map(|q| q.has_items()).unwrap_or(false);
      if !has_items {
        self.inner.runner.on_idle();
        self.inner.wake.notified().await;
        continue;
      }

      if let Err(e) = self.tick(now_ms()).await {
        warn!(error = %e, "scheduler tick failed");
      }

      // Disposal also signals the wake, so shutdown does not wait out the
      // full poll interval.
      tokio::select! {
        _ = tokio::time::sleep(POLL_INTERVAL) => {}
        _ = self.inner.wake.notified() => {}
      }
    }
  }

  /// Service at most one due request. Returns false when nothing was due.
  pub async fn tick(&self, now: i64) -> Result<bool> {
    if self.is_disposed() {
      return Ok(false);
    }
    let pending = match self.lock_queue()?.take_item(now) {
      Some(pending) => pending,
      None => return Ok(false),
    };
    let provider = pending.item.provider();

    // Rate-limit gate: do not dispatch while the provider is paused.
    let paused_until = self.rate_limited_until(provider)?;
    if paused_until > now {
      debug!(%provider, paused_until, "provider paused, deferring request");
      self.lock_queue()?.add_item(pending, paused_until, false);
      return Ok(true);
    }

    let request = match self.inner.runner.prepare(&pending.item) {
      Ok(request) => request,
      Err(reason) => {
        warn!(%provider, item = ?pending.item, reason, "request dropped, not dispatchable");
        return Ok(true);
      }
    };

    debug!(%provider, url = %request.url(), attempts = pending.attempts, "dispatching");
    let result = self.inner.transport.get(&request).await;

    // One-shot completion guard: a call that finishes after disposal must
    // not touch the cache or the queue.
    if self.is_disposed() {
      return Ok(true);
    }

    let response = match result {
      Ok(response) => response,
      Err(e) => {
        let until = now_ms() + TRANSPORT_ERROR_PAUSE_MS;
        warn!(%provider, error = %e, "transport error, pausing provider for 5 minutes");
        self.pause_provider(provider, until)?;
        self.lock_queue()?.add_item(pending, until, false);
        return Ok(true);
      }
    };

    let rate = parse_rate_limit(provider, &response.headers);
    match response.status {
      200 => {
        // Rate-limit headers update state no matter what the body holds.
        match rate {
          RateLimit::Known {
            limit,
            remaining,
            reset_ms,
          } => {
            debug!(%provider, limit, remaining, reset_ms, "rate limit status");
            if remaining == 0 {
              self.pause_provider(provider, reset_ms)?;
            }
          }
          RateLimit::Unknown => debug!(%provider, "rate limit headers absent or malformed"),
        }

        match self.inner.runner.complete(&pending.item, &response).await {
          Completion::Done { followups } => {
            let mut queue = self.lock_queue()?;
            for followup in followups {
              queue.add(followup, true);
            }
          }
          Completion::Empty => self.retry_or_drop(pending, provider)?,
          Completion::Malformed { message } => {
            warn!(%provider, item = ?pending.item, message, "malformed response body, dropping request");
          }
        }
      }
      403 | 429 => {
        let until = match rate {
          RateLimit::Known { reset_ms, .. } => reset_ms,
          RateLimit::Unknown => now_ms() + RATE_LIMIT_FALLBACK_MS,
        };
        warn!(%provider, until, "rate limited, pausing provider");
        self.pause_provider(provider, until)?;
        self.lock_queue()?.add_item(pending, until, false);
      }
      // GitHub answers 422 while the pushed commit is not yet recognized.
      422 => self.retry_or_drop(pending, provider)?,
      404 => match self.inner.runner.not_found_followup(&pending.item) {
        Some(followup) => self.lock_queue()?.add(followup, true),
        None => info!(%provider, item = ?pending.item, "resource not found, dropping request"),
      },
      status if status >= 500 => {
        let until = now_ms() + SERVER_ERROR_PAUSE_MS;
        warn!(%provider, status, "server error, pausing provider for 10 minutes");
        self.pause_provider(provider, until)?;
        self.lock_queue()?.add_item(pending, until, false);
      }
      status => {
        warn!(%provider, status, item = ?pending.item, "unexpected response status, dropping request");
      }
    }

    Ok(true)
  }

  fn retry_or_drop(&self, pending: Pending<R::Item>, provider: Provider) -> Result<()> {
    if pending.attempts + 1 < MAX_ATTEMPTS {
      self.lock_queue()?.add_item(pending, 0, true);
    } else {
      warn!(
        %provider,
        item = ?pending.item,
        attempts = pending.attempts + 1,
        "no matching result after final attempt, dropping request"
      );
    }
    Ok(())
  }

  fn pause_provider(&self, provider: Provider, until: i64) -> Result<()> {
    self.lock_rate_limits()?.insert(provider, until);
    Ok(())
  }

  fn lock_queue(&self) -> Result<MutexGuard<'_, RequestQueue<R::Item>>> {
    self
      .inner
      .queue
      .lock()
      .map_err(|e| eyre!("Queue lock poisoned: {}", e))
  }

  fn lock_rate_limits(&self) -> Result<MutexGuard<'_, HashMap<Provider, i64>>> {
    self
      .inner
      .rate_limits
      .lock()
      .map_err(|e| eyre!("Rate limit lock poisoned: {}", e))
  }

  #[cfg(test)]
  pub(crate) fn queue_len(&self) -> usize {
    self.lock_queue().unwrap().len()
  }
}

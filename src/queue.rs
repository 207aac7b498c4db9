//! Time-ordered queue of pending fetch requests.
//!
//! Entries are kept sorted ascending by `check_after` (epoch ms). Adding an
//! entry whose identity key is already queued merges the payloads in place
//! instead of creating a duplicate, so each (repo, commit) or (email, repo)
//! pair has at most one pending request at any time.

use std::sync::Arc;
use tokio::sync::Notify;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
  chrono::Utc::now().timestamp_millis()
}

/// A unit of work that can sit in the queue.
pub trait QueueItem: Send + std::fmt::Debug + 'static {
  type Key: Eq + Send;

  /// Identity key used for merge-on-duplicate insertion.
  fn identity(&self) -> Self::Key;

  /// Merge a newer request for the same identity into this one
  /// (union candidate lists, keep the newer provider config).
  fn merge_from(&mut self, newer: Self);
}

/// A queued item together with its scheduling state.
#[derive(Debug)]
pub struct Pending<T> {
  pub item: T,
  /// Epoch ms before which this entry must not be dispatched.
  pub check_after: i64,
  /// Failed-attempt counter, bounded by the scheduler.
  pub attempts: u32,
}

/// Ordered list of pending requests, sorted ascending by `check_after`.
pub struct RequestQueue<T: QueueItem> {
  entries: Vec<Pending<T>>,
  /// Signalled on every empty -> non-empty transition; the scheduler's
  /// polling loop parks on this while the queue is drained.
  wake: Arc<Notify>,
}

impl<T: QueueItem> RequestQueue<T> {
  pub fn new(wake: Arc<Notify>) -> Self {
    Self {
      entries: Vec::new(),
      wake,
    }
  }

  /// Queue a new request, merging into an existing entry with the same
  /// identity (its queue position is left unchanged).
  ///
  /// New entries get `check_after = 0` when `immediate` is set or the queue
  /// was empty; otherwise they go after everything currently queued
  /// (`last.check_after + 1`, which keeps simultaneously-queued items in
  /// insertion order).
  pub fn add(&mut self, item: T, immediate: bool) {
    let key = item.identity();
    if let Some(existing) = self.entries.iter_mut().find(|e| e.item.identity() == key) {
      existing.item.merge_from(item);
      return;
    }

    let was_empty = self.entries.is_empty();
    let check_after = if immediate || was_empty {
      0
    } else {
      // Sorted, so the last entry holds the largest check_after.
      self.entries[self.entries.len() - 1].check_after + 1
    };

    self.insert_sorted(Pending {
      item,
      check_after,
      attempts: 0,
    });
    if was_empty {
      self.wake.notify_one();
    }
  }

  /// Re-queue an item after a dispatch outcome.
  ///
  /// Sets `check_after`, bumps the attempt counter iff the outcome counted
  /// as a failed attempt, and re-inserts in sorted position.
  pub fn add_item(&mut self, mut pending: Pending<T>, check_after: i64, failed_attempt: bool) {
    pending.check_after = check_after;
    if failed_attempt {
      pending.attempts += 1;
    }
    let was_empty = self.entries.is_empty();
    self.insert_sorted(pending);
    if was_empty {
      self.wake.notify_one();
    }
  }

  /// Remove and return the head entry if it is due, i.e. its `check_after`
  /// has passed. Never blocks - if the head is not yet due the caller will
  /// simply try again on the next tick.
  pub fn take_item(&mut self, now: i64) -> Option<Pending<T>> {
    match self.entries.first() {
      Some(head) if head.check_after <= now => Some(self.entries.remove(0)),
      _ => None,
    }
  }

  pub fn has_items(&self) -> bool {
    !self.entries.is_empty()
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  fn insert_sorted(&mut self, pending: Pending<T>) {
    let idx = self
      .entries
      .partition_point(|e| e.check_after <= pending.check_after);
    self.entries.insert(idx, pending);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[derive(Debug, PartialEq)]
  struct TestItem {
    key: String,
    candidates: Vec<String>,
  }

  impl QueueItem for TestItem {
    type Key = String;

    fn identity(&self) -> String {
      self.key.clone()
    }

    fn merge_from(&mut self, newer: Self) {
      for c in newer.candidates {
        if !self.candidates.contains(&c) {
          self.candidates.push(c);
        }
      }
    }
  }

  fn item(key: &str) -> TestItem {
    TestItem {
      key: key.to_string(),
      candidates: vec![key.to_string()],
    }
  }

  fn queue() -> RequestQueue<TestItem> {
    RequestQueue::new(Arc::new(Notify::new()))
  }

  fn check_afters(q: &RequestQueue<TestItem>) -> Vec<i64> {
    q.entries.iter().map(|e| e.check_after).collect()
  }

  #[test]
  fn test_add_keeps_queue_sorted() {
    let mut q = queue();
    q.add(item("a"), false);
    q.add(item("b"), false);
    q.add(item("c"), true);
    q.add(item("d"), false);

    let times = check_afters(&q);
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
  }

  #[test]
  fn test_later_adds_go_after_existing_entries() {
    let mut q = queue();
    q.add(item("a"), false);
    q.add(item("b"), false);
    q.add(item("c"), false);

    // First insert into an empty queue is immediate, the rest are strictly
    // ordered after it.
    assert_eq!(check_afters(&q), vec![0, 1, 2]);
  }

  #[test]
  fn test_duplicate_add_merges_candidates() {
    let mut q = queue();
    q.add(
      TestItem {
        key: "repo".to_string(),
        candidates: vec!["abc".to_string()],
      },
      false,
    );
    q.add(item("other"), false);
    q.add(
      TestItem {
        key: "repo".to_string(),
        candidates: vec!["abc".to_string(), "def".to_string()],
      },
      false,
    );

    assert_eq!(q.len(), 2);
    let merged = q.entries.iter().find(|e| e.item.key == "repo").unwrap();
    assert_eq!(merged.item.candidates, vec!["abc", "def"]);
    // Merge leaves the queue position (and check_after) unchanged.
    assert_eq!(merged.check_after, 0);
  }

  #[test]
  fn test_take_item_only_when_due() {
    let mut q = queue();
    q.add(item("a"), false);
    let taken = q.take_item(now_ms()).unwrap();
    q.add_item(taken, now_ms() + 60_000, false);

    assert!(q.take_item(now_ms()).is_none());
    assert!(q.has_items());
    assert!(q.take_item(now_ms() + 120_000).is_some());
    assert!(!q.has_items());
  }

  #[test]
  fn test_add_item_increments_attempts_on_failure_only() {
    let mut q = queue();
    q.add(item("a"), false);

    let taken = q.take_item(now_ms()).unwrap();
    assert_eq!(taken.attempts, 0);
    q.add_item(taken, 0, true);

    let taken = q.take_item(now_ms()).unwrap();
    assert_eq!(taken.attempts, 1);
    q.add_item(taken, 0, false);

    let taken = q.take_item(now_ms()).unwrap();
    assert_eq!(taken.attempts, 1);
  }

  #[test]
  fn test_ordering_holds_under_mixed_operations() {
    let mut q = queue();
    q.add(item("a"), false);
    q.add(item("b"), false);
    let taken = q.take_item(now_ms()).unwrap();
    q.add_item(taken, now_ms() + 300_000, false);
    q.add(item("c"), true);
    q.add(item("d"), false);

    let times = check_afters(&q);
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);
  }

  #[tokio::test]
  async fn test_wake_fires_on_empty_to_nonempty() {
    let wake = Arc::new(Notify::new());
    let mut q = RequestQueue::new(Arc::clone(&wake));

    q.add(item("a"), false);
    tokio::time::timeout(Duration::from_millis(50), wake.notified())
      .await
      .expect("wake should fire when the queue becomes non-empty");

    // A second add onto a non-empty queue does not signal again.
    q.add(item("b"), false);
    q.add(item("c"), false);
    assert!(
      tokio::time::timeout(Duration::from_millis(50), wake.notified())
        .await
        .is_err()
    );
  }
}

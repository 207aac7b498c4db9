//! Update notifications for cache changes.

use tokio::sync::broadcast;

/// Emitted whenever a fetch lands new data in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
  /// CI/CD statuses changed for a repository
  StatusesChanged { repo: String },
  /// A new avatar image was cached for an author email
  AvatarChanged { email: String },
}

/// Broadcast emitter with any number of subscribers.
///
/// Sending with no subscribers is fine - the event is simply dropped.
#[derive(Clone)]
pub struct Emitter {
  tx: broadcast::Sender<UpdateEvent>,
}

impl Emitter {
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(64);
    Self { tx }
  }

  /// Subscribe to future updates.
  pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
    self.tx.subscribe()
  }

  /// Notify all current subscribers.
  pub fn emit(&self, event: UpdateEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for Emitter {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_emit_reaches_all_subscribers() {
    let emitter = Emitter::new();
    let mut rx1 = emitter.subscribe();
    let mut rx2 = emitter.subscribe();

    emitter.emit(UpdateEvent::StatusesChanged {
      repo: "/work/widgets".to_string(),
    });

    let expected = UpdateEvent::StatusesChanged {
      repo: "/work/widgets".to_string(),
    };
    assert_eq!(rx1.recv().await.unwrap(), expected);
    assert_eq!(rx2.recv().await.unwrap(), expected);
  }

  #[test]
  fn test_emit_without_subscribers_is_noop() {
    let emitter = Emitter::new();
    emitter.emit(UpdateEvent::AvatarChanged {
      email: "a@b.c".to_string(),
    });
  }
}

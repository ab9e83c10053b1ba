//! Per-operation progress fan-out.
//!
//! Events for one operation are totally ordered by a sequence
//! number. Slow subscribers lag on the broadcast buffer and lose
//! the oldest buffered events; the terminal event is always the
//! newest, so it survives. Late subscribers get the cached
//! terminal immediately. Channels are garbage collected minutes
//! after terminal.

use std::sync::{
  Arc, Mutex,
  atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use docksmith_client::entities::{
  docksmith_timestamp,
  event::{EventKind, OperationEvent},
};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;
/// How long a terminal channel is kept for late subscribers.
pub const TERMINAL_RETENTION_MS: i64 = 5 * 60 * 1000;

#[derive(Default)]
pub struct EventHub {
  channels: DashMap<String, Arc<OperationChannel>>,
}

struct OperationChannel {
  sender: broadcast::Sender<OperationEvent>,
  sequence: AtomicU64,
  terminal: Mutex<Option<OperationEvent>>,
  terminal_at: Mutex<Option<i64>>,
}

impl OperationChannel {
  fn new() -> OperationChannel {
    let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
    OperationChannel {
      sender,
      sequence: AtomicU64::new(0),
      terminal: Mutex::new(None),
      terminal_at: Mutex::new(None),
    }
  }
}

impl EventHub {
  fn channel(&self, operation_id: &str) -> Arc<OperationChannel> {
    self
      .channels
      .entry(operation_id.to_string())
      .or_insert_with(|| Arc::new(OperationChannel::new()))
      .clone()
  }

  /// Publish the next event for an operation. Sequence numbers are
  /// assigned here, so publishers never race on ordering.
  pub fn publish(
    &self,
    operation_id: &str,
    kind: EventKind,
    payload: serde_json::Value,
  ) -> OperationEvent {
    let channel = self.channel(operation_id);
    let sequence =
      channel.sequence.fetch_add(1, Ordering::SeqCst) + 1;
    let event =
      OperationEvent::new(operation_id, sequence, kind, payload);
    if event.is_terminal() {
      *channel.terminal.lock().unwrap() = Some(event.clone());
      *channel.terminal_at.lock().unwrap() =
        Some(docksmith_timestamp());
    }
    // Send errors just mean nobody is listening.
    let _ = channel.sender.send(event.clone());
    event
  }

  /// Subscribe to an operation's events. The cached terminal event
  /// (if the operation already finished) comes back immediately so
  /// late subscribers do not hang forever.
  pub fn subscribe(
    &self,
    operation_id: &str,
  ) -> (Option<OperationEvent>, broadcast::Receiver<OperationEvent>)
  {
    let channel = self.channel(operation_id);
    let receiver = channel.sender.subscribe();
    let terminal = channel.terminal.lock().unwrap().clone();
    (terminal, receiver)
  }

  /// Drop channels whose terminal event is older than the
  /// retention window. Returns how many were collected.
  pub fn collect_garbage(&self) -> usize {
    let oldest = docksmith_timestamp() - TERMINAL_RETENTION_MS;
    let before = self.channels.len();
    self.channels.retain(|_, channel| {
      match *channel.terminal_at.lock().unwrap() {
        Some(at) => at > oldest,
        None => true,
      }
    });
    before - self.channels.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn events_are_sequenced_and_delivered() {
    let hub = EventHub::default();
    let (cached, mut rx) = hub.subscribe("op-1");
    assert!(cached.is_none());

    hub.publish(
      "op-1",
      EventKind::Status,
      serde_json::json!({"status": "validating"}),
    );
    hub.publish(
      "op-1",
      EventKind::Progress,
      serde_json::json!({"message": "pulling"}),
    );
    hub.publish(
      "op-1",
      EventKind::Complete,
      serde_json::json!({}),
    );

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let third = rx.recv().await.unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    assert_eq!(third.sequence, 3);
    assert!(third.is_terminal());
  }

  #[tokio::test]
  async fn late_subscriber_gets_cached_terminal() {
    let hub = EventHub::default();
    hub.publish("op-2", EventKind::Status, serde_json::json!({}));
    hub.publish(
      "op-2",
      EventKind::Fail,
      serde_json::json!({"error": "boom"}),
    );

    let (cached, _rx) = hub.subscribe("op-2");
    let cached = cached.expect("terminal cached");
    assert_eq!(cached.kind, EventKind::Fail);
    assert_eq!(cached.sequence, 2);
  }

  #[tokio::test]
  async fn slow_subscriber_never_loses_terminal() {
    let hub = EventHub::default();
    let (_, mut rx) = hub.subscribe("op-3");
    // Overflow the buffer several times over.
    for i in 0..500 {
      hub.publish(
        "op-3",
        EventKind::Progress,
        serde_json::json!({ "i": i }),
      );
    }
    hub.publish("op-3", EventKind::Complete, serde_json::json!({}));

    let mut saw_terminal = false;
    let mut last_sequence = 0;
    loop {
      match rx.recv().await {
        Ok(event) => {
          assert!(event.sequence > last_sequence);
          last_sequence = event.sequence;
          if event.is_terminal() {
            saw_terminal = true;
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
    assert!(saw_terminal);
  }

  #[tokio::test]
  async fn gc_only_collects_terminal_channels() {
    let hub = EventHub::default();
    hub.publish("live", EventKind::Status, serde_json::json!({}));
    hub.publish("done", EventKind::Complete, serde_json::json!({}));
    // Nothing old enough yet.
    assert_eq!(hub.collect_garbage(), 0);
    // Age the terminal channel artificially.
    if let Some(channel) = hub.channels.get("done") {
      *channel.terminal_at.lock().unwrap() =
        Some(docksmith_timestamp() - TERMINAL_RETENTION_MS - 1);
    }
    assert_eq!(hub.collect_garbage(), 1);
    assert!(hub.channels.get("live").is_some());
  }
}

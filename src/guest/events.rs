//! Guest event exchange and its streaming RPC.
//!
//! A small pub/sub bus: the task service publishes namespace-tagged
//! lifecycle envelopes, the events RPC streams them to the host shim in
//! publication order. Subscriber queues are bounded; a subscriber that
//! falls behind loses events (with a warning) rather than back-pressuring
//! publication; exit events must never be blocked by a stuck stream.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::protocol::{Envelope, TaskEvent};

/// Sink for event frames; implemented by the RPC connection writer.
#[async_trait]
pub trait EventSink: Send {
    /// Sends one envelope frame to the peer.
    async fn send(&mut self, envelope: Envelope) -> Result<()>;
}

/// Pub/sub bus for task lifecycle events.
pub struct EventExchange {
    subscribers: Mutex<Vec<mpsc::Sender<Envelope>>>,
}

impl Default for EventExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl EventExchange {
    /// Creates an exchange with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Publishes an event under a namespace; the topic is derived from the
    /// event variant. Delivery to each subscriber is non-blocking.
    pub fn publish(&self, namespace: &str, event: TaskEvent) {
        let envelope = Envelope {
            timestamp: Utc::now(),
            namespace: namespace.to_string(),
            topic: event.topic().to_string(),
            event,
        };

        let mut subs = self.subscribers.lock().expect("event exchange poisoned");
        subs.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic = %envelope.topic, "dropping event for slow subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        debug!(
            namespace = %envelope.namespace,
            topic = %envelope.topic,
            subscribers = subs.len(),
            "event published"
        );
    }

    /// Opens a bounded subscription to all future events.
    pub fn subscribe(&self) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .expect("event exchange poisoned")
            .push(tx);
        rx
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("event exchange poisoned")
            .len()
    }
}

/// Streams envelopes to a sink until cancellation or the sink fails.
///
/// This is the body of the events `stream` RPC: subscribe first, then relay
/// in publication order. The subscription dies with the stream, so a
/// disconnected host simply re-subscribes on reconnect.
pub async fn stream_events<S: EventSink>(
    exchange: &EventExchange,
    sink: &mut S,
    cancel: CancellationToken,
) -> Result<()> {
    let mut rx = exchange.subscribe();
    debug!("event stream opened");

    loop {
        tokio::select! {
            envelope = rx.recv() => match envelope {
                Some(envelope) => sink.send(envelope).await?,
                None => return Ok(()),
            },
            _ = cancel.cancelled() => {
                debug!("event stream cancelled");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::topics;

    fn exit_event(container: &str, pid: i32) -> TaskEvent {
        TaskEvent::TaskExit {
            container_id: container.into(),
            exec_id: String::new(),
            pid,
            exit_status: 0,
            exited_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let exchange = EventExchange::new();
        let mut rx = exchange.subscribe();

        exchange.publish("default", exit_event("c1", 1));
        exchange.publish("default", exit_event("c1", 2));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.topic, topics::TASK_EXIT);
        match (first.event, second.event) {
            (TaskEvent::TaskExit { pid: p1, .. }, TaskEvent::TaskExit { pid: p2, .. }) => {
                assert_eq!((p1, p2), (1, 2));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let exchange = EventExchange::new();
        let rx = exchange.subscribe();
        assert_eq!(exchange.subscriber_count(), 1);

        drop(rx);
        exchange.publish("default", exit_event("c1", 1));
        assert_eq!(exchange.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_event_not_publisher() {
        let exchange = EventExchange::new();
        let mut rx = exchange.subscribe();

        // Publish past the queue bound; publish must never block.
        for pid in 0..(EVENT_CHANNEL_CAPACITY as i32 + 16) {
            exchange.publish("default", exit_event("c1", pid));
        }

        // Subscriber still receives the first events in order.
        let first = rx.recv().await.unwrap();
        match first.event {
            TaskEvent::TaskExit { pid, .. } => assert_eq!(pid, 0),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(exchange.subscriber_count(), 1);
    }

    struct VecSink(Vec<Envelope>);

    #[async_trait]
    impl EventSink for VecSink {
        async fn send(&mut self, envelope: Envelope) -> Result<()> {
            self.0.push(envelope);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stream_relays_until_cancelled() {
        let exchange = std::sync::Arc::new(EventExchange::new());
        let cancel = CancellationToken::new();

        let handle = {
            let exchange = std::sync::Arc::clone(&exchange);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut sink = VecSink(Vec::new());
                stream_events(&exchange, &mut sink, cancel).await.unwrap();
                sink.0
            })
        };

        // Give the stream a moment to subscribe before publishing.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        exchange.publish("default", exit_event("c1", 9));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let seen = handle.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].namespace, "default");
    }
}

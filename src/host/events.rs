//! Forwards guest events to containerd.
//!
//! A single consumer drains the multi-producer `events` channel and
//! publishes to containerd through the [`EventPublisher`] seam, retrying
//! each publish on the bounded 100 ms → 2 s backoff. Publication order is
//! therefore first-in-first-out per container.
//!
//! Producers go through [`EventForwarder::send`], which checks the closed
//! flag first: during intentional shutdown events are dropped, never
//! pushed into a closed channel. That loss window is the only one:
//! containerd cannot observe an event that was never sent, so ordering
//! among delivered events is unaffected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::Result;
use crate::host::connection::retry_transient;
use crate::protocol::Envelope;

/// Seam to containerd's event publication RPC.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one envelope to containerd.
    async fn publish(&self, envelope: &Envelope) -> Result<()>;
}

/// Multi-producer, single-consumer event forwarding.
pub struct EventForwarder {
    tx: std::sync::Mutex<Option<mpsc::Sender<Envelope>>>,
    closed: AtomicBool,
    consumer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventForwarder {
    /// Spawns the consumer over the given publisher.
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(EVENT_CHANNEL_CAPACITY);

        let consumer = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let result = retry_transient("publish event", || {
                    let publisher = Arc::clone(&publisher);
                    let envelope = envelope.clone();
                    async move { publisher.publish(&envelope).await }
                })
                .await;

                match result {
                    Ok(()) => {
                        debug!(topic = %envelope.topic, "event forwarded");
                    }
                    Err(err) => {
                        // Bounded retry exhausted: drop rather than stall
                        // every later event behind an unreachable daemon.
                        warn!(topic = %envelope.topic, error = %err, "dropping event after retries");
                    }
                }
            }
        });

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            consumer: std::sync::Mutex::new(Some(consumer)),
        }
    }

    /// Enqueues an event for publication. Returns false (dropping the
    /// event) when the forwarder has been shut down. The closed check
    /// lives inside this send indirection so no producer ever races a
    /// closed channel.
    pub async fn send(&self, envelope: Envelope) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(topic = %envelope.topic, "event dropped during shutdown");
            return false;
        }
        let tx = {
            let guard = self.tx.lock().expect("event sender poisoned");
            guard.clone()
        };
        match tx {
            Some(tx) => tx.send(envelope).await.is_ok(),
            None => false,
        }
    }

    /// Stops accepting events; the consumer drains what is queued and
    /// exits.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tx.lock().expect("event sender poisoned").take();
        let consumer = self.consumer.lock().expect("event consumer poisoned").take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
    }
}

// =============================================================================
// Containerd Publisher
// =============================================================================

/// Publishes events by invoking `containerd publish`, the mechanism
/// containerd provides to v2 shims. The envelope travels as JSON on
/// stdin.
pub struct ContainerdPublisher {
    /// Path to the containerd binary.
    pub binary: std::path::PathBuf,
    /// Containerd GRPC address.
    pub address: String,
}

#[async_trait]
impl EventPublisher for ContainerdPublisher {
    async fn publish(&self, envelope: &Envelope) -> Result<()> {
        use crate::error::Error;
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("--address")
            .arg(&self.address)
            .arg("publish")
            .arg("--namespace")
            .arg(&envelope.namespace)
            .arg("--topic")
            .arg(&envelope.topic)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::RpcUnavailable(format!("containerd publish spawn: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(&envelope.event)?).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::RpcUnavailable(format!(
                "containerd publish failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::TaskEvent;
    use chrono::Utc;
    use std::sync::Mutex;

    struct RecordingPublisher {
        published: Mutex<Vec<String>>,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, envelope: &Envelope) -> Result<()> {
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(Error::RpcUnavailable("daemon busy".into()));
            }
            self.published.lock().unwrap().push(envelope.topic.clone());
            Ok(())
        }
    }

    fn envelope(topic: &str) -> Envelope {
        Envelope {
            timestamp: Utc::now(),
            namespace: "default".into(),
            topic: topic.into(),
            event: TaskEvent::TaskCreate {
                container_id: "c1".into(),
                pid: 1,
            },
        }
    }

    #[tokio::test]
    async fn forwards_in_order_with_retry() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_first: AtomicBool::new(true),
        });
        let forwarder = EventForwarder::new(Arc::clone(&publisher) as Arc<dyn EventPublisher>);

        assert!(forwarder.send(envelope("/tasks/create")).await);
        assert!(forwarder.send(envelope("/tasks/start")).await);
        assert!(forwarder.send(envelope("/tasks/exit")).await);
        forwarder.shutdown().await;

        let published = publisher.published.lock().unwrap();
        assert_eq!(
            *published,
            vec!["/tasks/create", "/tasks/start", "/tasks/exit"]
        );
    }

    #[tokio::test]
    async fn closed_forwarder_drops_events() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(Vec::new()),
            fail_first: AtomicBool::new(false),
        });
        let forwarder = EventForwarder::new(Arc::clone(&publisher) as Arc<dyn EventPublisher>);

        // Flip the closed flag as shutdown would, then send.
        forwarder.closed.store(true, Ordering::SeqCst);
        assert!(!forwarder.send(envelope("/tasks/exit")).await);
        forwarder.shutdown().await;
        assert!(publisher.published.lock().unwrap().is_empty());
    }
}

//! Fan-out of operation events to live push-stream subscribers.
//!
//! A publish pass snapshots the subscriber set, writes the framed event to
//! every subscriber concurrently with a per-write timeout, and only then
//! evicts the subscribers whose write failed. There is no buffering: events
//! published while nobody listens are dropped.

use crate::Event;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::bytes::Bytes;
use tracing::{debug, warn};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("subscriber disconnected")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

/// Transport end of one subscriber
#[async_trait]
pub trait EventSink: Send + Sync {
    /// True once the peer is known to be gone
    fn is_closed(&self) -> bool;

    async fn write(&self, frame: Bytes) -> Result<(), SinkError>;
}

/// Bounded in-process channel feeding an HTTP response body
struct ChannelSink {
    sender: mpsc::Sender<Bytes>,
}

#[async_trait]
impl EventSink for ChannelSink {
    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn write(&self, frame: Bytes) -> Result<(), SinkError> {
        self.sender.send(frame).await.map_err(|_| SinkError::Closed)
    }
}

/// Result of one [`EventBroadcaster::publish`] call
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PublishReport {
    pub attempted: usize,
    pub delivered: usize,
    pub evicted: Vec<SubscriberId>,
}

impl PublishReport {
    /// Nobody was subscribed, so nothing was written
    pub fn is_noop(&self) -> bool {
        self.attempted == 0
    }
}

type Subscribers = BTreeMap<SubscriberId, Arc<dyn EventSink>>;

struct Inner {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
    write_timeout: Duration,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-service subscriber registry. Cloning shares the same set.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_TIMEOUT)
    }
}

impl EventBroadcaster {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                write_timeout,
            }),
        }
    }

    /// Register a subscriber backed by a bounded channel. Dropping the
    /// returned stream unsubscribes it.
    pub fn subscribe(&self) -> (SubscriberId, SubscriberStream) {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.subscribe_sink(Arc::new(ChannelSink { sender }));
        let stream = SubscriberStream {
            id,
            inner: ReceiverStream::new(receiver),
            owner: Arc::downgrade(&self.inner),
        };
        (id, stream)
    }

    pub fn subscribe_sink(&self, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut subscribers = self.inner.lock();
            subscribers.insert(id, sink);
            subscribers.len()
        };
        debug!(subscriber = %id, count, "Subscriber connected");
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        remove(&self.inner, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub async fn publish(&self, event: &Event) -> PublishReport {
        let targets: Vec<(SubscriberId, Arc<dyn EventSink>)> = {
            let mut subscribers = self.inner.lock();
            subscribers.retain(|_, sink| !sink.is_closed());
            subscribers
                .iter()
                .map(|(id, sink)| (*id, sink.clone()))
                .collect()
        };

        if targets.is_empty() {
            debug!(event_type = event.event_type(), "No subscribers, event dropped");
            return PublishReport::default();
        }

        let frame = Bytes::from(event.to_frame());
        let timeout = self.inner.write_timeout;
        let writes = targets.iter().map(|(id, sink)| {
            let frame = frame.clone();
            async move {
                let result = match tokio::time::timeout(timeout, sink.write(frame)).await {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Write(format!("timed out after {timeout:?}"))),
                };
                (*id, result)
            }
        });

        let mut report = PublishReport {
            attempted: targets.len(),
            ..Default::default()
        };
        for (id, result) in join_all(writes).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(subscriber = %id, error = %e, "Dropping subscriber");
                    report.evicted.push(id);
                }
            }
        }

        // Evict only after the whole pass
        if !report.evicted.is_empty() {
            let mut subscribers = self.inner.lock();
            for id in &report.evicted {
                subscribers.remove(id);
            }
        }

        debug!(
            event_type = event.event_type(),
            delivered = report.delivered,
            evicted = report.evicted.len(),
            "Event published"
        );
        report
    }
}

fn remove(inner: &Inner, id: SubscriberId) -> bool {
    let removed = inner.lock().remove(&id).is_some();
    if removed {
        debug!(subscriber = %id, "Subscriber disconnected");
    }
    removed
}

/// Framed events for one subscriber, ready to be used as a response body
pub struct SubscriberStream {
    id: SubscriberId,
    inner: ReceiverStream<Bytes>,
    owner: Weak<Inner>,
}

impl SubscriberStream {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}

impl Stream for SubscriberStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        if let Some(inner) = self.owner.upgrade() {
            remove(&inner, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use tokio_stream::StreamExt;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        fn is_closed(&self) -> bool {
            false
        }

        async fn write(&self, _frame: Bytes) -> Result<(), SinkError> {
            Err(SinkError::Write("connection reset by peer".to_string()))
        }
    }

    struct StalledSink;

    #[async_trait]
    impl EventSink for StalledSink {
        fn is_closed(&self) -> bool {
            false
        }

        async fn write(&self, _frame: Bytes) -> Result<(), SinkError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Bytes>>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn write(&self, frame: Bytes) -> Result<(), SinkError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn event(kind: &str) -> Event {
        Event::new(kind, json!({"sheet_id": "abc"}))
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let broadcaster = EventBroadcaster::default();
        let report = broadcaster.publish(&event("sheet_created")).await;
        assert!(report.is_noop());
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn test_failed_write_does_not_block_others() {
        let broadcaster = EventBroadcaster::default();
        let failing = broadcaster.subscribe_sink(Arc::new(FailingSink));
        let healthy = Arc::new(RecordingSink::default());
        broadcaster.subscribe_sink(healthy.clone());

        let report = broadcaster.publish(&event("sheet_created")).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![failing]);
        assert_eq!(broadcaster.subscriber_count(), 1);

        let frames = healthy.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(b"event: sheet_created\n"));
    }

    #[tokio::test]
    async fn test_stalled_subscriber_is_bounded() {
        let broadcaster = EventBroadcaster::new(Duration::from_millis(50));
        let stalled = broadcaster.subscribe_sink(Arc::new(StalledSink));
        let healthy = Arc::new(RecordingSink::default());
        broadcaster.subscribe_sink(healthy.clone());

        let report = broadcaster.publish(&event("email_sent")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec![stalled]);
        assert_eq!(healthy.frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_sink_is_pruned_before_writing() {
        let broadcaster = EventBroadcaster::default();
        let sink = Arc::new(RecordingSink::default());
        broadcaster.subscribe_sink(sink.clone());
        sink.closed.store(true, Ordering::SeqCst);

        let report = broadcaster.publish(&event("file_uploaded")).await;
        assert!(report.is_noop());
        assert!(sink.frames.lock().unwrap().is_empty());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_events_while_connected() {
        let broadcaster = EventBroadcaster::default();
        broadcaster.publish(&event("before")).await;

        let (_, mut stream) = broadcaster.subscribe();
        broadcaster.publish(&event("first")).await;
        broadcaster.publish(&event("second")).await;

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(first.starts_with(b"event: first\n"));
        assert!(second.starts_with(b"event: second\n"));

        drop(stream);
        assert_eq!(broadcaster.subscriber_count(), 0);

        let report = broadcaster.publish(&event("third")).await;
        assert!(report.is_noop());
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let broadcaster = EventBroadcaster::default();
        let (id, _stream) = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
        assert!(broadcaster.publish(&event("ignored")).await.is_noop());
    }
}

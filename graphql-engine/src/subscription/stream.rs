use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::EventSource;
use super::STREAM_SPAN_NAME;
use super::subscriber::SubscriberHandle;
use crate::configuration::DEFAULT_QUEUE_CAPACITY;
use crate::configuration::IdleStreamPolicy;
use crate::error::SubscriptionError;

/// Lifecycle of a [`Stream`]. A stream only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Created, upstream not opened yet.
    Idle,
    /// Upstream is open and events are fanned out.
    Running,
    /// Upstream closed. No subscriber can attach anymore.
    Stopped,
}

/// One upstream event source fanned out to any number of subscribers.
///
/// The upstream is opened when the first subscriber attaches. Events go
/// through a bounded ring of `queue_capacity` events; a subscriber that falls
/// behind loses the oldest events instead of holding back the others.
pub struct Stream {
    input: Bytes,
    source: Arc<dyn EventSource>,
    events: broadcast::Sender<Bytes>,
    idle_stream: IdleStreamPolicy,
    shutdown: CancellationToken,
    next_subscriber: AtomicU64,
    inner: Mutex<Inner>,
}

struct Inner {
    state: StreamState,
    subscribers: HashSet<u64>,
    error: Option<SubscriptionError>,
}

/// A subscriber registered on a stream, not forwarding yet.
pub(crate) struct Registration {
    id: u64,
    events: broadcast::Receiver<Bytes>,
}

#[buildstructor::buildstructor]
impl Stream {
    #[builder]
    pub fn new(
        input: Bytes,
        source: Arc<dyn EventSource>,
        queue_capacity: Option<usize>,
        idle_stream: Option<IdleStreamPolicy>,
    ) -> Stream {
        let capacity = queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY).max(1);
        let (events, _) = broadcast::channel(capacity);
        Stream {
            input,
            source,
            events,
            idle_stream: idle_stream.unwrap_or_default(),
            shutdown: CancellationToken::new(),
            next_subscriber: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                state: StreamState::Idle,
                subscribers: HashSet::new(),
                error: None,
            }),
        }
    }
}

impl Stream {
    /// Attaches `subscriber` and forwards events to it until it is done, its
    /// consumer went away, or the upstream closed.
    ///
    /// Fails with [`SubscriptionError::Closed`] when the stream is already
    /// stopped; the subscriber's results channel is closed in that case.
    pub async fn start(
        self: &Arc<Self>,
        subscriber: SubscriberHandle,
    ) -> Result<(), SubscriptionError> {
        let registration = self.register()?;
        self.forward(registration, &subscriber).await;
        Ok(())
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == StreamState::Stopped
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Why the upstream closed, if it did not end normally.
    pub fn error(&self) -> Option<SubscriptionError> {
        self.inner.lock().error.clone()
    }

    /// Closes the upstream and detaches every subscriber. Idempotent.
    pub fn stop(&self) {
        self.inner.lock().state = StreamState::Stopped;
        self.shutdown.cancel();
    }

    pub(crate) fn register(self: &Arc<Self>) -> Result<Registration, SubscriptionError> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        // subscribed before the upstream can produce its first event
        let events = self.events.subscribe();
        let mut inner = self.inner.lock();
        match inner.state {
            StreamState::Stopped => return Err(SubscriptionError::Closed),
            StreamState::Idle => {
                inner.state = StreamState::Running;
                self.spawn_upstream();
            }
            StreamState::Running => {}
        }
        inner.subscribers.insert(id);
        tracing::debug!(subscriber = id, count = inner.subscribers.len(), "subscriber attached");

        Ok(Registration { id, events })
    }

    pub(crate) async fn forward(&self, registration: Registration, subscriber: &SubscriberHandle) {
        let Registration { id, mut events } = registration;

        loop {
            let event = tokio::select! {
                biased;
                _ = subscriber.done().cancelled() => break,
                event = events.recv() => event,
                _ = self.shutdown.cancelled() => break,
            };

            match event {
                Ok(event) => {
                    let sent = tokio::select! {
                        biased;
                        _ = subscriber.done().cancelled() => break,
                        sent = subscriber.results().send(event) => sent,
                    };
                    if sent.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(subscriber = id, skipped, "subscriber is too slow, dropping events");
                }
                Err(RecvError::Closed) => break,
            }
        }

        self.unregister(id);
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        if !inner.subscribers.remove(&id) {
            return;
        }
        tracing::debug!(subscriber = id, count = inner.subscribers.len(), "subscriber detached");

        if inner.subscribers.is_empty()
            && self.idle_stream == IdleStreamPolicy::Evict
            && inner.state == StreamState::Running
        {
            tracing::debug!("closing idle stream");
            inner.state = StreamState::Stopped;
            drop(inner);
            self.shutdown.cancel();
        }
    }

    fn spawn_upstream(self: &Arc<Self>) {
        let stream = Arc::clone(self);
        tokio::spawn(
            async move { stream.run_upstream().await }
                .instrument(tracing::info_span!(STREAM_SPAN_NAME, "otel.kind" = "INTERNAL")),
        );
    }

    async fn run_upstream(&self) {
        let opened = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            opened = self.source.open(&self.input) => opened,
        };
        let mut upstream = match opened {
            Ok(upstream) => upstream,
            Err(err) => {
                tracing::warn!(%err, "could not open upstream event source");
                self.inner.lock().error = Some(SubscriptionError::UpstreamOpen {
                    reason: err.to_string(),
                });
                self.stop();
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = upstream.next() => match event {
                    // fails only when nobody listens, the event is dropped then
                    Some(event) => {
                        let _ = self.events.send(event);
                    }
                    None => break,
                },
            }
        }

        tracing::debug!("upstream closed");
        self.stop();
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Stream")
            .field("input", &self.input)
            .field("state", &inner.state)
            .field("subscribers", &inner.subscribers.len())
            .field("idle_stream", &self.idle_stream)
            .finish()
    }
}

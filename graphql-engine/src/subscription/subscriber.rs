use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The consumer side of one subscription attached to a [`Stream`](super::Stream).
///
/// Dropping the subscriber, calling [`Subscriber::stop`] or cancelling the
/// token it was created from all signal the stream to let go of it.
#[derive(Debug)]
pub struct Subscriber {
    next: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
}

/// The producer side handed to [`Stream::start`](super::Stream::start).
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    results: mpsc::Sender<Bytes>,
    done: CancellationToken,
}

impl Subscriber {
    /// Creates a subscriber that stops when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> (Subscriber, SubscriberHandle) {
        let (results, next) = mpsc::channel(1);
        let stop = parent.child_token();
        let handle = SubscriberHandle {
            results,
            done: stop.clone(),
        };
        (Subscriber { next, stop }, handle)
    }

    /// Waits for the next result.
    ///
    /// Returns `None` when `cancellation` fires or when the stream let go of
    /// this subscriber.
    pub async fn next(&mut self, cancellation: &CancellationToken) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            result = self.next.recv() => result,
        }
    }

    /// Signals the stream that no more results are wanted. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl SubscriberHandle {
    pub fn results(&self) -> &mpsc::Sender<Bytes> {
        &self.results
    }

    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled() || self.results.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_reach_the_consumer() {
        let (mut subscriber, handle) = Subscriber::new(&CancellationToken::new());
        handle.results().send(Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(
            subscriber.next(&CancellationToken::new()).await,
            Some(Bytes::from_static(b"1"))
        );
    }

    #[tokio::test]
    async fn cancelled_context_ends_next() {
        let (mut subscriber, _handle) = Subscriber::new(&CancellationToken::new());
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        assert_eq!(subscriber.next(&cancellation).await, None);
    }

    #[test]
    fn stop_is_idempotent_and_visible_to_the_producer() {
        let (subscriber, handle) = Subscriber::new(&CancellationToken::new());
        subscriber.stop();
        subscriber.stop();
        assert!(subscriber.is_stopped());
        assert!(handle.is_done());
    }

    #[test]
    fn parent_cancellation_closes_done() {
        let parent = CancellationToken::new();
        let (_subscriber, handle) = Subscriber::new(&parent);
        parent.cancel();
        assert!(handle.done().is_cancelled());
    }

    #[test]
    fn dropping_the_subscriber_closes_done() {
        let (subscriber, handle) = Subscriber::new(&CancellationToken::new());
        drop(subscriber);
        assert!(handle.is_done());
    }
}

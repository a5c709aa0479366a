use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A point to point subscription: one producer, one consumer, no fan-out.
///
/// The channel holds a single result, a producer waits for the consumer to
/// take it before sending the next one.
#[derive(Debug)]
pub struct Trigger {
    subscription_id: u64,
    results: mpsc::Receiver<Bytes>,
}

impl Trigger {
    /// Returns the trigger and the sender feeding it.
    pub fn new(subscription_id: u64) -> (Trigger, mpsc::Sender<Bytes>) {
        let (sender, results) = mpsc::channel(1);
        (
            Trigger {
                subscription_id,
                results,
            },
            sender,
        )
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription_id
    }

    /// Waits for the next result, `None` once `cancellation` fires or the
    /// producer went away.
    pub async fn next(&mut self, cancellation: &CancellationToken) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            result = self.results.recv() => result,
        }
    }
}

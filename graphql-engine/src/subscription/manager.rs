use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Stream;
use super::StreamFactory;
use crate::configuration::SubscriptionConfig;

/// Shares one [`Stream`] between every subscription with the same identity.
///
/// Lookup and creation happen under a single lock so concurrent subscriptions
/// with the same identity always end up on the same stream. Factories must
/// not do I/O in [`StreamFactory::stream`]; the upstream is only opened when
/// the first subscriber attaches.
#[derive(Debug)]
pub struct StreamManager {
    enable_deduplication: bool,
    streams: Mutex<HashMap<Vec<u8>, Arc<Stream>>>,
}

impl Default for StreamManager {
    fn default() -> Self {
        StreamManager::new(true)
    }
}

impl StreamManager {
    pub fn new(enable_deduplication: bool) -> Self {
        StreamManager {
            enable_deduplication,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SubscriptionConfig) -> Self {
        StreamManager::new(config.enable_deduplication)
    }

    /// Returns the stream for `input`, creating it with `factory` when no live
    /// stream has the same identity. Stopped streams are replaced.
    pub fn stream(&self, input: &[u8], factory: &dyn StreamFactory) -> Arc<Stream> {
        if !self.enable_deduplication {
            return factory.stream(input);
        }

        let identity = factory.unique_identifier(input);
        let mut streams = self.streams.lock();
        match streams.entry(identity) {
            Entry::Occupied(entry) if !entry.get().is_stopped() => Arc::clone(entry.get()),
            Entry::Occupied(mut entry) => {
                tracing::debug!("replacing stopped stream");
                let stream = factory.stream(input);
                entry.insert(Arc::clone(&stream));
                stream
            }
            Entry::Vacant(entry) => Arc::clone(entry.insert(factory.stream(input))),
        }
    }

    /// Forgets `stream` if it stopped and is still the one registered for
    /// `input`. A newer stream registered under the same identity is kept.
    pub fn release(
        &self,
        input: &[u8],
        factory: &dyn StreamFactory,
        stream: &Arc<Stream>,
    ) -> bool {
        if !self.enable_deduplication {
            return false;
        }

        let identity = factory.unique_identifier(input);
        let mut streams = self.streams.lock();
        match streams.entry(identity) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), stream) && stream.is_stopped() => {
                entry.remove();
                tracing::debug!("released stopped stream");
                true
            }
            _ => false,
        }
    }

    /// Forgets every stopped stream, returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let mut streams = self.streams.lock();
        let before = streams.len();
        streams.retain(|_, stream| !stream.is_stopped());
        let evicted = before - streams.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted stopped streams");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

//! Paired data/error buffers holding the outcome of a single fetch.

use std::convert::Infallible;
use std::time::Duration;

use bytes::BufMut;
use bytes::BytesMut;
use deadpool::Runtime;
use deadpool::managed;

use crate::error::FetchError;

/// Two append-only buffers: one for successful data, one for structured errors.
///
/// Both start empty. Writers only append; [`BufPair::reset`] truncates without
/// giving the backing storage back so that pooled pairs can be reused.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufPair {
    pub data: BytesMut,
    pub errors: BytesMut,
}

impl BufPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn write_data(&mut self, bytes: &[u8]) {
        self.data.put_slice(bytes);
    }

    pub fn write_errors(&mut self, bytes: &[u8]) {
        self.errors.put_slice(bytes);
    }

    /// Appends the content of `other` to this pair.
    pub fn extend_from(&mut self, other: &BufPair) {
        if other.has_data() {
            self.write_data(&other.data);
        }
        if other.has_errors() {
            self.write_errors(&other.errors);
        }
    }

    /// Empties both buffers. Idempotent, keeps the allocated capacity.
    pub fn reset(&mut self) {
        self.data.clear();
        self.errors.clear();
    }
}

/// Creates and recycles pooled [`BufPair`]s.
#[derive(Debug)]
pub struct BufPairManager;

impl managed::Manager for BufPairManager {
    type Type = BufPair;
    type Error = Infallible;

    async fn create(&self) -> Result<BufPair, Self::Error> {
        Ok(BufPair::new())
    }

    async fn recycle(
        &self,
        buf: &mut BufPair,
        _metrics: &managed::Metrics,
    ) -> managed::RecycleResult<Self::Error> {
        buf.reset();
        Ok(())
    }
}

/// A [`BufPair`] checked out of a [`BufPairPool`]. Goes back to the pool on drop.
pub type PooledBufPair = managed::Object<BufPairManager>;

/// Pool of reusable [`BufPair`]s. Pairs are reset before they are handed out again.
#[derive(Clone)]
pub struct BufPairPool {
    inner: managed::Pool<BufPairManager>,
}

impl BufPairPool {
    pub(crate) fn new(max_size: usize, wait_timeout: Option<Duration>) -> Self {
        let inner = managed::Pool::builder(BufPairManager)
            .max_size(max_size)
            .wait_timeout(wait_timeout)
            .runtime(Runtime::Tokio1)
            .build()
            .expect("a runtime is always specified so building the pool cannot fail; qed");
        Self { inner }
    }

    /// Checks out an empty pair, waiting for one to be released if the pool is at capacity.
    pub async fn get(&self) -> Result<PooledBufPair, FetchError> {
        self.inner
            .get()
            .await
            .map_err(|err| FetchError::PoolExhausted {
                reason: err.to_string(),
            })
    }

    pub fn max_size(&self) -> usize {
        self.inner.status().max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pair_is_empty() {
        let buf = BufPair::new();
        assert!(!buf.has_data());
        assert!(!buf.has_errors());
    }

    #[test]
    fn reset_twice_leaves_pair_empty() {
        let mut buf = BufPair::new();
        buf.write_data(br#"{"id":"1"}"#);
        buf.write_errors(br#"{"message":"boom"}"#);
        let capacity = buf.data.capacity();

        buf.reset();
        buf.reset();

        assert!(!buf.has_data());
        assert!(!buf.has_errors());
        assert!(buf.data.capacity() >= capacity);
    }

    #[test]
    fn extend_from_appends_both_sides() {
        let mut source = BufPair::new();
        source.write_data(b"data");
        source.write_errors(b"errors");

        let mut target = BufPair::new();
        target.write_data(b"more ");
        target.extend_from(&source);

        assert_eq!(&target.data[..], b"more data");
        assert_eq!(&target.errors[..], b"errors");
    }

    #[tokio::test]
    async fn pooled_pairs_come_back_empty() {
        let pool = BufPairPool::new(1, None);
        {
            let mut buf = pool.get().await.unwrap();
            buf.write_data(b"stale");
        }
        let buf = pool.get().await.unwrap();
        assert!(!buf.has_data());
    }

    #[tokio::test]
    async fn exhausted_pool_reports_an_error() {
        let pool = BufPairPool::new(1, Some(Duration::from_millis(10)));
        let _held = pool.get().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert!(matches!(err, FetchError::PoolExhausted { .. }));
    }
}

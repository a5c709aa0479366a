use std::fmt;
use std::sync::Arc;

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use serde_json::value::RawValue;
use tower::BoxError;

use super::fetch::SingleFetch;
use crate::buf_pair::BufPair;

/// Combines several fetch inputs into a single upstream request.
pub trait BatchFactory: Send + Sync + 'static {
    fn create_batch(&self, inputs: &[&[u8]]) -> Result<Box<dyn Batch>, BoxError>;
}

/// One combined request, able to split its response back per input.
pub trait Batch: Send + Sync {
    fn input(&self) -> &[u8];

    /// Writes the part of `response` belonging to each input into `outputs`,
    /// in input order.
    fn demultiplex(&self, response: &BufPair, outputs: &mut [BufPair]) -> Result<(), BoxError>;
}

/// A fetch node combining several inputs into one call.
#[derive(Clone)]
pub struct BatchFetch {
    pub fetch: SingleFetch,
    pub batch_factory: Arc<dyn BatchFactory>,
}

impl fmt::Debug for BatchFetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchFetch")
            .field("fetch", &self.fetch)
            .finish_non_exhaustive()
    }
}

/// Batches JSON inputs as a JSON array and expects a JSON array of the same
/// length back.
///
/// Errors returned for the combined request cannot be attributed to a single
/// input, so every output receives all of them.
#[derive(Clone, Copy, Debug, Default)]
pub struct ListBatchFactory;

struct ListBatch {
    input: Bytes,
    len: usize,
}

impl BatchFactory for ListBatchFactory {
    fn create_batch(&self, inputs: &[&[u8]]) -> Result<Box<dyn Batch>, BoxError> {
        let capacity = inputs.iter().map(|input| input.len() + 1).sum::<usize>() + 2;
        let mut combined = BytesMut::with_capacity(capacity);
        combined.put_u8(b'[');
        for (index, input) in inputs.iter().enumerate() {
            // only validates, the input is forwarded untouched
            serde_json::from_slice::<&RawValue>(input)?;
            if index > 0 {
                combined.put_u8(b',');
            }
            combined.put_slice(input);
        }
        combined.put_u8(b']');

        Ok(Box::new(ListBatch {
            input: combined.freeze(),
            len: inputs.len(),
        }))
    }
}

impl Batch for ListBatch {
    fn input(&self) -> &[u8] {
        &self.input
    }

    fn demultiplex(&self, response: &BufPair, outputs: &mut [BufPair]) -> Result<(), BoxError> {
        if outputs.len() != self.len {
            return Err(format!(
                "batch was created for {} inputs but {} outputs were provided",
                self.len,
                outputs.len()
            )
            .into());
        }

        if response.has_data() {
            let items: Vec<&RawValue> = serde_json::from_slice(&response.data)?;
            if items.len() != self.len {
                return Err(format!(
                    "expected {} items in the batch response, got {}",
                    self.len,
                    items.len()
                )
                .into());
            }
            for (item, output) in items.iter().zip(outputs.iter_mut()) {
                output.write_data(item.get().as_bytes());
            }
        }

        if response.has_errors() {
            for output in outputs.iter_mut() {
                output.write_errors(&response.errors);
            }
        }

        Ok(())
    }
}

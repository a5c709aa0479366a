//! Fetch plan nodes, as produced by a query planner, and their execution.

use bytes::Bytes;

pub(crate) mod batch;
mod execution;
pub(crate) mod fetch;

pub use self::batch::Batch;
pub use self::batch::BatchFactory;
pub use self::batch::BatchFetch;
pub use self::batch::ListBatchFactory;
pub use self::fetch::DataSource;
pub use self::fetch::ProcessResponseConfig;
pub use self::fetch::SingleFetch;

pub(crate) const SEQUENCE_SPAN_NAME: &str = "sequence";
pub(crate) const PARALLEL_SPAN_NAME: &str = "parallel";

/// Query plans are composed of a set of nodes.
///
/// The serialized inputs are prepared by the planner; the executor forwards
/// them untouched.
#[derive(Clone, Debug)]
pub enum PlanNode {
    /// These nodes must be executed in order.
    Sequence { nodes: Vec<PlanNode> },

    /// These nodes may be executed in parallel.
    Parallel { nodes: Vec<PlanNode> },

    /// Fetch some data from a data source, stored under `response_key`.
    Fetch {
        response_key: String,
        fetch: SingleFetch,
        input: Bytes,
    },

    /// One upstream call for several inputs. `response_keys[i]` receives the
    /// result of `inputs[i]`.
    BatchFetch {
        response_keys: Vec<String>,
        fetch: BatchFetch,
        inputs: Vec<Bytes>,
    },
}

impl PlanNode {
    /// Number of upstream calls the node makes when nothing is deduplicated.
    pub fn fetch_count(&self) -> usize {
        match self {
            PlanNode::Sequence { nodes } | PlanNode::Parallel { nodes } => {
                nodes.iter().map(PlanNode::fetch_count).sum()
            }
            PlanNode::Fetch { .. } | PlanNode::BatchFetch { .. } => 1,
        }
    }
}

//! Communication substrate for partitioned arrays.
//!
//! Two families of primitives:
//! - Collectives (barrier, all-gather, all-reduce) that every rank of a group
//!   calls in the same order
//! - One-sided segment access (get, put, accumulate) where one rank reads or
//!   writes another rank's registered memory without its participation

use crate::tensor::local::SharedBuffer;
use crate::tensor::range::Run;
use crate::utils::error::{DArrayError, Result};
use serde::{de::DeserializeOwned, Serialize};

pub mod backend;
pub mod groups;

pub use backend::LocalCommunicator;
pub use groups::{run_local_group, ProcessGroup};

/// Identifier of a collectively registered memory segment.
///
/// Every rank of a group receives the same id from the same `register` call.
pub type SegmentId = u64;

/// Trait for collective communication and one-sided segment access.
///
/// Implementations include:
/// - `LocalCommunicator`: threads of one process acting as ranks
///
/// For one-sided calls, a [`Run`] moves `len` elements; `src` indexes the
/// buffer the data comes from and `dst` the buffer it goes to.
pub trait CollectiveCommunicator: Send + Sync {
    /// Get the rank of this process
    fn rank(&self) -> usize;

    /// Get the total number of processes
    fn world_size(&self) -> usize;

    /// Block until every rank has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// All-gather: every rank contributes one payload and receives all of
    /// them, indexed by rank.
    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Collectively expose `buffer` to the other ranks.
    fn register(&self, buffer: SharedBuffer) -> Result<SegmentId>;

    /// Collectively withdraw a segment. Returns once no rank can reach it.
    fn deregister(&self, segment: SegmentId) -> Result<()>;

    /// Read runs of `target`'s segment into `out` (`src` remote, `dst` local).
    fn get(&self, segment: SegmentId, target: usize, runs: &[Run], out: &mut [f32]) -> Result<()>;

    /// Overwrite runs of `target`'s segment (`src` into `data`, `dst` remote).
    fn put(&self, segment: SegmentId, target: usize, runs: &[Run], data: &[f32]) -> Result<()>;

    /// Add `alpha * data` into runs of `target`'s segment.
    ///
    /// All runs of one call land atomically with respect to other accumulates
    /// into the same segment.
    fn accumulate(
        &self,
        segment: SegmentId,
        target: usize,
        runs: &[Run],
        data: &[f32],
        alpha: f32,
    ) -> Result<()>;
}

/// Reduction applied by [`all_reduce_scalar`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    pub fn identity(self) -> f64 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
            ReduceOp::Min => f64::INFINITY,
        }
    }

    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

/// All-gather any serializable value.
pub fn all_gather_value<T>(communicator: &dyn CollectiveCommunicator, value: &T) -> Result<Vec<T>>
where
    T: Serialize + DeserializeOwned,
{
    let payload = serde_json::to_vec(value)?;
    communicator
        .all_gather_bytes(payload)?
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(DArrayError::from))
        .collect()
}

/// Reduce a scalar value across all ranks; every rank gets the result.
///
/// Contributions are combined in rank order so all ranks see the same bits.
pub fn all_reduce_scalar(
    value: f64,
    op: ReduceOp,
    communicator: &dyn CollectiveCommunicator,
) -> Result<f64> {
    if communicator.world_size() == 1 {
        return Ok(value);
    }
    let values = all_gather_value(communicator, &value)?;
    Ok(values.into_iter().fold(op.identity(), |acc, v| op.combine(acc, v)))
}

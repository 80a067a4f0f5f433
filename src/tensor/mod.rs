//! N-dimensional arrays: geometry, process-local storage, partitioned global
//! storage and the unified [`DistributedArray`] front end.

pub mod darray;
pub mod global;
pub mod local;
pub mod partition;
pub mod proto;
pub mod range;
pub mod shape;

pub use darray::DistributedArray;
pub use global::GlobalArray;
pub use local::LocalArray;
pub use partition::Partition;
pub use proto::{ArrayProto, PartitionMode};
pub use range::{Point, Range};
pub use shape::Shape;

use crate::utils::error::Result;

/// Anything a box of elements can be copied out of, wherever they live.
pub trait RangeSource {
    fn source_shape(&self) -> Shape;

    /// Copy `range` into a new process-local array shaped like the range.
    fn fetch_range(&self, range: &Range) -> Result<LocalArray>;
}

impl RangeSource for LocalArray {
    fn source_shape(&self) -> Shape {
        self.shape().clone()
    }

    fn fetch_range(&self, range: &Range) -> Result<LocalArray> {
        Ok(self.copy_range(range))
    }
}

//! Distributed N-dimensional `f32` arrays.
//!
//! Arrays are either process-local or partitioned along one dimension across
//! the ranks of a [`distributed::ProcessGroup`]. Both kinds share one math
//! API through [`tensor::DistributedArray`].

pub mod benchmarks;
pub mod distributed;
pub mod tensor;
pub mod utils;

pub use distributed::{run_local_group, ProcessGroup};
pub use tensor::{DistributedArray, GlobalArray, LocalArray, Range, Shape};
pub use utils::error::{DArrayError, Result};

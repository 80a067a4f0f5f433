//! Which slice of a logical array a rank owns.

use super::range::Range;
use super::shape::Shape;
use crate::precondition;
use serde::{Deserialize, Serialize};

/// A rank's slice of a logical shape.
///
/// `partition_dim == None` means the array is replicated: the range covers the
/// whole shape on every rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    shape: Shape,
    range: Range,
    partition_dim: Option<usize>,
}

impl Partition {
    pub fn new(shape: Shape, range: Range, partition_dim: Option<usize>) -> Self {
        precondition!(
            range.dims() == shape.dims(),
            "partition range {} has {} dimensions, shape {} has {}",
            range,
            range.dims(),
            shape,
            shape.dims()
        );
        precondition!(
            Range::full(&shape).contains_range(&range),
            "partition range {} is outside shape {}",
            range,
            shape
        );
        if let Some(dim) = partition_dim {
            precondition!(
                dim < shape.dims(),
                "partition dimension {} out of range for shape {}",
                dim,
                shape
            );
        }
        if !range.is_empty() {
            for d in (0..shape.dims()).filter(|&d| Some(d) != partition_dim) {
                precondition!(
                    range.start()[d] == 0 && range.end()[d] == shape.extent(d),
                    "partition range {} does not span dimension {} of shape {}",
                    range,
                    d,
                    shape
                );
            }
        }
        Self {
            shape,
            range,
            partition_dim,
        }
    }

    /// Every rank holds the whole array.
    pub fn replicated(shape: Shape) -> Self {
        let range = Range::full(&shape);
        Self::new(shape, range, None)
    }

    /// Bounds of `rank` when `dim` is split over `group_size` ranks.
    ///
    /// Each rank gets `floor(extent / group_size)` indices; the last rank also
    /// takes the remainder.
    pub fn for_rank(shape: &Shape, dim: usize, group_size: usize, rank: usize) -> Self {
        precondition!(group_size > 0, "cannot partition over an empty group");
        precondition!(
            rank < group_size,
            "rank {} out of range for group of {}",
            rank,
            group_size
        );
        let extent = shape.extent(dim);
        let chunk = extent / group_size;
        let begin = rank * chunk;
        let end = if rank + 1 == group_size { extent } else { begin + chunk };

        let range = Range::full(shape).narrow(dim, begin, end);
        Self::new(shape.clone(), range, Some(dim))
    }

    /// Bounds of every rank, indexed by rank.
    pub fn split(shape: &Shape, dim: usize, group_size: usize) -> Vec<Self> {
        (0..group_size)
            .map(|rank| Self::for_rank(shape, dim, group_size, rank))
            .collect()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn range(&self) -> &Range {
        &self.range
    }

    pub fn partition_dim(&self) -> Option<usize> {
        self.partition_dim
    }

    pub fn is_in_partition(&self, point: &[usize]) -> bool {
        self.range.contains(point)
    }

    pub fn local_vol(&self) -> usize {
        self.range.volume()
    }

    pub fn total_vol(&self) -> usize {
        self.shape.volume()
    }

    /// Shape of the rank-local buffer.
    pub fn local_shape(&self) -> Shape {
        self.range.shape()
    }
}

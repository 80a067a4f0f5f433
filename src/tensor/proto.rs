//! Wire description of a distributed array: its logical shape and how it is
//! partitioned, without any element data.

use super::partition::Partition;
use super::shape::Shape;
use crate::utils::error::{DArrayError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionMode {
    /// Every rank holds a private copy.
    Local,
    /// Split along this dimension.
    Dim(usize),
}

impl PartitionMode {
    pub fn from_dim(partition_dim: Option<usize>) -> Self {
        partition_dim.map_or(PartitionMode::Local, PartitionMode::Dim)
    }

    pub fn dim(self) -> Option<usize> {
        match self {
            PartitionMode::Local => None,
            PartitionMode::Dim(dim) => Some(dim),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayProto {
    pub extents: Vec<usize>,
    pub partition: PartitionMode,
}

impl ArrayProto {
    pub fn new(shape: &Shape, partition_dim: Option<usize>) -> Self {
        Self {
            extents: shape.extents().to_vec(),
            partition: PartitionMode::from_dim(partition_dim),
        }
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.extents.clone())
    }

    pub fn partition_dim(&self) -> Option<usize> {
        self.partition.dim()
    }

    /// The slice `rank` would own in a group of `group_size`.
    pub fn partition_for(&self, group_size: usize, rank: usize) -> Partition {
        let shape = self.shape();
        match self.partition {
            PartitionMode::Local => Partition::replicated(shape),
            PartitionMode::Dim(dim) => Partition::for_rank(&shape, dim, group_size, rank),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and [`validate`](ArrayProto::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let proto: Self = serde_json::from_str(json)?;
        proto.validate()?;
        Ok(proto)
    }

    /// Reject descriptions no array can be built from: a partition dimension
    /// past the last extent, or extents whose volume overflows.
    pub fn validate(&self) -> Result<()> {
        if let PartitionMode::Dim(dim) = self.partition {
            if dim >= self.extents.len() {
                return Err(DArrayError::Config(format!(
                    "partition dimension {} out of range for extents {:?}",
                    dim, self.extents
                )));
            }
        }
        if self
            .extents
            .iter()
            .try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
            .is_none()
        {
            return Err(DArrayError::Config(format!(
                "volume of extents {:?} overflows usize",
                self.extents
            )));
        }
        Ok(())
    }
}

//! Array shapes: ordered extents with derived row-major strides and volume.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-dimension extents of an array.
///
/// Strides are row-major: `strides[i] = product(extents[i+1..])`.
/// An empty extents list has volume 0, the same as any shape with a zero
/// extent, so callers check [`Shape::dims`] before indexing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<usize>", into = "Vec<usize>")]
pub struct Shape {
    extents: Vec<usize>,
    strides: Vec<usize>,
    volume: usize,
}

impl Shape {
    pub fn new(extents: Vec<usize>) -> Self {
        let mut shape = Self {
            extents,
            strides: Vec::new(),
            volume: 0,
        };
        shape.recompute();
        shape
    }

    fn recompute(&mut self) {
        let mut strides = vec![0; self.extents.len()];
        let mut acc = 1usize;
        for (i, extent) in self.extents.iter().enumerate().rev() {
            strides[i] = acc;
            acc = match acc.checked_mul(*extent) {
                Some(next) => next,
                None => crate::utils::error::violation(format!(
                    "volume of extents {:?} overflows usize",
                    self.extents
                )),
            };
        }
        self.strides = strides;
        self.volume = if self.extents.is_empty() { 0 } else { acc };
    }

    pub fn dims(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn extent(&self, dim: usize) -> usize {
        crate::precondition!(
            dim < self.dims(),
            "dimension {} out of range for shape {}",
            dim,
            self
        );
        self.extents[dim]
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn stride(&self, dim: usize) -> usize {
        crate::precondition!(
            dim < self.dims(),
            "dimension {} out of range for shape {}",
            dim,
            self
        );
        self.strides[dim]
    }

    pub fn volume(&self) -> usize {
        self.volume
    }

    /// Replace one extent, recomputing strides and volume.
    pub fn reassign(&mut self, dim: usize, value: usize) {
        crate::precondition!(
            dim < self.dims(),
            "cannot reassign dimension {} of shape {}",
            dim,
            self
        );
        self.extents[dim] = value;
        self.recompute();
    }

    /// The shape of one slice along the leading axis.
    pub fn sub_shape(&self) -> Shape {
        crate::precondition!(self.dims() > 0, "sub_shape of a zero-dimensional shape");
        Shape::new(self.extents[1..].to_vec())
    }

    /// Row-major flat offset of `point`.
    pub fn flat_index(&self, point: &[usize]) -> usize {
        crate::precondition!(
            point.len() == self.dims(),
            "point has {} coordinates, shape {} has {} dimensions",
            point.len(),
            self,
            self.dims()
        );
        point
            .iter()
            .zip(self.extents.iter().zip(&self.strides))
            .map(|(&p, (&extent, &stride))| {
                crate::precondition!(
                    p < extent,
                    "index {:?} out of bounds for shape {}",
                    point,
                    self
                );
                p * stride
            })
            .sum()
    }

    /// Inverse of [`Shape::flat_index`].
    pub fn unravel(&self, mut flat: usize) -> Vec<usize> {
        crate::precondition!(
            flat < self.volume,
            "flat index {} out of bounds for volume {}",
            flat,
            self.volume
        );
        self.strides
            .iter()
            .map(|&stride| {
                let coord = flat / stride;
                flat %= stride;
                coord
            })
            .collect()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(extents: Vec<usize>) -> Self {
        Shape::new(extents)
    }
}

impl From<&[usize]> for Shape {
    fn from(extents: &[usize]) -> Self {
        Shape::new(extents.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(extents: [usize; N]) -> Self {
        Shape::new(extents.to_vec())
    }
}

impl From<Shape> for Vec<usize> {
    fn from(shape: Shape) -> Self {
        shape.extents
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, extent) in self.extents.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", extent)?;
        }
        write!(f, "}}")
    }
}

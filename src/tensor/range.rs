//! Half-open index boxes over a shape's coordinate space.

use super::shape::Shape;
use crate::precondition;
use crate::utils::error::violation;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Point = Vec<usize>;

/// A box `[start[i], end[i])` per dimension.
///
/// Empty dimensions are always stored as `[0, 0)`, so an empty range compares
/// equal to every other empty range of the same rank on that dimension and
/// `r.intersect(&r) == r` holds for every `r`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    start: Point,
    end: Point,
}

/// One contiguous copy between two row-major containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub src: usize,
    pub dst: usize,
    pub len: usize,
}

impl Range {
    pub fn new(start: Point, end: Point) -> Self {
        precondition!(
            start.len() == end.len(),
            "range start has {} dimensions, end has {}",
            start.len(),
            end.len()
        );
        let mut range = Self { start, end };
        for dim in 0..range.start.len() {
            precondition!(
                range.start[dim] <= range.end[dim],
                "range start {:?} exceeds end {:?} on dimension {}",
                range.start,
                range.end,
                dim
            );
            if range.start[dim] == range.end[dim] {
                range.start[dim] = 0;
                range.end[dim] = 0;
            }
        }
        range
    }

    /// The whole index space of `shape`.
    pub fn full(shape: &Shape) -> Self {
        Self::new(vec![0; shape.dims()], shape.extents().to_vec())
    }

    pub fn start(&self) -> &[usize] {
        &self.start
    }

    pub fn end(&self) -> &[usize] {
        &self.end
    }

    pub fn dims(&self) -> usize {
        self.start.len()
    }

    pub fn extent(&self, dim: usize) -> usize {
        self.end[dim] - self.start[dim]
    }

    pub fn extents(&self) -> Vec<usize> {
        (0..self.dims()).map(|d| self.extent(d)).collect()
    }

    pub fn shape(&self) -> Shape {
        Shape::new(self.extents())
    }

    pub fn volume(&self) -> usize {
        if self.dims() == 0 {
            return 0;
        }
        let extents = self.extents();
        extents
            .iter()
            .try_fold(1usize, |acc, &extent| acc.checked_mul(extent))
            .unwrap_or_else(|| violation(format!("volume of range extents {:?} overflows usize", extents)))
    }

    /// True when some dimension has no overlap.
    pub fn is_empty(&self) -> bool {
        self.dims() == 0 || (0..self.dims()).any(|d| self.start[d] == self.end[d])
    }

    pub fn intersect(&self, other: &Range) -> Range {
        precondition!(
            self.dims() == other.dims(),
            "cannot intersect {}-dimensional range with {}-dimensional range",
            self.dims(),
            other.dims()
        );
        let mut start = Vec::with_capacity(self.dims());
        let mut end = Vec::with_capacity(self.dims());
        for dim in 0..self.dims() {
            let lo = self.start[dim].max(other.start[dim]);
            let hi = self.end[dim].min(other.end[dim]);
            if lo < hi {
                start.push(lo);
                end.push(hi);
            } else {
                start.push(0);
                end.push(0);
            }
        }
        Range { start, end }
    }

    pub fn contains(&self, point: &[usize]) -> bool {
        point.len() == self.dims()
            && point
                .iter()
                .enumerate()
                .all(|(d, &p)| self.start[d] <= p && p < self.end[d])
    }

    /// True when every point of `other` lies inside `self`. An empty range is
    /// contained everywhere.
    pub fn contains_range(&self, other: &Range) -> bool {
        if other.dims() != self.dims() {
            return false;
        }
        if other.is_empty() {
            return true;
        }
        (0..self.dims())
            .all(|d| self.start[d] <= other.start[d] && other.end[d] <= self.end[d])
    }

    /// Restrict one dimension to `[start, end)` relative to this range's start.
    pub fn narrow(&self, dim: usize, start: usize, end: usize) -> Range {
        precondition!(
            start <= end && end <= self.extent(dim),
            "narrow [{}, {}) out of bounds for extent {} on dimension {}",
            start,
            end,
            self.extent(dim),
            dim
        );
        let mut s = self.start.clone();
        let mut e = self.end.clone();
        s[dim] = self.start[dim] + start;
        e[dim] = self.start[dim] + end;
        Range::new(s, e)
    }

    /// Shift by `offset` per dimension.
    pub fn translate(&self, offset: &[usize]) -> Range {
        precondition!(
            offset.len() == self.dims(),
            "offset has {} dimensions, range has {}",
            offset.len(),
            self.dims()
        );
        if self.is_empty() {
            return self.clone();
        }
        Range::new(
            self.start.iter().zip(offset).map(|(s, o)| s + o).collect(),
            self.end.iter().zip(offset).map(|(e, o)| e + o).collect(),
        )
    }

    /// Express `self` in the local coordinates of `outer`.
    pub fn relative_to(&self, outer: &Range) -> Range {
        precondition!(
            outer.contains_range(self),
            "range {} is not inside {}",
            self,
            outer
        );
        if self.is_empty() {
            return self.clone();
        }
        Range::new(
            self.start.iter().zip(&outer.start).map(|(s, o)| s - o).collect(),
            self.end.iter().zip(&outer.start).map(|(e, o)| e - o).collect(),
        )
    }

    /// Contiguous runs that move `block` from a row-major buffer laid out as
    /// `src` into one laid out as `dst`. Runs are in `block`'s row-major order
    /// and adjacent runs are merged when both sides are contiguous.
    pub fn copy_plan(block: &Range, src: &Range, dst: &Range) -> Vec<Run> {
        precondition!(
            src.contains_range(block) && dst.contains_range(block),
            "block {} must lie inside both {} and {}",
            block,
            src,
            dst
        );
        if block.is_empty() {
            return Vec::new();
        }

        let src_shape = src.shape();
        let dst_shape = dst.shape();
        let last = block.dims() - 1;
        let len = block.extent(last);
        let offset = |coord: &[usize], container: &Range, shape: &Shape| -> usize {
            coord
                .iter()
                .zip(container.start())
                .zip(shape.strides())
                .map(|((c, s), stride)| (c - s) * stride)
                .sum()
        };

        let mut runs: Vec<Run> = Vec::new();
        let mut coord = block.start.clone();
        loop {
            let s = offset(&coord[..], src, &src_shape);
            let d = offset(&coord[..], dst, &dst_shape);
            match runs.last_mut() {
                Some(prev) if prev.src + prev.len == s && prev.dst + prev.len == d => {
                    prev.len += len;
                }
                _ => runs.push(Run { src: s, dst: d, len }),
            }

            let mut axis = last;
            loop {
                if axis == 0 {
                    return runs;
                }
                axis -= 1;
                coord[axis] += 1;
                if coord[axis] < block.end[axis] {
                    break;
                }
                coord[axis] = block.start[axis];
            }
        }
    }

    /// The fewest boxes of `shape` whose row-major elements are exactly the
    /// flat offsets `start..start + len`, in order.
    pub fn flat_cover(shape: &Shape, start: usize, len: usize) -> Vec<Range> {
        precondition!(
            start + len <= shape.volume(),
            "flat span {}..{} is outside shape {} (volume {})",
            start,
            start + len,
            shape,
            shape.volume()
        );
        let dims = shape.dims();
        let end = start + len;
        let mut boxes = Vec::new();
        let mut pos = start;
        while pos < end {
            let point = shape.unravel(pos);
            let remaining = end - pos;
            // Outermost dimension we can step along from here
            let dim = (0..dims)
                .find(|&d| point[d + 1..].iter().all(|&c| c == 0) && shape.stride(d) <= remaining)
                .unwrap_or(dims - 1);
            let count = (remaining / shape.stride(dim)).min(shape.extent(dim) - point[dim]);
            let box_end = (0..dims)
                .map(|d| match d.cmp(&dim) {
                    std::cmp::Ordering::Less => point[d] + 1,
                    std::cmp::Ordering::Equal => point[d] + count,
                    std::cmp::Ordering::Greater => shape.extent(d),
                })
                .collect();
            boxes.push(Range::new(point, box_end));
            pos += count * shape.stride(dim);
        }
        boxes
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for dim in 0..self.dims() {
            if dim > 0 {
                write!(f, "x")?;
            }
            write!(f, "[{},{})", self.start[dim], self.end[dim])?;
        }
        Ok(())
    }
}

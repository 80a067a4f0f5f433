//! One array type over both storage modes.
//!
//! A [`DistributedArray`] is either process-local (every rank has a private
//! copy) or partitioned across a [`ProcessGroup`]. Sub-views from
//! [`DistributedArray::index`], [`DistributedArray::reshape`] and
//! [`DistributedArray::view`] share storage with their parent and never keep
//! it alive.
//!
//! Math with a partitioned destination is owner-computes: each rank updates
//! the elements of its own partition that the destination covers, pulling any
//! operand data it does not hold with one-sided reads. Such an operation is
//! collective and ends with a barrier, so its writes are visible everywhere
//! when it returns. With a process-local destination nothing is collective;
//! partitioned operands are read one-sided.

use super::global::GlobalArray;
use super::local::LocalArray;
use super::partition::Partition;
use super::proto::ArrayProto;
use super::range::{Range, Run};
use super::shape::Shape;
use super::RangeSource;
use crate::distributed::{ProcessGroup, ReduceOp};
use crate::precondition;
use crate::utils::error::{violation, DArrayError, Result};
use crate::utils::metrics;
use std::fmt;
use tracing::debug;

enum Backing {
    Local(LocalArray),
    Global(GlobalView),
}

/// A box of a global array. Leading window dimensions beyond the view's rank
/// have extent 1, so the view's row-major order is the window's.
struct GlobalView {
    array: GlobalArray,
    window: Range,
}

/// The part of a window this rank owns.
struct OwnedBlock {
    /// In array coordinates.
    block: Range,
    /// `src` indexes this rank's segment, `dst` the block.
    segment_runs: Vec<Run>,
    /// `src` is a flat index of the view, `dst` indexes the block.
    view_runs: Vec<Run>,
    len: usize,
}

impl GlobalView {
    fn lead(&self, view_dims: usize) -> usize {
        self.window.dims() - view_dims
    }

    fn owned_block(&self) -> OwnedBlock {
        let part = self.array.partition().range();
        let block = self.window.intersect(part);
        OwnedBlock {
            segment_runs: Range::copy_plan(&block, part, &block),
            view_runs: Range::copy_plan(&block, &self.window, &block),
            len: block.volume(),
            block,
        }
    }

    fn read_block(&self, owned: &OwnedBlock) -> Vec<f32> {
        let mut out = vec![0.0; owned.len];
        if owned.len > 0 {
            self.array.local().read(|segment| {
                for run in &owned.segment_runs {
                    out[run.dst..run.dst + run.len]
                        .copy_from_slice(&segment[run.src..run.src + run.len]);
                }
            });
        }
        out
    }

    fn write_block(&self, owned: &OwnedBlock, values: &[f32]) {
        if owned.len == 0 {
            return;
        }
        self.array.local().write(|segment| {
            for run in &owned.segment_runs {
                segment[run.src..run.src + run.len]
                    .copy_from_slice(&values[run.dst..run.dst + run.len]);
            }
        });
    }

    /// A view-coordinate range in array coordinates.
    fn to_window(&self, range: &Range) -> Range {
        let dims = self.window.dims();
        if range.is_empty() {
            return Range::new(vec![0; dims], vec![0; dims]);
        }
        let lead = self.lead(range.dims());
        let mut start = self.window.start()[..lead].to_vec();
        let mut end: Vec<usize> = start.iter().map(|s| s + 1).collect();
        for d in 0..range.dims() {
            start.push(self.window.start()[lead + d] + range.start()[d]);
            end.push(self.window.start()[lead + d] + range.end()[d]);
        }
        Range::new(start, end)
    }

    /// An array-coordinate box inside the window in view coordinates.
    fn to_view(&self, block: &Range, view_dims: usize) -> Range {
        if block.is_empty() {
            return Range::new(vec![0; view_dims], vec![0; view_dims]);
        }
        let lead = self.lead(view_dims);
        let relative = block.relative_to(&self.window);
        Range::new(relative.start()[lead..].to_vec(), relative.end()[lead..].to_vec())
    }

    /// The view dimension the underlying array is split on, if it survives.
    fn partition_dim(&self, view_dims: usize) -> Option<usize> {
        self.array.partition_dim().checked_sub(self.lead(view_dims))
    }

    fn same_layout(&self, other: &GlobalView) -> bool {
        self.window == other.window
            && self.array.shape() == other.array.shape()
            && self.array.partitions() == other.array.partitions()
    }

    /// Read-update-write this rank's block, then fence.
    ///
    /// `fence` puts a barrier between the reads the caller already did and the
    /// write, for when those reads reached other ranks' memory. Both barriers
    /// are joined even when `update` fails, so a rank whose operand reads
    /// failed hands its error to `update` instead of returning early.
    fn finish_owned(
        &self,
        owned: &OwnedBlock,
        op: &str,
        fence: bool,
        update: impl FnOnce(&mut Vec<f32>) -> Result<()>,
    ) -> Result<()> {
        let group = self.array.group();
        if fence {
            group.barrier()?;
        }
        let mut block = self.read_block(owned);
        let outcome = update(&mut block);
        if outcome.is_ok() {
            self.write_block(owned, &block);
        }
        metrics::record_collective(op);
        group.barrier()?;
        debug!(rank = group.rank(), op, owned = %owned.block, "owner-computes update");
        outcome
    }
}

pub struct DistributedArray {
    shape: Shape,
    partition_dim: Option<usize>,
    group: Option<ProcessGroup>,
    backing: Option<Backing>,
}

impl DistributedArray {
    /// Describe an array without allocating it. `partition_dim == None`
    /// makes it process-local.
    pub fn setup(shape: Shape, partition_dim: Option<usize>) -> Self {
        if let Some(dim) = partition_dim {
            precondition!(
                dim < shape.dims(),
                "partition dimension {} out of range for shape {}",
                dim,
                shape
            );
        }
        Self {
            shape,
            partition_dim,
            group: None,
            backing: None,
        }
    }

    pub fn in_group(mut self, group: &ProcessGroup) -> Self {
        self.group = Some(group.clone());
        self
    }

    /// Allocate storage. Partitioned arrays are set up collectively.
    pub fn alloc(&mut self) -> Result<()> {
        if self.backing.is_some() {
            return Err(DArrayError::AlreadyAllocated(self.shape.to_string()));
        }
        let backing = match self.partition_dim {
            None => Backing::Local(LocalArray::zeros(self.shape.clone())),
            Some(dim) => {
                let group = self.group.as_ref().ok_or_else(|| {
                    DArrayError::NotAllocated(format!(
                        "array {} split on dimension {} has no process group",
                        self.shape, dim
                    ))
                })?;
                let array = GlobalArray::setup(self.shape.clone(), dim, group)?;
                Backing::Global(GlobalView {
                    window: Range::full(&self.shape),
                    array,
                })
            }
        };
        debug!(shape = %self.shape, partition_dim = ?self.partition_dim, "Array allocated");
        self.backing = Some(backing);
        Ok(())
    }

    /// An allocated, zero-filled process-local array.
    pub fn local(shape: Shape) -> Self {
        Self::from_local(LocalArray::zeros(shape))
    }

    /// An allocated, zero-filled array split along `dim` across `group`.
    pub fn partitioned(shape: Shape, dim: usize, group: &ProcessGroup) -> Result<Self> {
        let mut array = Self::setup(shape, Some(dim)).in_group(group);
        array.alloc()?;
        Ok(array)
    }

    pub fn from_local(array: LocalArray) -> Self {
        Self {
            shape: array.shape().clone(),
            partition_dim: None,
            group: None,
            backing: Some(Backing::Local(array)),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn partition_dim(&self) -> Option<usize> {
        self.partition_dim
    }

    pub fn group(&self) -> Option<&ProcessGroup> {
        self.group.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.backing.is_some()
    }

    pub fn is_global(&self) -> bool {
        matches!(self.backing, Some(Backing::Global(_)))
    }

    /// This rank's slice of the underlying storage.
    pub fn partition(&self) -> Option<Partition> {
        match self.backing.as_ref()? {
            Backing::Local(array) => Some(Partition::replicated(array.shape().clone())),
            Backing::Global(view) => Some(view.array.partition().clone()),
        }
    }

    pub fn global(&self) -> Option<&GlobalArray> {
        match self.backing.as_ref()? {
            Backing::Global(view) => Some(&view.array),
            Backing::Local(_) => None,
        }
    }

    fn backing(&self, op: &str) -> &Backing {
        match &self.backing {
            Some(backing) => backing,
            None => violation(format!("{}: array {} is not allocated", op, self.shape)),
        }
    }

    /// A weak handle on the same elements.
    pub fn view(&self) -> DistributedArray {
        let backing = match self.backing("view") {
            Backing::Local(array) => Backing::Local(array.view()),
            Backing::Global(view) => Backing::Global(GlobalView {
                array: view.array.view(),
                window: view.window.clone(),
            }),
        };
        DistributedArray {
            shape: self.shape.clone(),
            partition_dim: self.partition_dim,
            group: self.group.clone(),
            backing: Some(backing),
        }
    }

    /// The `k`-th slice along the leading axis, one dimension lower.
    pub fn index(&self, k: usize) -> DistributedArray {
        precondition!(
            self.shape.dims() >= 2,
            "index needs at least 2 dimensions, shape {} has {}",
            self.shape,
            self.shape.dims()
        );
        precondition!(
            k < self.shape.extent(0),
            "index {} out of range for leading extent {}",
            k,
            self.shape.extent(0)
        );
        let shape = self.shape.sub_shape();
        let (backing, partition_dim) = match self.backing("index") {
            Backing::Local(array) => (Backing::Local(array.index(k)), None),
            Backing::Global(view) => {
                let lead = view.lead(self.shape.dims());
                let narrowed = GlobalView {
                    array: view.array.view(),
                    window: view.window.narrow(lead, k, k + 1),
                };
                let dim = narrowed.partition_dim(shape.dims());
                (Backing::Global(narrowed), dim)
            }
        };
        DistributedArray {
            shape,
            partition_dim,
            group: self.group.clone(),
            backing: Some(backing),
        }
    }

    /// The same elements under another shape of equal volume.
    ///
    /// A view of a global array can be reshaped only when it covers whole
    /// trailing dimensions of the array and the split dimension keeps its
    /// extent and stride; otherwise the elements would have to move.
    pub fn reshape(&self, shape: Shape) -> Result<DistributedArray> {
        if shape.volume() != self.shape.volume() {
            return Err(DArrayError::Reshape(format!(
                "cannot reshape {} (volume {}) to {} (volume {})",
                self.shape,
                self.shape.volume(),
                shape,
                shape.volume()
            )));
        }
        let (backing, partition_dim) = match self.backing("reshape") {
            Backing::Local(array) => (Backing::Local(array.reshape(shape.clone())), None),
            Backing::Global(view) => {
                let lead = view.lead(self.shape.dims());
                let array_shape = view.array.shape();
                let whole = (lead..view.window.dims()).all(|d| {
                    view.window.start()[d] == 0 && view.window.end()[d] == array_shape.extent(d)
                });
                if !whole {
                    return Err(DArrayError::Reshape(format!(
                        "window {} of {} does not cover whole trailing dimensions",
                        view.window, array_shape
                    )));
                }
                let mut extents = array_shape.extents()[..lead].to_vec();
                extents.extend_from_slice(shape.extents());
                let array = view.array.reshape(Shape::new(extents))?;

                let mut start = view.window.start()[..lead].to_vec();
                let mut end = view.window.end()[..lead].to_vec();
                start.extend(std::iter::repeat(0).take(shape.dims()));
                end.extend_from_slice(shape.extents());
                let reshaped = GlobalView {
                    array,
                    window: Range::new(start, end),
                };
                let dim = reshaped.partition_dim(shape.dims());
                (Backing::Global(reshaped), dim)
            }
        };
        Ok(DistributedArray {
            shape,
            partition_dim,
            group: self.group.clone(),
            backing: Some(backing),
        })
    }

    fn check_range(&self, range: &Range, op: &str) {
        precondition!(
            Range::full(&self.shape).contains_range(range),
            "{}: range {} is outside array {}",
            op,
            range,
            self.shape
        );
    }

    /// Copy `range` into a new process-local array shaped like the range.
    pub fn fetch(&self, range: &Range) -> Result<LocalArray> {
        self.check_range(range, "fetch");
        match self.backing("fetch") {
            Backing::Local(array) => Ok(array.copy_range(range)),
            Backing::Global(view) => Ok(LocalArray::from_vec(
                range.shape(),
                view.array.get_values(&view.to_window(range))?,
            )),
        }
    }

    pub fn fetch_all(&self) -> Result<LocalArray> {
        self.fetch(&Range::full(&self.shape))
    }

    /// `range` as a new process-local array.
    pub fn sub_array(&self, range: &Range) -> Result<DistributedArray> {
        Ok(Self::from_local(self.fetch(range)?))
    }

    /// One-sided overwrite of `range`.
    pub fn put(&mut self, range: &Range, values: &[f32]) -> Result<()> {
        self.check_range(range, "put");
        match self.backing("put") {
            Backing::Local(array) => {
                array.view().write_range(range, values);
                Ok(())
            }
            Backing::Global(view) => view.array.put(&view.to_window(range), values),
        }
    }

    /// One-sided `range += alpha * values`.
    pub fn accumulate(&mut self, range: &Range, values: &[f32], alpha: f32) -> Result<()> {
        self.check_range(range, "accumulate");
        match self.backing("accumulate") {
            Backing::Local(array) => {
                array.view().accumulate_range(range, values, alpha);
                Ok(())
            }
            Backing::Global(view) => view.array.accumulate(&view.to_window(range), values, alpha),
        }
    }

    /// Fence one-sided writes. A no-op for process-local arrays.
    pub fn sync(&self) -> Result<()> {
        match self.backing("sync") {
            Backing::Local(_) => Ok(()),
            Backing::Global(view) => view.array.sync(),
        }
    }

    fn point_range(&self, point: &[usize]) -> Range {
        precondition!(
            Range::full(&self.shape).contains(point),
            "index {:?} out of bounds for shape {}",
            point,
            self.shape
        );
        Range::new(point.to_vec(), point.iter().map(|p| p + 1).collect())
    }

    pub fn at(&self, point: &[usize]) -> Result<f32> {
        match self.backing("at") {
            Backing::Local(array) => Ok(array.at(point)),
            Backing::Global(view) => {
                let range = view.to_window(&self.point_range(point));
                Ok(view.array.get_values(&range)?[0])
            }
        }
    }

    pub fn set(&mut self, point: &[usize], value: f32) -> Result<()> {
        let range = self.point_range(point);
        self.put(&range, &[value])
    }

    /// Release storage. Collective for an owning partitioned array.
    pub fn free(&mut self) -> Result<()> {
        match self.backing.take() {
            Some(Backing::Global(view)) if !view.array.is_view() => view.array.free(),
            _ => Ok(()),
        }
    }

    /// The whole array as a process-local array: a view when it already is
    /// one, a one-sided fetch otherwise.
    fn resolve_whole(&self) -> Result<LocalArray> {
        match self.backing("read") {
            Backing::Local(array) => Ok(array.view()),
            Backing::Global(_) => self.fetch_all(),
        }
    }

    fn co_located(&self, dest: &GlobalView, dest_shape: &Shape) -> bool {
        match &self.backing {
            Some(Backing::Global(view)) => self.shape == *dest_shape && view.same_layout(dest),
            _ => false,
        }
    }

    /// The operand elements matching `owned`, in block order.
    fn resolve_block(&self, dest: &GlobalView, dest_shape: &Shape, owned: &OwnedBlock) -> Result<Vec<f32>> {
        if owned.len == 0 {
            return Ok(Vec::new());
        }
        if let Some(Backing::Global(view)) = &self.backing {
            if self.co_located(dest, dest_shape) {
                return Ok(view.read_block(owned));
            }
        }
        if self.shape == *dest_shape {
            let range = dest.to_view(&owned.block, dest_shape.dims());
            return Ok(self.fetch(&range)?.to_vec());
        }
        // Same volume, other shape: flat offsets of the view are the operand's
        let mut out = vec![0.0; owned.len];
        for run in &owned.view_runs {
            let mut dst = run.dst;
            for range in Range::flat_cover(&self.shape, run.src, run.len) {
                let values = self.fetch(&range)?.to_vec();
                out[dst..dst + values.len()].copy_from_slice(&values);
                dst += values.len();
            }
        }
        Ok(out)
    }

    fn apply(
        &mut self,
        op: &str,
        operands: &[&DistributedArray],
        kernel: impl FnOnce(&mut LocalArray, &[LocalArray]) -> Result<()>,
    ) -> Result<()> {
        for operand in operands {
            precondition!(
                operand.shape.volume() == self.shape.volume(),
                "{}: destination {} has {} elements, operand {} has {}",
                op,
                self.shape,
                self.shape.volume(),
                operand.shape,
                operand.shape.volume()
            );
        }
        match self.backing(op) {
            Backing::Local(dest) => {
                let resolved = operands
                    .iter()
                    .map(|operand| operand.resolve_whole())
                    .collect::<Result<Vec<_>>>()?;
                kernel(&mut dest.view(), &resolved)
            }
            Backing::Global(view) => {
                let owned = view.owned_block();
                let block_shape = Shape::new(vec![owned.len]);
                let fence = operands
                    .iter()
                    .any(|operand| operand.is_global() && !operand.co_located(view, &self.shape));
                let resolved = operands
                    .iter()
                    .map(|operand| {
                        let values = operand.resolve_block(view, &self.shape, &owned)?;
                        Ok(LocalArray::from_vec(block_shape.clone(), values))
                    })
                    .collect::<Result<Vec<_>>>();
                view.finish_owned(&owned, op, fence, |block| {
                    let resolved = resolved?;
                    let mut dest = LocalArray::from_vec(block_shape, std::mem::take(block));
                    kernel(&mut dest, &resolved)?;
                    *block = dest.to_vec();
                    Ok(())
                })
            }
        }
    }

    pub fn add(&mut self, a: &DistributedArray, b: &DistributedArray) -> Result<()> {
        self.apply("add", &[a, b], |d, o| {
            d.add(&o[0], &o[1]);
            Ok(())
        })
    }

    pub fn minus(&mut self, a: &DistributedArray, b: &DistributedArray) -> Result<()> {
        self.apply("minus", &[a, b], |d, o| {
            d.minus(&o[0], &o[1]);
            Ok(())
        })
    }

    pub fn mult(&mut self, a: &DistributedArray, b: &DistributedArray) -> Result<()> {
        self.apply("mult", &[a, b], |d, o| {
            d.mult(&o[0], &o[1]);
            Ok(())
        })
    }

    pub fn div(&mut self, a: &DistributedArray, b: &DistributedArray) -> Result<()> {
        self.apply("div", &[a, b], |d, o| {
            d.div(&o[0], &o[1]);
            Ok(())
        })
    }

    pub fn add_scalar(&mut self, a: &DistributedArray, x: f32) -> Result<()> {
        self.apply("add_scalar", &[a], |d, o| {
            d.add_scalar(&o[0], x);
            Ok(())
        })
    }

    pub fn minus_scalar(&mut self, a: &DistributedArray, x: f32) -> Result<()> {
        self.apply("minus_scalar", &[a], |d, o| {
            d.minus_scalar(&o[0], x);
            Ok(())
        })
    }

    pub fn mult_scalar(&mut self, a: &DistributedArray, x: f32) -> Result<()> {
        self.apply("mult_scalar", &[a], |d, o| {
            d.mult_scalar(&o[0], x);
            Ok(())
        })
    }

    pub fn div_scalar(&mut self, a: &DistributedArray, x: f32) -> Result<()> {
        self.apply("div_scalar", &[a], |d, o| {
            d.div_scalar(&o[0], x);
            Ok(())
        })
    }

    pub fn square(&mut self, a: &DistributedArray) -> Result<()> {
        self.apply("square", &[a], |d, o| {
            d.square(&o[0]);
            Ok(())
        })
    }

    pub fn pow(&mut self, a: &DistributedArray, p: f32) -> Result<()> {
        self.apply("pow", &[a], |d, o| {
            d.pow(&o[0], p);
            Ok(())
        })
    }

    pub fn map(&mut self, a: &DistributedArray, f: impl Fn(f32) -> f32) -> Result<()> {
        self.apply("map", &[a], |d, o| {
            d.map(&o[0], f);
            Ok(())
        })
    }

    /// 1.0 where `a < t`, otherwise 0.0.
    pub fn threshold(&mut self, a: &DistributedArray, t: f32) -> Result<()> {
        self.apply("threshold", &[a], |d, o| {
            d.threshold(&o[0], t);
            Ok(())
        })
    }

    pub fn max_scalar(&mut self, a: &DistributedArray, x: f32) -> Result<()> {
        self.apply("max_scalar", &[a], |d, o| {
            d.max_scalar(&o[0], x);
            Ok(())
        })
    }

    pub fn min_scalar(&mut self, a: &DistributedArray, x: f32) -> Result<()> {
        self.apply("min_scalar", &[a], |d, o| {
            d.min_scalar(&o[0], x);
            Ok(())
        })
    }

    pub fn copy_from(&mut self, a: &DistributedArray) -> Result<()> {
        self.apply("copy_from", &[a], |d, o| {
            d.copy_from(&o[0]);
            Ok(())
        })
    }

    pub fn fill(&mut self, value: f32) -> Result<()> {
        self.apply("fill", &[], |d, _| {
            d.fill(value);
            Ok(())
        })
    }

    pub fn set_zeros(&mut self) -> Result<()> {
        self.fill(0.0)
    }

    pub fn set_ones(&mut self) -> Result<()> {
        self.fill(1.0)
    }

    /// Uniform samples in `[0, 1)`.
    pub fn random(&mut self) -> Result<()> {
        self.apply("random", &[], |d, _| d.random())
    }

    pub fn rand_uniform(&mut self, low: f32, high: f32) -> Result<()> {
        self.apply("rand_uniform", &[], |d, _| d.rand_uniform(low, high))
    }

    pub fn rand_gaussian(&mut self, mean: f32, std: f32) -> Result<()> {
        self.apply("rand_gaussian", &[], |d, _| d.rand_gaussian(mean, std))
    }

    fn reduce(&self, name: &str, op: ReduceOp, f: impl Fn(&LocalArray) -> f32) -> Result<f32> {
        match self.backing(name) {
            Backing::Local(array) => Ok(f(array)),
            Backing::Global(view) => {
                let owned = view.owned_block();
                let partial = if owned.len == 0 {
                    op.identity()
                } else {
                    let block = LocalArray::from_vec(Shape::new(vec![owned.len]), view.read_block(&owned));
                    f(&block) as f64
                };
                metrics::record_collective(name);
                Ok(view.array.group().all_reduce(partial, op)? as f32)
            }
        }
    }

    pub fn sum(&self) -> Result<f32> {
        self.reduce("sum", ReduceOp::Sum, LocalArray::sum)
    }

    pub fn max(&self) -> Result<f32> {
        self.reduce("max", ReduceOp::Max, LocalArray::max)
    }

    pub fn min(&self) -> Result<f32> {
        self.reduce("min", ReduceOp::Min, LocalArray::min)
    }

    pub fn norm1(&self) -> Result<f32> {
        self.reduce("norm1", ReduceOp::Sum, LocalArray::norm1)
    }

    fn last_extent(&self, op: &str) -> usize {
        precondition!(self.shape.dims() > 0, "{}: zero-dimensional array", op);
        self.shape.extent(self.shape.dims() - 1)
    }

    fn first_extent(&self, op: &str) -> usize {
        precondition!(self.shape.dims() > 0, "{}: zero-dimensional array", op);
        self.shape.extent(0)
    }

    /// Add `v[j]` to column `j` of every row.
    pub fn add_row(&mut self, v: &DistributedArray) -> Result<()> {
        let cols = self.last_extent("add_row");
        precondition!(
            v.shape.volume() == cols,
            "add_row: vector of {} elements, destination {} has {} columns",
            v.shape.volume(),
            self.shape,
            cols
        );
        let vector = v.resolve_whole();
        match self.backing("add_row") {
            Backing::Local(dest) => {
                dest.view().add_row(&vector?);
                Ok(())
            }
            Backing::Global(view) => {
                let owned = view.owned_block();
                view.finish_owned(&owned, "add_row", v.is_global(), |block| {
                    let vector = vector?.to_vec();
                    for run in &owned.view_runs {
                        for i in 0..run.len {
                            block[run.dst + i] += vector[(run.src + i) % cols];
                        }
                    }
                    Ok(())
                })
            }
        }
    }

    /// Add `v[i]` to every element of row `i`.
    pub fn add_col(&mut self, v: &DistributedArray) -> Result<()> {
        let rows = self.first_extent("add_col");
        precondition!(
            v.shape.volume() == rows,
            "add_col: vector of {} elements, destination {} has {} rows",
            v.shape.volume(),
            self.shape,
            rows
        );
        let vector = v.resolve_whole();
        match self.backing("add_col") {
            Backing::Local(dest) => {
                dest.view().add_col(&vector?);
                Ok(())
            }
            Backing::Global(view) => {
                let owned = view.owned_block();
                let width = (self.shape.volume() / rows.max(1)).max(1);
                view.finish_owned(&owned, "add_col", v.is_global(), |block| {
                    let vector = vector?.to_vec();
                    for run in &owned.view_runs {
                        for i in 0..run.len {
                            block[run.dst + i] += vector[(run.src + i) / width];
                        }
                    }
                    Ok(())
                })
            }
        }
    }

    /// `self[j] = sum_i src[i, j]`.
    pub fn sum_rows(&mut self, src: &DistributedArray) -> Result<()> {
        let cols = src.last_extent("sum_rows");
        precondition!(
            self.shape.volume() == cols,
            "sum_rows: destination of {} elements, source {} has {} columns",
            self.shape.volume(),
            src.shape,
            cols
        );
        let last = src.shape.dims() - 1;
        self.reduce_into("sum_rows", src, |start, len| {
            let range = Range::full(&src.shape).narrow(last, start, start + len);
            let block = src.fetch(&range)?;
            let mut sums = LocalArray::zeros(Shape::new(vec![len]));
            sums.sum_rows(&block);
            Ok(sums.to_vec())
        })
    }

    /// `self[i] = sum_j src[i, j]`.
    pub fn sum_cols(&mut self, src: &DistributedArray) -> Result<()> {
        let rows = src.first_extent("sum_cols");
        precondition!(
            self.shape.volume() == rows,
            "sum_cols: destination of {} elements, source {} has {} rows",
            self.shape.volume(),
            src.shape,
            rows
        );
        self.reduce_into("sum_cols", src, |start, len| {
            let range = Range::full(&src.shape).narrow(0, start, start + len);
            let block = src.fetch(&range)?;
            let mut sums = LocalArray::zeros(Shape::new(vec![len]));
            sums.sum_cols(&block);
            Ok(sums.to_vec())
        })
    }

    /// Fill `self` from per-element reductions of `src`. `slab(start, len)`
    /// returns the results for destination flat indices `start..start + len`.
    fn reduce_into(
        &mut self,
        op: &str,
        src: &DistributedArray,
        slab: impl Fn(usize, usize) -> Result<Vec<f32>>,
    ) -> Result<()> {
        match self.backing(op) {
            Backing::Local(dest) => {
                let values = slab(0, self.shape.volume())?;
                dest.view().write(|data| data.copy_from_slice(&values));
                Ok(())
            }
            Backing::Global(view) => {
                let owned = view.owned_block();
                let pieces = owned
                    .view_runs
                    .iter()
                    .map(|run| Ok((run.dst, slab(run.src, run.len)?)))
                    .collect::<Result<Vec<_>>>();
                view.finish_owned(&owned, op, src.is_global(), |block| {
                    for (dst, values) in pieces? {
                        block[dst..dst + values.len()].copy_from_slice(&values);
                    }
                    Ok(())
                })
            }
        }
    }

    /// `self = op(a) * op(b) + beta * self`, `beta` being 0 when `overwrite`
    /// and 1 otherwise. Collective when `self` is partitioned.
    pub fn dot(
        &mut self,
        a: &DistributedArray,
        b: &DistributedArray,
        trans_a: bool,
        trans_b: bool,
        overwrite: bool,
    ) -> Result<()> {
        precondition!(
            self.shape.dims() == 2,
            "dot: destination {} has {} dimensions, expected 2",
            self.shape,
            self.shape.dims()
        );
        match self.backing("dot") {
            Backing::Local(dest) => {
                let (lhs, rhs) = (a.resolve_whole()?, b.resolve_whole()?);
                dest.view().dot(&lhs, &rhs, trans_a, trans_b, overwrite)
            }
            Backing::Global(view) => view.array.dot(&view.window, a, b, trans_a, trans_b, overwrite),
        }
    }

    pub fn to_proto(&self) -> ArrayProto {
        ArrayProto::new(&self.shape, self.partition_dim)
    }

    /// An unallocated array with the shape and partitioning of `proto`.
    pub fn from_proto(proto: &ArrayProto) -> Result<Self> {
        proto.validate()?;
        Ok(Self::setup(proto.shape(), proto.partition_dim()))
    }
}

impl RangeSource for DistributedArray {
    fn source_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn fetch_range(&self, range: &Range) -> Result<LocalArray> {
        self.fetch(range)
    }
}

impl fmt::Debug for DistributedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = match &self.backing {
            None => "unallocated".to_string(),
            Some(Backing::Local(array)) if array.is_view() => "local view".to_string(),
            Some(Backing::Local(_)) => "local".to_string(),
            Some(Backing::Global(view)) => format!("global window {}", view.window),
        };
        f.debug_struct("DistributedArray")
            .field("shape", &self.shape)
            .field("partition_dim", &self.partition_dim)
            .field("storage", &storage)
            .finish()
    }
}

//! Process-local dense arrays and the math kernels every other layer delegates to.
//!
//! A [`LocalArray`] owns one contiguous `f32` buffer laid out row-major. Sub-views
//! produced by [`LocalArray::index`] and [`LocalArray::reshape`] share that
//! buffer through a weak reference plus an element offset; a view never keeps
//! its parent alive and using it after the parent is gone aborts.
//!
//! Operands are copied out before the destination is locked, so a destination
//! may alias any of its operands.

use super::range::Range;
use super::shape::Shape;
use crate::precondition;
use crate::utils::error::{violation, Result};
use candle_core::{DType, Device, Tensor};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

pub type SharedBuffer = Arc<RwLock<Vec<f32>>>;

enum Storage {
    Owned(SharedBuffer),
    View(Weak<RwLock<Vec<f32>>>),
}

pub struct LocalArray {
    shape: Shape,
    storage: Storage,
    offset: usize,
}

impl LocalArray {
    pub fn zeros(shape: Shape) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Shape, value: f32) -> Self {
        let data = vec![value; shape.volume()];
        Self::from_vec(shape, data)
    }

    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Self {
        precondition!(
            data.len() == shape.volume(),
            "buffer of {} elements does not match shape {} (volume {})",
            data.len(),
            shape,
            shape.volume()
        );
        Self {
            shape,
            storage: Storage::Owned(Arc::new(RwLock::new(data))),
            offset: 0,
        }
    }

    /// A weak view of `shape.volume()` elements of `buffer` starting at `offset`.
    pub(crate) fn view_of(shape: Shape, buffer: &SharedBuffer, offset: usize) -> Self {
        Self {
            shape,
            storage: Storage::View(Arc::downgrade(buffer)),
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.volume()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::View(_))
    }

    fn buffer(&self) -> SharedBuffer {
        match &self.storage {
            Storage::Owned(buffer) => buffer.clone(),
            Storage::View(weak) => weak.upgrade().unwrap_or_else(|| {
                violation(format!(
                    "view of shape {} at offset {} outlived its parent buffer",
                    self.shape, self.offset
                ))
            }),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        let buffer = self.buffer();
        let guard = buffer.read().unwrap_or_else(PoisonError::into_inner);
        let end = self.offset + self.len();
        precondition!(
            end <= guard.len(),
            "view [{}, {}) exceeds buffer of {} elements",
            self.offset,
            end,
            guard.len()
        );
        f(&guard[self.offset..end])
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        let buffer = self.buffer();
        let mut guard = buffer.write().unwrap_or_else(PoisonError::into_inner);
        let end = self.offset + self.len();
        precondition!(
            end <= guard.len(),
            "view [{}, {}) exceeds buffer of {} elements",
            self.offset,
            end,
            guard.len()
        );
        f(&mut guard[self.offset..end])
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.read(|data| data.to_vec())
    }

    /// An owned copy with its own buffer.
    pub fn duplicate(&self) -> Self {
        Self::from_vec(self.shape.clone(), self.to_vec())
    }

    /// A weak view over the same elements.
    pub fn view(&self) -> Self {
        Self::view_of(self.shape.clone(), &self.buffer(), self.offset)
    }

    /// The `k`-th slice along the leading axis, one dimension lower.
    pub fn index(&self, k: usize) -> Self {
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
        let sub = self.shape.sub_shape();
        let offset = self.offset + k * sub.volume();
        Self::view_of(sub, &self.buffer(), offset)
    }

    /// The same elements under a different shape of equal volume.
    pub fn reshape(&self, shape: Shape) -> Self {
        precondition!(
            shape.volume() == self.len(),
            "cannot reshape {} (volume {}) to {} (volume {})",
            self.shape,
            self.len(),
            shape,
            shape.volume()
        );
        Self::view_of(shape, &self.buffer(), self.offset)
    }

    pub fn at(&self, point: &[usize]) -> f32 {
        let flat = self.shape.flat_index(point);
        self.read(|data| data[flat])
    }

    pub fn set(&mut self, point: &[usize], value: f32) {
        let flat = self.shape.flat_index(point);
        self.write(|data| data[flat] = value);
    }

    fn check_range(&self, range: &Range) {
        precondition!(
            Range::full(&self.shape).contains_range(range),
            "range {} is outside shape {}",
            range,
            self.shape
        );
    }

    /// Copy the elements of `range` into a new array shaped like the range.
    pub fn copy_range(&self, range: &Range) -> Self {
        self.check_range(range);
        let full = Range::full(&self.shape);
        let plan = Range::copy_plan(range, &full, range);
        let mut out = vec![0.0; range.volume()];
        self.read(|data| {
            for run in &plan {
                out[run.dst..run.dst + run.len].copy_from_slice(&data[run.src..run.src + run.len]);
            }
        });
        Self::from_vec(range.shape(), out)
    }

    /// Overwrite the elements of `range` with `values` (row-major over the range).
    pub fn write_range(&mut self, range: &Range, values: &[f32]) {
        self.accumulate_into(range, values, None);
    }

    /// Add `alpha * values` into the elements of `range`.
    pub fn accumulate_range(&mut self, range: &Range, values: &[f32], alpha: f32) {
        self.accumulate_into(range, values, Some(alpha));
    }

    fn accumulate_into(&mut self, range: &Range, values: &[f32], alpha: Option<f32>) {
        self.check_range(range);
        precondition!(
            values.len() == range.volume(),
            "range {} needs {} elements, got {}",
            range,
            range.volume(),
            values.len()
        );
        let full = Range::full(&self.shape);
        let plan = Range::copy_plan(range, range, &full);
        self.write(|data| {
            for run in &plan {
                let src = &values[run.src..run.src + run.len];
                let dst = &mut data[run.dst..run.dst + run.len];
                match alpha {
                    None => dst.copy_from_slice(src),
                    Some(alpha) => {
                        for (d, s) in dst.iter_mut().zip(src) {
                            *d += alpha * s;
                        }
                    }
                }
            }
        });
    }

    fn check_same_volume(&self, other: &LocalArray, op: &str) {
        precondition!(
            self.len() == other.len(),
            "{}: destination {} has {} elements, operand {} has {}",
            op,
            self.shape,
            self.len(),
            other.shape,
            other.len()
        );
    }

    fn zip_with(&mut self, a: &LocalArray, b: &LocalArray, op: &str, f: impl Fn(f32, f32) -> f32) {
        self.check_same_volume(a, op);
        self.check_same_volume(b, op);
        let a = a.to_vec();
        let b = b.to_vec();
        self.write(|dst| {
            for ((d, x), y) in dst.iter_mut().zip(&a).zip(&b) {
                *d = f(*x, *y);
            }
        });
    }

    fn map_from(&mut self, a: &LocalArray, op: &str, f: impl Fn(f32) -> f32) {
        self.check_same_volume(a, op);
        let a = a.to_vec();
        self.write(|dst| {
            for (d, x) in dst.iter_mut().zip(&a) {
                *d = f(*x);
            }
        });
    }

    pub fn add(&mut self, a: &LocalArray, b: &LocalArray) {
        self.zip_with(a, b, "add", |x, y| x + y);
    }

    pub fn minus(&mut self, a: &LocalArray, b: &LocalArray) {
        self.zip_with(a, b, "minus", |x, y| x - y);
    }

    pub fn mult(&mut self, a: &LocalArray, b: &LocalArray) {
        self.zip_with(a, b, "mult", |x, y| x * y);
    }

    pub fn div(&mut self, a: &LocalArray, b: &LocalArray) {
        self.zip_with(a, b, "div", |x, y| x / y);
    }

    pub fn add_scalar(&mut self, a: &LocalArray, x: f32) {
        self.map_from(a, "add_scalar", |v| v + x);
    }

    pub fn minus_scalar(&mut self, a: &LocalArray, x: f32) {
        self.map_from(a, "minus_scalar", |v| v - x);
    }

    pub fn mult_scalar(&mut self, a: &LocalArray, x: f32) {
        self.map_from(a, "mult_scalar", |v| v * x);
    }

    pub fn div_scalar(&mut self, a: &LocalArray, x: f32) {
        self.map_from(a, "div_scalar", |v| v / x);
    }

    pub fn square(&mut self, a: &LocalArray) {
        self.map_from(a, "square", |v| v * v);
    }

    pub fn pow(&mut self, a: &LocalArray, p: f32) {
        self.map_from(a, "pow", |v| v.powf(p));
    }

    pub fn map(&mut self, a: &LocalArray, f: impl Fn(f32) -> f32) {
        self.map_from(a, "map", f);
    }

    /// 1.0 where `a < t`, otherwise 0.0.
    pub fn threshold(&mut self, a: &LocalArray, t: f32) {
        self.map_from(a, "threshold", |v| if v < t { 1.0 } else { 0.0 });
    }

    pub fn max_scalar(&mut self, a: &LocalArray, x: f32) {
        self.map_from(a, "max_scalar", |v| v.max(x));
    }

    pub fn min_scalar(&mut self, a: &LocalArray, x: f32) {
        self.map_from(a, "min_scalar", |v| v.min(x));
    }

    pub fn copy_from(&mut self, a: &LocalArray) {
        self.map_from(a, "copy_from", |v| v);
    }

    pub fn fill(&mut self, value: f32) {
        self.write(|dst| dst.fill(value));
    }

    pub fn set_zeros(&mut self) {
        self.fill(0.0);
    }

    pub fn set_ones(&mut self) {
        self.fill(1.0);
    }

    /// Uniform samples in `[0, 1)`.
    pub fn random(&mut self) -> Result<()> {
        self.rand_uniform(0.0, 1.0)
    }

    pub fn rand_uniform(&mut self, low: f32, high: f32) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let samples = Tensor::rand(low, high, self.len(), &Device::Cpu)?.to_vec1::<f32>()?;
        self.write(|dst| dst.copy_from_slice(&samples));
        Ok(())
    }

    pub fn rand_gaussian(&mut self, mean: f32, std: f32) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let samples = Tensor::randn(mean, std, self.len(), &Device::Cpu)?.to_vec1::<f32>()?;
        self.write(|dst| dst.copy_from_slice(&samples));
        Ok(())
    }

    pub fn sum(&self) -> f32 {
        self.read(|data| data.iter().sum())
    }

    pub fn max(&self) -> f32 {
        self.read(|data| data.iter().copied().fold(f32::NEG_INFINITY, f32::max))
    }

    pub fn min(&self) -> f32 {
        self.read(|data| data.iter().copied().fold(f32::INFINITY, f32::min))
    }

    pub fn norm1(&self) -> f32 {
        self.read(|data| data.iter().map(|v| v.abs()).sum())
    }

    fn last_extent(&self) -> usize {
        precondition!(self.shape.dims() > 0, "broadcast on a zero-dimensional array");
        self.shape.extent(self.shape.dims() - 1)
    }

    fn first_extent(&self) -> usize {
        precondition!(self.shape.dims() > 0, "broadcast on a zero-dimensional array");
        self.shape.extent(0)
    }

    /// Add `v[j]` to column `j` of every row.
    pub fn add_row(&mut self, v: &LocalArray) {
        let cols = self.last_extent();
        precondition!(
            v.len() == cols,
            "add_row: vector of {} elements, destination {} has {} columns",
            v.len(),
            self.shape,
            cols
        );
        let v = v.to_vec();
        self.write(|dst| {
            for row in dst.chunks_mut(cols) {
                for (d, x) in row.iter_mut().zip(&v) {
                    *d += x;
                }
            }
        });
    }

    /// Add `v[i]` to every element of row `i`.
    pub fn add_col(&mut self, v: &LocalArray) {
        let rows = self.first_extent();
        precondition!(
            v.len() == rows,
            "add_col: vector of {} elements, destination {} has {} rows",
            v.len(),
            self.shape,
            rows
        );
        let v = v.to_vec();
        let width = if rows == 0 { 0 } else { self.len() / rows };
        self.write(|dst| {
            for (row, x) in dst.chunks_mut(width.max(1)).zip(&v) {
                for d in row.iter_mut() {
                    *d += x;
                }
            }
        });
    }

    /// `self[j] = sum_i src[i, j]`.
    pub fn sum_rows(&mut self, src: &LocalArray) {
        let cols = src.last_extent();
        precondition!(
            self.len() == cols,
            "sum_rows: destination of {} elements, source {} has {} columns",
            self.len(),
            src.shape,
            cols
        );
        let src = src.to_vec();
        self.write(|dst| {
            dst.fill(0.0);
            for row in src.chunks(cols.max(1)) {
                for (d, x) in dst.iter_mut().zip(row) {
                    *d += x;
                }
            }
        });
    }

    /// `self[i] = sum_j src[i, j]`.
    pub fn sum_cols(&mut self, src: &LocalArray) {
        let rows = src.first_extent();
        precondition!(
            self.len() == rows,
            "sum_cols: destination of {} elements, source {} has {} rows",
            self.len(),
            src.shape,
            rows
        );
        let width = if rows == 0 { 0 } else { src.len() / rows };
        let src = src.to_vec();
        self.write(|dst| {
            for (i, d) in dst.iter_mut().enumerate() {
                *d = src[i * width..(i + 1) * width].iter().sum();
            }
        });
    }

    /// `self = op(a) * op(b) + beta * self`, `beta` being 0 when `overwrite`
    /// and 1 otherwise.
    pub fn dot(
        &mut self,
        a: &LocalArray,
        b: &LocalArray,
        trans_a: bool,
        trans_b: bool,
        overwrite: bool,
    ) -> Result<()> {
        for (name, array) in [("lhs", a), ("rhs", b), ("destination", &*self)] {
            precondition!(
                array.shape.dims() == 2,
                "dot: {} {} has {} dimensions, expected 2",
                name,
                array.shape,
                array.shape.dims()
            );
        }
        let (m, k) = if trans_a {
            (a.shape.extent(1), a.shape.extent(0))
        } else {
            (a.shape.extent(0), a.shape.extent(1))
        };
        let (kb, n) = if trans_b {
            (b.shape.extent(1), b.shape.extent(0))
        } else {
            (b.shape.extent(0), b.shape.extent(1))
        };
        precondition!(
            k == kb,
            "dot: inner dimensions differ, op(lhs) is {}x{} and op(rhs) is {}x{}",
            m,
            k,
            kb,
            n
        );
        precondition!(
            self.shape.extent(0) == m && self.shape.extent(1) == n,
            "dot: destination {} cannot hold a {}x{} product",
            self.shape,
            m,
            n
        );

        if m == 0 || n == 0 {
            return Ok(());
        }
        if k == 0 {
            if overwrite {
                self.fill(0.0);
            }
            return Ok(());
        }

        let lhs = if trans_a { a.to_tensor()?.t()? } else { a.to_tensor()? };
        let rhs = if trans_b { b.to_tensor()?.t()? } else { b.to_tensor()? };
        let product = lhs
            .contiguous()?
            .matmul(&rhs.contiguous()?)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        self.write(|dst| {
            if overwrite {
                dst.copy_from_slice(&product);
            } else {
                for (d, p) in dst.iter_mut().zip(&product) {
                    *d += p;
                }
            }
        });
        Ok(())
    }

    pub fn to_tensor(&self) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.to_vec(), self.shape.extents(), &Device::Cpu)?)
    }

    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = Shape::new(tensor.dims().to_vec());
        let data = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(Self::from_vec(shape, data))
    }
}

impl fmt::Debug for LocalArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalArray")
            .field("shape", &self.shape)
            .field("offset", &self.offset)
            .field("view", &self.is_view())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(extents: &[usize], data: &[f32]) -> LocalArray {
        LocalArray::from_vec(Shape::from(extents), data.to_vec())
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_ones_sum() {
        let mut a = LocalArray::zeros(Shape::from([2, 3]));
        a.set_ones();
        assert_eq!(a.sum(), 6.0);
    }

    #[test]
    fn test_elementwise_laws() {
        let a = array(&[2, 2], &[1.0, -2.0, 3.5, 4.0]);
        let b = array(&[2, 2], &[0.5, 2.0, -1.0, 8.0]);
        let mut c = LocalArray::zeros(Shape::from([2, 2]));

        c.add(&a, &b);
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(c.at(&[i, j]), a.at(&[i, j]) + b.at(&[i, j]));
            }
        }

        c.minus(&a, &b);
        let diff = c.duplicate();
        c.add(&diff, &b);
        assert_close(&c.to_vec(), &a.to_vec());
    }

    #[test]
    fn test_destination_may_alias_operand() {
        let mut a = array(&[3], &[1.0, 2.0, 3.0]);
        let alias = a.view();
        a.mult(&alias, &alias);
        assert_eq!(a.to_vec(), vec![1.0, 4.0, 9.0]);
    }

    #[test]
    fn test_unary_kernels() {
        let a = array(&[4], &[-2.0, 0.5, 2.0, 3.0]);
        let mut out = LocalArray::zeros(Shape::from([4]));

        out.square(&a);
        assert_close(&out.to_vec(), &[4.0, 0.25, 4.0, 9.0]);
        out.pow(&a, 3.0);
        assert_close(&out.to_vec(), &[-8.0, 0.125, 8.0, 27.0]);
        out.threshold(&a, 1.0);
        assert_eq!(out.to_vec(), vec![1.0, 1.0, 0.0, 0.0]);
        out.max_scalar(&a, 0.0);
        assert_eq!(out.to_vec(), vec![0.0, 0.5, 2.0, 3.0]);
        out.min_scalar(&a, 1.0);
        assert_eq!(out.to_vec(), vec![-2.0, 0.5, 1.0, 1.0]);
        out.map(&a, |v| v * 10.0 + 1.0);
        assert_close(&out.to_vec(), &[-19.0, 6.0, 21.0, 31.0]);
        out.div_scalar(&a, 2.0);
        assert_close(&out.to_vec(), &[-1.0, 0.25, 1.0, 1.5]);
    }

    #[test]
    fn test_reductions() {
        let a = array(&[2, 2], &[-3.0, 1.0, 2.0, -0.5]);
        assert_eq!(a.sum(), -0.5);
        assert_eq!(a.max(), 2.0);
        assert_eq!(a.min(), -3.0);
        assert_eq!(a.norm1(), 6.5);
    }

    #[test]
    fn test_broadcast_ops() {
        let mut m = array(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        m.add_row(&array(&[3], &[10.0, 20.0, 30.0]));
        assert_eq!(m.to_vec(), vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);

        m.add_col(&array(&[2], &[-1.0, 1.0]));
        assert_eq!(m.to_vec(), vec![10.0, 21.0, 32.0, 15.0, 26.0, 37.0]);

        let mut rows = LocalArray::zeros(Shape::from([3]));
        rows.sum_rows(&m);
        assert_eq!(rows.to_vec(), vec![25.0, 47.0, 69.0]);

        let mut cols = LocalArray::zeros(Shape::from([2]));
        cols.sum_cols(&m);
        assert_eq!(cols.to_vec(), vec![63.0, 78.0]);
    }

    #[test]
    #[should_panic(expected = "add_row")]
    fn test_add_row_requires_matching_columns() {
        let mut m = LocalArray::zeros(Shape::from([2, 3]));
        m.add_row(&LocalArray::zeros(Shape::from([2])));
    }

    #[test]
    fn test_dot_plain_and_transposed() -> Result<()> {
        // a is 2x3, b is 3x2
        let a = array(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = array(&[3, 2], &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let mut c = LocalArray::zeros(Shape::from([2, 2]));
        c.dot(&a, &b, false, false, true)?;
        assert_eq!(c.to_vec(), vec![58.0, 64.0, 139.0, 154.0]);

        // at * a is 3x3
        let mut g = LocalArray::zeros(Shape::from([3, 3]));
        g.dot(&a, &a, true, false, true)?;
        assert_eq!(g.to_vec(), vec![17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);

        // a * at is 2x2
        let mut h = LocalArray::zeros(Shape::from([2, 2]));
        h.dot(&a, &a, false, true, true)?;
        assert_eq!(h.to_vec(), vec![14.0, 32.0, 32.0, 77.0]);

        // accumulate adds on top of the previous product
        c.dot(&a, &b, false, false, false)?;
        assert_eq!(c.to_vec(), vec![116.0, 128.0, 278.0, 308.0]);
        Ok(())
    }

    #[test]
    fn test_dot_both_transposed() -> Result<()> {
        let a = array(&[3, 2], &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let b = array(&[2, 3], &[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
        let mut c = LocalArray::zeros(Shape::from([2, 2]));
        c.dot(&a, &b, true, true, true)?;
        assert_close(&c.to_vec(), &[58.0, 64.0, 139.0, 154.0]);
        Ok(())
    }

    #[test]
    fn test_dot_empty_inner_dimension() -> Result<()> {
        let a = LocalArray::zeros(Shape::from([2, 0]));
        let b = LocalArray::zeros(Shape::from([0, 3]));
        let mut c = LocalArray::filled(Shape::from([2, 3]), 5.0);
        c.dot(&a, &b, false, false, false)?;
        assert_eq!(c.to_vec(), vec![5.0; 6]);
        c.dot(&a, &b, false, false, true)?;
        assert_eq!(c.to_vec(), vec![0.0; 6]);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "inner dimensions differ")]
    fn test_dot_inner_mismatch() {
        let a = LocalArray::zeros(Shape::from([2, 3]));
        let b = LocalArray::zeros(Shape::from([2, 2]));
        let mut c = LocalArray::zeros(Shape::from([2, 2]));
        let _ = c.dot(&a, &b, false, false, true);
    }

    #[test]
    #[should_panic(expected = "volume")]
    fn test_from_vec_volume_mismatch() {
        array(&[2, 2], &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_index_view_writes_through() {
        let parent = LocalArray::zeros(Shape::from([3, 2]));
        let mut row = parent.index(1);
        assert!(row.is_view());
        assert_eq!(row.shape().extents(), &[2]);
        row.set_ones();
        assert_eq!(parent.to_vec(), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_reshape_view() {
        let parent = array(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let flat = parent.reshape(Shape::from([3, 2]));
        assert_eq!(flat.at(&[2, 1]), 6.0);
        assert_eq!(flat.index(1).to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    #[should_panic(expected = "outlived its parent")]
    fn test_view_after_parent_dropped() {
        let parent = LocalArray::zeros(Shape::from([2, 2]));
        let row = parent.index(0);
        drop(parent);
        row.sum();
    }

    #[test]
    fn test_range_copy_and_write() {
        let mut m = array(&[3, 3], &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let block = Range::new(vec![1, 1], vec![3, 3]);
        assert_eq!(m.copy_range(&block).to_vec(), vec![4.0, 5.0, 7.0, 8.0]);

        m.write_range(&block, &[-1.0, -2.0, -3.0, -4.0]);
        m.accumulate_range(&block, &[1.0, 1.0, 1.0, 1.0], 2.0);
        assert_eq!(m.copy_range(&block).to_vec(), vec![1.0, 0.0, -1.0, -2.0]);
        assert_eq!(m.at(&[0, 2]), 2.0);
    }

    #[test]
    fn test_random_fills_within_bounds() -> Result<()> {
        let mut a = LocalArray::zeros(Shape::from([64]));
        a.rand_uniform(-1.0, 1.0)?;
        assert!(a.max() < 1.0 && a.min() >= -1.0);
        a.random()?;
        assert!(a.min() >= 0.0);
        Ok(())
    }
}

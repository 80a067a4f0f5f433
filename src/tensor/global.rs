//! Arrays partitioned along one dimension across the ranks of a process group.
//!
//! Every rank holds the elements of its own [`Partition`] in a registered
//! segment. Reads and writes of arbitrary boxes are one-sided: the caller
//! splits the box by owner and moves each piece with the communicator, and the
//! owners do not participate. Setup, teardown, `sync` and `dot` are
//! collective and must be called by every rank of the group in the same order.

use super::local::{LocalArray, SharedBuffer};
use super::partition::Partition;
use super::range::Range;
use super::shape::Shape;
use super::RangeSource;
use crate::distributed::{ProcessGroup, SegmentId};
use crate::precondition;
use crate::utils::error::{violation, DArrayError, Result};
use crate::utils::metrics;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// This rank's registered segment. Dropping the last strong reference
/// deregisters it collectively.
struct Registration {
    group: ProcessGroup,
    segment: SegmentId,
    local: SharedBuffer,
    freed: AtomicBool,
}

impl Registration {
    fn free(&self) -> Result<()> {
        if self.freed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let elements = self.local.read().unwrap_or_else(PoisonError::into_inner).len();
        self.group.communicator().deregister(self.segment)?;
        metrics::record_global_free(elements);
        metrics::record_collective("free");
        debug!(rank = self.group.rank(), segment = self.segment, "Global array freed");
        Ok(())
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(e) = self.free() {
            error!(segment = self.segment, error = %e, "Failed to free global array");
        }
    }
}

enum Handle {
    Owner(Arc<Registration>),
    View(Weak<Registration>),
}

pub struct GlobalArray {
    shape: Shape,
    partition_dim: usize,
    partitions: Vec<Partition>,
    rank: usize,
    handle: Handle,
}

impl GlobalArray {
    /// Collectively create a zero-filled array split along `partition_dim`.
    ///
    /// Every rank must pass the same shape and dimension. Every rank checks
    /// the gathered layouts, so a disagreement aborts all of them before
    /// anything is registered.
    pub fn setup(shape: Shape, partition_dim: usize, group: &ProcessGroup) -> Result<Self> {
        precondition!(
            shape.dims() > 0 && partition_dim < shape.dims(),
            "cannot split shape {} along dimension {}",
            shape,
            partition_dim
        );
        let rank = group.rank();
        let layouts = group.all_gather(&(shape.extents().to_vec(), partition_dim))?;
        metrics::record_collective("setup");
        if let Some((other, (extents, dim))) = layouts
            .iter()
            .enumerate()
            .find(|(_, (extents, dim))| extents.as_slice() != shape.extents() || *dim != partition_dim)
        {
            violation(format!(
                "setup disagreement: rank {} set up {} split on {}, rank {} set up {:?} split on {}",
                rank, shape, partition_dim, other, extents, dim
            ));
        }

        let partitions = Partition::split(&shape, partition_dim, group.size());
        let local_vol = partitions[rank].local_vol();
        if local_vol == 0 {
            warn!(rank, shape = %shape, partition_dim, "Rank owns an empty slice");
        }
        let local: SharedBuffer = Arc::new(RwLock::new(vec![0.0; local_vol]));
        let segment = group.communicator().register(local.clone())?;
        metrics::record_global_alloc(local_vol);
        info!(
            rank,
            shape = %shape,
            partition_dim,
            range = %partitions[rank].range(),
            "Global array set up"
        );

        Ok(Self {
            shape,
            partition_dim,
            partitions,
            rank,
            handle: Handle::Owner(Arc::new(Registration {
                group: group.clone(),
                segment,
                local,
                freed: AtomicBool::new(false),
            })),
        })
    }

    fn registration(&self) -> Arc<Registration> {
        match &self.handle {
            Handle::Owner(reg) => reg.clone(),
            Handle::View(weak) => weak.upgrade().unwrap_or_else(|| {
                violation(format!(
                    "view of global array {} used after the array was freed",
                    self.shape
                ))
            }),
        }
    }

    fn weak(&self) -> Weak<Registration> {
        match &self.handle {
            Handle::Owner(reg) => Arc::downgrade(reg),
            Handle::View(weak) => weak.clone(),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn partition_dim(&self) -> usize {
        self.partition_dim
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// This rank's slice.
    pub fn partition(&self) -> &Partition {
        &self.partitions[self.rank]
    }

    /// Every rank's slice, indexed by rank.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn group(&self) -> ProcessGroup {
        self.registration().group.clone()
    }

    pub fn is_view(&self) -> bool {
        matches!(self.handle, Handle::View(_))
    }

    /// A weak view of this rank's own slice, shaped like the partition.
    pub fn local(&self) -> LocalArray {
        let reg = self.registration();
        LocalArray::view_of(self.partition().local_shape(), &reg.local, 0)
    }

    /// A non-owning handle on the same array.
    pub fn view(&self) -> GlobalArray {
        GlobalArray {
            shape: self.shape.clone(),
            partition_dim: self.partition_dim,
            partitions: self.partitions.clone(),
            rank: self.rank,
            handle: Handle::View(self.weak()),
        }
    }

    /// Reinterpret the array under `shape` without moving data.
    ///
    /// Possible only when `shape` has a dimension with the same extent and the
    /// same stride as the current partition dimension; that dimension becomes
    /// the new partition dimension and every rank keeps its segment as is.
    pub fn reshape(&self, shape: Shape) -> Result<GlobalArray> {
        if shape.volume() != self.shape.volume() {
            return Err(DArrayError::Reshape(format!(
                "cannot reshape {} (volume {}) to {} (volume {})",
                self.shape,
                self.shape.volume(),
                shape,
                shape.volume()
            )));
        }
        let extent = self.shape.extent(self.partition_dim);
        let stride = self.shape.stride(self.partition_dim);
        let dim = (0..shape.dims())
            .find(|&d| shape.extent(d) == extent && shape.stride(d) == stride)
            .ok_or_else(|| {
                DArrayError::Reshape(format!(
                    "{} is split on dimension {} (extent {}, stride {}) and {} has no matching dimension",
                    self.shape, self.partition_dim, extent, stride, shape
                ))
            })?;
        let partitions = Partition::split(&shape, dim, self.partitions.len());
        Ok(GlobalArray {
            shape,
            partition_dim: dim,
            partitions,
            rank: self.rank,
            handle: Handle::View(self.weak()),
        })
    }

    fn check_range(&self, range: &Range, op: &str) {
        precondition!(
            Range::full(&self.shape).contains_range(range),
            "{}: range {} is outside global array {}",
            op,
            range,
            self.shape
        );
    }

    pub(crate) fn get_values(&self, range: &Range) -> Result<Vec<f32>> {
        self.check_range(range, "get");
        let reg = self.registration();
        let mut out = vec![0.0; range.volume()];
        for (target, part) in self.partitions.iter().enumerate() {
            let block = range.intersect(part.range());
            if block.is_empty() {
                continue;
            }
            let runs = Range::copy_plan(&block, part.range(), range);
            reg.group.communicator().get(reg.segment, target, &runs, &mut out)?;
            if target != self.rank {
                metrics::record_remote_get(block.volume());
            }
        }
        Ok(out)
    }

    /// Copy `range` out of whichever ranks own it.
    pub fn get(&self, range: &Range) -> Result<LocalArray> {
        Ok(LocalArray::from_vec(range.shape(), self.get_values(range)?))
    }

    /// Overwrite `range` with `values`, row-major over the range.
    pub fn put(&self, range: &Range, values: &[f32]) -> Result<()> {
        self.scatter(range, values, None)
    }

    /// Add `alpha * values` into `range`.
    ///
    /// Concurrent accumulates from several ranks into overlapping ranges all
    /// land; each owner applies one call's contribution atomically.
    pub fn accumulate(&self, range: &Range, values: &[f32], alpha: f32) -> Result<()> {
        self.scatter(range, values, Some(alpha))
    }

    fn scatter(&self, range: &Range, values: &[f32], alpha: Option<f32>) -> Result<()> {
        let op = if alpha.is_some() { "accumulate" } else { "put" };
        self.check_range(range, op);
        precondition!(
            values.len() == range.volume(),
            "{}: range {} needs {} elements, got {}",
            op,
            range,
            range.volume(),
            values.len()
        );
        let reg = self.registration();
        let comm = reg.group.communicator();
        for (target, part) in self.partitions.iter().enumerate() {
            let block = range.intersect(part.range());
            if block.is_empty() {
                continue;
            }
            let runs = Range::copy_plan(&block, range, part.range());
            match alpha {
                Some(alpha) => {
                    comm.accumulate(reg.segment, target, &runs, values, alpha)?;
                    metrics::record_accumulate(block.volume());
                }
                None => {
                    comm.put(reg.segment, target, &runs, values)?;
                    if target != self.rank {
                        metrics::record_remote_put(block.volume());
                    }
                }
            }
        }
        Ok(())
    }

    /// Collective fence: one-sided writes issued before it are visible to
    /// every rank after it.
    pub fn sync(&self) -> Result<()> {
        metrics::record_collective("sync");
        self.registration().group.barrier()
    }

    /// Collectively release the array. Views created from it become unusable.
    pub fn free(self) -> Result<()> {
        match self.handle {
            Handle::Owner(reg) => reg.free(),
            Handle::View(_) => Err(DArrayError::Distributed(format!(
                "only the owning handle can free global array {}",
                self.shape
            ))),
        }
    }

    /// Collective matrix product into `window`.
    ///
    /// `window` selects one matrix in the trailing two dimensions (every
    /// leading dimension has extent 1). Each rank computes the part of the
    /// window it owns, fetching only the rows of `op(a)` and columns of
    /// `op(b)` it needs, and writes it into its own segment.
    pub fn dot(
        &self,
        window: &Range,
        a: &dyn RangeSource,
        b: &dyn RangeSource,
        trans_a: bool,
        trans_b: bool,
        overwrite: bool,
    ) -> Result<()> {
        let dims = self.shape.dims();
        precondition!(
            dims >= 2 && window.dims() == dims,
            "dot: window {} does not select a matrix of {}",
            window,
            self.shape
        );
        self.check_range(window, "dot");
        precondition!(
            (0..dims - 2).all(|d| window.extent(d) == 1),
            "dot: window {} spans more than one matrix of {}",
            window,
            self.shape
        );
        let (rd, cd) = (dims - 2, dims - 1);
        let (m, n) = (window.extent(rd), window.extent(cd));
        let (a_shape, b_shape) = (a.source_shape(), b.source_shape());
        precondition!(
            a_shape.dims() == 2 && b_shape.dims() == 2,
            "dot: operands {} and {} must both have 2 dimensions",
            a_shape,
            b_shape
        );
        let (am, k) = if trans_a {
            (a_shape.extent(1), a_shape.extent(0))
        } else {
            (a_shape.extent(0), a_shape.extent(1))
        };
        let (kb, bn) = if trans_b {
            (b_shape.extent(1), b_shape.extent(0))
        } else {
            (b_shape.extent(0), b_shape.extent(1))
        };
        precondition!(
            k == kb,
            "dot: inner dimensions differ, op(lhs) is {}x{} and op(rhs) is {}x{}",
            am,
            k,
            kb,
            bn
        );
        precondition!(
            am == m && bn == n,
            "dot: window {} cannot hold a {}x{} product",
            window,
            am,
            bn
        );

        let reg = self.registration();
        let start = Instant::now();
        reg.group.barrier()?;

        let owned = window.intersect(self.partition().range());
        let product = if owned.is_empty() {
            Ok(None)
        } else {
            let rows = (owned.start()[rd] - window.start()[rd], owned.end()[rd] - window.start()[rd]);
            let cols = (owned.start()[cd] - window.start()[cd], owned.end()[cd] - window.start()[cd]);
            let compute = || -> Result<Vec<f32>> {
                let block_shape = Shape::new(vec![rows.1 - rows.0, cols.1 - cols.0]);
                let mut block = if overwrite {
                    LocalArray::zeros(block_shape)
                } else {
                    LocalArray::from_vec(block_shape, self.get_values(&owned)?)
                };
                if k > 0 {
                    let a_range = if trans_a {
                        Range::new(vec![0, rows.0], vec![k, rows.1])
                    } else {
                        Range::new(vec![rows.0, 0], vec![rows.1, k])
                    };
                    let b_range = if trans_b {
                        Range::new(vec![cols.0, 0], vec![cols.1, k])
                    } else {
                        Range::new(vec![0, cols.0], vec![k, cols.1])
                    };
                    let lhs = a.fetch_range(&a_range)?;
                    let rhs = b.fetch_range(&b_range)?;
                    block.dot(&lhs, &rhs, trans_a, trans_b, overwrite)?;
                }
                Ok(block.to_vec())
            };
            compute().map(Some)
        };

        // Operands may alias the destination; nobody writes until all have read.
        // A failed rank still joins both barriers.
        reg.group.barrier()?;
        let written = match product {
            Ok(Some(values)) => self.put(&owned, &values),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        reg.group.barrier()?;
        if let Err(e) = written {
            error!(rank = self.rank, window = %window, error = %e, "dot failed on this rank");
            return Err(e);
        }

        let elapsed = start.elapsed();
        metrics::record_collective("dot");
        metrics::record_dot_duration(elapsed.as_secs_f64());
        debug!(rank = self.rank, window = %window, owned = %owned, ?elapsed, "dot");
        Ok(())
    }
}

impl RangeSource for GlobalArray {
    fn source_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn fetch_range(&self, range: &Range) -> Result<LocalArray> {
        self.get(range)
    }
}

impl fmt::Debug for GlobalArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalArray")
            .field("shape", &self.shape)
            .field("partition_dim", &self.partition_dim)
            .field("rank", &self.rank)
            .field("range", self.partition().range())
            .field("view", &self.is_view())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::run_local_group;

    #[test]
    fn test_partitions_and_get() {
        let results = run_local_group(2, |group| {
            let array = GlobalArray::setup(Shape::from([4, 4]), 0, &group).unwrap();
            let mut local = array.local();
            local.fill(group.rank() as f32 + 1.0);
            array.sync().unwrap();

            let range = array.partition().range().clone();
            let all = array.get(&Range::full(array.shape())).unwrap().to_vec();
            (range, all)
        });

        assert_eq!(results[0].0, Range::new(vec![0, 0], vec![2, 4]));
        assert_eq!(results[1].0, Range::new(vec![2, 0], vec![4, 4]));
        let expected: Vec<f32> = [1.0; 8].iter().chain([2.0; 8].iter()).copied().collect();
        assert!(results.iter().all(|(_, all)| *all == expected));
    }

    #[test]
    fn test_put_across_boundary() {
        let results = run_local_group(2, |group| {
            let array = GlobalArray::setup(Shape::from([4, 3]), 0, &group).unwrap();
            if group.rank() == 0 {
                // rows 1..3 straddle both ranks
                let range = Range::new(vec![1, 1], vec![3, 3]);
                array.put(&range, &[1.0, 2.0, 3.0, 4.0]).unwrap();
            }
            array.sync().unwrap();
            array.local().to_vec()
        });
        assert_eq!(results[0], vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
        assert_eq!(results[1], vec![0.0, 3.0, 4.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_concurrent_accumulate() {
        let results = run_local_group(3, |group| {
            let array = GlobalArray::setup(Shape::from([3, 4]), 1, &group).unwrap();
            let full = Range::full(array.shape());
            let ones = vec![1.0; full.volume()];
            array.accumulate(&full, &ones, 2.0).unwrap();
            array.sync().unwrap();
            array.get(&full).unwrap().to_vec()
        });
        for values in results {
            assert!(values.iter().all(|&v| v == 6.0));
        }
    }

    #[test]
    #[should_panic(expected = "setup disagreement")]
    fn test_setup_mismatch_is_fatal() {
        run_local_group(2, |group| {
            let extents = if group.rank() == 0 { [4, 4] } else { [4, 2] };
            let _ = GlobalArray::setup(Shape::from(extents), 0, &group);
        });
    }

    #[test]
    fn test_setup_mismatch_aborts_every_rank() {
        let outcomes = run_local_group(2, |group| {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let dim = if group.rank() == 0 { 0 } else { 1 };
                let _ = GlobalArray::setup(Shape::from([4, 4]), dim, &group);
            }))
            .is_err()
        });
        assert_eq!(outcomes, vec![true, true]);
    }

    #[test]
    fn test_reshape_keeps_segments() {
        let results = run_local_group(2, |group| {
            let array = GlobalArray::setup(Shape::from([4, 6]), 0, &group).unwrap();
            let local = array.local();
            let base = group.rank() as f32 * 12.0;
            local.write(|data| {
                for (i, v) in data.iter_mut().enumerate() {
                    *v = base + i as f32;
                }
            });
            array.sync().unwrap();

            let cube = array.reshape(Shape::from([4, 2, 3])).unwrap();
            let value = cube.get(&Range::new(vec![3, 1, 2], vec![4, 2, 3])).unwrap().to_vec();
            let flat_err = array.reshape(Shape::from([24])).is_err();
            let volume_err = array.reshape(Shape::from([5, 5])).is_err();
            (cube.partition_dim(), value, flat_err, volume_err)
        });
        for (dim, value, flat_err, volume_err) in results {
            assert_eq!(dim, 0);
            assert_eq!(value, vec![23.0]);
            assert!(flat_err && volume_err);
        }
    }

    #[test]
    fn test_collective_dot_matches_local() {
        let a = LocalArray::from_vec(Shape::from([4, 3]), (0..12).map(|v| v as f32).collect());
        let b = LocalArray::from_vec(Shape::from([3, 5]), (0..15).map(|v| v as f32 * 0.5).collect());
        let mut expected = LocalArray::zeros(Shape::from([4, 5]));
        expected.dot(&a, &b, false, false, true).unwrap();
        let expected = expected.to_vec();

        let (a_data, b_data) = (a.to_vec(), b.to_vec());
        let results = run_local_group(3, |group| {
            let a = LocalArray::from_vec(Shape::from([4, 3]), a_data.clone());
            let b = LocalArray::from_vec(Shape::from([3, 5]), b_data.clone());
            let c = GlobalArray::setup(Shape::from([4, 5]), 0, &group).unwrap();
            c.dot(&Range::full(c.shape()), &a, &b, false, false, true).unwrap();
            c.get(&Range::full(c.shape())).unwrap().to_vec()
        });
        for values in results {
            assert_eq!(values, expected);
        }
    }

    /// Serves a matrix on every rank but `failing_rank`.
    struct FlakySource {
        inner: LocalArray,
        rank: usize,
        failing_rank: usize,
    }

    impl RangeSource for FlakySource {
        fn source_shape(&self) -> Shape {
            self.inner.shape().clone()
        }

        fn fetch_range(&self, range: &Range) -> Result<LocalArray> {
            if self.rank == self.failing_rank {
                return Err(DArrayError::Communication(format!("cannot reach {}", range)));
            }
            self.inner.fetch_range(range)
        }
    }

    #[test]
    fn test_dot_failure_keeps_group_in_step() {
        let results = run_local_group(2, |group| {
            let a = FlakySource {
                inner: LocalArray::filled(Shape::from([2, 2]), 1.0),
                rank: group.rank(),
                failing_rank: 1,
            };
            let b = LocalArray::filled(Shape::from([2, 2]), 1.0);
            let c = GlobalArray::setup(Shape::from([2, 2]), 0, &group).unwrap();
            let outcome = c.dot(&Range::full(c.shape()), &a, &b, false, false, true);

            // The group still agrees on the next collective
            let total = group.all_reduce(1.0, crate::distributed::ReduceOp::Sum).unwrap();
            (outcome.is_ok(), total, c.get(&Range::full(c.shape())).unwrap().to_vec())
        });
        assert_eq!(results[0], (true, 2.0, vec![2.0, 2.0, 0.0, 0.0]));
        assert_eq!(results[1], (false, 2.0, vec![2.0, 2.0, 0.0, 0.0]));
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_get_outside_shape_is_fatal() {
        run_local_group(2, |group| {
            let array = GlobalArray::setup(Shape::from([4, 3]), 0, &group).unwrap();
            let _ = array.get(&Range::new(vec![3, 0], vec![5, 3]));
        });
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_put_outside_shape_is_fatal() {
        run_local_group(2, |group| {
            let array = GlobalArray::setup(Shape::from([4, 3]), 0, &group).unwrap();
            let _ = array.put(&Range::new(vec![0, 2], vec![1, 4]), &[1.0, 2.0]);
        });
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_accumulate_outside_shape_is_fatal() {
        let array = GlobalArray::setup(Shape::from([2, 2]), 1, &ProcessGroup::solo()).unwrap();
        let _ = array.accumulate(&Range::new(vec![2, 0], vec![3, 1]), &[1.0], 1.0);
    }

    #[test]
    fn test_free_then_view_panics() {
        let outcome = std::panic::catch_unwind(|| {
            let array = GlobalArray::setup(Shape::from([2, 2]), 0, &ProcessGroup::solo()).unwrap();
            let view = array.view();
            array.free().unwrap();
            view.get(&Range::full(view.shape())).map(|a| a.to_vec())
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn test_view_cannot_free() {
        let array = GlobalArray::setup(Shape::from([2, 2]), 1, &ProcessGroup::solo()).unwrap();
        assert!(array.view().free().is_err());
    }
}

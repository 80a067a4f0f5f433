use super::{all_gather_value, CollectiveCommunicator, SegmentId};
use crate::tensor::local::SharedBuffer;
use crate::tensor::range::Run;
use crate::utils::error::{DArrayError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, PoisonError, RwLock};
use tracing::{debug, trace};

struct SharedState {
    buffers: Mutex<Vec<Option<Vec<u8>>>>,
    barrier: Barrier,
    segments: RwLock<HashMap<(SegmentId, usize), SharedBuffer>>,
}

/// In-process communicator: each rank is a thread sharing one [`SharedState`].
pub struct LocalCommunicator {
    rank: usize,
    world_size: usize,
    shared: Arc<SharedState>,
    next_segment: AtomicU64,
}

impl LocalCommunicator {
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let shared = Arc::new(SharedState {
            buffers: Mutex::new((0..world_size).map(|_| None).collect()),
            barrier: Barrier::new(world_size),
            segments: RwLock::new(HashMap::new()),
        });

        (0..world_size)
            .map(|rank| Self {
                rank,
                world_size,
                shared: shared.clone(),
                next_segment: AtomicU64::new(0),
            })
            .collect()
    }

    fn segment(&self, segment: SegmentId, target: usize) -> Result<SharedBuffer> {
        if target >= self.world_size {
            return Err(DArrayError::Communication(format!(
                "rank {} out of range for group of {}",
                target, self.world_size
            )));
        }
        let segments = self
            .shared
            .segments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        segments.get(&(segment, target)).cloned().ok_or_else(|| {
            DArrayError::Communication(format!(
                "segment {} is not registered on rank {}",
                segment, target
            ))
        })
    }
}

fn check_runs(runs: &[Run], local_len: usize, remote_len: usize, remote_is_src: bool) -> Result<()> {
    for run in runs {
        let (remote, local) = if remote_is_src {
            (run.src, run.dst)
        } else {
            (run.dst, run.src)
        };
        if remote + run.len > remote_len || local + run.len > local_len {
            return Err(DArrayError::Communication(format!(
                "run {:?} exceeds segment of {} or buffer of {} elements",
                run, remote_len, local_len
            )));
        }
    }
    Ok(())
}

impl CollectiveCommunicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn all_gather_bytes(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        // 1. Write to buffer
        {
            let mut buffers = self
                .shared
                .buffers
                .lock()
                .map_err(|e| DArrayError::Communication(e.to_string()))?;
            buffers[self.rank] = Some(payload);
        }

        // 2. Wait for all
        self.shared.barrier.wait();

        // 3. Gather
        let gathered = {
            let buffers = self
                .shared
                .buffers
                .lock()
                .map_err(|e| DArrayError::Communication(e.to_string()))?;
            buffers
                .iter()
                .enumerate()
                .map(|(rank, slot)| {
                    slot.clone().ok_or_else(|| {
                        DArrayError::Communication(format!("rank {} contributed nothing", rank))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };

        // 4. Nobody may overwrite a slot before everyone has read it
        self.shared.barrier.wait();

        gathered
    }

    fn register(&self, buffer: SharedBuffer) -> Result<SegmentId> {
        let id = self.next_segment.fetch_add(1, Ordering::SeqCst);
        {
            let mut segments = self
                .shared
                .segments
                .write()
                .map_err(|e| DArrayError::Communication(e.to_string()))?;
            segments.insert((id, self.rank), buffer);
        }

        // Doubles as the barrier that makes every rank's segment visible
        let ids = all_gather_value(self, &id)?;
        if let Some(other) = ids.iter().position(|&other| other != id) {
            self.shared
                .segments
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&(id, self.rank));
            return Err(DArrayError::CollectiveMismatch {
                rank: self.rank,
                detail: format!(
                    "segment registration out of step: rank {} got id {}, rank {} got id {}",
                    self.rank, id, other, ids[other]
                ),
            });
        }
        debug!(rank = self.rank, segment = id, "Segment registered");
        Ok(id)
    }

    fn deregister(&self, segment: SegmentId) -> Result<()> {
        self.shared.barrier.wait();
        {
            let mut segments = self
                .shared
                .segments
                .write()
                .map_err(|e| DArrayError::Communication(e.to_string()))?;
            segments.remove(&(segment, self.rank));
        }
        self.shared.barrier.wait();
        debug!(rank = self.rank, segment, "Segment deregistered");
        Ok(())
    }

    fn get(&self, segment: SegmentId, target: usize, runs: &[Run], out: &mut [f32]) -> Result<()> {
        let buffer = self.segment(segment, target)?;
        let data = buffer.read().unwrap_or_else(PoisonError::into_inner);
        check_runs(runs, out.len(), data.len(), true)?;
        for run in runs {
            out[run.dst..run.dst + run.len].copy_from_slice(&data[run.src..run.src + run.len]);
        }
        trace!(rank = self.rank, target, segment, runs = runs.len(), "get");
        Ok(())
    }

    fn put(&self, segment: SegmentId, target: usize, runs: &[Run], data: &[f32]) -> Result<()> {
        let buffer = self.segment(segment, target)?;
        let mut remote = buffer.write().unwrap_or_else(PoisonError::into_inner);
        check_runs(runs, data.len(), remote.len(), false)?;
        for run in runs {
            remote[run.dst..run.dst + run.len].copy_from_slice(&data[run.src..run.src + run.len]);
        }
        trace!(rank = self.rank, target, segment, runs = runs.len(), "put");
        Ok(())
    }

    fn accumulate(
        &self,
        segment: SegmentId,
        target: usize,
        runs: &[Run],
        data: &[f32],
        alpha: f32,
    ) -> Result<()> {
        let buffer = self.segment(segment, target)?;
        // The write lock is held across all runs
        let mut remote = buffer.write().unwrap_or_else(PoisonError::into_inner);
        check_runs(runs, data.len(), remote.len(), false)?;
        for run in runs {
            let src = &data[run.src..run.src + run.len];
            for (d, s) in remote[run.dst..run.dst + run.len].iter_mut().zip(src) {
                *d += alpha * s;
            }
        }
        trace!(rank = self.rank, target, segment, runs = runs.len(), "accumulate");
        Ok(())
    }
}

//! Process group handles.
//!
//! A [`ProcessGroup`] is passed explicitly to everything that communicates;
//! there is no process-wide registry of groups.

use super::backend::LocalCommunicator;
use super::{all_gather_value, all_reduce_scalar, CollectiveCommunicator, ReduceOp};
use crate::utils::error::{DArrayError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::info;

/// Process group handle
#[derive(Clone)]
pub struct ProcessGroup {
    /// Communicator for this group
    communicator: Arc<dyn CollectiveCommunicator>,
    /// Global rank of each group member, indexed by group rank
    ranks: Vec<usize>,
}

impl ProcessGroup {
    /// A group whose global ranks equal its group ranks.
    pub fn new(communicator: Arc<dyn CollectiveCommunicator>) -> Self {
        let ranks = (0..communicator.world_size()).collect();
        Self {
            communicator,
            ranks,
        }
    }

    /// A group whose members carry the given global ranks.
    pub fn with_ranks(communicator: Arc<dyn CollectiveCommunicator>, ranks: Vec<usize>) -> Result<Self> {
        if ranks.len() != communicator.world_size() {
            return Err(DArrayError::Distributed(format!(
                "{} global ranks given for a communicator of {} ranks",
                ranks.len(),
                communicator.world_size()
            )));
        }
        Ok(Self {
            communicator,
            ranks,
        })
    }

    /// One handle per rank of a fresh in-process group, indexed by rank.
    pub fn local(world_size: usize) -> Vec<Self> {
        LocalCommunicator::new_group(world_size)
            .into_iter()
            .map(|comm| Self::new(Arc::new(comm)))
            .collect()
    }

    /// A group containing only the calling thread.
    pub fn solo() -> Self {
        Self::local(1).remove(0)
    }

    pub fn communicator(&self) -> &dyn CollectiveCommunicator {
        self.communicator.as_ref()
    }

    /// Rank of the caller within this group.
    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Global rank of the caller.
    pub fn global_rank(&self) -> usize {
        self.ranks[self.rank()]
    }

    /// Get local rank within this group
    pub fn local_rank(&self, global_rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == global_rank)
    }

    pub fn barrier(&self) -> Result<()> {
        self.communicator.barrier()
    }

    pub fn all_gather<T: Serialize + DeserializeOwned>(&self, value: &T) -> Result<Vec<T>> {
        all_gather_value(self.communicator(), value)
    }

    pub fn all_reduce(&self, value: f64, op: ReduceOp) -> Result<f64> {
        all_reduce_scalar(value, op, self.communicator())
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank())
            .field("ranks", &self.ranks)
            .finish()
    }
}

/// Run `body` once per rank of a fresh in-process group and collect the
/// results, indexed by rank.
///
/// Each rank runs on its own named thread. A panic on any rank is re-raised
/// here once every thread has finished.
pub fn run_local_group<F, R>(world_size: usize, body: F) -> Vec<R>
where
    F: Fn(ProcessGroup) -> R + Sync,
    R: Send,
{
    info!(world_size, "Launching in-process group");
    let groups = ProcessGroup::local(world_size);
    let body = &body;
    thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .enumerate()
            .map(|(rank, group)| {
                thread::Builder::new()
                    .name(format!("rank-{}", rank))
                    .spawn_scoped(scope, move || body(group))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                },
                Err(e) => panic!("failed to spawn rank thread: {}", e),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solo_group() -> Result<()> {
        let group = ProcessGroup::solo();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.size(), 1);
        group.barrier()?;
        assert_eq!(group.all_reduce(3.0, ReduceOp::Max)?, 3.0);
        Ok(())
    }

    #[test]
    fn test_run_local_group_reduces() {
        let sums = run_local_group(4, |group| {
            group
                .all_reduce(group.rank() as f64 + 1.0, ReduceOp::Sum)
                .unwrap()
        });
        assert_eq!(sums, vec![10.0; 4]);
    }

    #[test]
    fn test_local_rank_mapping() -> Result<()> {
        let comm = LocalCommunicator::new_group(1).remove(0);
        let group = ProcessGroup::with_ranks(Arc::new(comm), vec![5])?;
        assert_eq!(group.global_rank(), 5);
        assert_eq!(group.local_rank(5), Some(0));
        assert_eq!(group.local_rank(0), None);
        Ok(())
    }

    #[test]
    fn test_rank_count_must_match() {
        let comm = LocalCommunicator::new_group(2).remove(0);
        assert!(ProcessGroup::with_ranks(Arc::new(comm), vec![0]).is_err());
    }
}

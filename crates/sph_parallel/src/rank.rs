//! Process identity within a parallel run.

use std::fmt;
use std::sync::Arc;

/// Collective operations over the ranks of a run.
///
/// Every method except [`rank`](Communicator::rank) and
/// [`size`](Communicator::size) is collective: all ranks must call it, in the
/// same order, or the run deadlocks.
pub trait Communicator: fmt::Debug {
    /// This process's rank, `0..size`.
    fn rank(&self) -> usize;

    /// Number of cooperating processes.
    fn size(&self) -> usize;

    /// Block until every rank has reached the barrier.
    fn barrier(&self);

    /// Contribute `value` and receive every rank's contribution, indexed by
    /// rank.
    fn all_gather(&self, value: u64) -> Vec<u64>;

    /// Terminate the whole run with `code`.
    fn abort(&self, code: i32) -> !;
}

/// Rank id, process count, and communicator for this process.
///
/// Created once at startup and passed down; immutable afterwards. A serial
/// run has `rank = 0`, `size = 1`, and no communicator.
#[derive(Clone)]
pub struct RankContext {
    rank: usize,
    size: usize,
    comm: Option<Arc<dyn Communicator>>,
}

impl RankContext {
    /// The context of a run without a parallel runtime.
    #[must_use]
    pub fn serial() -> Self {
        Self {
            rank: 0,
            size: 1,
            comm: None,
        }
    }

    /// Build the context from a communicator. A single-process communicator
    /// is dropped so that `size == 1` always means "no communicator".
    #[must_use]
    pub fn from_communicator(comm: Arc<dyn Communicator>) -> Self {
        let size = comm.size().max(1);
        let rank = comm.rank();
        debug_assert!(rank < size, "rank {rank} out of range for size {size}");
        if size == 1 {
            return Self::serial();
        }
        Self {
            rank,
            size,
            comm: Some(comm),
        }
    }

    /// Establish the context from the process environment: the MPI world
    /// when built with the `mpi` feature and launched under an MPI runtime,
    /// the serial context otherwise.
    #[must_use]
    pub fn from_environment() -> Self {
        #[cfg(feature = "mpi")]
        {
            if let Some(comm) = crate::mpi_comm::MpiCommunicator::initialize() {
                return Self::from_communicator(Arc::new(comm));
            }
        }
        Self::serial()
    }

    /// This process's rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of cooperating processes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The communicator, present iff `size() > 1`.
    #[must_use]
    pub fn communicator(&self) -> Option<&Arc<dyn Communicator>> {
        self.comm.as_ref()
    }

    /// Returns `true` on the rank that reads truth data and hosts the
    /// control-plane transports.
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Returns `true` when more than one process takes part in the run.
    #[must_use]
    pub fn in_parallel(&self) -> bool {
        self.size > 1
    }

    /// Abort every rank of the run. A serial run simply exits.
    pub fn abort(&self, code: i32) -> ! {
        match &self.comm {
            Some(comm) => comm.abort(code),
            None => std::process::exit(code),
        }
    }
}

impl fmt::Debug for RankContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankContext")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("communicator", &self.comm.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCommunicator;

    #[test]
    fn test_serial_context() {
        let ctx = RankContext::serial();
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.size(), 1);
        assert!(ctx.communicator().is_none());
        assert!(ctx.is_coordinator());
        assert!(!ctx.in_parallel());
    }

    #[test]
    fn test_single_rank_group_drops_communicator() {
        let comm = LocalCommunicator::group(1).pop().unwrap();
        let ctx = RankContext::from_communicator(Arc::new(comm));
        assert_eq!(ctx.size(), 1);
        assert!(ctx.communicator().is_none());
    }

    #[test]
    fn test_exactly_one_coordinator_per_group() {
        for size in 1..=6 {
            let contexts: Vec<RankContext> = LocalCommunicator::group(size)
                .into_iter()
                .map(|c| RankContext::from_communicator(Arc::new(c)))
                .collect();
            assert!(contexts.iter().all(|c| c.rank() < c.size()));
            assert_eq!(contexts.iter().filter(|c| c.is_coordinator()).count(), 1);
        }
    }

    #[test]
    fn test_from_environment_without_runtime_is_serial() {
        if cfg!(feature = "mpi") {
            return;
        }
        let ctx = RankContext::from_environment();
        assert_eq!(ctx.size(), 1);
    }
}

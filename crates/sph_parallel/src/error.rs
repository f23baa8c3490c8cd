//! Partitioning error types.

use crate::partition::PartitionKind;

/// Errors from partition coordination. All of them are fatal for the run:
/// a partially partitioned set of ranks must never enter the step loop.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// A parallel run was requested but no partitioning backend is present.
    #[error("cannot run on {size} ranks: no partitioning backend is available")]
    Unavailable {
        /// The process count of the run.
        size: usize,
    },

    /// Ranks disagree on the set of array names or kinds.
    #[error("particle arrays differ from rank 0 on ranks {ranks:?}")]
    TopologyMismatch {
        /// Ranks whose arrays diverge from rank 0.
        ranks: Vec<usize>,
    },

    /// The partition service failed on this rank.
    #[error("{kind} partition service failed on rank {rank}: {reason}")]
    Service {
        /// The group being balanced.
        kind: PartitionKind,
        /// This rank.
        rank: usize,
        /// The service's error message.
        reason: String,
    },

    /// The partition service failed on other ranks.
    #[error("partitioning failed on ranks {failed_ranks:?}")]
    Collective {
        /// Every rank that reported a failure.
        failed_ranks: Vec<usize>,
    },
}

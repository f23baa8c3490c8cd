//! # sph_parallel
//!
//! Process identity and partition coordination for rank-distributed runs.
//!
//! This crate provides:
//!
//! - [`RankContext`]: rank id, process count, and communicator handle,
//!   established once per process.
//! - [`Communicator`]: the collective operations the bootstrap needs
//!   (barrier, all-gather, abort), with an in-process [`LocalCommunicator`]
//!   group and, behind the `mpi` feature, an MPI world communicator.
//! - [`PartitionBackend`] / [`PartitionService`]: the contract of the
//!   external geometric partitioner.
//! - [`PartitionCoordinator`]: drives the partitioner over the static and
//!   dynamic array groups and barriers all ranks.

pub mod coordinator;
pub mod error;
pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi_comm;
pub mod partition;
pub mod rank;

pub use coordinator::{PartitionCoordinator, PartitionSettings, Partitions, topology_fingerprint};
pub use error::PartitionError;
pub use local::LocalCommunicator;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiCommunicator;
pub use partition::{
    PartitionBackend, PartitionGroup, PartitionKind, PartitionParams, PartitionService,
    ServiceFailure,
};
pub use rank::{Communicator, RankContext};

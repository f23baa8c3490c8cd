//! Initial partitioning of a rank's arrays.
//!
//! Orchestration only; the balancing itself is done by the external
//! [`PartitionBackend`]. The sequence on every rank is:
//!
//! 1. Serial runs return immediately with no groups.
//! 2. Require the backend (no silent fallback).
//! 3. Compare array topologies across ranks.
//! 4. Build and balance the dynamic group.
//! 5. Build and balance the static group, if any static array exists.
//! 6. Barrier.
//!
//! Building a group takes two rounds: create and configure the service,
//! then run its first balance. Ranks agree on the outcome of every round, so
//! a failure on one rank fails every rank before anyone enters the next
//! collective call.

use std::sync::Arc;

use sph_particles::{ArraySplit, ParticleArray};
use tracing::{error, info};

use crate::error::PartitionError;
use crate::partition::{PartitionBackend, PartitionGroup, PartitionKind, PartitionParams};
use crate::rank::{Communicator, RankContext};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// Partitioner tuning taken from the run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSettings {
    /// Balancing method name (e.g. `"RCB"`).
    pub lb_method: String,
    /// Weight objects during balancing.
    pub obj_weights: bool,
    /// Number of ghost cells shared for remote neighbours.
    pub ghost_layers: f64,
    /// Backend debug verbosity.
    pub debug_level: String,
    /// Recompute binning cell sizes on every update.
    pub update_cell_sizes: bool,
    /// Multiplier applied to the kernel radius scale for ghost regions.
    pub parallel_scale_factor: f64,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            lb_method: "RCB".to_string(),
            obj_weights: true,
            ghost_layers: 3.0,
            debug_level: "0".to_string(),
            update_cell_sizes: false,
            parallel_scale_factor: 2.0,
        }
    }
}

impl PartitionSettings {
    /// Resolve the service parameters for a kernel with the given radius
    /// scale. Ghost regions must cover every neighbour a later search can
    /// ask for, so the partition radius follows the interaction radius.
    #[must_use]
    pub fn params(&self, kernel_radius_scale: f64) -> PartitionParams {
        PartitionParams {
            lb_method: self.lb_method.clone(),
            obj_weight_dim: u32::from(self.obj_weights),
            ghost_layers: self.ghost_layers,
            update_cell_sizes: self.update_cell_sizes,
            radius_scale: self.parallel_scale_factor * kernel_radius_scale,
            debug_level: self.debug_level.clone(),
        }
    }
}

/// The partition groups of a rank. Both are `None` in a serial run.
#[derive(Debug, Default)]
pub struct Partitions {
    /// The group balancing dynamic arrays.
    pub dynamic: Option<PartitionGroup>,
    /// The group balancing static arrays, present only if any exist.
    pub fixed: Option<PartitionGroup>,
}

impl Partitions {
    /// Returns `true` if no partitioning took place.
    #[must_use]
    pub fn is_serial(&self) -> bool {
        self.dynamic.is_none() && self.fixed.is_none()
    }
}

/// FNV-1a 64 hash of the ordered `(name, is_static)` list of `arrays`.
///
/// Ranks that built their arrays from the same factory produce the same
/// fingerprint regardless of how many particles they hold.
#[must_use]
pub fn topology_fingerprint(arrays: &[ParticleArray]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut mix = |byte: u8| {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    };
    for array in arrays {
        array.name().bytes().for_each(&mut mix);
        mix(0);
        mix(u8::from(array.is_static()));
    }
    hash
}

/// Drives the external partitioner for one rank.
pub struct PartitionCoordinator<'a> {
    ctx: &'a RankContext,
    backend: Option<&'a dyn PartitionBackend>,
}

impl<'a> PartitionCoordinator<'a> {
    /// Create a coordinator. `backend` is `None` when the run was configured
    /// without a partitioner.
    #[must_use]
    pub fn new(ctx: &'a RankContext, backend: Option<&'a dyn PartitionBackend>) -> Self {
        Self { ctx, backend }
    }

    /// Partition `arrays` across all ranks. Collective.
    ///
    /// On success every rank holds a consistent partition and has passed the
    /// post-balance barrier. On failure every rank returns an error.
    ///
    /// # Errors
    ///
    /// - [`PartitionError::Unavailable`] without a backend in a parallel run.
    /// - [`PartitionError::TopologyMismatch`] if array names or kinds differ
    ///   between ranks.
    /// - [`PartitionError::Service`] if balancing failed on this rank.
    /// - [`PartitionError::Collective`] if balancing failed elsewhere.
    pub fn initialize(
        &self,
        dim: usize,
        arrays: &mut [ParticleArray],
        split: &ArraySplit,
        settings: &PartitionSettings,
        kernel_radius_scale: f64,
    ) -> Result<Partitions, PartitionError> {
        let comm = match self.ctx.communicator() {
            Some(comm) if self.ctx.size() > 1 => comm,
            _ => return Ok(Partitions::default()),
        };
        let rank = self.ctx.rank();
        let backend = self.backend.ok_or(PartitionError::Unavailable {
            size: self.ctx.size(),
        })?;

        check_topology(comm.as_ref(), arrays)?;

        let params = settings.params(kernel_radius_scale);
        info!(
            rank,
            backend = backend.name(),
            lb_method = %params.lb_method,
            radius_scale = params.radius_scale,
            dynamic = split.dynamic.len(),
            fixed = split.fixed.len(),
            "partitioning particle arrays"
        );

        let dynamic = build_group(
            backend,
            comm,
            dim,
            PartitionKind::Dynamic,
            &split.dynamic,
            &params,
            arrays,
        )?;

        let fixed = if split.has_static() {
            Some(build_group(
                backend,
                comm,
                dim,
                PartitionKind::Static,
                &split.fixed,
                &params,
                arrays,
            )?)
        } else {
            None
        };

        comm.barrier();
        info!(rank, "initial partition complete");

        Ok(Partitions {
            dynamic: Some(dynamic),
            fixed,
        })
    }
}

fn check_topology(comm: &dyn Communicator, arrays: &[ParticleArray]) -> Result<(), PartitionError> {
    let fingerprints = comm.all_gather(topology_fingerprint(arrays));
    let reference = fingerprints[0];
    let ranks: Vec<usize> = fingerprints
        .iter()
        .enumerate()
        .filter(|&(_, &fp)| fp != reference)
        .map(|(r, _)| r)
        .collect();
    if ranks.is_empty() {
        Ok(())
    } else {
        Err(PartitionError::TopologyMismatch { ranks })
    }
}

/// Collectively agree on the outcome of one round, so that a failure
/// anywhere stops every rank before the next collective call.
fn agree<T>(
    comm: &dyn Communicator,
    kind: PartitionKind,
    round: &str,
    local: Result<T, PartitionError>,
) -> Result<T, PartitionError> {
    let statuses = comm.all_gather(u64::from(local.is_err()));
    let failed_ranks: Vec<usize> = statuses
        .iter()
        .enumerate()
        .filter(|&(_, &failed)| failed != 0)
        .map(|(r, _)| r)
        .collect();
    if failed_ranks.is_empty() {
        return local;
    }
    let rank = comm.rank();
    match local {
        Err(e) => {
            error!(rank, %kind, round, ?failed_ranks, error = %e, "partitioning failed");
            Err(e)
        }
        Ok(_) => {
            error!(rank, %kind, round, ?failed_ranks, "partitioning failed on other ranks");
            Err(PartitionError::Collective { failed_ranks })
        }
    }
}

/// Create, configure, and initially balance one group.
fn build_group(
    backend: &dyn PartitionBackend,
    comm: &Arc<dyn Communicator>,
    dim: usize,
    kind: PartitionKind,
    members: &[usize],
    params: &PartitionParams,
    arrays: &mut [ParticleArray],
) -> Result<PartitionGroup, PartitionError> {
    let configured = configure_group(backend, comm, dim, kind, members, params);
    let mut group = agree(comm.as_ref(), kind, "configure", configured)?;
    let balanced = group.update(arrays);
    agree(comm.as_ref(), kind, "balance", balanced)?;
    Ok(group)
}

fn configure_group(
    backend: &dyn PartitionBackend,
    comm: &Arc<dyn Communicator>,
    dim: usize,
    kind: PartitionKind,
    members: &[usize],
    params: &PartitionParams,
) -> Result<PartitionGroup, PartitionError> {
    let rank = comm.rank();
    let service = backend
        .create(dim, kind, comm, params)
        .map_err(|e| PartitionError::Service {
            kind,
            rank,
            reason: e.to_string(),
        })?;
    let mut group = PartitionGroup::new(kind, rank, members.to_vec(), params.clone(), service);
    group.set_param("DEBUG_LEVEL", &params.debug_level)?;
    group.set_param("DEBUG_MEMORY", "0")?;
    Ok(group)
}

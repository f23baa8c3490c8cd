//! Contract of the external geometric partitioner, and the per-kind
//! partition groups built on top of it.
//!
//! The balancing algorithm itself is a black box: a [`PartitionBackend`]
//! creates one [`PartitionService`] per group, and the service moves
//! particles between ranks whenever it is told to `update`.

use std::fmt;
use std::sync::Arc;

use sph_particles::ParticleArray;
use tracing::debug;

use crate::error::PartitionError;
use crate::rank::Communicator;

/// Boxed error returned by a failing partition service.
pub type ServiceFailure = Box<dyn std::error::Error + Send + Sync>;

/// Which arrays a partition group balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
    /// Arrays that move every step.
    Dynamic,
    /// Arrays that never move; balanced once.
    Static,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dynamic => f.write_str("dynamic"),
            Self::Static => f.write_str("static"),
        }
    }
}

/// Tuning parameters handed to every partition service.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionParams {
    /// Balancing method name understood by the backend (e.g. `"RCB"`).
    pub lb_method: String,
    /// Object weight dimension: `1` to weight objects, `0` otherwise.
    pub obj_weight_dim: u32,
    /// Number of ghost cells shared for remote neighbours.
    pub ghost_layers: f64,
    /// Recompute binning cell sizes on every update.
    pub update_cell_sizes: bool,
    /// Interaction radius scale used to size ghost regions.
    pub radius_scale: f64,
    /// Backend debug verbosity.
    pub debug_level: String,
}

/// One live partition of a group of arrays.
pub trait PartitionService {
    /// Set a backend-specific parameter.
    ///
    /// # Errors
    ///
    /// Returns the backend's rejection.
    fn set_param(&mut self, key: &str, value: &str) -> Result<(), ServiceFailure>;

    /// Re-balance `arrays` across ranks. Collective.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure; the partition is then unusable.
    fn update(&mut self, arrays: &mut [&mut ParticleArray]) -> Result<(), ServiceFailure>;
}

/// Factory for partition services; the one supported partitioning backend
/// of a parallel run.
pub trait PartitionBackend {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Create a service for one group of arrays.
    ///
    /// # Errors
    ///
    /// Returns the backend's failure.
    fn create(
        &self,
        dim: usize,
        kind: PartitionKind,
        comm: &Arc<dyn Communicator>,
        params: &PartitionParams,
    ) -> Result<Box<dyn PartitionService>, ServiceFailure>;
}

/// A partition service bound to one kind of array.
pub struct PartitionGroup {
    kind: PartitionKind,
    rank: usize,
    members: Vec<usize>,
    params: PartitionParams,
    service: Box<dyn PartitionService>,
    initialized: bool,
    balances: u64,
}

impl PartitionGroup {
    /// Wrap a freshly created service. `members` index the rank's array list.
    #[must_use]
    pub fn new(
        kind: PartitionKind,
        rank: usize,
        members: Vec<usize>,
        params: PartitionParams,
        service: Box<dyn PartitionService>,
    ) -> Self {
        Self {
            kind,
            rank,
            members,
            params,
            service,
            initialized: false,
            balances: 0,
        }
    }

    /// Returns the group kind.
    #[must_use]
    pub fn kind(&self) -> PartitionKind {
        self.kind
    }

    /// Returns `true` once the initial balance has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns how many balances have run.
    #[must_use]
    pub fn balance_count(&self) -> u64 {
        self.balances
    }

    /// Forward a parameter to the service.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Service`] if the backend rejects it.
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<(), PartitionError> {
        self.service
            .set_param(key, value)
            .map_err(|e| self.failure(e))
    }

    /// Per-step update. Dynamic groups re-balance every time; an initialised
    /// static group is left alone. Returns whether a balance ran.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Service`] if the balance fails.
    pub fn update(&mut self, arrays: &mut [ParticleArray]) -> Result<bool, PartitionError> {
        if self.kind == PartitionKind::Static && self.initialized {
            return Ok(false);
        }
        self.balance(arrays)?;
        Ok(true)
    }

    /// Balance unconditionally, including an already balanced static group.
    ///
    /// # Errors
    ///
    /// Returns [`PartitionError::Service`] if the balance fails.
    pub fn rebalance(&mut self, arrays: &mut [ParticleArray]) -> Result<(), PartitionError> {
        self.balance(arrays)
    }

    fn balance(&mut self, arrays: &mut [ParticleArray]) -> Result<(), PartitionError> {
        let mut members: Vec<&mut ParticleArray> = arrays
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| self.members.contains(i))
            .map(|(_, a)| a)
            .collect();
        if let Err(e) = self.service.update(&mut members) {
            return Err(self.failure(e));
        }
        self.initialized = true;
        self.balances += 1;
        debug!(
            kind = %self.kind,
            rank = self.rank,
            lb_method = %self.params.lb_method,
            balances = self.balances,
            "partition balanced"
        );
        Ok(())
    }

    fn failure(&self, e: ServiceFailure) -> PartitionError {
        PartitionError::Service {
            kind: self.kind,
            rank: self.rank,
            reason: e.to_string(),
        }
    }
}

impl fmt::Debug for PartitionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionGroup")
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("members", &self.members)
            .field("initialized", &self.initialized)
            .field("balances", &self.balances)
            .finish_non_exhaustive()
    }
}

//! Checkpoint records for restarting a run.
//!
//! A checkpoint is a MessagePack document (struct-as-map encoding, so a
//! record with missing fields fails to decode) holding every particle array
//! by name plus the solver's time, timestep, and iteration count.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::array::{ArrayError, ParticleArray};

/// Errors from reading, writing, or validating a checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The file could not be read or written.
    #[error("checkpoint I/O error on {}: {source}", path.display())]
    Io {
        /// The checkpoint path.
        path: PathBuf,
        /// The underlying I/O failure.
        source: std::io::Error,
    },

    /// The record could not be encoded.
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The file is not a well-formed checkpoint record.
    #[error("failed to decode checkpoint: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The record decoded but its contents are inconsistent.
    #[error("invalid checkpoint: {0}")]
    Invalid(String),

    /// A stored array breaks the equal-length column invariant.
    #[error("invalid checkpoint array: {0}")]
    Array(#[from] ArrayError),
}

/// Solver progress stored alongside the particles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverData {
    /// Simulation time.
    pub t: f64,
    /// Timestep in effect when the checkpoint was written.
    pub dt: f64,
    /// Number of completed iterations.
    pub count: u64,
}

/// A persisted snapshot of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Particle arrays keyed by name, in their original order.
    pub arrays: IndexMap<String, ParticleArray>,
    /// Solver progress.
    pub solver_data: SolverData,
}

impl CheckpointRecord {
    /// Build a record from arrays (keyed by their own names) and solver data.
    #[must_use]
    pub fn new(arrays: impl IntoIterator<Item = ParticleArray>, solver_data: SolverData) -> Self {
        let arrays = arrays
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect();
        Self {
            arrays,
            solver_data,
        }
    }

    /// Check that every key matches its array, that the arrays are
    /// rectangular, and that `t`/`dt` are usable.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Invalid`] or [`CheckpointError::Array`].
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.arrays.is_empty() {
            return Err(CheckpointError::Invalid("no particle arrays".into()));
        }
        for (key, array) in &self.arrays {
            if key != array.name() {
                return Err(CheckpointError::Invalid(format!(
                    "entry '{key}' holds array '{}'",
                    array.name()
                )));
            }
            array.validate()?;
        }
        let SolverData { t, dt, .. } = self.solver_data;
        if !t.is_finite() {
            return Err(CheckpointError::Invalid(format!("t = {t} is not finite")));
        }
        if !dt.is_finite() || dt <= 0.0 {
            return Err(CheckpointError::Invalid(format!("dt = {dt} is not a positive number")));
        }
        Ok(())
    }

    /// Consume the record, returning the arrays in stored order.
    #[must_use]
    pub fn into_arrays(self) -> Vec<ParticleArray> {
        self.arrays.into_values().collect()
    }
}

/// Write a checkpoint to `path`.
///
/// # Errors
///
/// Returns [`CheckpointError::Encode`] or [`CheckpointError::Io`].
pub fn save_checkpoint(path: &Path, record: &CheckpointRecord) -> Result<(), CheckpointError> {
    let bytes = rmp_serde::to_vec_named(record)?;
    std::fs::write(path, bytes).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and validate a checkpoint from `path`.
///
/// # Errors
///
/// Returns [`CheckpointError`] if the file is unreadable, malformed, or
/// inconsistent.
pub fn load_checkpoint(path: &Path) -> Result<CheckpointRecord, CheckpointError> {
    let bytes = std::fs::read(path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let record: CheckpointRecord = rmp_serde::from_slice(&bytes)?;
    record.validate()?;
    Ok(record)
}

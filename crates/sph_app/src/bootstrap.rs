//! Construction of this rank's initial particle arrays.
//!
//! The strategy is chosen once, from the rank and the restart request:
//! rank 0 restarting reads the checkpoint, every other case calls the
//! factory (rank 0 for real data, others for empty placeholders).

use std::collections::HashSet;
use std::path::PathBuf;

use sph_parallel::RankContext;
use sph_particles::{
    ArrayFill, ArraySplit, CheckpointError, ParticleArray, ParticleFactory, load_checkpoint,
};
use tracing::info;

use crate::options::RestartOptions;

/// Errors from building the initial arrays. Fatal for the run.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The checkpoint is unreadable or inconsistent.
    #[error("cannot restart from {path}: {source}")]
    Restart {
        /// The checkpoint path.
        path: PathBuf,
        /// What is wrong with it.
        #[source]
        source: CheckpointError,
    },

    /// The factory failed or produced unusable arrays.
    #[error("particle factory failed on rank {rank}: {reason}")]
    Factory {
        /// This rank.
        rank: usize,
        /// What went wrong.
        reason: String,
    },
}

/// Solver progress restored from a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumeState {
    /// Simulation time.
    pub t: f64,
    /// Timestep, already multiplied by the rescale factor.
    pub dt: f64,
    /// Completed iterations.
    pub count: u64,
}

/// The arrays of this rank, grouped by kind, and restored progress if the
/// run restarted.
#[derive(Debug)]
pub struct Bootstrapped {
    /// Arrays in construction (or checkpoint) order.
    pub arrays: Vec<ParticleArray>,
    /// Indices of the static and dynamic arrays.
    pub split: ArraySplit,
    /// Progress restored from a checkpoint.
    pub resume: Option<ResumeState>,
}

/// How this rank obtains its arrays.
pub enum Bootstrap<'a> {
    /// Call the factory.
    FromFactory(&'a dyn ParticleFactory),
    /// Read a checkpoint. Only ever selected on rank 0.
    FromCheckpoint(RestartOptions),
}

impl<'a> Bootstrap<'a> {
    /// Choose the strategy for this rank.
    #[must_use]
    pub fn select(
        ctx: &RankContext,
        factory: &'a dyn ParticleFactory,
        restart: Option<&RestartOptions>,
    ) -> Self {
        match restart {
            Some(restart) if ctx.is_coordinator() => Self::FromCheckpoint(restart.clone()),
            _ => Self::FromFactory(factory),
        }
    }

    /// Build the arrays.
    ///
    /// # Errors
    ///
    /// - [`BootstrapError::Restart`] if the checkpoint cannot be used.
    /// - [`BootstrapError::Factory`] if the factory fails, returns nothing on
    ///   rank 0, returns particles on any other rank, or returns invalid or
    ///   duplicate arrays.
    pub fn build(self, ctx: &RankContext) -> Result<Bootstrapped, BootstrapError> {
        let (arrays, resume) = match self {
            Self::FromCheckpoint(restart) => {
                let (arrays, resume) = restore(&restart)?;
                (arrays, Some(resume))
            }
            Self::FromFactory(factory) => (create(factory, ctx)?, None),
        };
        let split = ArraySplit::classify(&arrays);
        info!(
            rank = ctx.rank(),
            arrays = arrays.len(),
            particles = arrays.iter().map(ParticleArray::len).sum::<usize>(),
            dynamic = split.dynamic.len(),
            fixed = split.fixed.len(),
            restarted = resume.is_some(),
            "particle arrays ready"
        );
        Ok(Bootstrapped {
            arrays,
            split,
            resume,
        })
    }
}

fn restore(restart: &RestartOptions) -> Result<(Vec<ParticleArray>, ResumeState), BootstrapError> {
    let record = load_checkpoint(&restart.path).map_err(|source| BootstrapError::Restart {
        path: restart.path.clone(),
        source,
    })?;
    let data = record.solver_data;
    let resume = ResumeState {
        t: data.t,
        dt: data.dt * restart.rescale_dt,
        count: data.count,
    };
    info!(
        path = %restart.path.display(),
        t = resume.t,
        dt = resume.dt,
        count = resume.count,
        "restarting from checkpoint"
    );
    Ok((record.into_arrays(), resume))
}

fn create(factory: &dyn ParticleFactory, ctx: &RankContext) -> Result<Vec<ParticleArray>, BootstrapError> {
    let rank = ctx.rank();
    let failure = |reason: String| BootstrapError::Factory { rank, reason };

    let fill = if ctx.is_coordinator() {
        ArrayFill::Populated
    } else {
        ArrayFill::Empty
    };
    let arrays = factory.create(fill).map_err(|e| failure(e.to_string()))?;

    if fill == ArrayFill::Populated && arrays.is_empty() {
        return Err(failure("no particle arrays were created".into()));
    }
    let mut names = HashSet::new();
    for array in &arrays {
        array.validate().map_err(|e| failure(e.to_string()))?;
        if !names.insert(array.name()) {
            return Err(failure(format!("duplicate array name '{}'", array.name())));
        }
        if fill == ArrayFill::Empty && !array.is_empty() {
            return Err(failure(format!(
                "placeholder '{}' holds {} particles",
                array.name(),
                array.len()
            )));
        }
    }
    Ok(arrays)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use sph_parallel::LocalCommunicator;
    use sph_particles::{CheckpointRecord, FactoryFailure, SolverData, save_checkpoint};

    use super::*;

    fn factory(fill: ArrayFill) -> Result<Vec<ParticleArray>, FactoryFailure> {
        let fluid = ParticleArray::new("fluid")
            .with_field("x", vec![0.0, 0.1, 0.2])?
            .with_field("m", vec![1.0; 3])?;
        let wall = ParticleArray::new_static("wall").with_field("x", vec![-0.1])?;
        Ok(match fill {
            ArrayFill::Populated => vec![fluid, wall],
            ArrayFill::Empty => vec![fluid.empty_like(), wall.empty_like()],
        })
    }

    fn rank(rank: usize, size: usize) -> RankContext {
        let comm = LocalCommunicator::group(size).remove(rank);
        RankContext::from_communicator(Arc::new(comm))
    }

    fn checkpoint(solver_data: SolverData) -> PathBuf {
        let path = std::env::temp_dir().join(format!("sph-ckpt-{}.msgpack", uuid::Uuid::new_v4()));
        let arrays = factory(ArrayFill::Populated).unwrap();
        save_checkpoint(&path, &CheckpointRecord::new(arrays, solver_data)).unwrap();
        path
    }

    #[test]
    fn test_coordinator_gets_full_arrays() {
        let ctx = RankContext::serial();
        let built = Bootstrap::select(&ctx, &factory, None).build(&ctx).unwrap();
        assert_eq!(built.arrays.len(), 2);
        assert_eq!(built.arrays[0].len(), 3);
        assert_eq!(built.split.dynamic, vec![0]);
        assert_eq!(built.split.fixed, vec![1]);
        assert!(built.resume.is_none());
    }

    #[test]
    fn test_other_ranks_get_matching_placeholders() {
        let coordinator = rank(0, 3);
        let full = Bootstrap::select(&coordinator, &factory, None)
            .build(&coordinator)
            .unwrap();
        for r in 1..3 {
            let ctx = rank(r, 3);
            let built = Bootstrap::select(&ctx, &factory, None).build(&ctx).unwrap();
            assert_eq!(built.arrays.len(), full.arrays.len());
            for (empty, populated) in built.arrays.iter().zip(&full.arrays) {
                assert!(empty.is_empty());
                assert_eq!(empty.name(), populated.name());
                assert_eq!(empty.is_static(), populated.is_static());
            }
        }
    }

    #[test]
    fn test_restart_rescales_dt_and_keeps_progress() {
        let path = checkpoint(SolverData {
            t: 0.75,
            dt: 2e-4,
            count: 3750,
        });
        let ctx = RankContext::serial();
        let restart = RestartOptions {
            path: path.clone(),
            rescale_dt: 0.5,
        };
        let built = Bootstrap::select(&ctx, &factory, Some(&restart))
            .build(&ctx)
            .unwrap();
        let resume = built.resume.unwrap();
        assert_eq!(resume.t, 0.75);
        assert_eq!(resume.dt, 2e-4 * 0.5);
        assert_eq!(resume.count, 3750);
        let names: Vec<_> = built.arrays.iter().map(ParticleArray::name).collect();
        assert_eq!(names, vec!["fluid", "wall"]);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_restart_with_unit_factor_reproduces_checkpoint() {
        let data = SolverData {
            t: 1.5,
            dt: 1e-3,
            count: 1500,
        };
        let path = checkpoint(data);
        let ctx = RankContext::serial();
        let restart = RestartOptions {
            path: path.clone(),
            rescale_dt: 1.0,
        };
        let built = Bootstrap::select(&ctx, &factory, Some(&restart))
            .build(&ctx)
            .unwrap();
        let resume = built.resume.unwrap();
        assert_eq!((resume.t, resume.dt, resume.count), (data.t, data.dt, data.count));
        assert_eq!(built.arrays, factory(ArrayFill::Populated).unwrap());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_restart_only_read_on_coordinator() {
        let ctx = rank(2, 4);
        let restart = RestartOptions {
            path: PathBuf::from("/does/not/exist.msgpack"),
            rescale_dt: 1.0,
        };
        let built = Bootstrap::select(&ctx, &factory, Some(&restart))
            .build(&ctx)
            .unwrap();
        assert!(built.resume.is_none());
        assert!(built.arrays.iter().all(ParticleArray::is_empty));
    }

    #[test]
    fn test_missing_checkpoint_is_restart_error() {
        let ctx = RankContext::serial();
        let restart = RestartOptions {
            path: PathBuf::from("/does/not/exist.msgpack"),
            rescale_dt: 1.0,
        };
        let err = Bootstrap::select(&ctx, &factory, Some(&restart))
            .build(&ctx)
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Restart { .. }));
    }

    #[test]
    fn test_factory_failures() {
        let ctx = RankContext::serial();
        let empty = |_: ArrayFill| -> Result<Vec<ParticleArray>, FactoryFailure> { Ok(Vec::new()) };
        let err = Bootstrap::select(&ctx, &empty, None).build(&ctx).unwrap_err();
        assert!(err.to_string().contains("no particle arrays"), "{err}");

        let failing =
            |_: ArrayFill| -> Result<Vec<ParticleArray>, FactoryFailure> { Err("mesh not found".into()) };
        let err = Bootstrap::select(&ctx, &failing, None).build(&ctx).unwrap_err();
        assert!(err.to_string().contains("mesh not found"), "{err}");

        let duplicate = |_: ArrayFill| -> Result<Vec<ParticleArray>, FactoryFailure> {
            Ok(vec![ParticleArray::new("fluid"), ParticleArray::new("fluid")])
        };
        let err = Bootstrap::select(&ctx, &duplicate, None).build(&ctx).unwrap_err();
        assert!(err.to_string().contains("duplicate"), "{err}");
    }

    #[test]
    fn test_populated_placeholder_is_rejected() {
        let ctx = rank(1, 2);
        let populated = |_: ArrayFill| factory(ArrayFill::Populated);
        let err = Bootstrap::select(&ctx, &populated, None).build(&ctx).unwrap_err();
        assert!(matches!(err, BootstrapError::Factory { rank: 1, .. }));
    }
}

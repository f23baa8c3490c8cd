//! # sph_app
//!
//! Start-up and main loop of a rank-distributed SPH simulation.
//!
//! This crate provides:
//!
//! - [`Options`]: the command-line surface, validated into [`RunOptions`].
//! - [`Logging`]: the run's `tracing` subscriber, with per-rank log files.
//! - [`Bootstrap`]: builds this rank's particle arrays from the factory or a
//!   checkpoint.
//! - [`bind`]: applies the options onto the mutable [`RunState`], which is
//!   also the executor of operator commands.
//! - [`Application`]: wires everything together; [`Run::run`] is the step
//!   loop.
//!
//! The start-up order on every rank is: rank context, arrays, partitioning
//! (parallel runs only), run-state binding, dispatcher and transports (rank
//! 0 only), step loop.

pub mod binding;
pub mod bootstrap;
pub mod logging;
pub mod options;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sph_control::{DispatchHandle, Dispatcher, Executor, Transport};
use sph_parallel::{
    PartitionBackend, PartitionCoordinator, PartitionError, Partitions, RankContext,
};
use sph_particles::{
    CheckpointError, CheckpointRecord, ParticleArray, ParticleFactory, SolverData,
    save_checkpoint,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

pub use binding::{RunDefaults, RunState, RunStatus, bind};
pub use bootstrap::{Bootstrap, BootstrapError, Bootstrapped, ResumeState};
pub use logging::{LogLevel, LogSettings, Logging, LoggingError};
pub use options::{ConfigurationError, Options, ParallelOutputMode, RestartOptions, RunOptions};

/// How long a paused loop sleeps between status checks when no command
/// arrives.
const PAUSE_POLL: Duration = Duration::from_millis(200);

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// An option value is out of range.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Logging could not be set up.
    #[error(transparent)]
    Logging(#[from] LoggingError),

    /// The output directory could not be created.
    #[error("cannot create output directory {path}: {source}")]
    OutputDirectory {
        /// The directory.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The initial arrays could not be built.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// Partitioning failed on this or another rank.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// A checkpoint could not be written.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Create the output directory and build the run's logging.
///
/// Must precede everything else that logs, so that the log file can live in
/// the output directory.
///
/// # Errors
///
/// Returns [`AppError::OutputDirectory`] or [`AppError::Logging`].
pub fn init_logging(options: &RunOptions, ctx: &RankContext) -> Result<Logging, AppError> {
    let dir = &options.output_directory;
    std::fs::create_dir_all(dir).map_err(|source| AppError::OutputDirectory {
        path: dir.clone(),
        source,
    })?;
    Ok(Logging::build(&options.log, ctx)?)
}

/// A simulation: its particle factory, default timing, and the optional
/// partitioning backend.
pub struct Application<'a> {
    name: String,
    factory: &'a dyn ParticleFactory,
    defaults: RunDefaults,
    dimension: usize,
    kernel_radius_scale: f64,
    partitioner: Option<&'a dyn PartitionBackend>,
}

impl<'a> Application<'a> {
    /// A two-dimensional simulation with a kernel radius scale of 2.
    #[must_use]
    pub fn new(name: impl Into<String>, factory: &'a dyn ParticleFactory, defaults: RunDefaults) -> Self {
        Self {
            name: name.into(),
            factory,
            defaults,
            dimension: 2,
            kernel_radius_scale: 2.0,
            partitioner: None,
        }
    }

    /// Spatial dimension handed to the partitioner.
    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension;
        self
    }

    /// Radius scale of the kernel, used to size ghost regions.
    #[must_use]
    pub fn with_kernel_radius_scale(mut self, scale: f64) -> Self {
        self.kernel_radius_scale = scale;
        self
    }

    /// The partitioning backend for parallel runs.
    #[must_use]
    pub fn with_partitioner(mut self, backend: &'a dyn PartitionBackend) -> Self {
        self.partitioner = Some(backend);
        self
    }

    /// Returns the application name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bring the run up to the point where the step loop can start.
    ///
    /// Collective in a parallel run. Transports are attached on rank 0
    /// only; one that fails to bind is logged and skipped.
    ///
    /// # Errors
    ///
    /// Any [`AppError`] here is fatal; in a parallel run every rank fails
    /// during partitioning if any rank does.
    pub fn setup(&self, options: &RunOptions, ctx: &RankContext, runtime: Handle) -> Result<Run, AppError> {
        info!(
            app = %self.name,
            rank = ctx.rank(),
            size = ctx.size(),
            "starting run"
        );
        let Bootstrapped {
            mut arrays,
            split,
            resume,
        } = Bootstrap::select(ctx, self.factory, options.restart.as_ref()).build(ctx)?;

        let backend = if options.partitioner_enabled {
            self.partitioner
        } else {
            None
        };
        let partitions = PartitionCoordinator::new(ctx, backend).initialize(
            self.dimension,
            &mut arrays,
            &split,
            &options.partition,
            self.kernel_radius_scale,
        )?;

        let state = Arc::new(Mutex::new(bind(options, ctx, self.defaults, resume)?));
        let executor: Arc<Mutex<dyn Executor>> = state.clone();
        let mut dispatcher = Dispatcher::new(executor, ctx.rank(), runtime);
        if ctx.is_coordinator() {
            for transport in transports(options) {
                // The dispatcher has logged the cause already.
                if dispatcher.attach(transport).is_err() {
                    warn!("continuing without that transport");
                }
            }
        }

        Ok(Run {
            ctx: ctx.clone(),
            arrays,
            partitions,
            state,
            dispatcher,
            quiet: options.quiet,
        })
    }
}

fn transports(options: &RunOptions) -> Vec<Transport> {
    let mut transports = Vec::new();
    if options.interactive {
        transports.push(Transport::console());
    }
    if let Some(address) = &options.rpc {
        transports.push(Transport::rpc(address.clone()));
    }
    if let Some(address) = &options.pool {
        transports.push(Transport::pool(address.clone()));
    }
    transports
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// Final simulation time.
    pub t: f64,
    /// Completed iterations.
    pub count: u64,
    /// `true` if an operator stopped the run before `tf`.
    pub stopped: bool,
}

/// A run that is ready to step.
pub struct Run {
    ctx: RankContext,
    arrays: Vec<ParticleArray>,
    partitions: Partitions,
    state: Arc<Mutex<RunState>>,
    dispatcher: Dispatcher,
    quiet: bool,
}

impl Run {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A snapshot of the run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.lock_state().clone()
    }

    /// This rank's arrays.
    #[must_use]
    pub fn arrays(&self) -> &[ParticleArray] {
        &self.arrays
    }

    /// Partition groups of this rank; both empty in a serial run.
    #[must_use]
    pub fn partitions(&self) -> &Partitions {
        &self.partitions
    }

    /// The dispatcher and its transports.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// A handle for sending commands from this process.
    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.dispatcher.handle()
    }

    /// Step until `t >= tf` or an operator stops the run, then shut the
    /// dispatcher down. Collective in a parallel run.
    ///
    /// Commands are applied between steps. Timing changes made on rank 0
    /// reach every rank before the next step.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Partition`] if re-balancing fails on any rank.
    pub fn run(&mut self) -> Result<RunSummary, AppError> {
        self.share_progress();
        let mut failure = None;
        loop {
            self.dispatcher.yield_to_commands();
            self.wait_while_paused();
            self.synchronize(failure.take())?;

            let mut state = self.lock_state();
            if state.is_finished() {
                break;
            }
            state.step();
            if !self.quiet && state.output_due() {
                info!(
                    rank = self.ctx.rank(),
                    count = state.count(),
                    t = state.t(),
                    dt = state.dt(),
                    "progress"
                );
            }
            drop(state);

            if let Some(group) = self.partitions.dynamic.as_mut() {
                failure = group.update(&mut self.arrays).err();
            }
        }

        self.dispatcher.shutdown();
        let state = self.lock_state();
        let summary = RunSummary {
            t: state.t(),
            count: state.count(),
            stopped: state.status() == RunStatus::Stopped,
        };
        info!(
            rank = self.ctx.rank(),
            t = summary.t,
            count = summary.count,
            stopped = summary.stopped,
            "run finished"
        );
        Ok(summary)
    }

    /// Only rank 0 restores progress from a checkpoint; everyone adopts it.
    fn share_progress(&self) {
        let Some(comm) = self.ctx.communicator() else {
            return;
        };
        let (t, count) = {
            let state = self.lock_state();
            (state.t(), state.count())
        };
        let t = f64::from_bits(comm.all_gather(t.to_bits())[0]);
        let count = comm.all_gather(count)[0];
        self.lock_state().resume_at(t, count);
    }

    fn wait_while_paused(&self) {
        let mut announced = false;
        while self.lock_state().status() == RunStatus::Paused {
            if !announced {
                info!(count = self.lock_state().count(), "run paused");
                announced = true;
            }
            self.dispatcher.wait_for_activity(PAUSE_POLL);
        }
        if announced {
            info!("run resumed");
        }
    }

    /// Adopt rank 0's timing and stop decision, and fail every rank if any
    /// rank's last re-balance failed.
    fn synchronize(&self, failure: Option<PartitionError>) -> Result<(), AppError> {
        let Some(comm) = self.ctx.communicator() else {
            return match failure {
                Some(e) => Err(e.into()),
                None => Ok(()),
            };
        };
        let (dt, tf, stopped) = {
            let state = self.lock_state();
            (state.dt(), state.tf(), state.status() == RunStatus::Stopped)
        };
        let dt = f64::from_bits(comm.all_gather(dt.to_bits())[0]);
        let tf = f64::from_bits(comm.all_gather(tf.to_bits())[0]);
        let flags = comm.all_gather(u64::from(stopped) | u64::from(failure.is_some()) << 1);

        let failed_ranks: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, flag)| *flag & 2 != 0)
            .map(|(rank, _)| rank)
            .collect();
        if let Some(e) = failure {
            return Err(e.into());
        }
        if !failed_ranks.is_empty() {
            return Err(PartitionError::Collective { failed_ranks }.into());
        }

        debug!(dt, tf, "timing synchronized");
        self.lock_state().synchronize(dt, tf, flags[0] & 1 != 0);
        Ok(())
    }

    /// Write this rank's arrays and progress to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Checkpoint`] if the file cannot be written.
    pub fn save_checkpoint(&self, path: &Path) -> Result<(), AppError> {
        let solver_data = {
            let state = self.lock_state();
            SolverData {
                t: state.t(),
                dt: state.dt(),
                count: state.count(),
            }
        };
        let record = CheckpointRecord::new(self.arrays.iter().cloned(), solver_data);
        save_checkpoint(path, &record)?;
        info!(path = %path.display(), t = solver_data.t, count = solver_data.count, "checkpoint written");
        Ok(())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("ctx", &self.ctx)
            .field("arrays", &self.arrays.len())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

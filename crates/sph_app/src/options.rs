//! Command-line options and their validation.
//!
//! [`Options`] is the raw clap surface. [`Options::resolve`] checks every
//! value and produces [`RunOptions`], the only form the rest of the
//! application consumes.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::Parser;
use sph_net::{AddressError, DEFAULT_POOL_ADDRESS, EndpointAddress};
use sph_parallel::PartitionSettings;

use crate::logging::{LogLevel, LogSettings};

/// Errors from invalid option values. Fatal before the run starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    /// A numeric option is outside its valid range.
    #[error("{name} must be {requirement}, got {value}")]
    OutOfRange {
        /// The option name.
        name: &'static str,
        /// What the value must satisfy.
        requirement: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// `--pfreq 0`.
    #[error("print frequency must be at least 1")]
    ZeroPrintFrequency,

    /// An empty output base name.
    #[error("output name must not be empty")]
    EmptyOutputName,

    /// Unknown `--parallel-output-mode`.
    #[error("unknown parallel output mode {0:?} (expected collected or distributed)")]
    ParallelOutputMode(String),

    /// A transport address does not parse.
    #[error("invalid --{option} address: {source}")]
    Address {
        /// The option carrying the address.
        option: &'static str,
        /// The parse failure.
        #[source]
        source: AddressError,
    },

    /// The output directory cannot be made absolute.
    #[error("cannot resolve output directory {path}: {source}")]
    Directory {
        /// The directory as given.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// How per-rank output is gathered in a parallel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelOutputMode {
    /// Rank 0 gathers and writes everything.
    Collected,
    /// Every rank writes its own share.
    Distributed,
}

impl FromStr for ParallelOutputMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collected" => Ok(Self::Collected),
            "distributed" => Ok(Self::Distributed),
            other => Err(ConfigurationError::ParallelOutputMode(other.to_string())),
        }
    }
}

impl fmt::Display for ParallelOutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collected => f.write_str("collected"),
            Self::Distributed => f.write_str("distributed"),
        }
    }
}

/// Raw command-line options.
#[derive(Debug, Clone, Parser)]
#[command(name = "sph_app", about = "Run an SPH simulation, serially or across MPI ranks")]
pub struct Options {
    /// Log level
    #[arg(short = 'v', long, value_enum, default_value_t = LogLevel::Warning)]
    pub loglevel: LogLevel,

    /// Log file, relative to the output directory; '' disables file logging
    #[arg(long)]
    pub logfile: Option<String>,

    /// Also print log messages to stderr
    #[arg(short = 'l', long)]
    pub print_log: bool,

    /// Final simulation time
    #[arg(long)]
    pub tf: Option<f64>,

    /// Timestep override
    #[arg(long = "timestep")]
    pub time_step: Option<f64>,

    /// Do not report progress
    #[arg(short, long)]
    pub quiet: bool,

    /// Output base name (defaults to the application name)
    #[arg(short = 'o', long)]
    pub fname: Option<String>,

    /// Print output every this many iterations
    #[arg(long, default_value_t = 100)]
    pub pfreq: u64,

    /// Write every particle property, not only the essential ones
    #[arg(short = 'd', long)]
    pub detailed_output: bool,

    /// Output directory (defaults to <fname>_output)
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Kernel selection, forwarded to the solver
    #[arg(long)]
    pub kernel: Option<String>,

    /// Integration method, forwarded to the solver
    #[arg(long)]
    pub integration: Option<String>,

    /// Restart from this checkpoint file
    #[arg(long)]
    pub restart_file: Option<PathBuf>,

    /// Multiply the restored timestep by this factor
    #[arg(long, default_value_t = 1.0)]
    pub rescale_dt: f64,

    /// Run without the partitioning backend (parallel runs then fail)
    #[arg(long)]
    pub no_partitioner: bool,

    /// Load balancing method
    #[arg(long, default_value = "RCB")]
    pub lb_method: String,

    /// Do not weight objects during load balancing
    #[arg(long)]
    pub no_object_weights: bool,

    /// Ghost layers shared with neighbouring partitions
    #[arg(long, default_value_t = 3.0)]
    pub ghost_layers: f64,

    /// Partitioner debug level
    #[arg(long, default_value = "0")]
    pub partition_debug_level: String,

    /// Recompute binning cell sizes on every partition update
    #[arg(long)]
    pub update_cell_sizes: bool,

    /// Multiplier on the kernel radius scale for ghost regions
    #[arg(long, default_value_t = 2.0)]
    pub parallel_scale_factor: f64,

    /// Parallel update mode, forwarded to the solver
    #[arg(long, default_value = "auto")]
    pub parallel_mode: String,

    /// Parallel output mode: collected or distributed
    #[arg(long, default_value = "collected")]
    pub parallel_output_mode: String,

    /// Accept commands on the console
    #[arg(long)]
    pub interactive: bool,

    /// Serve JSON-line RPC on this address
    #[arg(long, value_name = "[HOST:]PORT")]
    pub rpc: Option<String>,

    /// Serve authenticated pool sessions on this address
    #[arg(long, value_name = "[[AUTHKEY@]HOST:]PORT[+]", default_value = DEFAULT_POOL_ADDRESS)]
    pub pool: String,

    /// Disable the pool endpoint
    #[arg(long)]
    pub no_pool: bool,
}

/// Restart request.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartOptions {
    /// The checkpoint to read.
    pub path: PathBuf,
    /// Factor applied to the restored timestep.
    pub rescale_dt: f64,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Logging configuration.
    pub log: LogSettings,
    /// Final time override.
    pub final_time: Option<f64>,
    /// Timestep override.
    pub time_step: Option<f64>,
    /// Suppress progress reports.
    pub quiet: bool,
    /// Output base name.
    pub output_name: String,
    /// Iterations between outputs.
    pub print_frequency: u64,
    /// Write every particle property.
    pub detailed_output: bool,
    /// Absolute output directory.
    pub output_directory: PathBuf,
    /// Opaque kernel selection.
    pub kernel: Option<String>,
    /// Opaque integration selection.
    pub integration: Option<String>,
    /// Restart request, if any.
    pub restart: Option<RestartOptions>,
    /// Whether the partitioning backend may be used.
    pub partitioner_enabled: bool,
    /// Partitioner tuning.
    pub partition: PartitionSettings,
    /// Opaque parallel update mode.
    pub parallel_mode: String,
    /// Parallel output mode.
    pub parallel_output_mode: ParallelOutputMode,
    /// Start the console transport.
    pub interactive: bool,
    /// RPC endpoint address.
    pub rpc: Option<EndpointAddress>,
    /// Pool endpoint address.
    pub pool: Option<EndpointAddress>,
}

fn non_negative(name: &'static str, value: f64) -> Result<f64, ConfigurationError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigurationError::OutOfRange {
            name,
            requirement: "a finite non-negative number",
            value,
        })
    }
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigurationError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigurationError::OutOfRange {
            name,
            requirement: "a finite positive number",
            value,
        })
    }
}

fn address(option: &'static str, input: &str) -> Result<EndpointAddress, ConfigurationError> {
    EndpointAddress::parse(input).map_err(|source| ConfigurationError::Address { option, source })
}

impl Options {
    /// Validate the options. `app_name` names the output when `--fname` is
    /// absent. Relative directories are resolved against the current
    /// working directory.
    ///
    /// Timestep and final time are only checked here for being numbers at
    /// all; their ranges are enforced when they are bound to the run state.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigurationError`] found.
    pub fn resolve(&self, app_name: &str) -> Result<RunOptions, ConfigurationError> {
        let output_name = self.fname.clone().unwrap_or_else(|| app_name.to_string());
        if output_name.is_empty() {
            return Err(ConfigurationError::EmptyOutputName);
        }
        if self.pfreq == 0 {
            return Err(ConfigurationError::ZeroPrintFrequency);
        }

        let directory = self
            .directory
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{output_name}_output")));
        let output_directory = std::path::absolute(&directory).map_err(|source| {
            ConfigurationError::Directory {
                path: directory.clone(),
                source,
            }
        })?;

        let restart = match &self.restart_file {
            Some(path) => Some(RestartOptions {
                path: path.clone(),
                rescale_dt: positive("rescale-dt", self.rescale_dt)?,
            }),
            None => None,
        };

        let partition = PartitionSettings {
            lb_method: self.lb_method.clone(),
            obj_weights: !self.no_object_weights,
            ghost_layers: non_negative("ghost-layers", self.ghost_layers)?,
            debug_level: self.partition_debug_level.clone(),
            update_cell_sizes: self.update_cell_sizes,
            parallel_scale_factor: positive("parallel-scale-factor", self.parallel_scale_factor)?,
        };

        let log = LogSettings {
            level: self.loglevel,
            file: log_file(self.logfile.as_deref(), &output_name, &output_directory),
            echo: self.print_log,
        };

        Ok(RunOptions {
            log,
            final_time: self.tf,
            time_step: self.time_step,
            quiet: self.quiet,
            output_name,
            print_frequency: self.pfreq,
            detailed_output: self.detailed_output,
            output_directory,
            kernel: self.kernel.clone(),
            integration: self.integration.clone(),
            restart,
            partitioner_enabled: !self.no_partitioner,
            partition,
            parallel_mode: self.parallel_mode.clone(),
            parallel_output_mode: self.parallel_output_mode.parse()?,
            interactive: self.interactive,
            rpc: self.rpc.as_deref().map(|a| address("rpc", a)).transpose()?,
            pool: if self.no_pool {
                None
            } else {
                Some(address("pool", &self.pool)?)
            },
        })
    }
}

/// `None` disables file logging; an unset option means `<name>.log`.
fn log_file(option: Option<&str>, output_name: &str, directory: &Path) -> Option<PathBuf> {
    match option {
        Some("") => None,
        Some(file) => Some(directory.join(file)),
        None => Some(directory.join(format!("{output_name}.log"))),
    }
}

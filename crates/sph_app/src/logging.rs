//! Run-scoped logging.
//!
//! The subscriber is built into a [`Logging`] value that the run owns.
//! Library code only ever emits `tracing` events; the binary decides whether
//! the subscriber becomes the process-wide default.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::ValueEnum;
use sph_parallel::RankContext;
use tracing::Dispatch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Errors from setting up logging.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The log file could not be created.
    #[error("cannot create log file {path}: {source}")]
    File {
        /// The log file path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Another subscriber is already installed.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInstalled,
}

/// Verbosity of the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Everything down to debug events.
    Debug,
    /// Informational events and above.
    Info,
    /// Warnings and errors.
    Warning,
    /// Errors only.
    Error,
    /// Errors only; kept for command-line compatibility.
    Critical,
    /// No logging at all.
    None,
}

impl LogLevel {
    /// The tracing filter for this level, or `None` to disable logging.
    #[must_use]
    pub fn filter(self) -> Option<LevelFilter> {
        match self {
            Self::Debug => Some(LevelFilter::DEBUG),
            Self::Info => Some(LevelFilter::INFO),
            Self::Warning => Some(LevelFilter::WARN),
            Self::Error | Self::Critical => Some(LevelFilter::ERROR),
            Self::None => None,
        }
    }
}

/// Resolved logging options.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Verbosity.
    pub level: LogLevel,
    /// Log file before the per-rank suffix; `None` disables the file sink.
    pub file: Option<PathBuf>,
    /// Echo log lines to stderr.
    pub echo: bool,
}

/// `run.log` becomes `run_3.log` on rank 3 of a parallel run.
#[must_use]
pub fn rank_log_file(path: &Path, ctx: &RankContext) -> PathBuf {
    if !ctx.in_parallel() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{}.{}", ctx.rank(), ext.to_string_lossy()),
        None => format!("{stem}_{}", ctx.rank()),
    };
    path.with_file_name(name)
}

/// The logging setup of one run.
#[derive(Debug, Clone)]
pub struct Logging {
    dispatch: Option<Dispatch>,
    file: Option<PathBuf>,
}

impl Logging {
    /// Logging switched off.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dispatch: None,
            file: None,
        }
    }

    /// Build the subscriber for `settings` on this rank. `RUST_LOG`
    /// directives, if set, refine the configured level.
    ///
    /// The log file's directory must already exist.
    ///
    /// # Errors
    ///
    /// Returns [`LoggingError::File`] if the log file cannot be created.
    pub fn build(settings: &LogSettings, ctx: &RankContext) -> Result<Self, LoggingError> {
        let Some(level) = settings.level.filter() else {
            return Ok(Self::disabled());
        };
        let filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let file = settings.file.as_deref().map(|p| rank_log_file(p, ctx));
        let file_layer = match &file {
            Some(path) => {
                let sink = File::create(path).map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
                Some(
                    fmt::layer()
                        .with_ansi(false)
                        .with_target(true)
                        .with_writer(Mutex::new(sink)),
                )
            }
            None => None,
        };
        let echo_layer = settings
            .echo
            .then(|| fmt::layer().with_writer(io::stderr));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(echo_layer);
        Ok(Self {
            dispatch: Some(Dispatch::new(subscriber)),
            file,
        })
    }

    /// Returns the log file actually written, after the rank suffix.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Returns `true` if events are recorded anywhere.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Run `f` with this run's subscriber as the thread's default.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }

    /// Make this run's subscriber the process-wide default. Only the binary
    /// should call this.
    ///
    /// # Errors
    ///
    /// Returns [`LoggingError::AlreadyInstalled`] if a global subscriber
    /// exists.
    pub fn install(&self) -> Result<(), LoggingError> {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::set_global_default(dispatch.clone())
                .map_err(|_| LoggingError::AlreadyInstalled),
            None => Ok(()),
        }
    }
}

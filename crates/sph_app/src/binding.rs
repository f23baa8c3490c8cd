//! The simulation's mutable run state and the rules that bind resolved
//! options onto it.
//!
//! [`RunState`] is also the executor behind the control plane: operators
//! inspect and adjust it with `get`, `set`, `pause`, `cont`, `stop` and
//! `status`.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use sph_control::{CommandError, Executor};
use sph_net::Command;
use sph_parallel::RankContext;
use tracing::info;

use crate::bootstrap::ResumeState;
use crate::options::{ConfigurationError, ParallelOutputMode, RunOptions};

/// Timestep and final time a simulation uses unless the options override
/// them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunDefaults {
    /// Default timestep.
    pub dt: f64,
    /// Default final time.
    pub tf: f64,
}

/// Where the run stands: running, paused by an operator, or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Stepping.
    Running,
    /// Waiting for `cont`.
    Paused,
    /// Will not step again.
    Stopped,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

/// The mutable state of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    dt: f64,
    tf: f64,
    t: f64,
    count: u64,
    output_name: String,
    print_frequency: u64,
    detailed_output: bool,
    output_directory: PathBuf,
    parallel_output_mode: ParallelOutputMode,
    parallel_mode: String,
    kernel: Option<String>,
    integration: Option<String>,
    rank: usize,
    size: usize,
    in_parallel: bool,
    status: RunStatus,
}

fn check_time_step(dt: f64) -> Result<f64, ConfigurationError> {
    if dt.is_finite() && dt > 0.0 {
        Ok(dt)
    } else {
        Err(ConfigurationError::OutOfRange {
            name: "time step",
            requirement: "a finite positive number",
            value: dt,
        })
    }
}

fn check_final_time(tf: f64) -> Result<f64, ConfigurationError> {
    if tf.is_finite() && tf >= 0.0 {
        Ok(tf)
    } else {
        Err(ConfigurationError::OutOfRange {
            name: "final time",
            requirement: "a finite non-negative number",
            value: tf,
        })
    }
}

/// Bind resolved options onto a fresh run state.
///
/// The output name gets a `_<rank>` suffix whenever more than one process
/// takes part, so every rank writes distinct files. A restarted run resumes
/// at the checkpoint's `t` and `count` with its (rescaled) `dt`, unless
/// `--timestep` overrides it.
///
/// # Errors
///
/// Returns [`ConfigurationError::OutOfRange`] for a non-positive timestep or
/// a negative final time.
pub fn bind(
    options: &RunOptions,
    ctx: &RankContext,
    defaults: RunDefaults,
    resume: Option<ResumeState>,
) -> Result<RunState, ConfigurationError> {
    let base_dt = resume.map_or(defaults.dt, |r| r.dt);
    let dt = check_time_step(options.time_step.unwrap_or(base_dt))?;
    let tf = check_final_time(options.final_time.unwrap_or(defaults.tf))?;

    let output_name = if ctx.in_parallel() {
        format!("{}_{}", options.output_name, ctx.rank())
    } else {
        options.output_name.clone()
    };

    let state = RunState {
        dt,
        tf,
        t: resume.map_or(0.0, |r| r.t),
        count: resume.map_or(0, |r| r.count),
        output_name,
        print_frequency: options.print_frequency,
        detailed_output: options.detailed_output,
        output_directory: options.output_directory.clone(),
        parallel_output_mode: options.parallel_output_mode,
        parallel_mode: options.parallel_mode.clone(),
        kernel: options.kernel.clone(),
        integration: options.integration.clone(),
        rank: ctx.rank(),
        size: ctx.size(),
        in_parallel: ctx.in_parallel(),
        status: RunStatus::Running,
    };
    info!(
        rank = state.rank,
        dt = state.dt,
        tf = state.tf,
        t = state.t,
        output = %state.output_name,
        "run state bound"
    );
    Ok(state)
}

impl RunState {
    /// Current timestep.
    #[must_use]
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Final time.
    #[must_use]
    pub fn tf(&self) -> f64 {
        self.tf
    }

    /// Current simulation time.
    #[must_use]
    pub fn t(&self) -> f64 {
        self.t
    }

    /// Completed iterations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Output base name, with the rank suffix in parallel runs.
    #[must_use]
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    /// Iterations between progress reports.
    #[must_use]
    pub fn print_frequency(&self) -> u64 {
        self.print_frequency
    }

    /// `true` if detailed output was requested.
    #[must_use]
    pub fn detailed_output(&self) -> bool {
        self.detailed_output
    }

    /// Absolute directory for every output file.
    #[must_use]
    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    /// Whether ranks write collected or distributed output.
    #[must_use]
    pub fn parallel_output_mode(&self) -> ParallelOutputMode {
        self.parallel_output_mode
    }

    /// Parallel update mode passed through to the solver.
    #[must_use]
    pub fn parallel_mode(&self) -> &str {
        &self.parallel_mode
    }

    /// Kernel selection passed through to the solver.
    #[must_use]
    pub fn kernel(&self) -> Option<&str> {
        self.kernel.as_deref()
    }

    /// Integration selection passed through to the solver.
    #[must_use]
    pub fn integration(&self) -> Option<&str> {
        self.integration.as_deref()
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

    /// `true` iff more than one process takes part.
    #[must_use]
    pub fn in_parallel(&self) -> bool {
        self.in_parallel
    }

    /// Running, paused, or stopped.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// `true` once `t` reached `tf` or the run was stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == RunStatus::Stopped || self.t >= self.tf
    }

    /// Advance by one timestep.
    pub fn step(&mut self) {
        self.t += self.dt;
        self.count += 1;
    }

    /// Returns `true` if output is due after the current iteration.
    #[must_use]
    pub fn output_due(&self) -> bool {
        self.count % self.print_frequency == 0
    }

    /// Continue from progress restored elsewhere.
    pub fn resume_at(&mut self, t: f64, count: u64) {
        self.t = t;
        self.count = count;
    }

    /// Adopt the timing decided on the coordinating rank.
    pub fn synchronize(&mut self, dt: f64, tf: f64, stopped: bool) {
        self.dt = dt;
        self.tf = tf;
        if stopped {
            self.status = RunStatus::Stopped;
        }
    }

    /// Stop the run.
    pub fn stop(&mut self) {
        self.status = RunStatus::Stopped;
    }

    fn snapshot(&self) -> Value {
        json!({
            "t": self.t,
            "dt": self.dt,
            "tf": self.tf,
            "count": self.count,
            "status": self.status.as_str(),
            "rank": self.rank,
            "size": self.size,
        })
    }

    fn get(&self, name: &str) -> Result<Value, CommandError> {
        Ok(match name {
            "dt" => json!(self.dt),
            "tf" => json!(self.tf),
            "t" => json!(self.t),
            "count" => json!(self.count),
            "print_frequency" => json!(self.print_frequency),
            "output_name" => json!(self.output_name),
            "status" => json!(self.status.as_str()),
            other => {
                return Err(CommandError::InvalidArgument {
                    name: "name".into(),
                    reason: format!("unknown property {other:?}"),
                });
            }
        })
    }

    fn set(&mut self, name: &str, value: &Value) -> Result<Value, CommandError> {
        let invalid = |reason: String| CommandError::InvalidArgument {
            name: "value".into(),
            reason,
        };
        match name {
            "dt" => {
                let dt = value.as_f64().ok_or_else(|| invalid("dt must be a number".into()))?;
                self.dt = check_time_step(dt).map_err(|e| invalid(e.to_string()))?;
            }
            "tf" => {
                let tf = value.as_f64().ok_or_else(|| invalid("tf must be a number".into()))?;
                self.tf = check_final_time(tf).map_err(|e| invalid(e.to_string()))?;
            }
            "print_frequency" => {
                self.print_frequency = value
                    .as_u64()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| invalid("print_frequency must be a positive integer".into()))?;
            }
            other => {
                return Err(CommandError::InvalidArgument {
                    name: "name".into(),
                    reason: format!("property {other:?} cannot be set"),
                });
            }
        }
        info!(property = name, %value, "run state changed");
        self.get(name)
    }
}

fn string_arg<'c>(command: &'c Command, key: &str) -> Result<&'c str, CommandError> {
    command
        .arg(key)
        .ok_or_else(|| CommandError::MissingArgument(key.to_string()))?
        .as_str()
        .ok_or_else(|| CommandError::InvalidArgument {
            name: key.to_string(),
            reason: "expected a string".into(),
        })
}

impl Executor for RunState {
    fn execute(&mut self, command: &Command) -> Result<Value, CommandError> {
        match command.verb.as_str() {
            "get" => self.get(string_arg(command, "name")?),
            "set" => {
                let name = string_arg(command, "name")?;
                let value = command
                    .arg("value")
                    .ok_or_else(|| CommandError::MissingArgument("value".into()))?;
                self.set(name, value)
            }
            "pause" | "cont" => {
                if self.status == RunStatus::Stopped {
                    return Err(CommandError::Rejected("the run has stopped".into()));
                }
                self.status = if command.verb == "pause" {
                    RunStatus::Paused
                } else {
                    RunStatus::Running
                };
                info!(status = self.status.as_str(), "run status changed");
                Ok(self.snapshot())
            }
            "stop" => {
                self.stop();
                info!("run stopped by operator");
                Ok(self.snapshot())
            }
            "status" => Ok(self.snapshot()),
            other => Err(CommandError::UnknownVerb(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::Parser;
    use sph_parallel::LocalCommunicator;

    use super::*;
    use crate::options::Options;

    const DEFAULTS: RunDefaults = RunDefaults { dt: 1e-3, tf: 0.01 };

    fn options(args: &[&str]) -> RunOptions {
        Options::try_parse_from(std::iter::once("sph_app").chain(args.iter().copied()))
            .unwrap()
            .resolve("sim")
            .unwrap()
    }

    fn rank(rank: usize, size: usize) -> RankContext {
        let comm = LocalCommunicator::group(size).remove(rank);
        RankContext::from_communicator(Arc::new(comm))
    }

    #[test]
    fn test_serial_binding() {
        let state = bind(&options(&[]), &RankContext::serial(), DEFAULTS, None).unwrap();
        assert_eq!(state.output_name(), "sim");
        assert!(!state.in_parallel());
        assert_eq!((state.rank(), state.size()), (0, 1));
        assert_eq!(state.dt(), 1e-3);
        assert_eq!(state.tf(), 0.01);
        assert_eq!(state.t(), 0.0);
        assert_eq!(state.print_frequency(), 100);
        assert_eq!(state.parallel_output_mode(), ParallelOutputMode::Collected);
    }

    #[test]
    fn test_parallel_binding_suffixes_output_name() {
        let opts = options(&["-o", "dam", "--kernel", "WendlandQuintic"]);
        for r in 0..3 {
            let state = bind(&opts, &rank(r, 3), DEFAULTS, None).unwrap();
            assert_eq!(state.output_name(), format!("dam_{r}"));
            assert!(state.in_parallel());
            assert_eq!(state.size(), 3);
            assert_eq!(state.kernel(), Some("WendlandQuintic"));
        }
    }

    #[test]
    fn test_overrides_and_resume() {
        let resume = ResumeState {
            t: 0.5,
            dt: 5e-4,
            count: 1000,
        };
        let state = bind(&options(&["--tf", "2"]), &RankContext::serial(), DEFAULTS, Some(resume)).unwrap();
        assert_eq!(state.t(), 0.5);
        assert_eq!(state.count(), 1000);
        assert_eq!(state.dt(), 5e-4);
        assert_eq!(state.tf(), 2.0);

        let state = bind(
            &options(&["--timestep", "1e-5"]),
            &RankContext::serial(),
            DEFAULTS,
            Some(resume),
        )
        .unwrap();
        assert_eq!(state.dt(), 1e-5);
    }

    #[test]
    fn test_negative_time_step_is_configuration_error() {
        let err = bind(&options(&["--timestep=-0.1"]), &RankContext::serial(), DEFAULTS, None).unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { name: "time step", .. }));
        let err = bind(&options(&["--tf=-1"]), &RankContext::serial(), DEFAULTS, None).unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { name: "final time", .. }));
    }

    #[test]
    fn test_stepping_until_final_time() {
        let mut state = bind(&options(&["--pfreq", "4"]), &RankContext::serial(), DEFAULTS, None).unwrap();
        let mut outputs = 0;
        while !state.is_finished() {
            state.step();
            if state.output_due() {
                outputs += 1;
            }
        }
        assert!(state.count() >= 10);
        assert!(state.t() >= state.tf());
        assert_eq!(outputs, state.count() / 4);
    }

    #[test]
    fn test_get_and_set_commands() {
        let mut state = bind(&options(&[]), &RankContext::serial(), DEFAULTS, None).unwrap();
        let get = |name: &str| Command::new("get").with_arg("name", name);

        assert_eq!(state.execute(&get("dt")).unwrap(), json!(1e-3));
        assert_eq!(state.execute(&get("output_name")).unwrap(), json!("sim"));

        let set = Command::new("set").with_arg("name", "dt").with_arg("value", 2e-3);
        assert_eq!(state.execute(&set).unwrap(), json!(2e-3));
        assert_eq!(state.dt(), 2e-3);

        let set = Command::new("set").with_arg("name", "print_frequency").with_arg("value", 10);
        state.execute(&set).unwrap();
        assert_eq!(state.print_frequency(), 10);
    }

    #[test]
    fn test_bad_commands_leave_state_untouched() {
        let mut state = bind(&options(&[]), &RankContext::serial(), DEFAULTS, None).unwrap();
        let cases = [
            Command::new("set").with_arg("name", "dt").with_arg("value", -1.0),
            Command::new("set").with_arg("name", "dt").with_arg("value", "fast"),
            Command::new("set").with_arg("name", "t").with_arg("value", 3.0),
            Command::new("set").with_arg("name", "print_frequency").with_arg("value", 0),
            Command::new("set").with_arg("name", "dt"),
            Command::new("get"),
            Command::new("get").with_arg("name", "viscosity"),
            Command::new("jump"),
        ];
        for command in &cases {
            assert!(state.execute(command).is_err(), "{command:?} was accepted");
        }
        assert_eq!(state.dt(), 1e-3);
        assert_eq!(state.t(), 0.0);
        assert_eq!(state.print_frequency(), 100);
    }

    #[test]
    fn test_pause_cont_stop() {
        let mut state = bind(&options(&[]), &RankContext::serial(), DEFAULTS, None).unwrap();
        let status = state.execute(&Command::new("pause")).unwrap();
        assert_eq!(status["status"], "paused");
        assert_eq!(state.status(), RunStatus::Paused);

        state.execute(&Command::new("cont")).unwrap();
        assert_eq!(state.status(), RunStatus::Running);

        state.execute(&Command::new("stop")).unwrap();
        assert!(state.is_finished());
        assert!(matches!(
            state.execute(&Command::new("cont")),
            Err(CommandError::Rejected(_))
        ));
        assert_eq!(state.execute(&Command::new("status")).unwrap()["status"], "stopped");
    }
}

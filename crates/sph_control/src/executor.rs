//! The capability that actually applies commands to the simulation.

use serde_json::Value;
use sph_net::Command;

/// Why a command could not be applied. Never fatal: the dispatcher turns it
/// into a failure reply for the caller and keeps serving.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The verb is not understood by the executor.
    #[error("unknown command {0:?}")]
    UnknownVerb(String),

    /// A required argument was not supplied.
    #[error("missing argument {0:?}")]
    MissingArgument(String),

    /// An argument was supplied but has the wrong type or value.
    #[error("invalid argument {name:?}: {reason}")]
    InvalidArgument {
        /// The argument name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The command is understood but cannot be applied right now.
    #[error("{0}")]
    Rejected(String),
}

/// Applies commands to the simulation's run state.
///
/// The dispatcher guarantees that at most one `execute` runs at a time.
pub trait Executor: Send {
    /// Apply one command and return its result value.
    ///
    /// # Errors
    ///
    /// Returns a [`CommandError`] describing why the command was refused.
    fn execute(&mut self, command: &Command) -> Result<Value, CommandError>;
}

impl<F> Executor for F
where
    F: FnMut(&Command) -> Result<Value, CommandError> + Send,
{
    fn execute(&mut self, command: &Command) -> Result<Value, CommandError> {
        self(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_executor_keeps_state() {
        let mut calls = 0u64;
        let mut executor = |_: &Command| {
            calls += 1;
            Ok::<_, CommandError>(Value::from(calls))
        };
        executor.execute(&Command::new("a")).unwrap();
        let second = executor.execute(&Command::new("b")).unwrap();
        assert_eq!(second, Value::from(2));
    }

    #[test]
    fn test_error_messages() {
        let err = CommandError::InvalidArgument {
            name: "dt".into(),
            reason: "must be positive".into(),
        };
        assert_eq!(err.to_string(), "invalid argument \"dt\": must be positive");
        assert_eq!(
            CommandError::UnknownVerb("jump".into()).to_string(),
            "unknown command \"jump\""
        );
    }
}

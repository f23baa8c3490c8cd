//! Messages exchanged between control-plane clients and the running solver.
//!
//! A [`Command`] is opaque to the transports: its verb and arguments only
//! mean something to the executor that finally runs it. Every command gets
//! exactly one [`CommandReply`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Commands ────────────────────────────────────────────────────────────────

/// A control command addressed to the running simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// What to do (e.g. `"pause"`, `"set"`).
    pub verb: String,
    /// Named arguments. Absent in the JSON form means "no arguments".
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl Command {
    /// A command with no arguments.
    #[must_use]
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            arguments: Map::new(),
        }
    }

    /// Builder: add one argument.
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    /// Returns the argument `key`, if present.
    #[must_use]
    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.arguments.get(key)
    }
}

/// The outcome of one command.
///
/// Serialises as `{"ok": <value>}` or `{"error": "<message>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandReply {
    /// The executor accepted the command and returned a value.
    Ok(Value),
    /// The command failed; the message describes why.
    Error(String),
}

impl CommandReply {
    /// A successful reply.
    #[must_use]
    pub fn success(value: impl Into<Value>) -> Self {
        Self::Ok(value.into())
    }

    /// A failure reply.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Returns `true` for a successful reply.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Convert into a `Result`.
    ///
    /// # Errors
    ///
    /// Returns the failure message of an [`CommandReply::Error`].
    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(message) => Err(message),
        }
    }
}

// ── Pool sessions ───────────────────────────────────────────────────────────

/// Frames sent by a pool client.
///
/// A session opens with [`ClientFrame::Hello`]; every later frame is a
/// [`ClientFrame::Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Session establishment carrying the shared authentication token.
    Hello {
        /// The token the endpoint was configured with.
        authkey: String,
    },
    /// One command. `id` is echoed in the matching response.
    Request {
        /// Client-chosen correlation id.
        id: u64,
        /// The command to run.
        command: Command,
    },
}

/// Frames sent by the pool endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// The session is authenticated.
    Welcome {
        /// Identifier of the new session, for logs on both sides.
        session_id: String,
    },
    /// The session was refused; the endpoint closes the connection.
    Rejected {
        /// Why the session was refused.
        reason: String,
    },
    /// The reply to the request with the same `id`.
    Response {
        /// Correlation id copied from the request.
        id: u64,
        /// The command's outcome.
        reply: CommandReply,
    },
}

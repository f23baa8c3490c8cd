//! Transport adapters: the closed set of front-ends that feed the
//! dispatcher.

mod console;
mod endpoint;
mod pool;
mod rpc;

use std::fmt;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use sph_net::EndpointAddress;
use tokio::runtime::Handle;

pub use console::ConsoleTransport;
pub use pool::PoolTransport;
pub use rpc::RpcTransport;

use crate::dispatcher::DispatchHandle;

/// Errors from starting a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listening socket could not be set up.
    #[error("failed to bind {target}: {source}")]
    Bind {
        /// The `host:port` that was tried last.
        target: String,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Port search ran past the last port.
    #[error("no free port on {host} from {first} upwards")]
    PortsExhausted {
        /// The interface being bound.
        host: String,
        /// The first port tried.
        first: u16,
    },

    /// The console thread could not be spawned.
    #[error("failed to spawn console thread: {0}")]
    Spawn(#[source] io::Error),

    /// `start` was called twice.
    #[error("transport already started")]
    AlreadyStarted,
}

/// Which kind of front-end a transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Interactive console.
    Console,
    /// One-shot JSON-line requests.
    Rpc,
    /// Authenticated MessagePack sessions.
    Pool,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Console => f.write_str("console"),
            Self::Rpc => f.write_str("rpc"),
            Self::Pool => f.write_str("pool"),
        }
    }
}

/// Lifecycle of a transport.
///
/// The console cycles `Idle → Reading → Dispatching → Idle`; network
/// endpoints go `Idle → Bound → Serving ⇄ Dispatching`. Every transport ends
/// in `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Created or waiting between console lines.
    Idle,
    /// Listening socket acquired, accept loop not yet running.
    Bound,
    /// Accepting connections.
    Serving,
    /// Waiting for a console line.
    Reading,
    /// A command is being applied.
    Dispatching,
    /// No longer accepting input.
    Stopped,
}

/// Shared, observable transport state.
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<Mutex<TransportState>>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(TransportState::Idle)))
    }

    pub(crate) fn get(&self) -> TransportState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: TransportState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Set `state` unless the transport has already stopped.
    pub(crate) fn advance(&self, state: TransportState) {
        let mut current = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != TransportState::Stopped {
            *current = state;
        }
    }
}

/// A control-plane front-end. All variants share one
/// `start`/`stop`/`describe` capability.
#[derive(Debug)]
pub enum Transport {
    /// Interactive console.
    Console(ConsoleTransport),
    /// One-shot JSON-line request endpoint.
    Rpc(RpcTransport),
    /// Authenticated session endpoint.
    Pool(PoolTransport),
}

impl Transport {
    /// A console on the process's stdin and stdout.
    #[must_use]
    pub fn console() -> Self {
        Self::Console(ConsoleTransport::stdio())
    }

    /// A console on arbitrary streams.
    #[must_use]
    pub fn console_with<R, W>(reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::Console(ConsoleTransport::new(reader, writer))
    }

    /// An RPC endpoint. The address's authkey is not used.
    #[must_use]
    pub fn rpc(address: EndpointAddress) -> Self {
        Self::Rpc(RpcTransport::new(address))
    }

    /// A pool endpoint authenticated by the address's authkey.
    #[must_use]
    pub fn pool(address: EndpointAddress) -> Self {
        Self::Pool(PoolTransport::new(address))
    }

    /// Returns the transport kind.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Console(_) => TransportKind::Console,
            Self::Rpc(_) => TransportKind::Rpc,
            Self::Pool(_) => TransportKind::Pool,
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        match self {
            Self::Console(t) => t.state(),
            Self::Rpc(t) => t.state(),
            Self::Pool(t) => t.state(),
        }
    }

    /// Returns the bound socket address of a started network transport.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Console(_) => None,
            Self::Rpc(t) => t.bound_addr(),
            Self::Pool(t) => t.bound_addr(),
        }
    }

    /// A short human-readable description, for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Console(_) => "console".to_string(),
            Self::Rpc(t) => t.describe(),
            Self::Pool(t) => t.describe(),
        }
    }

    /// Start serving, forwarding commands to `dispatch`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transport cannot start.
    pub fn start(&mut self, dispatch: DispatchHandle, runtime: &Handle) -> Result<(), TransportError> {
        match self {
            Self::Console(t) => t.start(dispatch),
            Self::Rpc(t) => t.start(dispatch, runtime),
            Self::Pool(t) => t.start(dispatch, runtime),
        }
    }

    /// Stop accepting new input. Commands already being applied finish.
    pub fn stop(&mut self) {
        match self {
            Self::Console(t) => t.stop(),
            Self::Rpc(t) => t.stop(),
            Self::Pool(t) => t.stop(),
        }
    }
}

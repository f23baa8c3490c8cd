//! # sph_control
//!
//! Command-and-control plane for a running simulation.
//!
//! All external control funnels through one [`Dispatcher`], which forwards
//! each [`Command`](sph_net::Command) to the injected [`Executor`] one at a
//! time. Front-ends are attached as [`Transport`]s:
//!
//! - [`Transport::Console`]: interactive `verb key=value` lines on a
//!   dedicated thread.
//! - [`Transport::Rpc`]: one JSON-line request and reply per TCP connection.
//! - [`Transport::Pool`]: authenticated, long-lived MessagePack sessions,
//!   with optional port search.
//!
//! [`RpcClient`] and [`PoolClient`] speak the two network protocols.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//!
//! use serde_json::{Value, json};
//! use sph_control::{CommandError, Dispatcher, Executor, Transport};
//! use sph_net::{Command, EndpointAddress};
//!
//! struct Echo;
//!
//! impl Executor for Echo {
//!     fn execute(&mut self, command: &Command) -> Result<Value, CommandError> {
//!         Ok(json!({ "verb": command.verb }))
//!     }
//! }
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let mut dispatcher = Dispatcher::new(Arc::new(Mutex::new(Echo)), 0, runtime.handle().clone());
//! dispatcher
//!     .attach(Transport::pool(EndpointAddress::parse("sph@8800+").unwrap()))
//!     .unwrap();
//! ```

pub mod client;
pub mod dispatcher;
pub mod executor;
pub mod transport;

pub use client::{PoolClient, RpcClient};
pub use dispatcher::{DispatchError, DispatchHandle, DispatchLane, Dispatcher};
pub use executor::{CommandError, Executor};
pub use transport::{Transport, TransportError, TransportKind, TransportState};

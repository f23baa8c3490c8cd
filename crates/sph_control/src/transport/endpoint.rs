//! Listening socket and accept loop shared by the RPC and pool transports.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};

use sph_net::{EndpointAddress, NetError};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{StateCell, TransportError, TransportKind, TransportState};

/// Bind `address`, walking up from its port while ports are in use if
/// `search` is set.
pub(crate) fn bind_listener(
    address: &EndpointAddress,
    search: bool,
) -> Result<StdTcpListener, TransportError> {
    let mut port = address.port;
    loop {
        let target = address.bind_target(port);
        match StdTcpListener::bind(&target) {
            Ok(listener) => return Ok(listener),
            Err(e) if search && e.kind() == io::ErrorKind::AddrInUse => {
                debug!(port, "port in use, trying the next one");
                port = port
                    .checked_add(1)
                    .ok_or_else(|| TransportError::PortsExhausted {
                        host: address.host.clone(),
                        first: address.port,
                    })?;
            }
            Err(source) => return Err(TransportError::Bind { target, source }),
        }
    }
}

/// A network endpoint that has not started, is serving, or has stopped.
#[derive(Debug)]
pub(crate) struct Endpoint {
    kind: TransportKind,
    address: EndpointAddress,
    search: bool,
    state: StateCell,
    bound: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
}

impl Endpoint {
    pub(crate) fn new(kind: TransportKind, address: EndpointAddress, search: bool) -> Self {
        Self {
            kind,
            address,
            search,
            state: StateCell::new(),
            bound: None,
            shutdown: None,
        }
    }

    pub(crate) fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub(crate) fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound
    }

    pub(crate) fn describe(&self) -> String {
        match self.bound {
            Some(addr) => format!("{} on {addr}", self.kind),
            None => format!("{} on {}", self.kind, self.address.bind_target(self.address.port)),
        }
    }

    /// Bind and spawn the accept loop on `runtime`. Every accepted
    /// connection is handed to `handler` on its own task.
    pub(crate) fn serve<F, Fut>(&mut self, runtime: &Handle, handler: F) -> Result<(), TransportError>
    where
        F: Fn(TcpStream, watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        if self.shutdown.is_some() || self.state.get() == TransportState::Stopped {
            return Err(TransportError::AlreadyStarted);
        }

        let std_listener = bind_listener(&self.address, self.search)?;
        let bind_error = |source| TransportError::Bind {
            target: self.address.bind_target(self.address.port),
            source,
        };
        let local = std_listener.local_addr().map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener).map_err(bind_error)?
        };
        self.state.set(TransportState::Bound);
        info!(transport = %self.kind, addr = %local, "listening");

        let (tx, rx) = watch::channel(false);
        runtime.spawn(accept_loop(self.kind, listener, self.state.clone(), rx, handler));
        self.bound = Some(local);
        self.shutdown = Some(tx);
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.state.set(TransportState::Stopped);
    }
}

async fn accept_loop<F, Fut>(
    kind: TransportKind,
    listener: TcpListener,
    state: StateCell,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(TcpStream, watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), NetError>> + Send + 'static,
{
    state.advance(TransportState::Serving);
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(transport = %kind, %peer, "connection accepted");
                let connection = handler(stream, shutdown.clone());
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(transport = %kind, %peer, error = %e, "connection failed");
                    }
                });
            }
            Err(e) => warn!(transport = %kind, error = %e, "accept failed"),
        }
    }
    state.set(TransportState::Stopped);
    debug!(transport = %kind, "accept loop finished");
}

//! Worker-pool endpoint: long-lived, authenticated client sessions.
//!
//! A session starts with `Hello { authkey }`. A matching key is answered
//! with `Welcome { session_id }`, anything else with `Rejected` and the
//! connection is closed. After that every `Request { id, command }` gets one
//! `Response { id, reply }`, in order.

use std::net::SocketAddr;
use std::sync::Arc;

use sph_net::{ClientFrame, EndpointAddress, NetError, ServerFrame, decode, encode, read_frame, write_frame};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::endpoint::Endpoint;
use super::{StateCell, TransportError, TransportKind, TransportState};
use crate::dispatcher::{DispatchHandle, DispatchLane};

/// The pool endpoint.
#[derive(Debug)]
pub struct PoolTransport {
    endpoint: Endpoint,
}

impl PoolTransport {
    /// An endpoint that will bind `address` and accept sessions presenting
    /// the address's authkey.
    #[must_use]
    pub fn new(address: EndpointAddress) -> Self {
        let search = address.search;
        Self {
            endpoint: Endpoint::new(TransportKind::Pool, address, search),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        self.endpoint.state()
    }

    /// Returns the bound address once started. With port search this may
    /// differ from the configured port.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.endpoint.bound_addr()
    }

    pub(crate) fn describe(&self) -> String {
        format!("{} (authenticated)", self.endpoint.describe())
    }

    pub(crate) fn start(&mut self, dispatch: DispatchHandle, runtime: &Handle) -> Result<(), TransportError> {
        let authkey: Arc<str> = Arc::from(self.endpoint.address().authkey.as_str());
        let state = self.endpoint.state_cell();
        let lane = dispatch.lane(runtime);
        self.endpoint.serve(runtime, move |stream, shutdown| {
            serve_session(stream, Arc::clone(&authkey), lane.clone(), state.clone(), shutdown)
        })
    }

    pub(crate) fn stop(&mut self) {
        self.endpoint.stop();
    }
}

async fn send(stream: &mut TcpStream, frame: &ServerFrame) -> Result<(), NetError> {
    write_frame(stream, &encode(frame)?).await?;
    Ok(())
}

async fn serve_session(
    mut stream: TcpStream,
    authkey: Arc<str>,
    lane: DispatchLane,
    state: StateCell,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NetError> {
    let Some(bytes) = read_frame(&mut stream).await? else {
        return Ok(());
    };
    match decode::<ClientFrame>(&bytes)? {
        ClientFrame::Hello { authkey: offered } if *offered == *authkey => {}
        ClientFrame::Hello { .. } => {
            warn!("pool session rejected: bad authkey");
            let reason = "authentication failed".to_string();
            return send(&mut stream, &ServerFrame::Rejected { reason }).await;
        }
        ClientFrame::Request { .. } => {
            let reason = "expected hello".to_string();
            send(&mut stream, &ServerFrame::Rejected { reason }).await?;
            return Err(NetError::Protocol("request before hello".into()));
        }
    }

    let session_id = Uuid::new_v4().to_string();
    send(&mut stream, &ServerFrame::Welcome { session_id: session_id.clone() }).await?;
    info!(session = %session_id, "pool session opened");

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut stream) => frame?,
        };
        let Some(bytes) = frame else { break };
        match decode::<ClientFrame>(&bytes)? {
            ClientFrame::Request { id, command } => {
                debug!(session = %session_id, id, verb = %command.verb, "pool request");
                state.advance(TransportState::Dispatching);
                let reply = lane.dispatch(command).await;
                state.advance(TransportState::Serving);
                send(&mut stream, &ServerFrame::Response { id, reply }).await?;
            }
            ClientFrame::Hello { .. } => {
                return Err(NetError::Protocol("hello inside an open session".into()));
            }
        }
    }

    info!(session = %session_id, "pool session closed");
    Ok(())
}

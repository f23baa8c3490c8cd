//! Remote procedure endpoint: one JSON-line request and one JSON-line reply
//! per TCP connection.
//!
//! ```text
//! → {"verb": "set", "arguments": {"name": "dt", "value": 1e-5}}
//! ← {"ok": null}
//! ```

use std::net::SocketAddr;

use sph_net::{Command, CommandReply, EndpointAddress, NetError, decode_line, encode_line};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;

use super::endpoint::Endpoint;
use super::{StateCell, TransportError, TransportKind, TransportState};
use crate::dispatcher::{DispatchHandle, DispatchLane};

/// The RPC endpoint.
#[derive(Debug)]
pub struct RpcTransport {
    endpoint: Endpoint,
}

impl RpcTransport {
    /// An endpoint that will bind `address`, searching upwards if the
    /// address asks for it.
    #[must_use]
    pub fn new(address: EndpointAddress) -> Self {
        let search = address.search;
        Self {
            endpoint: Endpoint::new(TransportKind::Rpc, address, search),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        self.endpoint.state()
    }

    /// Returns the bound address once started.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.endpoint.bound_addr()
    }

    pub(crate) fn describe(&self) -> String {
        self.endpoint.describe()
    }

    pub(crate) fn start(&mut self, dispatch: DispatchHandle, runtime: &Handle) -> Result<(), TransportError> {
        let state = self.endpoint.state_cell();
        let lane = dispatch.lane(runtime);
        self.endpoint.serve(runtime, move |stream, _shutdown| {
            serve_request(stream, lane.clone(), state.clone())
        })
    }

    pub(crate) fn stop(&mut self) {
        self.endpoint.stop();
    }
}

async fn serve_request(
    stream: TcpStream,
    lane: DispatchLane,
    state: StateCell,
) -> Result<(), NetError> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let reply = match decode_line::<Command>(&line) {
        Ok(command) => {
            state.advance(TransportState::Dispatching);
            let reply = lane.dispatch(command).await;
            state.advance(TransportState::Serving);
            reply
        }
        Err(e) => CommandReply::failure(format!("malformed request: {e}")),
    };

    write.write_all(encode_line(&reply)?.as_bytes()).await?;
    write.shutdown().await?;
    Ok(())
}

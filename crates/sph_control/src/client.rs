//! Clients for the network transports.

use sph_net::{
    ClientFrame, Command, CommandReply, NetError, ServerFrame, decode, decode_line, encode,
    encode_line, read_frame, write_frame,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Client for the RPC endpoint. Every call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct RpcClient {
    target: String,
}

impl RpcClient {
    /// A client for the endpoint at `target` (`host:port`).
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Send one command and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`NetError`] if the connection fails or the reply is
    /// malformed. A command the solver refused is an `Ok` failure reply.
    pub async fn call(&self, command: &Command) -> Result<CommandReply, NetError> {
        let stream = TcpStream::connect(&self.target).await?;
        let (read, mut write) = stream.into_split();
        write.write_all(encode_line(command)?.as_bytes()).await?;
        write.flush().await?;

        let mut reader = BufReader::new(read);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(NetError::Closed);
        }
        decode_line(&line)
    }
}

/// Client for the pool endpoint: one authenticated session.
#[derive(Debug)]
pub struct PoolClient {
    stream: TcpStream,
    session_id: String,
    next_id: u64,
}

impl PoolClient {
    /// Connect to `target` and authenticate with `authkey`.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Rejected`] if the endpoint refuses the key, and
    /// other [`NetError`]s on connection or protocol failures.
    pub async fn connect(target: impl ToSocketAddrs, authkey: &str) -> Result<Self, NetError> {
        let mut stream = TcpStream::connect(target).await?;
        let hello = ClientFrame::Hello {
            authkey: authkey.to_string(),
        };
        write_frame(&mut stream, &encode(&hello)?).await?;

        let bytes = read_frame(&mut stream).await?.ok_or(NetError::Closed)?;
        match decode::<ServerFrame>(&bytes)? {
            ServerFrame::Welcome { session_id } => {
                debug!(session = %session_id, "pool session established");
                Ok(Self {
                    stream,
                    session_id,
                    next_id: 0,
                })
            }
            ServerFrame::Rejected { reason } => Err(NetError::Rejected(reason)),
            ServerFrame::Response { .. } => {
                Err(NetError::Protocol("response before welcome".into()))
            }
        }
    }

    /// Returns the session id assigned by the endpoint.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Send one command and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`NetError`] if the session breaks or the endpoint answers
    /// out of turn.
    pub async fn call(&mut self, command: Command) -> Result<CommandReply, NetError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = ClientFrame::Request { id, command };
        write_frame(&mut self.stream, &encode(&request)?).await?;

        let bytes = read_frame(&mut self.stream)
            .await?
            .ok_or(NetError::Closed)?;
        match decode::<ServerFrame>(&bytes)? {
            ServerFrame::Response { id: got, reply } if got == id => Ok(reply),
            other => Err(NetError::Protocol(format!(
                "expected response {id}, got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener as StdTcpListener};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{Value, json};
    use sph_net::EndpointAddress;

    use super::*;
    use crate::dispatcher::{DispatchError, Dispatcher};
    use crate::executor::{CommandError, Executor};
    use crate::transport::{Transport, TransportError, TransportState};

    /// Counts commands and records their order; `slow` sleeps while
    /// flagged as running so overlapping execution would be visible.
    #[derive(Default)]
    struct Counter {
        count: u64,
        running: bool,
        overlaps: u64,
        log: Vec<String>,
    }

    impl Executor for Counter {
        fn execute(&mut self, command: &Command) -> Result<Value, CommandError> {
            if self.running {
                self.overlaps += 1;
            }
            self.running = true;
            if command.verb == "slow" {
                std::thread::sleep(Duration::from_millis(30));
            }
            self.running = false;
            self.log.push(command.verb.clone());
            match command.verb.as_str() {
                "boom" => Err(CommandError::Rejected("boom refused".into())),
                _ => {
                    self.count += 1;
                    Ok(json!(self.count))
                }
            }
        }
    }

    fn loopback(addr: SocketAddr) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    }

    fn setup() -> (Dispatcher, Arc<Mutex<Counter>>) {
        let executor = Arc::new(Mutex::new(Counter::default()));
        let dispatcher = Dispatcher::new(executor.clone(), 0, tokio::runtime::Handle::current());
        (dispatcher, executor)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rpc_round_trip_and_failure_reply() {
        let (mut dispatcher, _executor) = setup();
        let address = EndpointAddress::parse("127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::rpc(address)).unwrap().bound_addr().unwrap();
        let client = RpcClient::new(loopback(bound).to_string());

        let reply = client.call(&Command::new("step")).await.unwrap();
        assert_eq!(reply, CommandReply::success(1));
        let reply = client.call(&Command::new("boom")).await.unwrap();
        assert_eq!(reply, CommandReply::failure("boom refused"));
        let reply = client.call(&Command::new("step")).await.unwrap();
        assert_eq!(reply, CommandReply::success(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rpc_malformed_request_gets_failure_reply() {
        let (mut dispatcher, executor) = setup();
        let address = EndpointAddress::parse("127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::rpc(address)).unwrap().bound_addr().unwrap();

        let stream = TcpStream::connect(loopback(bound)).await.unwrap();
        let (read, mut write) = stream.into_split();
        write.write_all(b"{\"no_verb\": 1}\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(read).read_line(&mut line).await.unwrap();

        let reply: CommandReply = decode_line(&line).unwrap();
        assert!(!reply.is_ok());
        assert!(executor.lock().unwrap().log.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_session_with_valid_key() {
        let (mut dispatcher, _executor) = setup();
        let address = EndpointAddress::parse("secret@127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::pool(address)).unwrap().bound_addr().unwrap();

        let mut client = PoolClient::connect(loopback(bound), "secret").await.unwrap();
        assert!(!client.session_id().is_empty());
        assert_eq!(client.call(Command::new("a")).await.unwrap(), CommandReply::success(1));
        assert_eq!(client.call(Command::new("b")).await.unwrap(), CommandReply::success(2));
        assert_eq!(
            client.call(Command::new("boom")).await.unwrap(),
            CommandReply::failure("boom refused")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_rejects_wrong_key() {
        let (mut dispatcher, executor) = setup();
        let address = EndpointAddress::parse("secret@127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::pool(address)).unwrap().bound_addr().unwrap();

        let err = PoolClient::connect(loopback(bound), "guess").await.unwrap_err();
        assert!(matches!(err, NetError::Rejected(_)), "{err}");
        assert!(executor.lock().unwrap().log.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_port_search_reports_bound_address() {
        let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let (mut dispatcher, _executor) = setup();
        let address = EndpointAddress::parse(&format!("k@127.0.0.1:{port}+")).unwrap();

        let bound = dispatcher.attach(Transport::pool(address)).unwrap().bound_addr().unwrap();
        assert!(bound.port() > port);

        let mut client = PoolClient::connect(loopback(bound), "k").await.unwrap();
        assert!(client.call(Command::new("x")).await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_error_leaves_other_transports_serving() {
        let (mut dispatcher, _executor) = setup();
        let pool = EndpointAddress::parse("k@127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::pool(pool)).unwrap().bound_addr().unwrap();

        let occupied = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let rpc = EndpointAddress::parse(&format!("127.0.0.1:{port}")).unwrap();
        let err = dispatcher.attach(Transport::rpc(rpc)).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Transport(TransportError::Bind { .. })
        ));
        assert_eq!(dispatcher.transports().len(), 1);

        let mut client = PoolClient::connect(loopback(bound), "k").await.unwrap();
        assert_eq!(client.call(Command::new("x")).await.unwrap(), CommandReply::success(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commands_from_two_transports_never_overlap() {
        let (mut dispatcher, executor) = setup();
        let rpc = EndpointAddress::parse("127.0.0.1:0").unwrap();
        let rpc_addr = dispatcher.attach(Transport::rpc(rpc)).unwrap().bound_addr().unwrap();
        let pool = EndpointAddress::parse("k@127.0.0.1:0").unwrap();
        let pool_addr = dispatcher.attach(Transport::pool(pool)).unwrap().bound_addr().unwrap();

        let rpc_side = tokio::spawn(async move {
            let client = RpcClient::new(loopback(rpc_addr).to_string());
            for _ in 0..5 {
                assert!(client.call(&Command::new("slow")).await.unwrap().is_ok());
            }
        });
        let pool_side = tokio::spawn(async move {
            let mut client = PoolClient::connect(loopback(pool_addr), "k").await.unwrap();
            for _ in 0..5 {
                assert!(client.call(Command::new("slow")).await.unwrap().is_ok());
            }
        });
        rpc_side.await.unwrap();
        pool_side.await.unwrap();

        let executor = executor.lock().unwrap();
        assert_eq!(executor.count, 10);
        assert_eq!(executor.overlaps, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rpc_calls_applied_in_arrival_order() {
        let (mut dispatcher, executor) = setup();
        let address = EndpointAddress::parse("127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::rpc(address)).unwrap().bound_addr().unwrap();
        let client = RpcClient::new(loopback(bound).to_string());

        // Keep the executor busy so every call queues behind it.
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let executor = Arc::clone(&executor);
            std::thread::spawn(move || {
                let _busy = executor.lock().unwrap();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        held_rx.recv().unwrap();

        let verbs = ["first", "second", "third", "fourth"];
        let mut calls = Vec::new();
        for verb in verbs {
            let client = client.clone();
            calls.push(tokio::spawn(async move { client.call(&Command::new(verb)).await }));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        release_tx.send(()).unwrap();
        holder.join().unwrap();

        for call in calls {
            assert!(call.await.unwrap().unwrap().is_ok());
        }
        assert_eq!(executor.lock().unwrap().log, verbs);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_closes_endpoints() {
        let (mut dispatcher, _executor) = setup();
        let address = EndpointAddress::parse("127.0.0.1:0").unwrap();
        let bound = dispatcher.attach(Transport::rpc(address)).unwrap().bound_addr().unwrap();
        let client = RpcClient::new(loopback(bound).to_string());
        assert!(client.call(&Command::new("x")).await.unwrap().is_ok());

        dispatcher.shutdown();
        assert_eq!(dispatcher.transports()[0].state(), TransportState::Stopped);

        // The accept loop drops its listener once it sees the signal.
        let mut refused = false;
        for _ in 0..100 {
            if TcpStream::connect(loopback(bound)).await.is_err() {
                refused = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(refused, "endpoint still accepting after shutdown");
    }
}

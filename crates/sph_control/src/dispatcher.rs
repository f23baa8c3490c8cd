//! The single serialisation point between transports and the simulation.
//!
//! Every transport holds a cloned [`DispatchHandle`]. A dispatch takes the
//! executor lock for exactly one command, so commands arriving concurrently
//! from different transports are applied one after the other, never
//! interleaved. The simulation's step loop shares the same lock, which makes
//! every command atomic with respect to a step.
//!
//! The executor lock is not fair, so a network transport whose connections
//! run on separate tasks submits through a [`DispatchLane`]: one queue
//! drained by one task, which applies commands in the order they arrived.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sph_net::{Command, CommandReply};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::executor::Executor;
use crate::transport::{Transport, TransportError};

/// Commands a lane buffers before submitting tasks wait.
const LANE_CAPACITY: usize = 64;

/// Errors from attaching transports.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Transports may only be attached on the coordinating rank.
    #[error("transports can only be attached on rank 0, this is rank {rank}")]
    NotCoordinator {
        /// This process's rank.
        rank: usize,
    },

    /// The dispatcher no longer accepts transports or commands.
    #[error("dispatcher is shut down")]
    ShutDown,

    /// The transport failed to start.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Default)]
struct Gate {
    closed: bool,
    in_flight: usize,
    completed: u64,
}

struct Core {
    executor: Arc<Mutex<dyn Executor>>,
    gate: Mutex<Gate>,
    settled: Condvar,
}

impl Core {
    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, command: &Command) -> CommandReply {
        {
            let mut gate = self.gate();
            if gate.closed {
                debug!(verb = %command.verb, "command refused after shutdown");
                return CommandReply::failure("dispatcher is shut down");
            }
            gate.in_flight += 1;
        }

        let reply = self.execute(command);

        let mut gate = self.gate();
        gate.in_flight -= 1;
        gate.completed += 1;
        self.settled.notify_all();
        reply
    }

    fn execute(&self, command: &Command) -> CommandReply {
        // A panicking command must not take the control plane down with it.
        let mut executor = self
            .executor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(command)));
        drop(executor);

        match outcome {
            Ok(Ok(value)) => {
                debug!(verb = %command.verb, "command applied");
                CommandReply::Ok(value)
            }
            Ok(Err(e)) => {
                warn!(verb = %command.verb, error = %e, "command failed");
                CommandReply::failure(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(verb = %command.verb, panic = message, "command panicked");
                CommandReply::failure(format!("command {:?} panicked: {message}", command.verb))
            }
        }
    }

    fn close(&self) -> bool {
        let mut gate = self.gate();
        let was_open = !gate.closed;
        gate.closed = true;
        self.settled.notify_all();
        was_open
    }

    fn wait_idle(&self) {
        let gate = self.gate();
        let _gate = self
            .settled
            .wait_while(gate, |g| g.in_flight > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    fn wait_for_activity(&self, timeout: Duration) -> bool {
        let gate = self.gate();
        let seen = gate.completed;
        let (gate, _) = self
            .settled
            .wait_timeout_while(gate, timeout, |g| g.completed == seen && !g.closed)
            .unwrap_or_else(PoisonError::into_inner);
        gate.completed != seen
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// A cloneable entry point into the dispatcher, handed to transports.
#[derive(Clone)]
pub struct DispatchHandle {
    core: Arc<Core>,
}

impl DispatchHandle {
    /// Apply one command, blocking until the executor returns.
    ///
    /// Never fails: executor errors, executor panics, and commands arriving
    /// after shutdown all come back as [`CommandReply::Error`].
    pub fn dispatch(&self, command: &Command) -> CommandReply {
        self.core.dispatch(command)
    }

    /// Open an ordered lane into this dispatcher, drained on `runtime`.
    ///
    /// The draining task ends once every clone of the lane is dropped.
    #[must_use]
    pub fn lane(&self, runtime: &Handle) -> DispatchLane {
        let (jobs, queue) = mpsc::channel(LANE_CAPACITY);
        runtime.spawn(drain_lane(self.clone(), queue));
        DispatchLane { jobs }
    }
}

type LaneJob = (Command, oneshot::Sender<CommandReply>);

async fn drain_lane(handle: DispatchHandle, mut queue: mpsc::Receiver<LaneJob>) {
    while let Some((command, reply)) = queue.recv().await {
        let dispatch = handle.clone();
        let outcome = tokio::task::spawn_blocking(move || dispatch.dispatch(&command))
            .await
            .unwrap_or_else(|e| CommandReply::failure(format!("dispatch task failed: {e}")));
        // The submitter may have gone away; the command was applied regardless.
        let _ = reply.send(outcome);
    }
}

/// An ordered queue into the dispatcher, shared by the connections of one
/// transport.
///
/// Commands are applied one at a time in submission order, whichever task
/// submitted them.
#[derive(Debug, Clone)]
pub struct DispatchLane {
    jobs: mpsc::Sender<LaneJob>,
}

impl DispatchLane {
    /// Queue one command and wait for its reply without blocking the
    /// runtime.
    pub async fn dispatch(&self, command: Command) -> CommandReply {
        let (reply, answer) = oneshot::channel();
        if self.jobs.send((command, reply)).await.is_err() {
            return CommandReply::failure("dispatch lane is closed");
        }
        answer
            .await
            .unwrap_or_else(|_| CommandReply::failure("dispatch lane dropped the command"))
    }
}

impl std::fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchHandle")
            .field("gate", &*self.core.gate())
            .finish_non_exhaustive()
    }
}

/// Owns the attached transports and forwards their commands to the
/// executor.
///
/// The executor is injected at construction; the dispatcher never touches
/// simulation state itself.
pub struct Dispatcher {
    handle: DispatchHandle,
    rank: usize,
    runtime: Handle,
    transports: Vec<Transport>,
}

impl Dispatcher {
    /// Create a dispatcher for `executor`. Network transports run their
    /// accept loops on `runtime`.
    #[must_use]
    pub fn new(executor: Arc<Mutex<dyn Executor>>, rank: usize, runtime: Handle) -> Self {
        let core = Core {
            executor,
            gate: Mutex::new(Gate::default()),
            settled: Condvar::new(),
        };
        Self {
            handle: DispatchHandle {
                core: Arc::new(core),
            },
            rank,
            runtime,
            transports: Vec::new(),
        }
    }

    /// Returns a handle that forwards into this dispatcher.
    #[must_use]
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Returns the transports attached so far.
    #[must_use]
    pub fn transports(&self) -> &[Transport] {
        &self.transports
    }

    /// Start `transport` and register it.
    ///
    /// A transport that fails to start is dropped; transports attached
    /// earlier keep serving.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotCoordinator`] on any rank but 0.
    /// - [`DispatchError::ShutDown`] after [`shutdown`](Self::shutdown).
    /// - [`DispatchError::Transport`] if the transport cannot start, e.g.
    ///   [`TransportError::Bind`] when its port is taken.
    pub fn attach(&mut self, mut transport: Transport) -> Result<&Transport, DispatchError> {
        if self.rank != 0 {
            return Err(DispatchError::NotCoordinator { rank: self.rank });
        }
        if self.handle.core.gate().closed {
            return Err(DispatchError::ShutDown);
        }

        if let Err(e) = transport.start(self.handle.clone(), &self.runtime) {
            error!(transport = %transport.describe(), error = %e, "transport failed to start");
            return Err(e.into());
        }
        info!(transport = %transport.describe(), "transport attached");

        self.transports.push(transport);
        let index = self.transports.len() - 1;
        Ok(&self.transports[index])
    }

    /// Apply one command. See [`DispatchHandle::dispatch`].
    pub fn dispatch(&self, command: &Command) -> CommandReply {
        self.handle.dispatch(command)
    }

    /// Block while commands are pending, so that a step loop that re-takes
    /// the executor lock immediately cannot starve them.
    pub fn yield_to_commands(&self) {
        self.handle.core.wait_idle();
    }

    /// Block until a command completes, shutdown begins, or `timeout`
    /// elapses. Returns `true` if a command completed.
    ///
    /// Used by a paused step loop to sleep until something may have changed.
    pub fn wait_for_activity(&self, timeout: Duration) -> bool {
        self.handle.core.wait_for_activity(timeout)
    }

    /// Stop accepting commands, stop every transport, and wait for
    /// in-flight commands to finish. Idempotent.
    pub fn shutdown(&mut self) {
        if !self.handle.core.close() {
            return;
        }
        for transport in &mut self.transports {
            transport.stop();
        }
        self.handle.core.wait_idle();
        info!(transports = self.transports.len(), "dispatcher shut down");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("rank", &self.rank)
            .field("transports", &self.transports)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use serde_json::{Value, json};

    use super::*;
    use crate::executor::CommandError;

    /// Logs the start and end of every command, sleeping in between.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Executor for Recorder {
        fn execute(&mut self, command: &Command) -> Result<Value, CommandError> {
            self.log.lock().unwrap().push(format!("start:{}", command.verb));
            thread::sleep(Duration::from_millis(20));
            self.log.lock().unwrap().push(format!("end:{}", command.verb));
            match command.verb.as_str() {
                "fail" => Err(CommandError::Rejected("not now".into())),
                "panic" => panic!("executor exploded"),
                _ => Ok(json!(command.verb)),
            }
        }
    }

    fn dispatcher(rank: usize) -> (Dispatcher, Arc<Mutex<Vec<String>>>, tokio::runtime::Runtime) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(Mutex::new(Recorder {
            log: Arc::clone(&log),
        }));
        let dispatcher = Dispatcher::new(executor, rank, runtime.handle().clone());
        (dispatcher, log, runtime)
    }

    #[test]
    fn test_concurrent_commands_are_not_interleaved() {
        let (dispatcher, log, _runtime) = dispatcher(0);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let handle = dispatcher.handle();
                thread::spawn(move || handle.dispatch(&Command::new(format!("c{i}"))))
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        for pair in log.chunks(2) {
            let verb = pair[0].strip_prefix("start:").unwrap();
            assert_eq!(pair[1], format!("end:{verb}"));
        }
    }

    #[test]
    fn test_executor_error_becomes_failure_reply() {
        let (dispatcher, _log, _runtime) = dispatcher(0);
        let reply = dispatcher.dispatch(&Command::new("fail"));
        assert_eq!(reply, CommandReply::failure("not now"));
        assert!(dispatcher.dispatch(&Command::new("ok")).is_ok());
    }

    #[test]
    fn test_executor_panic_becomes_failure_reply() {
        let (dispatcher, _log, _runtime) = dispatcher(0);
        let reply = dispatcher.dispatch(&Command::new("panic"));
        let message = reply.into_result().unwrap_err();
        assert!(message.contains("executor exploded"), "{message}");
        assert_eq!(dispatcher.dispatch(&Command::new("ok")), CommandReply::success("ok"));
    }

    #[test]
    fn test_attach_rejected_off_coordinator() {
        let (mut dispatcher, _log, _runtime) = dispatcher(2);
        let err = dispatcher.attach(Transport::console_with(
            std::io::Cursor::new(Vec::new()),
            std::io::sink(),
        ));
        assert!(matches!(err, Err(DispatchError::NotCoordinator { rank: 2 })));
        assert!(dispatcher.transports().is_empty());
    }

    #[test]
    fn test_shutdown_waits_for_in_flight_and_refuses_new_commands() {
        let (mut dispatcher, log, _runtime) = dispatcher(0);
        let handle = dispatcher.handle();
        let worker = thread::spawn(move || handle.dispatch(&Command::new("slow")));
        let deadline = Instant::now() + Duration::from_secs(5);
        while log.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        dispatcher.shutdown();
        assert_eq!(*log.lock().unwrap(), vec!["start:slow", "end:slow"]);
        assert!(worker.join().unwrap().is_ok());

        let late = dispatcher.dispatch(&Command::new("late"));
        assert_eq!(late, CommandReply::failure("dispatcher is shut down"));
        assert!(matches!(
            dispatcher.attach(Transport::console_with(
                std::io::Cursor::new(Vec::new()),
                std::io::sink(),
            )),
            Err(DispatchError::ShutDown)
        ));
    }

    #[test]
    fn test_lane_applies_commands_in_submission_order() {
        let (mut dispatcher, log, runtime) = dispatcher(0);
        let lane = dispatcher.handle().lane(runtime.handle());
        let replies = runtime.block_on(async {
            tokio::join!(
                lane.dispatch(Command::new("a")),
                lane.dispatch(Command::new("b")),
                lane.dispatch(Command::new("c")),
            )
        });
        assert_eq!(replies.0, CommandReply::success("a"));
        assert_eq!(replies.2, CommandReply::success("c"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c"]
        );

        dispatcher.shutdown();
        let late = runtime.block_on(lane.dispatch(Command::new("late")));
        assert_eq!(late, CommandReply::failure("dispatcher is shut down"));
    }

    #[test]
    fn test_wait_for_activity_sees_completed_command() {
        let (dispatcher, _log, _runtime) = dispatcher(0);
        let handle = dispatcher.handle();
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.dispatch(&Command::new("wake"))
        });
        assert!(dispatcher.wait_for_activity(Duration::from_secs(5)));
        worker.join().unwrap();
        assert!(!dispatcher.wait_for_activity(Duration::from_millis(5)));
    }
}

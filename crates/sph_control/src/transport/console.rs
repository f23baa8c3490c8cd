//! Interactive console: reads `verb key=value ...` lines on a dedicated
//! thread and prints one reply line per command.
//!
//! Values are parsed as JSON where possible (`value=1e-5`, `flag=true`,
//! `name="dt"`) and taken as plain strings otherwise (`name=dt`).

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use serde_json::Value;
use sph_net::{Command, CommandReply};
use tracing::{debug, warn};

use super::{StateCell, TransportError, TransportState};
use crate::dispatcher::DispatchHandle;

const PROMPT: &str = "sph> ";

type Streams = (Box<dyn BufRead + Send>, Box<dyn Write + Send>);

/// The console transport.
pub struct ConsoleTransport {
    streams: Option<Streams>,
    state: StateCell,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ConsoleTransport {
    /// A console on arbitrary streams.
    #[must_use]
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            streams: Some((Box::new(reader), Box::new(writer))),
            state: StateCell::new(),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// A console on stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }

    pub(crate) fn state(&self) -> TransportState {
        self.state.get()
    }

    pub(crate) fn start(&mut self, dispatch: DispatchHandle) -> Result<(), TransportError> {
        let (reader, writer) = self.streams.take().ok_or(TransportError::AlreadyStarted)?;
        let state = self.state.clone();
        let stop = Arc::clone(&self.stop);
        let thread = thread::Builder::new()
            .name("sph-console".into())
            .spawn(move || {
                if let Err(e) = run(reader, writer, &dispatch, &state, &stop) {
                    warn!(error = %e, "console failed");
                }
                state.set(TransportState::Stopped);
                debug!("console finished");
            })
            .map_err(TransportError::Spawn)?;
        self.thread = Some(thread);
        Ok(())
    }

    /// Stop after the current line. A read already blocked on input is not
    /// interrupted; the thread exits once that read returns.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.state.set(TransportState::Stopped);
        if self.thread.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for ConsoleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleTransport")
            .field("state", &self.state.get())
            .field("started", &self.streams.is_none())
            .finish_non_exhaustive()
    }
}

fn run(
    mut reader: Box<dyn BufRead + Send>,
    mut writer: Box<dyn Write + Send>,
    dispatch: &DispatchHandle,
    state: &StateCell,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut line = String::new();
    while !stop.load(Ordering::SeqCst) {
        state.advance(TransportState::Reading);
        write!(writer, "{PROMPT}")?;
        writer.flush()?;

        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let Some(parsed) = parse_line(&line) else {
            state.advance(TransportState::Idle);
            continue;
        };

        let reply = match parsed {
            Ok(command) => {
                state.advance(TransportState::Dispatching);
                dispatch.dispatch(&command)
            }
            Err(message) => CommandReply::failure(message),
        };
        match reply {
            CommandReply::Ok(value) => writeln!(writer, "ok {value}")?,
            CommandReply::Error(message) => writeln!(writer, "error: {message}")?,
        }
        state.advance(TransportState::Idle);
    }
    writer.flush()
}

/// Parse one console line. Blank lines and `#` comments yield `None`.
fn parse_line(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut words = line.split_whitespace();
    let mut command = Command::new(words.next()?);
    for word in words {
        let Some((key, raw)) = word.split_once('=') else {
            return Some(Err(format!("expected key=value, got {word:?}")));
        };
        if key.is_empty() {
            return Some(Err(format!("missing argument name in {word:?}")));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw));
        command.arguments.insert(key.to_string(), value);
    }
    Some(Ok(command))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::executor::{CommandError, Executor};
    use crate::transport::Transport;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Settings {
        dt: Value,
    }

    impl Executor for Settings {
        fn execute(&mut self, command: &Command) -> Result<Value, CommandError> {
            match command.verb.as_str() {
                "set" => {
                    self.dt = command
                        .arg("dt")
                        .cloned()
                        .ok_or_else(|| CommandError::MissingArgument("dt".into()))?;
                    Ok(Value::Null)
                }
                "get" => Ok(self.dt.clone()),
                other => Err(CommandError::UnknownVerb(other.into())),
            }
        }
    }

    #[test]
    fn test_parse_line_values() {
        let command = parse_line("set name=dt value=1e-5 flag=true label=\"ab\"\n")
            .unwrap()
            .unwrap();
        assert_eq!(command.verb, "set");
        assert_eq!(command.arg("name"), Some(&json!("dt")));
        assert_eq!(command.arg("value"), Some(&json!(1e-5)));
        assert_eq!(command.arg("flag"), Some(&json!(true)));
        assert_eq!(command.arg("label"), Some(&json!("ab")));
    }

    #[test]
    fn test_parse_line_skips_blank_and_comments() {
        assert!(parse_line("   \n").is_none());
        assert!(parse_line("# pause later").is_none());
    }

    #[test]
    fn test_parse_line_rejects_bare_words() {
        let err = parse_line("set dt").unwrap().unwrap_err();
        assert!(err.contains("key=value"), "{err}");
        assert!(parse_line("set =3").unwrap().is_err());
    }

    #[test]
    fn test_console_session() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let executor = Arc::new(Mutex::new(Settings { dt: json!(0.1) }));
        let mut dispatcher = Dispatcher::new(executor, 0, runtime.handle().clone());

        let input = Cursor::new(b"get\nset dt=0.5\n\nget\njump\nset\n".to_vec());
        let output = SharedBuf::default();
        dispatcher
            .attach(Transport::console_with(input, output.clone()))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.transports()[0].state() != TransportState::Stopped {
            assert!(Instant::now() < deadline, "console did not finish");
            thread::sleep(Duration::from_millis(5));
        }

        let text = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
        let replies: Vec<&str> = text
            .split(PROMPT)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        assert_eq!(
            replies,
            vec![
                "ok 0.1",
                "ok null",
                "ok 0.5",
                "error: unknown command \"jump\"",
                "error: missing argument \"dt\"",
            ]
        );
        assert_eq!(
            dispatcher.dispatch(&Command::new("get")),
            CommandReply::success(0.5)
        );
    }
}

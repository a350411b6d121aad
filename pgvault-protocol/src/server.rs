//! Protocol server.
//!
//! One server handles one connection. Commands dispatch to a handler table;
//! session commands multiplex several handler instances over the same
//! connection, keyed by a server-allocated id. Handler failures are reported
//! as error frames; assertion failures are re-raised after reporting so the
//! process exits non-zero.

use std::thread::sleep;
use std::time::Duration;

use pgvault_api_types::{Error, ErrorKind, Result, PGVAULT_VERSION};

use crate::frame::{
    connection_lost, read_frame_blocking, write_frame, Command, CommandType, Frame, ProtocolStream,
};
use crate::pack::Value;
use crate::{Greeting, PROTOCOL_NAME};

/// Writes data frames on behalf of a handler.
pub struct Responder<'s> {
    stream: &'s mut dyn ProtocolStream,
    data_end_sent: bool,
}

impl<'s> Responder<'s> {
    pub fn data(&mut self, payload: Value) -> Result<()> {
        write_frame(self.stream, &Frame::Data(payload))
    }

    pub fn data_end(&mut self) -> Result<()> {
        self.data_end_sent = true;
        write_frame(self.stream, &Frame::DataEnd)
    }
}

/// A stateful handler bound to one session id.
pub trait SessionHandler {
    /// Handle a `process` command. Return `false` to end the session.
    fn process(&mut self, param: &Value, out: &mut Responder) -> Result<bool>;

    /// Handle a `close` command. The default sends nothing; the server
    /// appends the end-of-data frame.
    fn close(&mut self, _param: &Value, _out: &mut Responder) -> Result<()> {
        Ok(())
    }

    /// Best-effort cleanup when the session is cancelled.
    fn cancel(&mut self) {}
}

type ProcessFn<'a> = Box<dyn FnMut(&Value, &mut Responder) -> Result<()> + 'a>;
type OpenFn<'a> = Box<dyn FnMut(&Value) -> Result<Box<dyn SessionHandler + 'a>> + 'a>;

enum HandlerKind<'a> {
    Process(ProcessFn<'a>),
    Session(OpenFn<'a>),
}

pub struct Handler<'a> {
    command: String,
    kind: HandlerKind<'a>,
}

impl<'a> Handler<'a> {
    /// A one-shot handler. The result value is sent as a single data frame.
    pub fn process<F>(command: impl Into<String>, mut func: F) -> Self
    where
        F: FnMut(&Value) -> Result<Value> + 'a,
    {
        Self {
            command: command.into(),
            kind: HandlerKind::Process(Box::new(move |param, out| {
                let result = func(param)?;
                out.data(result)
            })),
        }
    }

    /// A one-shot handler that streams its own data frames.
    pub fn process_streaming<F>(command: impl Into<String>, func: F) -> Self
    where
        F: FnMut(&Value, &mut Responder) -> Result<()> + 'a,
    {
        Self {
            command: command.into(),
            kind: HandlerKind::Process(Box::new(func)),
        }
    }

    /// A session handler factory invoked on `open`.
    pub fn session<F>(command: impl Into<String>, func: F) -> Self
    where
        F: FnMut(&Value) -> Result<Box<dyn SessionHandler + 'a>> + 'a,
    {
        Self {
            command: command.into(),
            kind: HandlerKind::Session(Box::new(func)),
        }
    }
}

struct Session<'a> {
    id: u64,
    command: String,
    handler: Box<dyn SessionHandler + 'a>,
}

pub struct ProtocolServer<'a> {
    stream: Box<dyn ProtocolStream + 'a>,
    name: String,
    retry_interval: Vec<Duration>,
    sessions: Vec<Session<'a>>,
    session_total: u64,
    keep_alive: Option<Box<dyn FnMut() + 'a>>,
}

impl<'a> ProtocolServer<'a> {
    /// Create a server and send the greeting.
    pub fn new(
        mut stream: Box<dyn ProtocolStream + 'a>,
        name: impl Into<String>,
        service: &str,
        retry_interval: Vec<Duration>,
    ) -> Result<Self> {
        let greeting = Greeting {
            name: PROTOCOL_NAME.to_string(),
            service: service.to_string(),
            version: PGVAULT_VERSION.to_string(),
        };

        let mut line = serde_json::to_vec(&greeting)?;
        line.push(b'\n');

        std::io::Write::write_all(&mut stream, &line)
            .and_then(|_| std::io::Write::flush(&mut stream))
            .map_err(|err| Error::protocol(format!("greeting write failed: {err}")))?;

        Ok(Self {
            stream,
            name: name.into(),
            retry_interval,
            sessions: Vec::new(),
            session_total: 0,
            keep_alive: None,
        })
    }

    /// Called after every completed unit of work, so the process can ping
    /// its own remote connections while it sits in a long command stream.
    pub fn set_keep_alive(&mut self, func: impl FnMut() + 'a) {
        self.keep_alive = Some(Box::new(func));
    }

    /// Run the command loop until `exit` or the peer disconnects.
    pub fn run(&mut self, handlers: &mut [Handler<'a>]) -> Result<()> {
        loop {
            let command = match read_frame_blocking(self.stream.as_mut()) {
                Ok(Frame::Command(command)) => command,
                Ok(_) => {
                    self.error_frame(&Error::protocol("expected command frame"))?;
                    continue;
                }
                Err(err) if connection_lost(&err) => {
                    log::debug!("{}: peer disconnected", self.name);
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            match command.id.as_str() {
                "exit" => return Ok(()),
                "noop" => {
                    self.responder().data_end()?;
                    continue;
                }
                _ => (),
            }

            if let Err(err) = self.dispatch(handlers, &command) {
                self.error_frame(&err)?;

                // A failed assertion means state cannot be trusted;
                // re-raise so the worker process dies visibly.
                if err.kind() == ErrorKind::Assert {
                    return Err(err);
                }
            }

            if let Some(keep_alive) = self.keep_alive.as_mut() {
                keep_alive();
            }
        }
    }

    fn responder(&mut self) -> Responder {
        Responder {
            stream: self.stream.as_mut(),
            data_end_sent: false,
        }
    }

    fn error_frame(&mut self, err: &Error) -> Result<()> {
        let stack = err
            .stack()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}: {}", self.name, err.kind().name()));

        write_frame(
            self.stream.as_mut(),
            &Frame::Error {
                code: err.code(),
                message: err.message().to_string(),
                stack,
            },
        )
    }

    fn dispatch(&mut self, handlers: &mut [Handler<'a>], command: &Command) -> Result<()> {
        let handler = handlers
            .iter_mut()
            .find(|handler| handler.command == command.id)
            .ok_or_else(|| Error::protocol(format!("unknown command '{}'", command.id)))?;

        // Retry wrapper: the first failure is authoritative; later attempts
        // only add context. Only transient kinds are retried.
        let mut retry = ErrorRetry::new();
        let mut attempt = 0;

        loop {
            let result = Self::dispatch_one(
                self.stream.as_mut(),
                &mut self.sessions,
                &mut self.session_total,
                handler,
                command,
            );

            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    let retryable = err.retryable();
                    retry.add(err);

                    if !retryable || attempt >= self.retry_interval.len() {
                        return Err(retry.into_error());
                    }

                    log::warn!(
                        "{}: command '{}' failed, retry {} of {}",
                        self.name,
                        command.id,
                        attempt + 1,
                        self.retry_interval.len()
                    );

                    sleep(self.retry_interval[attempt]);
                    attempt += 1;
                }
            }
        }
    }

    fn dispatch_one(
        stream: &mut dyn ProtocolStream,
        sessions: &mut Vec<Session<'a>>,
        session_total: &mut u64,
        handler: &mut Handler<'a>,
        command: &Command,
    ) -> Result<()> {
        let mut out = Responder {
            stream,
            data_end_sent: false,
        };

        match command.command_type {
            CommandType::NoSession => {
                let func = match &mut handler.kind {
                    HandlerKind::Process(func) => func,
                    HandlerKind::Session(_) => {
                        return Err(Error::protocol(format!(
                            "command '{}' requires a session",
                            command.id
                        )))
                    }
                };

                func(&command.param, &mut out)?;

                if !out.data_end_sent {
                    out.data_end()?;
                }
            }
            CommandType::Open => {
                let func = match &mut handler.kind {
                    HandlerKind::Session(func) => func,
                    HandlerKind::Process(_) => {
                        return Err(Error::protocol(format!(
                            "command '{}' does not support sessions",
                            command.id
                        )))
                    }
                };

                let session_handler = func(&command.param)?;

                *session_total += 1;
                sessions.push(Session {
                    id: *session_total,
                    command: command.id.clone(),
                    handler: session_handler,
                });

                out.data(Value::UInt(*session_total))?;
                out.data_end()?;
            }
            CommandType::Process | CommandType::Close | CommandType::Cancel => {
                let idx = sessions
                    .iter()
                    .position(|session| {
                        session.id == command.session_id && session.command == command.id
                    })
                    .ok_or_else(|| {
                        Error::protocol(format!(
                            "unable to find session {} for command '{}'",
                            command.session_id, command.id
                        ))
                    })?;

                // Take the session out so the handler cannot observe the
                // table in an inconsistent state.
                let mut session = sessions.remove(idx);

                match command.command_type {
                    CommandType::Process => {
                        let keep = session.handler.process(&command.param, &mut out)?;

                        if !out.data_end_sent {
                            out.data_end()?;
                        }

                        if keep {
                            sessions.push(session);
                        }
                    }
                    CommandType::Close => {
                        session.handler.close(&command.param, &mut out)?;

                        if !out.data_end_sent {
                            out.data_end()?;
                        }
                    }
                    CommandType::Cancel => {
                        session.handler.cancel();
                        out.data_end()?;
                    }
                    _ => unreachable!(),
                }
            }
        }

        Ok(())
    }
}

/// Keeps the first error of a retried command and folds later messages in.
struct ErrorRetry {
    first: Option<Error>,
    messages: Vec<String>,
}

impl ErrorRetry {
    fn new() -> Self {
        Self {
            first: None,
            messages: Vec::new(),
        }
    }

    fn add(&mut self, err: Error) {
        let message = err.message().to_string();

        if self.first.is_none() {
            self.first = Some(err);
            self.messages.push(message);
        } else if !self.messages.contains(&message) {
            self.messages.push(message);
        }
    }

    fn into_error(self) -> Error {
        let first = self.first.expect("no error recorded");

        if self.messages.len() <= 1 {
            return first;
        }

        let mut message = self.messages[0].clone();

        for cause in &self.messages[1..] {
            message.push_str("\n[retry] ");
            message.push_str(cause);
        }

        Error::new(first.kind(), message)
    }
}

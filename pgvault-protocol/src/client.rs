//! Protocol client.
//!
//! Validates the server greeting, then exchanges command frames for data
//! frames. Every read is bounded by the protocol timeout.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use pgvault_api_types::{Error, ErrorKind, Result, PGVAULT_VERSION};

use crate::frame::{
    read_frame, write_frame, Command, CommandType, Frame, ProtocolStream,
};
use crate::pack::Value;
use crate::{Greeting, PROTOCOL_NAME};

pub struct ProtocolClient {
    stream: Box<dyn ProtocolStream>,
    name: String,
    timeout: Duration,
}

impl ProtocolClient {
    /// Connect over an established stream. Reads and validates the greeting
    /// before the client is usable.
    pub fn new(
        mut stream: Box<dyn ProtocolStream>,
        name: impl Into<String>,
        service: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let greeting = read_greeting(stream.as_mut(), timeout)?;

        if greeting.name != PROTOCOL_NAME {
            return Err(Error::protocol(format!(
                "expected greeting from {PROTOCOL_NAME} but got '{}'",
                greeting.name
            )));
        }

        if greeting.service != service {
            return Err(Error::protocol(format!(
                "expected service '{service}' but got '{}'",
                greeting.service
            )));
        }

        if greeting.version != PGVAULT_VERSION {
            return Err(Error::protocol(format!(
                "expected version '{PGVAULT_VERSION}' but got '{}'",
                greeting.version
            )));
        }

        Ok(Self {
            stream,
            name: name.into(),
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a command without waiting for the result. Pair with
    /// [`ProtocolClient::result`]; the parallel executor uses the split so it
    /// can poll many clients at once.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        write_frame(self.stream.as_mut(), &Frame::Command(command.clone()))
    }

    /// Read data frames until the exchange completes, returning the last
    /// payload (or `None` when the command produced no data).
    pub fn result(&mut self) -> Result<Option<Value>> {
        let mut last = None;

        loop {
            match read_frame(self.stream.as_mut(), self.timeout)? {
                Frame::Data(payload) => last = Some(payload),
                Frame::DataEnd => return Ok(last),
                Frame::Error {
                    code,
                    message,
                    stack,
                } => return Err(remote_error(code, message, stack)),
                Frame::Command(_) => {
                    return Err(Error::protocol("unexpected command frame from server"))
                }
            }
        }
    }

    /// Execute a command and return its result payload.
    pub fn execute(&mut self, command: &Command, result_required: bool) -> Result<Option<Value>> {
        self.send(command)?;
        let result = self.result()?;

        if result_required && result.is_none() {
            return Err(Error::protocol(format!(
                "command '{}' returned no result",
                command.id
            )));
        }

        Ok(result)
    }

    /// Read a single data frame from a streaming command. `None` marks the
    /// end of the stream.
    pub fn data_get(&mut self) -> Result<Option<Value>> {
        match read_frame(self.stream.as_mut(), self.timeout)? {
            Frame::Data(payload) => Ok(Some(payload)),
            Frame::DataEnd => Ok(None),
            Frame::Error {
                code,
                message,
                stack,
            } => Err(remote_error(code, message, stack)),
            Frame::Command(_) => Err(Error::protocol("unexpected command frame from server")),
        }
    }

    /// Expect the end of a data stream.
    pub fn data_end_get(&mut self) -> Result<()> {
        match self.data_get()? {
            None => Ok(()),
            Some(_) => Err(Error::protocol("expected end of data stream")),
        }
    }

    /// Open a server-side session and return its id.
    pub fn session_open(&mut self, id: &str, param: Value) -> Result<u64> {
        let result = self
            .execute(&Command::session(id, CommandType::Open, 0, param), true)?
            .unwrap_or(Value::Null);

        result.as_u64()
    }

    pub fn session_process(&mut self, id: &str, session_id: u64, param: Value) -> Result<Option<Value>> {
        self.execute(&Command::session(id, CommandType::Process, session_id, param), false)
    }

    /// Send a session process command without draining the response, for
    /// streaming replies read via [`ProtocolClient::data_get`].
    pub fn session_process_send(&mut self, id: &str, session_id: u64, param: Value) -> Result<()> {
        self.send(&Command::session(id, CommandType::Process, session_id, param))
    }

    pub fn session_close(&mut self, id: &str, session_id: u64, param: Value) -> Result<Option<Value>> {
        self.execute(&Command::session(id, CommandType::Close, session_id, param), false)
    }

    pub fn session_cancel(&mut self, id: &str, session_id: u64) -> Result<()> {
        self.execute(
            &Command::session(id, CommandType::Cancel, session_id, Value::Null),
            false,
        )?;
        Ok(())
    }

    /// Ping the server. Used as a keep-alive so idle remotes do not time out.
    pub fn noop(&mut self) -> Result<()> {
        self.execute(&Command::new("noop", Value::Null), false)?;
        Ok(())
    }

    /// Ask the server loop to exit. The stream stays open so the caller can
    /// observe the shutdown.
    pub fn exit(&mut self) -> Result<()> {
        self.send(&Command::new("exit", Value::Null))
    }
}

impl AsRawFd for ProtocolClient {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

fn remote_error(code: u32, message: String, stack: String) -> Error {
    match ErrorKind::from_code(code) {
        Some(kind) => Error::with_stack(kind, message, stack),
        None => Error::with_stack(
            ErrorKind::Protocol,
            format!("remote error with unknown code {code}: {message}"),
            stack,
        ),
    }
}

fn read_greeting(stream: &mut dyn ProtocolStream, timeout: Duration) -> Result<Greeting> {
    // The greeting is a single short JSON line written before any frame.
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    crate::frame::wait_readable(stream, timeout)?;

    loop {
        match std::io::Read::read(stream, &mut byte) {
            Ok(0) => return Err(Error::protocol("connection closed while reading greeting")),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }

                line.push(byte[0]);

                if line.len() > 4096 {
                    return Err(Error::protocol("greeting too large"));
                }
            }
            Err(err) => return Err(Error::protocol(format!("greeting read failed: {err}"))),
        }
    }

    serde_json::from_slice(&line)
        .map_err(|err| Error::protocol(format!("invalid greeting: {err}")))
}

//! Length-prefixed frames.
//!
//! Every message after the greeting is one frame: a little-endian `u32`
//! length followed by a pack-encoded array whose first element is the frame
//! type. Frame reads are bounded by the protocol timeout; a peer that stops
//! mid-frame is reported as `Timeout` and the connection torn down by the
//! caller.

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use pgvault_api_types::{Error, ErrorKind, Result};

use crate::pack::Value;

/// Frames larger than this are rejected as framing corruption. Bulk payloads
/// stream in smaller data frames, so a huge length means garbage.
const FRAME_SIZE_MAX: u32 = 16 * 1024 * 1024 + 1024;

pub trait ProtocolStream: Read + Write + AsRawFd + Send {}

impl<T: Read + Write + AsRawFd + Send> ProtocolStream for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    NoSession,
    Open,
    Process,
    Close,
    Cancel,
}

impl CommandType {
    fn to_u64(self) -> u64 {
        match self {
            CommandType::NoSession => 0,
            CommandType::Open => 1,
            CommandType::Process => 2,
            CommandType::Close => 3,
            CommandType::Cancel => 4,
        }
    }

    fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(CommandType::NoSession),
            1 => Ok(CommandType::Open),
            2 => Ok(CommandType::Process),
            3 => Ok(CommandType::Close),
            4 => Ok(CommandType::Cancel),
            _ => Err(Error::protocol(format!("unknown command type {value}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub command_type: CommandType,
    pub session_id: u64,
    pub param: Value,
}

impl Command {
    pub fn new(id: impl Into<String>, param: Value) -> Self {
        Self {
            id: id.into(),
            command_type: CommandType::NoSession,
            session_id: 0,
            param,
        }
    }

    pub fn session(
        id: impl Into<String>,
        command_type: CommandType,
        session_id: u64,
        param: Value,
    ) -> Self {
        Self {
            id: id.into(),
            command_type,
            session_id,
            param,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Command(Command),
    Data(Value),
    DataEnd,
    Error {
        code: u32,
        message: String,
        stack: String,
    },
}

const FRAME_COMMAND: u64 = 0;
const FRAME_DATA: u64 = 1;
const FRAME_DATA_END: u64 = 2;
const FRAME_ERROR: u64 = 3;

impl Frame {
    fn to_value(&self) -> Value {
        match self {
            Frame::Command(command) => Value::Array(vec![
                Value::UInt(FRAME_COMMAND),
                Value::Str(command.id.clone()),
                Value::UInt(command.command_type.to_u64()),
                Value::UInt(command.session_id),
                command.param.clone(),
            ]),
            Frame::Data(payload) => Value::Array(vec![Value::UInt(FRAME_DATA), payload.clone()]),
            Frame::DataEnd => Value::Array(vec![Value::UInt(FRAME_DATA_END)]),
            Frame::Error {
                code,
                message,
                stack,
            } => Value::Array(vec![
                Value::UInt(FRAME_ERROR),
                Value::UInt(u64::from(*code)),
                Value::Str(message.clone()),
                Value::Str(stack.clone()),
            ]),
        }
    }

    fn from_value(value: Value) -> Result<Frame> {
        let fields = value.as_array()?;

        let field = |idx: usize| -> Result<&Value> {
            fields
                .get(idx)
                .ok_or_else(|| Error::protocol("truncated frame"))
        };

        match field(0)?.as_u64()? {
            FRAME_COMMAND => Ok(Frame::Command(Command {
                id: field(1)?.as_str()?.to_string(),
                command_type: CommandType::from_u64(field(2)?.as_u64()?)?,
                session_id: field(3)?.as_u64()?,
                param: field(4)?.clone(),
            })),
            FRAME_DATA => Ok(Frame::Data(field(1)?.clone())),
            FRAME_DATA_END => Ok(Frame::DataEnd),
            FRAME_ERROR => Ok(Frame::Error {
                code: u32::try_from(field(1)?.as_u64()?)
                    .map_err(|_| Error::protocol("error code out of range"))?,
                message: field(2)?.as_str()?.to_string(),
                stack: field(3)?.as_str()?.to_string(),
            }),
            frame_type => Err(Error::protocol(format!("unknown frame type {frame_type}"))),
        }
    }
}

pub fn write_frame(stream: &mut dyn ProtocolStream, frame: &Frame) -> Result<()> {
    let payload = frame.to_value().encode();
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::assert("frame payload exceeds u32"))?;

    let io_err = |err: std::io::Error| Error::protocol(format!("frame write failed: {err}"));

    stream.write_all(&len.to_le_bytes()).map_err(io_err)?;
    stream.write_all(&payload).map_err(io_err)?;
    stream.flush().map_err(io_err)?;

    Ok(())
}

/// Block until the stream is readable or the timeout expires.
pub fn wait_readable(stream: &dyn ProtocolStream, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut fds = [PollFd::new(stream.as_raw_fd(), PollFlags::POLLIN)];

        match poll(&mut fds, remaining.as_millis() as i32) {
            Ok(0) => {
                return Err(Error::timeout(format!(
                    "no frame received in {}ms",
                    timeout.as_millis()
                )))
            }
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => return Err(Error::protocol(format!("poll failed: {err}"))),
        }
    }
}

pub fn read_frame(stream: &mut dyn ProtocolStream, timeout: Duration) -> Result<Frame> {
    wait_readable(stream, timeout)?;
    read_frame_blocking(stream)
}

/// Read a frame with no timeout. Servers wait indefinitely for the next
/// command; the client side owns the timeout policy.
pub fn read_frame_blocking(stream: &mut dyn ProtocolStream) -> Result<Frame> {
    let io_err = |err: std::io::Error| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::protocol("connection closed unexpectedly")
        } else {
            Error::protocol(format!("frame read failed: {err}"))
        }
    };

    let mut len = [0u8; 4];
    stream.read_exact(&mut len).map_err(io_err)?;
    let len = u32::from_le_bytes(len);

    if len > FRAME_SIZE_MAX {
        return Err(Error::protocol(format!("frame length {len} out of range")));
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).map_err(io_err)?;

    Frame::from_value(Value::decode(&payload)?)
}

/// True when the error means the peer went away rather than reported a
/// failure, so the connection cannot be reused.
pub fn connection_lost(err: &Error) -> bool {
    err.kind() == ErrorKind::Protocol || err.kind() == ErrorKind::Timeout
}

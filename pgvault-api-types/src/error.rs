//! Error taxonomy shared by all pgvault crates.
//!
//! Worker errors cross the protocol as `(code, message, stack)` triples, so
//! every kind carries a stable numeric code. The numbers are part of the wire
//! format and must never be reused or reordered.

use std::fmt;

/// Classified error kinds with stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    /// Invalid option value or combination
    Config = 31,
    /// A path was required but does not exist
    PathMissing = 32,
    /// A file was required but does not exist
    FileMissing = 33,
    /// A path exists where none was expected
    PathExists = 34,
    /// A file exists where none was expected
    FileExists = 35,
    FileOpen = 36,
    FileRead = 37,
    FileWrite = 38,
    FileRemove = 39,
    FileOwner = 40,
    PathCreate = 41,
    PathRemove = 42,
    /// Restore target contained files and delta was not enabled
    PathNotEmpty = 43,
    /// Destination cluster is running
    PostmasterRunning = 44,
    /// On-disk structure violates a format invariant
    Format = 45,
    /// Recorded checksum does not match the computed one
    Checksum = 46,
    /// Decryption failed (wrong passphrase, truncation, tampering)
    Crypto = 47,
    /// Requested backup set does not exist
    BackupSetInvalid = 48,
    /// Backup metadata does not match the repository or cluster
    BackupMismatch = 49,
    TablespaceMap = 50,
    LinkMap = 51,
    DbMissing = 52,
    DbInvalid = 53,
    /// Framing, unknown command, bad session, greeting mismatch
    Protocol = 54,
    Timeout = 55,
    JsonFormat = 56,
    /// Another process already holds the lock
    LockAcquire = 57,
    /// Internal invariant violated (a bug)
    Assert = 58,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use ErrorKind::*;

        let kind = match code {
            31 => Config,
            32 => PathMissing,
            33 => FileMissing,
            34 => PathExists,
            35 => FileExists,
            36 => FileOpen,
            37 => FileRead,
            38 => FileWrite,
            39 => FileRemove,
            40 => FileOwner,
            41 => PathCreate,
            42 => PathRemove,
            43 => PathNotEmpty,
            44 => PostmasterRunning,
            45 => Format,
            46 => Checksum,
            47 => Crypto,
            48 => BackupSetInvalid,
            49 => BackupMismatch,
            50 => TablespaceMap,
            51 => LinkMap,
            52 => DbMissing,
            53 => DbInvalid,
            54 => Protocol,
            55 => Timeout,
            56 => JsonFormat,
            57 => LockAcquire,
            58 => Assert,
            _ => return None,
        };

        Some(kind)
    }

    /// May an operation that failed with this kind be retried?
    ///
    /// Only transport-level failures qualify. Data corruption, bad
    /// configuration and internal bugs will not get better by trying again.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::Protocol | ErrorKind::Timeout)
    }

    pub fn name(self) -> &'static str {
        use ErrorKind::*;

        match self {
            Config => "ConfigError",
            PathMissing => "PathMissingError",
            FileMissing => "FileMissingError",
            PathExists => "PathExistsError",
            FileExists => "FileExistsError",
            FileOpen => "FileOpenError",
            FileRead => "FileReadError",
            FileWrite => "FileWriteError",
            FileRemove => "FileRemoveError",
            FileOwner => "FileOwnerError",
            PathCreate => "PathCreateError",
            PathRemove => "PathRemoveError",
            PathNotEmpty => "PathNotEmptyError",
            PostmasterRunning => "PostmasterRunningError",
            Format => "FormatError",
            Checksum => "ChecksumError",
            Crypto => "CryptoError",
            BackupSetInvalid => "BackupSetInvalidError",
            BackupMismatch => "BackupMismatchError",
            TablespaceMap => "TablespaceMapError",
            LinkMap => "LinkMapError",
            DbMissing => "DbMissingError",
            DbInvalid => "DbInvalidError",
            Protocol => "ProtocolError",
            Timeout => "TimeoutError",
            JsonFormat => "JsonFormatError",
            LockAcquire => "LockAcquireError",
            Assert => "AssertError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error with a classified kind and, when it crossed the protocol, the
/// stack text captured on the remote side.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    stack: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(kind: ErrorKind, message: impl Into<String>, stack: String) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: Some(stack),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.stack.as_deref()
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, message)
    }

    pub fn checksum(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Checksum, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn assert(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Assert, message)
    }

    /// Classify an I/O failure for a given operation kind, preserving the
    /// missing-entry case so callers can match on it.
    pub fn from_io(err: std::io::Error, op: ErrorKind, what: &str) -> Self {
        let kind = if err.kind() == std::io::ErrorKind::NotFound {
            match op {
                ErrorKind::PathCreate | ErrorKind::PathRemove => ErrorKind::PathMissing,
                _ => ErrorKind::FileMissing,
            }
        } else {
            op
        };

        Self::new(kind, format!("{what}: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::JsonFormat, err.to_string())
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Self::new(ErrorKind::Crypto, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_round_trip() {
        for code in 0..100 {
            if let Some(kind) = ErrorKind::from_code(code) {
                assert_eq!(kind.code(), code);
            }
        }

        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(46), Some(ErrorKind::Checksum));
    }

    #[test]
    fn retry_classification() {
        assert!(ErrorKind::Protocol.retryable());
        assert!(ErrorKind::Timeout.retryable());
        assert!(!ErrorKind::Checksum.retryable());
        assert!(!ErrorKind::Format.retryable());
        assert!(!ErrorKind::Config.retryable());
        assert!(!ErrorKind::Assert.retryable());
    }

    #[test]
    fn io_not_found_maps_to_missing() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = Error::from_io(err, ErrorKind::FileOpen, "open 'x'");
        assert_eq!(err.kind(), ErrorKind::FileMissing);

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        let err = Error::from_io(err, ErrorKind::FileOpen, "open 'x'");
        assert_eq!(err.kind(), ErrorKind::FileOpen);
    }
}

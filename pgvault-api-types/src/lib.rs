//! Shared types used across the pgvault crates.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

mod error;

pub use error::{Error, ErrorKind, Result};

/// Current repository format. Anything else on disk is rejected.
pub const REPOSITORY_FORMAT: u32 = 5;

/// Version string recorded in info files and the protocol greeting.
pub const PGVAULT_VERSION: &str = env!("CARGO_PKG_VERSION");

static STANZA_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[-_A-Za-z0-9]+$").unwrap());

/// A stanza names the pairing of one cluster with one repository. The name is
/// used verbatim in repository and lock paths, so the character set is
/// restricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StanzaName(String);

impl StanzaName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();

        if !STANZA_NAME_REGEX.is_match(&name) {
            return Err(Error::config(format!(
                "'{name}' is not a valid stanza name"
            )));
        }

        Ok(StanzaName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StanzaName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StanzaName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for StanzaName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<StanzaName> for String {
    fn from(name: StanzaName) -> String {
        name.0
    }
}

/// Backup type. A diff is always based on a full; an incr may be based on
/// any prior backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }

    /// May a backup of this type depend on a prior backup of `prior`?
    pub fn can_follow(self, prior: BackupType) -> bool {
        match self {
            BackupType::Full => false,
            BackupType::Diff => prior == BackupType::Full,
            BackupType::Incr => true,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => Err(Error::config(format!("invalid backup type '{s}'"))),
        }
    }
}

/// Compression applied to repository files. The extension is appended to the
/// stored name so readers can pick the codec without metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressType {
    None,
    Gz,
    Bz2,
    Lz4,
    Zst,
}

impl CompressType {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressType::None => "none",
            CompressType::Gz => "gz",
            CompressType::Bz2 => "bz2",
            CompressType::Lz4 => "lz4",
            CompressType::Zst => "zst",
        }
    }

    /// Extension including the leading dot, empty for no compression.
    pub fn extension(self) -> &'static str {
        match self {
            CompressType::None => "",
            CompressType::Gz => ".gz",
            CompressType::Bz2 => ".bz2",
            CompressType::Lz4 => ".lz4",
            CompressType::Zst => ".zst",
        }
    }

    /// Detect the compression type from a file name and return it along with
    /// the name stripped of the extension.
    pub fn from_name(name: &str) -> (&str, CompressType) {
        for compress_type in [
            CompressType::Gz,
            CompressType::Bz2,
            CompressType::Lz4,
            CompressType::Zst,
        ] {
            if let Some(base) = name.strip_suffix(compress_type.extension()) {
                return (base, compress_type);
            }
        }

        (name, CompressType::None)
    }
}

impl fmt::Display for CompressType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressType::None),
            "gz" => Ok(CompressType::Gz),
            "bz2" => Ok(CompressType::Bz2),
            "lz4" => Ok(CompressType::Lz4),
            "zst" => Ok(CompressType::Zst),
            _ => Err(Error::config(format!("invalid compress type '{s}'"))),
        }
    }
}

/// Repository encryption. Files are wrapped in the standard OpenSSL salted
/// envelope, so no extension is needed to recognize them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherType {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
}

impl CipherType {
    pub fn as_str(self) -> &'static str {
        match self {
            CipherType::None => "none",
            CipherType::Aes256Cbc => "aes-256-cbc",
        }
    }
}

impl fmt::Display for CipherType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CipherType::None),
            "aes-256-cbc" => Ok(CipherType::Aes256Cbc),
            _ => Err(Error::config(format!("invalid cipher type '{s}'"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stanza_name_validation() {
        assert!(StanzaName::new("demo").is_ok());
        assert!(StanzaName::new("demo-1_A").is_ok());
        assert!(StanzaName::new("").is_err());
        assert!(StanzaName::new("bad name").is_err());
        assert!(StanzaName::new("bad/name").is_err());
    }

    #[test]
    fn backup_type_composition() {
        assert!(BackupType::Diff.can_follow(BackupType::Full));
        assert!(!BackupType::Diff.can_follow(BackupType::Diff));
        assert!(BackupType::Incr.can_follow(BackupType::Full));
        assert!(BackupType::Incr.can_follow(BackupType::Diff));
        assert!(BackupType::Incr.can_follow(BackupType::Incr));
        assert!(!BackupType::Full.can_follow(BackupType::Full));
    }

    #[test]
    fn compress_extension_round_trip() {
        assert_eq!(
            CompressType::from_name("000000010000000000000001-abcd.gz"),
            ("000000010000000000000001-abcd", CompressType::Gz)
        );
        assert_eq!(CompressType::from_name("plain"), ("plain", CompressType::None));
        assert_eq!(CompressType::from_name("x.zst"), ("x", CompressType::Zst));
    }
}

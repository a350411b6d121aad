//! Cluster control file.
//!
//! Only the version-stable prefix of `pg_control` is parsed here: the
//! system identifier and the control/catalog version numbers. Fields whose
//! offsets move between major versions (checksum flag, WAL segment size)
//! come from the cluster interface instead.

use pgvault_api_types::{Error, ErrorKind, Result};
use pgvault_storage::{ReadOptions, Storage};

pub const PG_CONTROL_PATH: &str = "global/pg_control";
pub const PG_VERSION_FILE: &str = "PG_VERSION";

/// Minimum bytes the stable prefix needs.
const PG_CONTROL_PREFIX_SIZE: usize = 16;

/// `pg_control` is always written as a single 8 KiB sector.
pub const PG_CONTROL_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgControl {
    pub system_id: u64,
    pub control_version: u32,
    pub catalog_version: u32,
}

impl PgControl {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PG_CONTROL_PREFIX_SIZE {
            return Err(Error::format(format!(
                "pg_control is only {} bytes",
                data.len()
            )));
        }

        let control = Self {
            system_id: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            control_version: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            catalog_version: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        };

        if control.system_id == 0 || control.control_version == 0 {
            return Err(Error::format("pg_control content is not valid"));
        }

        Ok(control)
    }

    /// Load from a cluster data directory.
    pub fn load(pg_storage: &Storage) -> Result<Self> {
        let data = pg_storage.get(PG_CONTROL_PATH)?.ok_or_else(|| {
            Error::new(
                ErrorKind::FileMissing,
                format!(
                    "'{}' does not exist\nHINT: is this a PostgreSQL data directory?",
                    pg_storage.path(PG_CONTROL_PATH)
                ),
            )
        })?;

        Self::parse(&data)
    }

    /// Serialize a control file image, for stanza tests and fixtures.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; PG_CONTROL_SIZE];
        data[0..8].copy_from_slice(&self.system_id.to_le_bytes());
        data[8..12].copy_from_slice(&self.control_version.to_le_bytes());
        data[12..16].copy_from_slice(&self.catalog_version.to_le_bytes());
        data
    }
}

/// Major version string from the `PG_VERSION` file.
pub fn pg_version_load(pg_storage: &Storage) -> Result<String> {
    let mut read = pg_storage
        .new_read(PG_VERSION_FILE, ReadOptions::default().ignore_missing(true))?
        .ok_or_else(|| {
            Error::new(
                ErrorKind::FileMissing,
                format!(
                    "'{}' does not exist\nHINT: is this a PostgreSQL data directory?",
                    pg_storage.path(PG_VERSION_FILE)
                ),
            )
        })?;

    let text = String::from_utf8(read.read_all()?)
        .map_err(|_| Error::format("PG_VERSION is not valid utf-8"))?;
    let version = text.trim().to_string();

    if version.is_empty() || !version.bytes().all(|byte| byte.is_ascii_digit() || byte == b'.') {
        return Err(Error::format(format!("invalid PG_VERSION '{version}'")));
    }

    Ok(version)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TempPath;

    #[test]
    fn control_round_trip() {
        let control = PgControl {
            system_id: 6_569_239_123_849_665_679,
            control_version: 1300,
            catalog_version: 202_209_061,
        };

        let parsed = PgControl::parse(&control.to_bytes()).unwrap();
        assert_eq!(parsed, control);
    }

    #[test]
    fn short_or_zero_control_is_invalid() {
        assert!(PgControl::parse(&[0u8; 8]).is_err());
        assert!(PgControl::parse(&[0u8; 8192]).is_err());
    }

    #[test]
    fn version_file() {
        let tmp = TempPath::new("pg-version");
        let storage = Storage::posix(tmp.str());

        storage.put(PG_VERSION_FILE, b"15\n").unwrap();
        assert_eq!(pg_version_load(&storage).unwrap(), "15");

        storage.put(PG_VERSION_FILE, b"not a version").unwrap();
        assert!(pg_version_load(&storage).is_err());
    }

    #[test]
    fn missing_control_names_the_path() {
        let tmp = TempPath::new("pg-control-missing");
        let storage = Storage::posix(tmp.str());

        let err = PgControl::load(&storage).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileMissing);
        assert!(err.message().contains("pg_control"));
    }
}

//! Cluster interface.
//!
//! The engine talks to PostgreSQL through the [`DbSource`] trait: identity,
//! backup start and backup stop. The SQL client lives outside this crate;
//! [`OfflineDb`] implements the trait from on-disk state alone for backups
//! of a stopped cluster and for tests.

use pgvault_api_types::{Error, ErrorKind, Result};
use pgvault_repo::PgHistoryEntry;
use pgvault_storage::Storage;

pub mod control;

pub use control::{pg_version_load, PgControl, PG_CONTROL_PATH, PG_VERSION_FILE};

/// Everything the engine needs to know about the running cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct PgIdentity {
    pub version: String,
    pub system_id: u64,
    pub control_version: u32,
    pub catalog_version: u32,
    pub checksum_enabled: bool,
    pub wal_segment_size: u64,
}

impl PgIdentity {
    /// The history entry this identity would record at stanza create time.
    pub fn history_entry(&self, id: u32) -> PgHistoryEntry {
        PgHistoryEntry {
            id,
            version: self.version.clone(),
            system_id: self.system_id,
            catalog_version: self.catalog_version,
            control_version: self.control_version,
        }
    }

    /// Does this identity match a recorded history entry?
    pub fn matches(&self, entry: &PgHistoryEntry) -> bool {
        self.version == entry.version && self.system_id == entry.system_id
    }
}

/// Result of backup start or stop.
#[derive(Debug, Clone)]
pub struct BackupPosition {
    pub lsn: String,
    pub wal_segment: String,
}

/// One database in the cluster, recorded in the manifest for selective
/// restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInfo {
    pub name: String,
    pub oid: u32,
    pub last_system_oid: u32,
}

/// Oids at or below this belong to built-in databases and templates.
pub const DB_SYSTEM_OID_MAX: u32 = 16_383;

pub trait DbSource {
    fn identity(&mut self) -> Result<PgIdentity>;

    /// Begin an online backup; the returned position is the replay start.
    fn backup_start(&mut self, label: &str) -> Result<BackupPosition>;

    /// End the online backup; the returned position is the replay stop.
    fn backup_stop(&mut self) -> Result<BackupPosition>;

    /// Databases in the cluster. Without a connection the names are not
    /// knowable, so implementations may fall back to oids.
    fn db_list(&mut self) -> Result<Vec<DbInfo>> {
        Ok(Vec::new())
    }
}

/// Identity from on-disk state, for offline backups. Start and stop are
/// meaningless without a running cluster and fail loudly.
pub struct OfflineDb {
    pg_storage: Storage,
    checksum_enabled: bool,
    wal_segment_size: u64,
}

impl OfflineDb {
    pub fn new(pg_storage: Storage) -> Self {
        Self {
            pg_storage,
            checksum_enabled: true,
            wal_segment_size: pgvault_repo::WAL_SEGMENT_SIZE_DEFAULT,
        }
    }

    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.wal_segment_size = size;
        self
    }

    pub fn checksums(mut self, enabled: bool) -> Self {
        self.checksum_enabled = enabled;
        self
    }
}

impl DbSource for OfflineDb {
    fn identity(&mut self) -> Result<PgIdentity> {
        let control = PgControl::load(&self.pg_storage)?;
        let version = pg_version_load(&self.pg_storage)?;

        Ok(PgIdentity {
            version,
            system_id: control.system_id,
            control_version: control.control_version,
            catalog_version: control.catalog_version,
            checksum_enabled: self.checksum_enabled,
            wal_segment_size: self.wal_segment_size,
        })
    }

    fn backup_start(&mut self, _label: &str) -> Result<BackupPosition> {
        Err(Error::new(
            ErrorKind::Config,
            "backup start requires a running cluster\n\
             HINT: use an offline backup when the cluster is stopped",
        ))
    }

    fn backup_stop(&mut self) -> Result<BackupPosition> {
        Err(Error::new(
            ErrorKind::Config,
            "backup stop requires a running cluster",
        ))
    }

    /// Database oids from the `base` directory; names are unknown offline.
    fn db_list(&mut self) -> Result<Vec<DbInfo>> {
        let mut list = Vec::new();

        for entry in self
            .pg_storage
            .list_opt("base", pgvault_storage::InfoLevel::Type)?
        {
            if let Ok(oid) = entry.name.parse::<u32>() {
                list.push(DbInfo {
                    name: entry.name,
                    oid,
                    last_system_oid: DB_SYSTEM_OID_MAX,
                });
            }
        }

        Ok(list)
    }
}

/// A cluster is considered live when its postmaster pid file exists.
pub fn postmaster_running(pg_storage: &Storage) -> Result<bool> {
    pg_storage.exists("postmaster.pid")
}

/// Tablespace directory entries under `pg_tblspc` are named by oid.
pub fn parse_tablespace_oid(name: &str) -> Result<u32> {
    name.parse().map_err(|_| {
        Error::new(
            ErrorKind::Format,
            format!("'{name}' is not a tablespace oid"),
        )
    })
}

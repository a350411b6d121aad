//! Immutable option structs the orchestrators are constructed with.
//!
//! Option parsing and config files live outside this crate; callers build
//! these structs and hand them to the command entry points. Workers receive
//! the subset they need at spawn time.

use std::path::PathBuf;
use std::time::Duration;

use pgvault_api_types::{BackupType, CipherType, CompressType, StanzaName};
use pgvault_storage::Storage;

/// How the repository is reached.
#[derive(Debug, Clone)]
pub enum RepoDriver {
    Posix,
    Cifs,
}

/// The repository a stanza writes to.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    pub path: String,
    pub driver: RepoDriver,
    pub stanza: StanzaName,
    pub cipher_type: CipherType,
    /// Top-level repository passphrase; subpasses are stored in the info
    /// files it protects.
    pub cipher_pass: Option<String>,
}

impl RepoConfig {
    pub fn new(path: impl Into<String>, stanza: StanzaName) -> Self {
        Self {
            path: path.into(),
            driver: RepoDriver::Posix,
            stanza,
            cipher_type: CipherType::None,
            cipher_pass: None,
        }
    }

    pub fn with_cipher(mut self, cipher_type: CipherType, pass: impl Into<String>) -> Self {
        self.cipher_type = cipher_type;
        self.cipher_pass = Some(pass.into());
        self
    }

    /// Storage rooted at this stanza's slice of the repository.
    pub fn storage(&self) -> Storage {
        let root = self.stanza_root();

        match self.driver {
            RepoDriver::Posix => Storage::posix(root),
            RepoDriver::Cifs => Storage::cifs(root),
        }
    }

    /// Absolute root used to hand workers their own storage handle.
    pub fn stanza_root(&self) -> String {
        format!("{}/{}", self.path, self.stanza)
    }
}

/// Settings shared by every command: lock directory, parallelism, protocol
/// tuning.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub lock_path: PathBuf,
    pub process_max: u32,
    pub protocol_timeout: Duration,
    pub lock_timeout: Duration,
    /// Sleep schedule between retries of transient failures.
    pub retry_interval: Vec<Duration>,
}

impl GlobalConfig {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            process_max: 1,
            protocol_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(30),
            retry_interval: vec![Duration::from_millis(500), Duration::from_secs(2)],
        }
    }

    pub fn process_max(mut self, process_max: u32) -> Self {
        self.process_max = process_max.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    pub compress_type: CompressType,
    pub compress_level: Option<i32>,
    /// Re-hash candidate files instead of trusting size and timestamp.
    pub delta: bool,
    /// Copy only changed blocks of large files, with a block map.
    pub block_incr: bool,
    /// Validate data page checksums while copying.
    pub checksum_page: bool,
    /// Online backup through the cluster, with WAL start/stop.
    pub online: bool,
    /// Wait for the stop segment to reach the archive.
    pub archive_check: bool,
    /// Copy the WAL range into the backup itself.
    pub archive_copy: bool,
    pub archive_timeout: Duration,
    /// Record the hard-link option in the manifest.
    pub hardlink: bool,
    /// Attempt to resume a matching partial backup.
    pub resume: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            compress_type: CompressType::Gz,
            compress_level: None,
            delta: false,
            block_incr: false,
            checksum_page: true,
            online: true,
            archive_check: true,
            archive_copy: false,
            archive_timeout: Duration::from_secs(60),
            hardlink: false,
            resume: true,
        }
    }
}

/// Replay stop target for restore.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreTarget {
    /// Replay all available WAL.
    Default,
    /// Stop as soon as consistency is reached.
    Immediate,
    Time(String),
    Xid(String),
    Name(String),
    Lsn(String),
}

#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Backup set label, or `None` for the latest.
    pub set: Option<String>,
    pub target: RestoreTarget,
    /// Reconcile an existing data directory instead of requiring empty.
    pub delta: bool,
    /// With delta: trust file size+timestamp instead of re-hashing.
    pub force: bool,
    /// Remap the data directory to a new location.
    pub pg_path: Option<String>,
    /// Tablespace remapping by name or oid string.
    pub tablespace_map: Vec<(String, String)>,
    /// Link remapping by manifest name.
    pub link_map: Vec<(String, String)>,
    /// Restore unmapped links as links instead of dropping them.
    pub link_all: bool,
    /// Databases to include; other user databases restore as sparse zeros.
    pub db_include: Vec<String>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            set: None,
            target: RestoreTarget::Default,
            delta: false,
            force: false,
            pg_path: None,
            tablespace_map: Vec::new(),
            link_map: Vec::new(),
            link_all: false,
            db_include: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivePushOptions {
    pub compress_type: CompressType,
    pub compress_level: Option<i32>,
    /// Queue the segment in the spool path and return once durably spooled;
    /// a flush pushes queued segments in parallel.
    pub asynchronous: bool,
    pub spool_path: Option<PathBuf>,
}

impl Default for ArchivePushOptions {
    fn default() -> Self {
        Self {
            compress_type: CompressType::Gz,
            compress_level: None,
            asynchronous: false,
            spool_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Verify only this backup set.
    pub set: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExpireOptions {
    /// Full backups to keep; older chains expire.
    pub retention_full: Option<u32>,
    /// Differential backups to keep per full.
    pub retention_diff: Option<u32>,
    pub dry_run: bool,
}

impl Default for ExpireOptions {
    fn default() -> Self {
        Self {
            retention_full: Some(2),
            retention_diff: None,
            dry_run: false,
        }
    }
}

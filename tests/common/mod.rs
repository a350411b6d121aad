//! Shared fixtures: a throwaway repository, a synthetic cluster and a
//! scripted cluster interface.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use pgvault::config::{ArchivePushOptions, BackupOptions, GlobalConfig, RepoConfig};
use pgvault::pg::{BackupPosition, DbInfo, DbSource, PgIdentity};
use pgvault_api_types::{CompressType, Result, StanzaName};
use pgvault_repo::{format_lsn, WalSegment, WAL_SEGMENT_SIZE_DEFAULT};
use pgvault_storage::filter::HashFilter;
use pgvault_storage::Storage;

static NEXT: AtomicU32 = AtomicU32::new(0);

pub struct TestEnv {
    pub root: PathBuf,
    pub repo: RepoConfig,
    pub global: GlobalConfig,
    pub pg_path: String,
}

impl TestEnv {
    pub fn new(tag: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let root = std::env::temp_dir().join(format!(
            "pgvault-it-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));

        let pg_path = root.join("pg").to_string_lossy().into_owned();
        std::fs::create_dir_all(&pg_path).unwrap();
        std::fs::create_dir_all(root.join("repo")).unwrap();
        std::fs::create_dir_all(root.join("lock")).unwrap();
        std::fs::create_dir_all(root.join("spool")).unwrap();

        let repo = RepoConfig::new(
            root.join("repo").to_string_lossy().into_owned(),
            StanzaName::new("demo").unwrap(),
        );

        let global = GlobalConfig::new(root.join("lock")).process_max(2);

        Self {
            root,
            repo,
            global,
            pg_path,
        }
    }

    pub fn pg(&self) -> Storage {
        Storage::posix(self.pg_path.clone())
    }

    pub fn repo_storage(&self) -> Storage {
        self.repo.storage()
    }

    pub fn spool_path(&self) -> PathBuf {
        self.root.join("spool")
    }

    pub fn push_options(&self) -> ArchivePushOptions {
        ArchivePushOptions {
            compress_type: CompressType::Gz,
            ..ArchivePushOptions::default()
        }
    }

    /// Backup options tuned for tests: online with a scripted cluster, no
    /// archive wait unless a test opts in.
    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            checksum_page: false,
            archive_check: false,
            ..BackupOptions::default()
        }
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub const TEST_SYSTEM_ID: u64 = 6_569_239_123_849_665_679;

/// Lay down a minimal but plausible cluster.
pub fn build_cluster(pg: &Storage) {
    pg.put("PG_VERSION", b"15\n").unwrap();

    let control = pgvault::pg::PgControl {
        system_id: TEST_SYSTEM_ID,
        control_version: 1300,
        catalog_version: 202_209_061,
    };
    pg.put("global/pg_control", &control.to_bytes()).unwrap();

    // Three relations: big, medium and empty.
    pg.put("base/1/1249", &pattern(1024 * 1024, 3)).unwrap();
    pg.put("base/1/2600", &pattern(100 * 1024, 7)).unwrap();
    pg.put("base/1/2601", b"").unwrap();

    pg.path_create("pg_wal", None).unwrap();
    pg.path_create("pg_tblspc", None).unwrap();
}

/// Deterministic content that does not compress away entirely.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|idx| {
            let idx = idx as u64;
            (idx.wrapping_mul(31).wrapping_add(u64::from(seed) * 7919) % 251) as u8
        })
        .collect()
}

/// SHA-1 of every file under the storage root, keyed by relative path.
pub fn dir_digests(storage: &Storage, skip: &[&str]) -> BTreeMap<String, String> {
    let mut digests = BTreeMap::new();
    walk_digests(storage, "", skip, &mut digests).unwrap();
    digests
}

fn walk_digests(
    storage: &Storage,
    rel: &str,
    skip: &[&str],
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    for entry in storage.list(rel, pgvault_storage::InfoLevel::Type)? {
        let child = if rel.is_empty() {
            entry.name.clone()
        } else {
            format!("{rel}/{}", entry.name)
        };

        if skip.contains(&child.as_str()) {
            continue;
        }

        match entry.info.file_type {
            pgvault_storage::FileType::File => {
                let data = storage.get(&child)?.unwrap_or_default();
                out.insert(child, HashFilter::digest(&data)?);
            }
            pgvault_storage::FileType::Path => walk_digests(storage, &child, skip, out)?,
            _ => (),
        }
    }

    Ok(())
}

/// Scripted cluster: identity from the on-disk fixture, start/stop
/// positions advanced by the test.
pub struct TestDb {
    pub pg_path: String,
    pub start_lsn: u64,
    pub stop_lsn: u64,
    pub dbs: Vec<DbInfo>,
}

impl TestDb {
    pub fn new(env: &TestEnv) -> Self {
        Self {
            pg_path: env.pg_path.clone(),
            start_lsn: 0x0200_0028,
            stop_lsn: 0x0200_0100,
            dbs: vec![DbInfo {
                name: "postgres".to_string(),
                oid: 5,
                last_system_oid: 16_383,
            }],
        }
    }

    pub fn with_lsn(mut self, start: u64, stop: u64) -> Self {
        self.start_lsn = start;
        self.stop_lsn = stop;
        self
    }

    pub fn with_db(mut self, name: &str, oid: u32) -> Self {
        self.dbs.push(DbInfo {
            name: name.to_string(),
            oid,
            last_system_oid: 16_383,
        });
        self
    }
}

impl DbSource for TestDb {
    fn identity(&mut self) -> Result<PgIdentity> {
        let mut offline = pgvault::pg::OfflineDb::new(Storage::posix(self.pg_path.clone()));
        offline.identity()
    }

    fn backup_start(&mut self, _label: &str) -> Result<BackupPosition> {
        Ok(BackupPosition {
            lsn: format_lsn(self.start_lsn),
            wal_segment: WalSegment::from_lsn(1, self.start_lsn, WAL_SEGMENT_SIZE_DEFAULT)
                .to_string(),
        })
    }

    fn backup_stop(&mut self) -> Result<BackupPosition> {
        Ok(BackupPosition {
            lsn: format_lsn(self.stop_lsn),
            wal_segment: WalSegment::from_lsn(1, self.stop_lsn, WAL_SEGMENT_SIZE_DEFAULT)
                .to_string(),
        })
    }

    fn db_list(&mut self) -> Result<Vec<DbInfo>> {
        Ok(self.dbs.clone())
    }
}

/// Push a synthetic WAL segment into the archive via archive-push.
pub fn push_wal_segment(env: &TestEnv, name: &str, content: &[u8]) {
    let wal_dir = format!("{}/pg_wal", env.pg_path);
    std::fs::create_dir_all(&wal_dir).unwrap();

    let wal_file = format!("{wal_dir}/{name}");
    std::fs::write(&wal_file, content).unwrap();

    pgvault::archive_push(&env.repo, &env.global, &wal_file, &env.push_options()).unwrap();
}

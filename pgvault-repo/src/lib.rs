//! Repository metadata: info files, per-backup manifests, WAL segment
//! arithmetic, the on-disk layout and stanza locks.

pub mod info;
pub mod info_archive;
pub mod info_backup;
pub mod info_pg;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod wal;

pub use info::{cipher_pass_gen, InfoDoc, INFO_COPY_EXT};
pub use info_archive::{InfoArchive, INFO_ARCHIVE_FILE};
pub use info_backup::{format_label_time, BackupRecord, InfoBackup, INFO_BACKUP_FILE};
pub use info_pg::{InfoPg, InfoPgKind, PgHistoryEntry};
pub use lock::{exec_id_gen, lock_acquire, LockHandle, LockType};
pub use manifest::{
    Manifest, ManifestData, ManifestDb, ManifestFile, ManifestLink, ManifestOptions, ManifestPath,
    ManifestTarget, TargetType, MANIFEST_TARGET_PGDATA, MANIFEST_TARGET_TBLSPC,
};
pub use wal::{
    format_lsn, parse_lsn, segment_file_split, wal_ranges, WalRange, WalSegment,
    WAL_SEGMENT_SIZE_DEFAULT,
};

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::info_pg::PgHistoryEntry;

    static NEXT: AtomicU32 = AtomicU32::new(0);

    pub struct TempPath {
        pub path: PathBuf,
    }

    impl TempPath {
        pub fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "pgvault-repo-test-{}-{}-{}",
                tag,
                std::process::id(),
                NEXT.fetch_add(1, Ordering::SeqCst)
            ));
            std::fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        pub fn str(&self) -> String {
            self.path.to_string_lossy().into_owned()
        }
    }

    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    pub fn pg_entry(id: u32, version: &str, system_id: u64) -> PgHistoryEntry {
        PgHistoryEntry {
            id,
            version: version.to_string(),
            system_id,
            catalog_version: 202_209_061,
            control_version: 1300,
        }
    }
}

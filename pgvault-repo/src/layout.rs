//! Repository path layout.
//!
//! ```text
//! archive.info, archive.info.copy
//! backup.info,  backup.info.copy
//! archive/<archiveId>/<prefix>/<segment>-<sha1>[.<ext>]
//! backup/<label>/backup.manifest[.copy]
//! backup/<label>/<manifestName>[.<ext>]
//! ```

use pgvault_api_types::CompressType;

pub const MANIFEST_FILE: &str = "backup.manifest";

pub fn archive_path(archive_id: &str) -> String {
    format!("archive/{archive_id}")
}

/// Two-level prefix: the first 16 hex characters (timeline + log) bound the
/// directory fan-out.
pub fn wal_segment_prefix(segment_name: &str) -> &str {
    &segment_name[..16.min(segment_name.len())]
}

pub fn wal_segment_dir(archive_id: &str, segment_name: &str) -> String {
    format!("archive/{archive_id}/{}", wal_segment_prefix(segment_name))
}

pub fn wal_segment_path(
    archive_id: &str,
    segment_name: &str,
    checksum: &str,
    compress_type: CompressType,
) -> String {
    format!(
        "{}/{segment_name}-{checksum}{}",
        wal_segment_dir(archive_id, segment_name),
        compress_type.extension()
    )
}

pub fn backup_path(label: &str) -> String {
    format!("backup/{label}")
}

pub fn manifest_path(label: &str) -> String {
    format!("backup/{label}/{MANIFEST_FILE}")
}

/// Repository path of a backed-up file, with the compression extension it
/// was stored under.
pub fn backup_file_path(label: &str, name: &str, compress_type: CompressType) -> String {
    format!("backup/{label}/{name}{}", compress_type.extension())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wal_paths() {
        assert_eq!(
            wal_segment_prefix("0000000100000002000000FE"),
            "0000000100000002"
        );
        assert_eq!(
            wal_segment_path("15-1", "0000000100000002000000FE", "ab12", CompressType::Gz),
            "archive/15-1/0000000100000002/0000000100000002000000FE-ab12.gz"
        );
        assert_eq!(
            wal_segment_path("15-1", "0000000100000002000000FE", "ab12", CompressType::None),
            "archive/15-1/0000000100000002/0000000100000002000000FE-ab12"
        );
    }

    #[test]
    fn backup_paths() {
        assert_eq!(manifest_path("20240101-000000F"), "backup/20240101-000000F/backup.manifest");
        assert_eq!(
            backup_file_path("20240101-000000F", "pg_data/base/1/2", CompressType::Zst),
            "backup/20240101-000000F/pg_data/base/1/2.zst"
        );
    }
}

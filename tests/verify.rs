//! Repository verify scenarios: corruption, duplicates, missing manifests.

mod common;

use common::{build_cluster, pattern, push_wal_segment, TestDb, TestEnv};

use pgvault::command::verify::VerifyBackupStatus;
use pgvault::config::VerifyOptions;
use pgvault_storage::InfoLevel;

/// Set up a stanza with archived WAL covering the backup range.
fn backed_up_env(tag: &str) -> (TestEnv, String) {
    let env = TestEnv::new(tag);
    let pg = env.pg();
    build_cluster(&pg);

    let mut db = TestDb::new(&env).with_lsn(0x0200_0028, 0x0300_0050);
    pgvault::stanza_create(&env.repo, &env.global, &mut db).unwrap();

    push_wal_segment(&env, "000000010000000000000002", &pattern(4096, 61));
    push_wal_segment(&env, "000000010000000000000003", &pattern(4096, 62));

    let mut options = env.backup_options();
    options.archive_check = true;
    let result =
        pgvault::backup(&env.repo, &env.global, &env.pg_path, &mut db, &options).unwrap();

    (env, result.label)
}

/// Find the archived file for a segment and return its repo path.
fn archived_segment_path(env: &TestEnv, segment: &str) -> String {
    let storage = env.repo_storage();
    let dir = format!("archive/15-1/{}", &segment[..16]);

    let file = storage
        .list(&dir, InfoLevel::Type)
        .unwrap()
        .into_iter()
        .find(|entry| entry.name.starts_with(&format!("{segment}-")))
        .expect("segment archived");

    format!("{dir}/{}", file.name)
}

#[test]
fn valid_repository_verifies_clean() {
    let (env, label) = backed_up_env("verify-ok");

    let result = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(result.status, "ok");

    let backup = result
        .backups
        .iter()
        .find(|backup| backup.label == label)
        .unwrap();
    assert_eq!(backup.status, VerifyBackupStatus::Valid);
    assert_eq!(backup.missing, 0);
    assert_eq!(backup.checksum_invalid, 0);
    assert_eq!(backup.wal_invalid, 0);
    assert!(backup.total > 0);

    let archive = &result.archives[0];
    assert_eq!(archive.archive_id, "15-1");
    assert_eq!(archive.total, 2);
    assert_eq!(archive.checksum_invalid, 0);
    assert_eq!(archive.ranges.len(), 1);

    // A valid backup stays valid on re-verify.
    let again = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(again.status, "ok");
}

#[test]
fn corrupt_wal_segment_invalidates_covering_backups() {
    let (env, label) = backed_up_env("verify-corrupt-wal");
    let storage = env.repo_storage();

    // Flip one byte in the archived copy of segment 3.
    let path = archived_segment_path(&env, "000000010000000000000003");
    let mut data = storage.get(&path).unwrap().unwrap();
    let idx = data.len() / 2;
    data[idx] ^= 0xff;
    storage.put(&path, &data).unwrap();

    let result = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(result.status, "error");

    let archive = &result.archives[0];
    assert_eq!(archive.checksum_invalid, 1);

    // The backup's range [2, 3] covers the broken segment.
    let backup = result
        .backups
        .iter()
        .find(|backup| backup.label == label)
        .unwrap();
    assert_eq!(backup.status, VerifyBackupStatus::Invalid);
    assert!(backup.wal_invalid >= 1);

    // JSON output carries the bucketed counts.
    let json = result.to_json().unwrap();
    assert!(json.contains("\"status\": \"error\""));
    assert!(json.contains("\"checksumInvalid\": 1"));
    assert!(json.contains("\"walInvalid\""));
}

#[test]
fn missing_wal_segment_counts_against_backups() {
    let (env, label) = backed_up_env("verify-gap");
    let storage = env.repo_storage();

    // Remove segment 2 entirely: the range [2, 3] now has a gap.
    let path = archived_segment_path(&env, "000000010000000000000002");
    storage.remove(&path, true).unwrap();

    let result = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(result.status, "error");

    let backup = result
        .backups
        .iter()
        .find(|backup| backup.label == label)
        .unwrap();
    assert_eq!(backup.status, VerifyBackupStatus::Invalid);
    assert_eq!(backup.wal_invalid, 1);
}

#[test]
fn duplicate_wal_segment_is_flagged_and_skipped() {
    let (env, _) = backed_up_env("verify-dup");
    let storage = env.repo_storage();

    // A second file for segment 2 with a different checksum.
    storage
        .put(
            &format!(
                "archive/15-1/0000000100000000/000000010000000000000002-{}",
                "f".repeat(40)
            ),
            b"imposter",
        )
        .unwrap();

    let result = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(result.status, "error");

    let archive = &result.archives[0];
    assert_eq!(archive.duplicate, 1);
    // The duplicated segment is out of the processing set; segment 3 was
    // still verified.
    assert_eq!(archive.total, 1);
    assert!(result
        .warnings
        .iter()
        .any(|warning| warning.contains("duplicate wal segment")));
}

#[test]
fn corrupt_backup_file_is_checksum_invalid() {
    let (env, label) = backed_up_env("verify-corrupt-file");
    let storage = env.repo_storage();

    // Corrupt the stored copy of one relation.
    let path = format!("backup/{label}/pg_data/base/1/2600.gz");
    let mut data = storage.get(&path).unwrap().unwrap();
    let idx = data.len() / 2;
    data[idx] ^= 0xff;
    storage.put(&path, &data).unwrap();

    let result = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(result.status, "error");

    let backup = result
        .backups
        .iter()
        .find(|backup| backup.label == label)
        .unwrap();
    assert_eq!(backup.status, VerifyBackupStatus::Invalid);
    assert_eq!(backup.checksum_invalid, 1);
}

#[test]
fn unregistered_backup_dirs_are_classified() {
    let (env, _) = backed_up_env("verify-partial");
    let storage = env.repo_storage();

    // Two unregistered label directories; only the newest may be a backup
    // still in progress.
    storage.path_create("backup/20990101-000000F", None).unwrap();
    storage.path_create("backup/20990102-000000F", None).unwrap();

    let result = pgvault::verify(&env.repo, &env.global, &VerifyOptions::default()).unwrap();
    assert_eq!(result.status, "error");

    let status_of = |label: &str| {
        result
            .backups
            .iter()
            .find(|backup| backup.label == label)
            .unwrap()
            .status
    };

    assert_eq!(status_of("20990101-000000F"), VerifyBackupStatus::MissingManifest);
    assert_eq!(status_of("20990102-000000F"), VerifyBackupStatus::InProgress);
}

#[test]
fn verify_single_set() {
    let (env, label) = backed_up_env("verify-set");

    let result = pgvault::verify(
        &env.repo,
        &env.global,
        &VerifyOptions {
            set: Some(label.clone()),
        },
    )
    .unwrap();

    assert_eq!(result.backups.len(), 1);
    assert_eq!(result.backups[0].label, label);

    let err = pgvault::verify(
        &env.repo,
        &env.global,
        &VerifyOptions {
            set: Some("20000101-000000F".to_string()),
        },
    )
    .unwrap_err();
    assert_eq!(err.kind(), pgvault_api_types::ErrorKind::BackupSetInvalid);
}

//! Retention enforcement.

mod common;

use common::{build_cluster, pattern, push_wal_segment, TestDb, TestEnv};

use pgvault::config::ExpireOptions;
use pgvault_api_types::BackupType;
use pgvault_storage::InfoLevel;

/// Three fulls with an incr on the first, each with its own WAL range.
fn populated_env(tag: &str) -> (TestEnv, Vec<String>) {
    let env = TestEnv::new(tag);
    let pg = env.pg();
    build_cluster(&pg);

    let mut db = TestDb::new(&env);
    pgvault::stanza_create(&env.repo, &env.global, &mut db).unwrap();

    for (idx, segment) in (2..=9).enumerate() {
        push_wal_segment(
            &env,
            &format!("0000000100000000000000{segment:02X}"),
            &pattern(4096, 90 + idx as u8),
        );
    }

    let mut labels = Vec::new();
    let mut options = env.backup_options();
    options.archive_check = true;

    // Backups at distinct seconds so labels never collide.
    let starts = [0x0200_0028u64, 0x0500_0028, 0x0800_0028];

    for (idx, start) in starts.iter().enumerate() {
        db = db.with_lsn(*start, *start + 0x100);

        if idx == 1 {
            // An incr chained to the first full, taken in between.
            let mut incr = options.clone();
            incr.backup_type = BackupType::Incr;
            pg.put("base/1/2600", &pattern(100 * 1024, 50)).unwrap();
            let result =
                pgvault::backup(&env.repo, &env.global, &env.pg_path, &mut db, &incr).unwrap();
            labels.push(result.label);
            std::thread::sleep(std::time::Duration::from_millis(1100));
        }

        let result =
            pgvault::backup(&env.repo, &env.global, &env.pg_path, &mut db, &options).unwrap();
        labels.push(result.label);
        std::thread::sleep(std::time::Duration::from_millis(1100));
    }

    (env, labels)
}

#[test]
fn retention_full_expires_old_chains() {
    let (env, labels) = populated_env("expire-full");
    let storage = env.repo_storage();

    // labels: [full1, incr-on-full1, full2, full3]
    assert_eq!(labels.len(), 4);

    let result = pgvault::expire(
        &env.repo,
        &env.global,
        &ExpireOptions {
            retention_full: Some(2),
            retention_diff: None,
            dry_run: false,
        },
    )
    .unwrap();

    // The oldest full and its dependent incr are gone.
    let mut expected: Vec<String> = vec![labels[0].clone(), labels[1].clone()];
    expected.sort();
    assert_eq!(result.backups_removed, expected);

    let info = pgvault_repo::InfoBackup::load(
        &storage,
        pgvault_api_types::CipherType::None,
        None,
    )
    .unwrap();
    assert_eq!(info.labels(), vec![labels[2].clone(), labels[3].clone()]);

    // Their directories are gone too.
    assert!(!storage.path_exists(&format!("backup/{}", labels[0])).unwrap());
    assert!(!storage.path_exists(&format!("backup/{}", labels[1])).unwrap());
    assert!(storage.path_exists(&format!("backup/{}", labels[2])).unwrap());

    // WAL older than full2's range start (segment 5) is pruned.
    assert!(result.wal_removed >= 3);

    let remaining: Vec<String> = storage
        .list("archive/15-1/0000000100000000", InfoLevel::Type)
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert!(remaining
        .iter()
        .all(|name| !name.starts_with("000000010000000000000002")));
    assert!(remaining
        .iter()
        .any(|name| name.starts_with("000000010000000000000005")));

    // Verify stays clean after expire.
    let verify = pgvault::verify(&env.repo, &env.global, &Default::default()).unwrap();
    assert_eq!(verify.status, "ok");
}

#[test]
fn dry_run_changes_nothing() {
    let (env, labels) = populated_env("expire-dry");
    let storage = env.repo_storage();

    let result = pgvault::expire(
        &env.repo,
        &env.global,
        &ExpireOptions {
            retention_full: Some(1),
            retention_diff: None,
            dry_run: true,
        },
    )
    .unwrap();

    assert!(!result.backups_removed.is_empty());
    assert_eq!(result.wal_removed, 0);

    // Everything still present.
    let info = pgvault_repo::InfoBackup::load(
        &storage,
        pgvault_api_types::CipherType::None,
        None,
    )
    .unwrap();
    assert_eq!(info.labels().len(), labels.len());

    for label in &labels {
        assert!(storage.path_exists(&format!("backup/{label}")).unwrap());
    }
}

#[test]
fn retention_keeps_everything_when_under_limit() {
    let (env, labels) = populated_env("expire-under");

    let result = pgvault::expire(
        &env.repo,
        &env.global,
        &ExpireOptions {
            retention_full: Some(10),
            retention_diff: None,
            dry_run: false,
        },
    )
    .unwrap();

    assert!(result.backups_removed.is_empty());

    let info = pgvault_repo::InfoBackup::load(
        &env.repo_storage(),
        pgvault_api_types::CipherType::None,
        None,
    )
    .unwrap();
    assert_eq!(info.labels().len(), labels.len());
}

//! WAL archive push and get.

mod common;

use common::{build_cluster, pattern, TestDb, TestEnv};

use pgvault::config::ArchivePushOptions;
use pgvault_api_types::ErrorKind;
use pgvault_storage::InfoLevel;

fn setup(tag: &str) -> TestEnv {
    let env = TestEnv::new(tag);
    build_cluster(&env.pg());

    let mut db = TestDb::new(&env);
    pgvault::stanza_create(&env.repo, &env.global, &mut db).unwrap();
    env
}

fn wal_file(env: &TestEnv, name: &str, content: &[u8]) -> String {
    let dir = format!("{}/pg_wal", env.pg_path);
    std::fs::create_dir_all(&dir).unwrap();
    let path = format!("{dir}/{name}");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn push_and_get_round_trip() {
    let env = setup("archive-rt");
    let segment = "000000010000000000000005";
    let content = pattern(16 * 1024, 71);

    let path = wal_file(&env, segment, &content);
    pgvault::archive_push(&env.repo, &env.global, &path, &env.push_options()).unwrap();

    // Stored under the two-level prefix with checksum and extension.
    let storage = env.repo_storage();
    let entries = storage
        .list(&format!("archive/15-1/{}", &segment[..16]), InfoLevel::Type)
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].name.starts_with(&format!("{segment}-")));
    assert!(entries[0].name.ends_with(".gz"));

    // Fetch it back to a recovery destination.
    let dest = format!("{}/pg_wal/RECOVERYXLOG", env.pg_path);
    let found = pgvault::archive_get(&env.repo, &env.global, segment, &dest).unwrap();
    assert!(found);
    assert_eq!(std::fs::read(&dest).unwrap(), content);
}

#[test]
fn push_is_idempotent_for_identical_content() {
    let env = setup("archive-dup");
    let segment = "000000010000000000000006";
    let content = pattern(8192, 73);

    let path = wal_file(&env, segment, &content);
    pgvault::archive_push(&env.repo, &env.global, &path, &env.push_options()).unwrap();

    // The cluster retries after a crash; same bytes must succeed quietly.
    pgvault::archive_push(&env.repo, &env.global, &path, &env.push_options()).unwrap();

    let storage = env.repo_storage();
    let entries = storage
        .list(&format!("archive/15-1/{}", &segment[..16]), InfoLevel::Type)
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[test]
fn push_conflicts_on_different_content() {
    let env = setup("archive-conflict");
    let segment = "000000010000000000000007";

    let path = wal_file(&env, segment, &pattern(8192, 75));
    pgvault::archive_push(&env.repo, &env.global, &path, &env.push_options()).unwrap();

    // Same name, different bytes: never silently replace WAL.
    let path = wal_file(&env, segment, &pattern(8192, 76));
    let err =
        pgvault::archive_push(&env.repo, &env.global, &path, &env.push_options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileExists);
}

#[test]
fn get_missing_segment_returns_false() {
    let env = setup("archive-missing");

    let dest = format!("{}/pg_wal/RECOVERYXLOG", env.pg_path);
    let found =
        pgvault::archive_get(&env.repo, &env.global, "0000000100000000000000FF", &dest).unwrap();
    assert!(!found);
    assert!(!std::path::Path::new(&dest).exists());
}

#[test]
fn history_files_push_and_get() {
    let env = setup("archive-history");

    let path = wal_file(&env, "00000002.history", b"1\t0/3000000\tno reason\n");
    pgvault::archive_push(&env.repo, &env.global, &path, &env.push_options()).unwrap();

    let dest = format!("{}/pg_wal/RECOVERYHISTORY", env.pg_path);
    let found =
        pgvault::archive_get(&env.repo, &env.global, "00000002.history", &dest).unwrap();
    assert!(found);
    assert_eq!(std::fs::read(&dest).unwrap(), b"1\t0/3000000\tno reason\n");
}

#[test]
fn async_push_spools_then_flushes() {
    let env = setup("archive-async");

    let options = ArchivePushOptions {
        asynchronous: true,
        spool_path: Some(env.spool_path()),
        ..env.push_options()
    };

    let segments = [
        ("000000010000000000000010", pattern(8192, 81)),
        ("000000010000000000000011", pattern(8192, 82)),
        ("000000010000000000000012", pattern(8192, 83)),
    ];

    for (name, content) in &segments {
        let path = wal_file(&env, name, content);
        pgvault::archive_push(&env.repo, &env.global, &path, &options).unwrap();
    }

    // Spooled, not yet in the repository.
    let storage = env.repo_storage();
    assert!(storage
        .list_opt("archive/15-1/0000000100000000", InfoLevel::Type)
        .unwrap()
        .is_empty());

    let pushed = pgvault::archive_push_flush(&env.repo, &env.global, &options).unwrap();
    assert_eq!(pushed, 3);

    // Now archived, and the spool is drained.
    for (name, content) in &segments {
        let dest = format!("{}/pg_wal/RECOVERED-{name}", env.pg_path);
        assert!(pgvault::archive_get(&env.repo, &env.global, name, &dest).unwrap());
        assert_eq!(&std::fs::read(&dest).unwrap(), content);
    }

    let spool = pgvault_storage::Storage::posix(format!(
        "{}/archive-push",
        env.spool_path().display()
    ));
    assert!(spool.list_opt("", InfoLevel::Type).unwrap().is_empty());

    // A second flush is a no-op.
    assert_eq!(
        pgvault::archive_push_flush(&env.repo, &env.global, &options).unwrap(),
        0
    );
}

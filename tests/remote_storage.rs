//! Remote storage driver against its server half over a socket pair.

mod common;

use std::os::unix::net::UnixStream;
use std::time::Duration;

use common::{pattern, TestEnv};

use pgvault::workers::{run_remote_server, REMOTE_SERVICE};
use pgvault_api_types::ErrorKind;
use pgvault_protocol::ProtocolClient;
use pgvault_storage::remote::RemoteDriver;
use pgvault_storage::{FileType, InfoLevel, ReadOptions, Storage, WriteOptions};

fn remote_pair(env: &TestEnv) -> (Storage, std::thread::JoinHandle<pgvault_api_types::Result<()>>) {
    let (client_stream, server_stream) = UnixStream::pair().unwrap();

    let handle = std::thread::spawn(move || {
        // Clients send fully resolved paths, so the served storage is
        // rooted at the filesystem.
        run_remote_server(
            Box::new(server_stream),
            "remote-server",
            Storage::posix("/"),
            vec![],
        )
    });

    let client = ProtocolClient::new(
        Box::new(client_stream),
        "remote-client",
        REMOTE_SERVICE,
        Duration::from_secs(10),
    )
    .unwrap();

    let root = env.root.join("remote-root").to_string_lossy().into_owned();
    std::fs::create_dir_all(&root).unwrap();

    (RemoteDriver::storage(client, root), handle)
}

#[test]
fn remote_read_write_round_trip() {
    let env = TestEnv::new("remote-rw");
    let (storage, _handle) = remote_pair(&env);

    // Streaming write through a session, streaming read back.
    let content = pattern(300 * 1024, 111);
    let mut write = storage.new_write("dir/blob.bin", WriteOptions::default()).unwrap();
    for chunk in content.chunks(40 * 1024) {
        write.write(chunk).unwrap();
    }
    write.close().unwrap();

    let mut read = storage.open_read("dir/blob.bin", ReadOptions::default()).unwrap();
    assert_eq!(read.read_all().unwrap(), content);

    // Ranged reads pass through to the driver.
    let mut read = storage
        .open_read("dir/blob.bin", ReadOptions::default().range(100, Some(50)))
        .unwrap();
    assert_eq!(read.read_all().unwrap(), content[100..150]);
}

#[test]
fn remote_metadata_operations() {
    let env = TestEnv::new("remote-meta");
    let (storage, _handle) = remote_pair(&env);

    storage.put("a/one", b"1").unwrap();
    storage.put("a/two", b"22").unwrap();

    let entries = storage.list("a", InfoLevel::Basic).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "one");
    assert_eq!(entries[1].name, "two");
    assert_eq!(entries[1].info.size, 2);

    let info = storage.info("a/one", InfoLevel::Basic).unwrap();
    assert!(info.exists);
    assert_eq!(info.file_type, FileType::File);
    assert_eq!(info.size, 1);

    assert!(!storage.info("a/ghost", InfoLevel::Basic).unwrap().exists);

    let err = storage.list("ghost", InfoLevel::Basic).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathMissing);

    storage.remove("a/one", true).unwrap();
    assert!(!storage.exists("a/one").unwrap());

    storage.path_create("b/c", None).unwrap();
    assert!(storage.path_exists("b/c").unwrap());
    storage.path_remove("b", true, true).unwrap();
    assert!(!storage.path_exists("b").unwrap());

    storage.path_sync("a").unwrap();
}

#[test]
fn remote_missing_read_honors_ignore_missing() {
    let env = TestEnv::new("remote-missing");
    let (storage, _handle) = remote_pair(&env);

    assert!(storage
        .new_read("nope", ReadOptions::default().ignore_missing(true))
        .unwrap()
        .is_none());

    let err = storage.open_read("nope", ReadOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileMissing);

    // The connection survives and keeps working.
    storage.put("after", b"still alive").unwrap();
    assert_eq!(storage.get("after").unwrap().unwrap(), b"still alive");
}

#[test]
fn remote_errors_carry_their_kind() {
    let env = TestEnv::new("remote-errors");
    let (storage, _handle) = remote_pair(&env);

    storage.path_create("exists", None).unwrap();
    let err = storage.path_create_strict("exists", None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathExists);

    let err = storage.path_remove("exists-not", false, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathMissing);
}

#[test]
fn remote_abandoned_write_leaves_no_file() {
    let env = TestEnv::new("remote-abandon");
    let (storage, _handle) = remote_pair(&env);

    let mut write = storage.new_write("half.bin", WriteOptions::default()).unwrap();
    write.write(b"partial content").unwrap();
    drop(write);

    assert!(!storage.exists("half.bin").unwrap());
}

//! Archive push: move WAL segments from the cluster into the repository.
//!
//! Pushes are serialized per stanza by the archive lock. A segment already
//! archived with the same content is a success (the cluster retries after
//! crashes); the same name with different content is corruption and fails
//! hard. Async mode spools segments locally and pushes the queue with the
//! parallel executor so `archive_command` stays fast.

use pgvault_api_types::{CipherType, CompressType, Error, ErrorKind, Result};
use pgvault_protocol::{Command, ParallelExecutor, ParallelJob, Value};
use pgvault_repo::{exec_id_gen, layout, lock_acquire, InfoArchive, LockType, WalSegment};
use pgvault_storage::filter::{CipherFilter, CipherMode, CompressFilter, HashFilter};
use pgvault_storage::{InfoLevel, ReadOptions, Storage, WriteOptions};

use crate::config::{ArchivePushOptions, GlobalConfig, RepoConfig};
use crate::workers::{WorkerConfig, WorkerPool};

const SPOOL_DIR: &str = "archive-push";

/// Push one segment handed in by `archive_command`. `wal_file` is the path
/// the cluster provides, absolute or relative to the data directory.
pub fn archive_push(
    repo: &RepoConfig,
    global: &GlobalConfig,
    wal_file: &str,
    options: &ArchivePushOptions,
) -> Result<()> {
    let segment_name = wal_file
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::format(format!("'{wal_file}' is not a wal file path")))?
        .to_string();

    if options.asynchronous {
        return spool_segment(options, wal_file, &segment_name);
    }

    let exec_id = exec_id_gen();
    let _lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Archive,
        &exec_id,
        global.lock_timeout,
        true,
    )?;

    let storage = repo.storage();
    let info_archive =
        InfoArchive::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;

    let pushed = push_segment(
        &storage,
        &info_archive.archive_id(),
        wal_file,
        &segment_name,
        options.compress_type,
        options.compress_level,
        repo.cipher_type,
        info_archive.cipher_pass(),
    )?;

    if pushed {
        log::info!("pushed wal segment '{segment_name}'");
    } else {
        log::info!("wal segment '{segment_name}' already exists in the archive");
    }

    Ok(())
}

/// Copy the segment into the spool queue; durability of the spool copy is
/// the success guarantee `archive_command` reports to the cluster.
fn spool_segment(
    options: &ArchivePushOptions,
    wal_file: &str,
    segment_name: &str,
) -> Result<()> {
    let spool_path = options
        .spool_path
        .as_ref()
        .ok_or_else(|| Error::config("async archive-push requires a spool path"))?;

    let spool = Storage::posix(format!("{}/{SPOOL_DIR}", spool_path.display()));
    let source = Storage::posix("/");

    let read = source.open_read(wal_file.trim_start_matches('/'), ReadOptions::default())?;
    let write = spool.new_write(segment_name, WriteOptions::default())?;

    Storage::copy(read, write)?;
    log::info!("spooled wal segment '{segment_name}'");
    Ok(())
}

/// Push everything in the spool queue through the executor.
pub fn archive_push_flush(
    repo: &RepoConfig,
    global: &GlobalConfig,
    options: &ArchivePushOptions,
) -> Result<u64> {
    let spool_path = options
        .spool_path
        .as_ref()
        .ok_or_else(|| Error::config("async archive-push requires a spool path"))?;
    let spool_root = format!("{}/{SPOOL_DIR}", spool_path.display());

    let exec_id = exec_id_gen();
    let _lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Archive,
        &exec_id,
        global.lock_timeout,
        true,
    )?;

    let storage = repo.storage();
    let info_archive =
        InfoArchive::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
    let archive_id = info_archive.archive_id();

    let spool = Storage::posix(spool_root.clone());
    let mut pending: std::collections::VecDeque<String> = spool
        .list_opt("", InfoLevel::Type)?
        .into_iter()
        .map(|entry| entry.name)
        .collect();

    if pending.is_empty() {
        return Ok(0);
    }

    let total = pending.len() as u64;

    let worker_config = WorkerConfig {
        repo_root: repo.stanza_root(),
        pg_root: spool_root.clone(),
        cipher_type: repo.cipher_type,
        cipher_pass: info_archive.cipher_pass().map(str::to_string),
        compress_type: options.compress_type,
        compress_level: options.compress_level,
    };

    let (clients, pool) = WorkerPool::spawn(global.process_max, &worker_config, global)?;

    let executor = ParallelExecutor::new(
        clients,
        global.protocol_timeout,
        global.retry_interval.clone(),
        move |_| {
            Ok(pending.pop_front().map(|name| {
                let param = Value::obj([
                    ("file", Value::from(name.as_str())),
                    ("archive-id", Value::from(archive_id.as_str())),
                ]);

                ParallelJob::new(Value::from(name), Command::new("archive-push-file", param))
            }))
        },
    );

    executor.run(|done| {
        let name = done.key.as_str()?.to_string();
        done.result
            .map_err(|err| Error::new(err.kind(), format!("unable to push '{name}': {err}")))?;
        Ok(())
    })?;

    pool.join()?;

    log::info!("pushed {total} spooled wal segments");
    Ok(total)
}

/// Worker handler: push one spooled segment and drop it from the queue.
pub(crate) fn push_file_job(
    config: &crate::workers::WorkerConfig,
    param: &Value,
) -> Result<Value> {
    let name = param.get("file").as_str()?;
    let archive_id = param.get("archive-id").as_str()?;

    let spool = Storage::posix(config.pg_root.clone());
    let repo = Storage::posix(config.repo_root.clone());

    push_segment(
        &repo,
        archive_id,
        &spool.path(name),
        name,
        config.compress_type,
        config.compress_level,
        config.cipher_type,
        config.cipher_pass.as_deref(),
    )?;

    spool.remove(name, false)?;
    Ok(Value::Null)
}

/// The push itself: hash, dedup check, filtered copy, atomic store.
#[allow(clippy::too_many_arguments)]
pub(crate) fn push_segment(
    repo_storage: &Storage,
    archive_id: &str,
    source_path: &str,
    segment_name: &str,
    compress_type: CompressType,
    compress_level: Option<i32>,
    cipher_type: CipherType,
    cipher_pass: Option<&str>,
) -> Result<bool> {
    let source = Storage::posix("/");
    let source_rel = source_path.trim_start_matches('/');

    // Timeline history and backup label files have no checksum in their
    // name and may be overwritten freely.
    if !WalSegment::is_segment_name(segment_name) || segment_name.len() != 24 {
        let dest = format!(
            "{}/{segment_name}{}",
            layout::archive_path(archive_id),
            compress_type.extension()
        );

        let read = source.open_read(source_rel, ReadOptions::default())?;
        let mut write = repo_storage.new_write(&dest, WriteOptions::default())?;
        add_push_filters(&mut write, compress_type, compress_level, cipher_type, cipher_pass)?;
        Storage::copy(read, write)?;
        return Ok(true);
    }

    // Pass one: the checksum that becomes part of the archived name.
    let mut read = source.open_read(source_rel, ReadOptions::default())?;
    read.filters_mut().add(Box::new(HashFilter::sha1()?));
    read.drain()?;
    let checksum = read.filters().result_required("hash")?.as_str()?.to_string();

    // Dedup: an identical segment is success, a different one is conflict.
    let dir = layout::wal_segment_dir(archive_id, segment_name);

    for entry in repo_storage.list_opt(&dir, InfoLevel::Type)? {
        if !entry.name.starts_with(&format!("{segment_name}-")) {
            continue;
        }

        let (_, existing) = pgvault_repo::segment_file_split(&entry.name)?;

        if existing == checksum {
            return Ok(false);
        }

        return Err(Error::new(
            ErrorKind::FileExists,
            format!(
                "wal segment '{segment_name}' already exists in the archive with a \
                 different checksum\n\
                 HINT: this is valid in some cases such as a timeline switch gone wrong"
            ),
        ));
    }

    // Pass two: the filtered copy under the final name.
    let dest = layout::wal_segment_path(archive_id, segment_name, &checksum, compress_type);

    let read = source.open_read(source_rel, ReadOptions::default())?;
    let mut write = repo_storage.new_write(&dest, WriteOptions::default())?;
    add_push_filters(&mut write, compress_type, compress_level, cipher_type, cipher_pass)?;
    Storage::copy(read, write)?;

    Ok(true)
}

fn add_push_filters(
    write: &mut pgvault_storage::StorageWrite,
    compress_type: CompressType,
    compress_level: Option<i32>,
    cipher_type: CipherType,
    cipher_pass: Option<&str>,
) -> Result<()> {
    let filters = write.filters_mut();

    if compress_type != CompressType::None {
        filters.add(Box::new(CompressFilter::new(compress_type, compress_level)?));
    }

    if cipher_type != CipherType::None {
        let pass = cipher_pass
            .ok_or_else(|| Error::new(ErrorKind::Crypto, "archive cipher passphrase not set"))?;
        filters.add(Box::new(CipherFilter::new(
            CipherMode::Encrypt,
            cipher_type,
            pass.as_bytes(),
        )?));
    }

    Ok(())
}

//! Backup command.
//!
//! Enumerates the cluster, decides per file whether to copy or reference
//! the prior backup, streams copies through workers and registers the
//! completed backup. The manifest is saved before `backup.info` is updated,
//! so a crash at any point leaves either a complete backup or none.

use std::time::Instant;

use pgvault_api_types::{BackupType, CipherType, Error, ErrorKind, Result};
use pgvault_protocol::{Command, ParallelExecutor, ParallelJob, Value};
use pgvault_repo::{
    exec_id_gen, layout, lock_acquire, BackupRecord, InfoArchive, InfoBackup, LockType, Manifest,
    ManifestData, ManifestDb, ManifestFile, ManifestLink, ManifestOptions, ManifestPath,
    ManifestTarget, TargetType, WalSegment, MANIFEST_TARGET_PGDATA, MANIFEST_TARGET_TBLSPC,
};
use pgvault_storage::filter::SHA1_EMPTY;
use pgvault_storage::{FileType, InfoLevel, ReadOptions, Storage, WriteOptions};

use crate::config::{BackupOptions, GlobalConfig, RepoConfig};
use crate::pg::{parse_tablespace_oid, DbSource};
use crate::workers::{WorkerConfig, WorkerPool};

/// Files that never belong in a backup.
const SKIP_FILES: &[&str] = &[
    "backup_label.old",
    "postmaster.opts",
    "postmaster.pid",
    "tablespace_map.old",
];

/// Directories whose content is runtime state and is recreated on start.
const SKIP_DIR_CONTENT: &[&str] = &[
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_snapshots",
    "pg_stat_tmp",
    "pg_subtrans",
];

#[derive(Debug)]
pub struct BackupResult {
    pub label: String,
    pub files_copied: u64,
    pub files_referenced: u64,
    pub size: u64,
    pub repo_size: u64,
}

/// Block-incremental block size by file size tier; small files are copied
/// whole because the map overhead would dominate.
fn block_incr_size_for(size: u64) -> Option<u64> {
    if size >= 16 * 1024 * 1024 {
        Some(128 * 1024)
    } else if size >= 1024 * 1024 {
        Some(16 * 1024)
    } else if size >= 128 * 1024 {
        Some(8 * 1024)
    } else {
        None
    }
}

/// Relation data files get page validation; everything else (configs,
/// maps, the control file) has other protection.
fn page_checksum_eligible(name: &str) -> bool {
    let rel = match name.strip_prefix("pg_data/") {
        Some(rel) => rel,
        None if name.starts_with(MANIFEST_TARGET_TBLSPC) => name,
        None => return false,
    };

    let in_rel_dir = rel.starts_with("base/")
        || rel.starts_with("global/")
        || rel.starts_with(MANIFEST_TARGET_TBLSPC);

    let file_name = rel.rsplit('/').next().unwrap_or(rel);

    in_rel_dir && file_name.bytes().next().map(|b| b.is_ascii_digit()).unwrap_or(false)
}

/// Source path relative to the data directory for a manifest file name.
fn source_path(name: &str) -> &str {
    name.strip_prefix("pg_data/").unwrap_or(name)
}

struct JobSpec {
    name: String,
    size: u64,
    prior_checksum: Option<String>,
    block_incr: Option<BlockIncrSpec>,
}

struct BlockIncrSpec {
    block_size: u64,
    map_file: Option<String>,
    map_offset: u64,
    map_size: u64,
}

pub fn backup(
    repo: &RepoConfig,
    global: &GlobalConfig,
    pg_path: &str,
    db: &mut dyn DbSource,
    options: &BackupOptions,
) -> Result<BackupResult> {
    let started = Instant::now();
    let exec_id = exec_id_gen();

    let mut lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Backup,
        &exec_id,
        global.lock_timeout,
        true,
    )?
    .ok_or_else(|| Error::assert("lock acquire returned without a handle"))?;

    let storage = repo.storage();
    let pg = Storage::posix(pg_path);

    let (mut info_backup, info_archive) = super::load_info_pair(&storage, repo)?;

    let identity = db.identity()?;
    if !identity.matches(info_backup.pg().current()) {
        return Err(Error::new(
            ErrorKind::BackupMismatch,
            format!(
                "cluster {} ({}) does not match stanza '{}' ({} {})\n\
                 HINT: has the cluster been upgraded without stanza-upgrade?",
                identity.version,
                identity.system_id,
                repo.stanza,
                info_backup.pg().current().version,
                info_backup.pg().current().system_id
            ),
        ));
    }

    // Fall back to full when no prior exists for a diff or incr.
    let mut backup_type = options.backup_type;
    let prior_record = info_backup.prior_for(backup_type).cloned();

    if backup_type != BackupType::Full && prior_record.is_none() {
        log::warn!(
            "no prior backup exists, {} backup has been changed to full",
            backup_type
        );
        backup_type = BackupType::Full;
    }

    let prior_manifest = match &prior_record {
        Some(record) => Some(Manifest::load(
            &storage,
            &layout::backup_path(&record.label),
            Some(&record.label),
            repo.cipher_type,
            info_backup.cipher_pass(),
        )?),
        None => None,
    };

    // References point into the prior backup's stored files, so they are
    // only usable while the storage format matches.
    let reference_ok = prior_manifest
        .as_ref()
        .map(|prior| prior.options.compress_type == options.compress_type)
        .unwrap_or(false);

    if prior_manifest.is_some() && !reference_ok {
        log::warn!("compression changed since the prior backup, all files will be copied");
    }

    let timestamp_start = super::time_now();

    let mut label = info_backup.label_new(
        backup_type,
        prior_record.as_ref().map(|record| record.label.as_str()),
        timestamp_start,
    )?;

    // A partial prior attempt with a matching shape can be resumed; an
    // unusable one is cleared out.
    let mut resume_manifest = None;

    for entry in storage.list_opt("backup", InfoLevel::Type)? {
        if entry.info.file_type != FileType::Path || info_backup.get(&entry.name).is_some() {
            continue;
        }

        let base = layout::backup_path(&entry.name);

        let candidate = match Manifest::load(
            &storage,
            &base,
            Some(&entry.name),
            repo.cipher_type,
            info_backup.cipher_pass(),
        ) {
            Ok(manifest) => manifest,
            Err(err) => {
                log::warn!("removing unusable partial backup '{}': {err}", entry.name);
                storage.path_remove(&base, true, false)?;
                continue;
            }
        };

        let matches = options.resume
            && candidate.data.backup_type == backup_type
            && candidate.data.backup_prior
                == prior_record.as_ref().map(|record| record.label.clone())
            && candidate.data.pg_system_id == identity.system_id;

        if matches {
            log::info!("resuming partial backup '{}'", entry.name);
            label = entry.name.clone();
            resume_manifest = Some(candidate);
        } else {
            log::warn!("removing partial backup '{}' that cannot be resumed", entry.name);
            storage.path_remove(&base, true, false)?;
        }
    }

    // Start point for WAL: online backups ask the cluster, offline backups
    // have no archive range.
    let start = if options.online {
        Some(db.backup_start(&label)?)
    } else {
        None
    };

    let lsn_limit = match &start {
        Some(position) => pgvault_repo::parse_lsn(&position.lsn)?,
        None => u64::MAX,
    };

    let timestamp_copy_start = super::time_now();

    let data = ManifestData {
        backup_label: label.clone(),
        backup_prior: prior_record.as_ref().map(|record| record.label.clone()),
        backup_type,
        timestamp_copy_start,
        timestamp_start,
        timestamp_stop: 0,
        archive_start: start.as_ref().map(|position| position.wal_segment.clone()),
        archive_stop: None,
        lsn_start: start.as_ref().map(|position| position.lsn.clone()),
        lsn_stop: None,
        pg_id: info_backup.pg().current().id,
        pg_version: identity.version.clone(),
        pg_system_id: identity.system_id,
        pg_catalog_version: identity.catalog_version,
        pg_control_version: identity.control_version,
    };

    let checksum_page = options.checksum_page && identity.checksum_enabled;
    let block_incr = options.block_incr && repo.cipher_type == CipherType::None;

    if options.block_incr && !block_incr {
        log::warn!("block incremental disabled: repository is encrypted");
    }

    let manifest_options = ManifestOptions {
        archive_check: options.archive_check && options.online,
        archive_copy: options.archive_copy && options.online,
        checksum_page,
        compress_type: options.compress_type,
        compress_level: options.compress_level,
        delta: options.delta,
        hardlink: options.hardlink,
        online: options.online,
        block_incr,
        process_max: global.process_max,
    };

    let mut manifest = Manifest::new(data, manifest_options);

    manifest.add_target(
        MANIFEST_TARGET_PGDATA,
        ManifestTarget {
            target_type: TargetType::Path,
            path: pg_path.to_string(),
            file: None,
            tablespace_id: None,
            tablespace_name: None,
        },
    )?;

    manifest_build(&pg, &mut manifest, "", MANIFEST_TARGET_PGDATA, options.online)?;

    for db_info in db.db_list()? {
        manifest.add_db(
            &db_info.name.clone(),
            ManifestDb {
                id: db_info.oid,
                last_system_id: db_info.last_system_oid,
            },
        )?;
    }

    manifest.validate()?;

    // Decide copy vs reference per file and build the job list.
    let mut jobs: Vec<JobSpec> = Vec::new();
    let mut referenced: u64 = 0;

    let file_names: Vec<String> = manifest.files().map(|(name, _)| name.clone()).collect();

    for name in &file_names {
        let file = manifest.file(name)?.clone();

        // Resumed files that already landed in the repository are kept.
        if let Some(resumed) = &resume_manifest {
            if let Some(prior_file) = resumed.file_opt(name) {
                if prior_file.reference.is_none()
                    && prior_file.checksum.is_some()
                    && prior_file.size == file.size
                    && prior_file.timestamp == file.timestamp
                {
                    let repo_file = layout::backup_file_path(
                        &label,
                        name,
                        repo_compress_type(&manifest, prior_file),
                    );

                    if storage.exists(&repo_file)? {
                        let prior_file = prior_file.clone();
                        manifest.update_file(name, |entry| {
                            entry.checksum = prior_file.checksum.clone();
                            entry.checksum_repo = prior_file.checksum_repo.clone();
                            entry.size_repo = prior_file.size_repo;
                            entry.checksum_page = prior_file.checksum_page;
                            entry.checksum_page_error =
                                prior_file.checksum_page_error.clone();
                            entry.block_incr_size = prior_file.block_incr_size;
                            entry.block_incr_map_size = prior_file.block_incr_map_size;
                        })?;
                        continue;
                    }
                }
            }
        }

        let prior_file = prior_manifest
            .as_ref()
            .and_then(|prior| prior.file_opt(name).cloned());

        if let Some(prior_file) = &prior_file {
            let unchanged = reference_ok
                && prior_file.size == file.size
                && prior_file.checksum.is_some()
                && {
                    if options.delta {
                        // Delta defers the decision to the worker's re-hash.
                        false
                    } else {
                        prior_file.timestamp == file.timestamp
                    }
                };

            if unchanged {
                let reference = prior_file
                    .reference
                    .clone()
                    .unwrap_or_else(|| prior_record.as_ref().unwrap().label.clone());

                manifest.update_file(name, |entry| {
                    entry.reference = Some(reference);
                    entry.checksum = prior_file.checksum.clone();
                    entry.checksum_repo = prior_file.checksum_repo.clone();
                    entry.size_repo = prior_file.size_repo;
                    entry.checksum_page = prior_file.checksum_page;
                    entry.checksum_page_error = prior_file.checksum_page_error.clone();
                    entry.block_incr_size = prior_file.block_incr_size;
                    entry.block_incr_map_size = prior_file.block_incr_map_size;
                })?;
                referenced += 1;
                continue;
            }
        }

        // Zero-length files need no copy at all.
        if file.size == 0 {
            manifest.update_file(name, |entry| {
                entry.checksum = Some(SHA1_EMPTY.to_string());
                entry.size_repo = 0;
            })?;
            continue;
        }

        let block_spec = if block_incr {
            block_incr_size_for(file.size).map(|block_size| {
                // The prior map bounds what must be recopied; it only
                // applies while the block size tier is unchanged.
                let prior_map = prior_file.as_ref().and_then(|prior| {
                    if prior.block_incr_size != Some(block_size) {
                        return None;
                    }

                    let map_size = prior.block_incr_map_size?;
                    let reference = prior
                        .reference
                        .clone()
                        .unwrap_or_else(|| prior_record.as_ref().unwrap().label.clone());

                    Some((
                        layout::backup_file_path(&reference, name, pgvault_api_types::CompressType::None),
                        prior.size_repo.saturating_sub(map_size),
                        map_size,
                    ))
                });

                BlockIncrSpec {
                    block_size,
                    map_file: prior_map.as_ref().map(|(file, _, _)| file.clone()),
                    map_offset: prior_map.as_ref().map(|(_, offset, _)| *offset).unwrap_or(0),
                    map_size: prior_map.as_ref().map(|(_, _, size)| *size).unwrap_or(0),
                }
            })
        } else {
            None
        };

        jobs.push(JobSpec {
            name: name.clone(),
            size: file.size,
            prior_checksum: if options.delta && reference_ok {
                prior_file.and_then(|prior| {
                    (prior.size == file.size).then_some(prior.checksum).flatten()
                })
            } else {
                None
            },
            block_incr: block_spec,
        });
    }

    let (total_bytes, _) = manifest.totals();
    let copy_bytes: u64 = jobs.iter().map(|job| job.size).sum();

    log::info!(
        "backup '{label}' starting: {} files, {} to copy",
        file_names.len(),
        copy_bytes
    );

    // Per-target queues, largest files first so the tail of the run is
    // short jobs.
    let target_names: Vec<String> = manifest
        .targets()
        .filter(|(_, target)| target.target_type == TargetType::Path || target.tablespace_id.is_some())
        .map(|(name, _)| name.clone())
        .collect();

    let mut queues: Vec<Vec<JobSpec>> = target_names.iter().map(|_| Vec::new()).collect();

    for job in jobs {
        let queue_idx = target_names
            .iter()
            .position(|target| {
                target != MANIFEST_TARGET_PGDATA && job.name.starts_with(target.as_str())
            })
            .or_else(|| target_names.iter().position(|t| t == MANIFEST_TARGET_PGDATA))
            .unwrap_or(0);
        queues[queue_idx].push(job);
    }

    for queue in &mut queues {
        queue.sort_by(|a, b| b.size.cmp(&a.size));
    }

    let mut queues: Vec<std::collections::VecDeque<JobSpec>> =
        queues.into_iter().map(Into::into).collect();

    let worker_config = WorkerConfig {
        repo_root: repo.stanza_root(),
        pg_root: pg_path.to_string(),
        cipher_type: repo.cipher_type,
        cipher_pass: info_backup.cipher_pass().map(str::to_string),
        compress_type: options.compress_type,
        compress_level: options.compress_level,
    };

    let (clients, pool) = WorkerPool::spawn(global.process_max, &worker_config, global)?;

    let compress_type = options.compress_type;
    let label_for_jobs = label.clone();

    let executor = ParallelExecutor::new(
        clients,
        global.protocol_timeout,
        global.retry_interval.clone(),
        move |worker_idx| {
            let queue_total = queues.len();

            for offset in 0..queue_total {
                let queue = &mut queues[(worker_idx + offset) % queue_total];

                if let Some(job) = queue.pop_front() {
                    let compress = job.block_incr.is_none();
                    let repo_file = layout::backup_file_path(
                        &label_for_jobs,
                        &job.name,
                        if compress { compress_type } else { pgvault_api_types::CompressType::None },
                    );

                    let block_incr = match &job.block_incr {
                        Some(spec) => Value::obj([
                            ("block-size", Value::from(spec.block_size)),
                            ("map-file", spec.map_file.clone().into()),
                            ("map-offset", Value::from(spec.map_offset)),
                            ("map-size", Value::from(spec.map_size)),
                        ]),
                        None => Value::Null,
                    };

                    let param = Value::obj([
                        ("source-file", Value::from(source_path(&job.name))),
                        ("repo-file", Value::from(repo_file)),
                        ("label", Value::from(label_for_jobs.as_str())),
                        ("compress", Value::Bool(compress)),
                        (
                            "checksum-page",
                            Value::Bool(checksum_page && page_checksum_eligible(&job.name)),
                        ),
                        ("lsn-limit", Value::from(lsn_limit)),
                        ("prior-checksum", job.prior_checksum.clone().into()),
                        ("block-incr", block_incr),
                    ]);

                    return Ok(Some(ParallelJob::new(
                        Value::from(job.name.as_str()),
                        Command::new("backup-file", param),
                    )));
                }
            }

            Ok(None)
        },
    );

    let mut copied: u64 = 0;
    let mut copied_bytes: u64 = 0;
    let mut removed: Vec<String> = Vec::new();
    let prior_label = prior_record.as_ref().map(|record| record.label.clone());

    {
        let manifest = &mut manifest;
        let removed = &mut removed;
        let referenced = &mut referenced;

        executor.run(|done| {
            let name = done.key.as_str()?.to_string();
            // A failed file makes the manifest incomplete; abort the backup.
            let result = done.result?;

            match result.get("result").as_str()? {
                "missing" => {
                    log::info!("skip '{name}': removed by the cluster during backup");
                    removed.push(name);
                }
                "reference" => {
                    let prior = prior_manifest
                        .as_ref()
                        .and_then(|prior| prior.file_opt(&name).cloned())
                        .ok_or_else(|| Error::assert("reference result without prior"))?;
                    let reference = prior
                        .reference
                        .clone()
                        .unwrap_or_else(|| prior_label.clone().unwrap_or_default());

                    manifest.update_file(&name, |entry| {
                        entry.reference = Some(reference);
                        entry.checksum = prior.checksum.clone();
                        entry.checksum_repo = prior.checksum_repo.clone();
                        entry.size_repo = prior.size_repo;
                        entry.checksum_page = prior.checksum_page;
                        entry.checksum_page_error = prior.checksum_page_error.clone();
                        entry.block_incr_size = prior.block_incr_size;
                        entry.block_incr_map_size = prior.block_incr_map_size;
                    })?;
                    *referenced += 1;
                }
                "copied" => {
                    let checksum = result.get("checksum").as_str()?.to_string();
                    let size = result.get("size").as_u64()?;
                    let size_repo = result.get("repo-size").as_u64()?;
                    let checksum_repo = result
                        .get("checksum-repo")
                        .as_opt_str()?
                        .map(str::to_string);

                    let page_valid = match result.get("page-valid") {
                        Value::Null => None,
                        value => Some(value.as_bool()?),
                    };
                    let page_errors: Vec<u64> = match result.get("page-errors") {
                        Value::Null => Vec::new(),
                        value => value
                            .as_array()?
                            .iter()
                            .map(|page| page.as_u64())
                            .collect::<Result<_>>()?,
                    };

                    if page_valid == Some(false) {
                        log::warn!(
                            "invalid page checksums found in '{name}': {page_errors:?}"
                        );
                    }

                    let block_incr_size = match result.get("block-size") {
                        Value::Null => None,
                        value => Some(value.as_u64()?),
                    };
                    let block_incr_map_size = match result.get("map-size") {
                        Value::Null => None,
                        value => Some(value.as_u64()?),
                    };

                    manifest.update_file(&name, |entry| {
                        entry.checksum = Some(checksum);
                        entry.checksum_repo = checksum_repo;
                        entry.size = size;
                        entry.size_repo = size_repo;
                        entry.checksum_page = page_valid;
                        entry.checksum_page_error = page_errors;
                        entry.block_incr_size = block_incr_size;
                        entry.block_incr_map_size = block_incr_map_size;
                    })?;

                    copied += 1;
                    copied_bytes += size;
                }
                other => {
                    return Err(Error::protocol(format!(
                        "unknown backup-file result '{other}'"
                    )))
                }
            }

            if total_bytes > 0 {
                let _ = lock.write_progress(copied_bytes as f64 * 100.0 / total_bytes as f64);
            }

            Ok(())
        })?;
    }

    pool.join()?;

    for name in removed {
        manifest.remove_file(&name);
    }

    // Stop point, archive checks and the optional WAL copy.
    let stop = if options.online {
        Some(db.backup_stop()?)
    } else {
        None
    };

    if let Some(stop) = &stop {
        manifest.data.archive_stop = Some(stop.wal_segment.clone());
        manifest.data.lsn_stop = Some(stop.lsn.clone());

        let archive_id = info_archive.archive_id();

        if options.archive_check {
            wait_for_segment(&storage, &archive_id, &stop.wal_segment, options.archive_timeout)?;
        }

        if options.archive_copy {
            archive_copy(
                repo,
                &storage,
                &info_archive,
                &mut manifest,
                &label,
                identity.wal_segment_size,
                info_backup.cipher_pass(),
            )?;
        }
    }

    manifest.data.timestamp_stop = super::time_now();

    // Sizes: the full cluster vs what this backup actually copied.
    let mut size: u64 = 0;
    let mut size_delta: u64 = 0;
    let mut repo_size: u64 = 0;
    let mut repo_size_delta: u64 = 0;

    for (_, file) in manifest.files() {
        size += file.size;
        repo_size += file.size_repo;

        if file.reference.is_none() {
            size_delta += file.size;
            repo_size_delta += file.size_repo;
        }
    }

    manifest.save(
        &storage,
        &layout::backup_path(&label),
        repo.cipher_type,
        info_backup.cipher_pass(),
    )?;

    let record = BackupRecord {
        label: label.clone(),
        backup_type,
        backup_prior: prior_record.as_ref().map(|record| record.label.clone()),
        backup_archive_start: manifest.data.archive_start.clone(),
        backup_archive_stop: manifest.data.archive_stop.clone(),
        backup_lsn_start: manifest.data.lsn_start.clone(),
        backup_lsn_stop: manifest.data.lsn_stop.clone(),
        backup_timestamp_start: timestamp_start,
        backup_timestamp_stop: manifest.data.timestamp_stop,
        backup_info_size: size,
        backup_info_size_delta: size_delta,
        backup_info_repo_size: repo_size,
        backup_info_repo_size_delta: repo_size_delta,
        db_id: info_backup.pg().current().id,
        backup_reference: manifest.references(),
        option_archive_check: manifest.options.archive_check,
        option_archive_copy: manifest.options.archive_copy,
        option_backup_standby: false,
        option_checksum_page: checksum_page,
        option_compress: options.compress_type != pgvault_api_types::CompressType::None,
        option_delta: options.delta,
        option_hardlink: options.hardlink,
        option_online: options.online,
        option_block_incr: block_incr,
    };

    info_backup.add(record)?;
    info_backup.save(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;

    log::info!(
        "backup '{label}' complete: {copied} copied, {referenced} referenced in {:.1}s",
        started.elapsed().as_secs_f64()
    );

    Ok(BackupResult {
        label,
        files_copied: copied,
        files_referenced: referenced,
        size,
        repo_size,
    })
}

fn repo_compress_type(manifest: &Manifest, file: &ManifestFile) -> pgvault_api_types::CompressType {
    if file.block_incr_map_size.is_some() {
        pgvault_api_types::CompressType::None
    } else {
        manifest.options.compress_type
    }
}

/// Recursive enumeration of one target into the manifest.
fn manifest_build(
    pg: &Storage,
    manifest: &mut Manifest,
    rel: &str,
    prefix: &str,
    online: bool,
) -> Result<()> {
    let manifest_name = |entry_name: &str| -> String {
        if rel.is_empty() {
            format!("{prefix}/{entry_name}")
        } else {
            format!("{prefix}/{rel}/{entry_name}")
        }
    };

    if rel.is_empty() {
        let info = pg.info_follow("", InfoLevel::Detail)?;

        if !info.exists {
            return Err(Error::new(
                ErrorKind::PathMissing,
                format!("data directory '{}' does not exist", pg.root()),
            ));
        }

        manifest.add_path(
            prefix,
            ManifestPath {
                mode: info.mode,
                user: info.user,
                group: info.group,
            },
        )?;
    }

    for entry in pg.list(rel, InfoLevel::Detail)? {
        let name = manifest_name(&entry.name);
        let child_rel = if rel.is_empty() {
            entry.name.clone()
        } else {
            format!("{rel}/{}", entry.name)
        };

        match entry.info.file_type {
            FileType::File => {
                if SKIP_FILES.contains(&entry.name.as_str())
                    || entry.name.starts_with("pgsql_tmp")
                {
                    continue;
                }

                manifest.add_file(
                    &name,
                    ManifestFile {
                        size: entry.info.size,
                        size_repo: entry.info.size,
                        timestamp: entry.info.time,
                        mode: entry.info.mode,
                        user: entry.info.user,
                        group: entry.info.group,
                        ..Default::default()
                    },
                )?;
            }
            FileType::Path => {
                manifest.add_path(
                    &name,
                    ManifestPath {
                        mode: entry.info.mode,
                        user: entry.info.user,
                        group: entry.info.group,
                    },
                )?;

                let skip_content = (rel.is_empty()
                    && (SKIP_DIR_CONTENT.contains(&entry.name.as_str())
                        || (online && entry.name == "pg_wal")))
                    || entry.name.starts_with("pgsql_tmp");

                if !skip_content {
                    manifest_build(pg, manifest, &child_rel, prefix, online)?;
                }
            }
            FileType::Link => {
                let destination = entry.info.link_destination.clone().unwrap_or_default();

                manifest.add_link(
                    &name,
                    ManifestLink {
                        destination: destination.clone(),
                        user: entry.info.user.clone(),
                        group: entry.info.group.clone(),
                    },
                )?;

                let dest_info = pg.info_follow(&child_rel, InfoLevel::Detail)?;

                if !dest_info.exists {
                    return Err(Error::new(
                        ErrorKind::FileMissing,
                        format!("link '{name}' destination '{destination}' does not exist"),
                    ));
                }

                if dest_info.file_type == FileType::Path {
                    let tablespace_id = if rel == MANIFEST_TARGET_TBLSPC {
                        Some(parse_tablespace_oid(&entry.name)?)
                    } else {
                        None
                    };

                    manifest.add_target(
                        &name,
                        ManifestTarget {
                            target_type: TargetType::Link,
                            path: destination,
                            file: None,
                            tablespace_id,
                            tablespace_name: tablespace_id.map(|id| format!("ts{id}")),
                        },
                    )?;

                    manifest.add_path(
                        &name,
                        ManifestPath {
                            mode: dest_info.mode,
                            user: dest_info.user,
                            group: dest_info.group,
                        },
                    )?;

                    // A linked pg_wal is runtime state like the plain
                    // directory.
                    let skip_link_content = rel.is_empty() && online && entry.name == "pg_wal";

                    if !skip_link_content {
                        manifest_build(pg, manifest, &child_rel, prefix, online)?;
                    }
                } else {
                    // File link: the file itself is backed up, the link is
                    // recreated at restore.
                    let (link_path, file_name) = match destination.rsplit_once('/') {
                        Some((path, file)) => (path.to_string(), file.to_string()),
                        None => (destination.clone(), entry.name.clone()),
                    };

                    manifest.add_target(
                        &name,
                        ManifestTarget {
                            target_type: TargetType::Link,
                            path: link_path,
                            file: Some(file_name),
                            tablespace_id: None,
                            tablespace_name: None,
                        },
                    )?;

                    manifest.add_file(
                        &name,
                        ManifestFile {
                            size: dest_info.size,
                            size_repo: dest_info.size,
                            timestamp: dest_info.time,
                            mode: dest_info.mode,
                            user: dest_info.user,
                            group: dest_info.group,
                            ..Default::default()
                        },
                    )?;
                }
            }
            FileType::Special => {
                log::warn!("skip special file '{}'", name);
            }
        }
    }

    Ok(())
}

/// Poll the archive until the segment arrives or the timeout expires.
fn wait_for_segment(
    storage: &Storage,
    archive_id: &str,
    segment: &str,
    timeout: std::time::Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let dir = layout::wal_segment_dir(archive_id, segment);

    loop {
        let found = storage
            .list_opt(&dir, InfoLevel::Type)?
            .into_iter()
            .any(|entry| entry.name.starts_with(&format!("{segment}-")));

        if found {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "wal segment {segment} was not archived within {}ms\n\
                 HINT: is archive_command configured and working?",
                timeout.as_millis()
            )));
        }

        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}

/// Copy the backup's WAL range into the backup itself so it can be restored
/// without the archive.
fn archive_copy(
    repo: &RepoConfig,
    storage: &Storage,
    info_archive: &InfoArchive,
    manifest: &mut Manifest,
    label: &str,
    wal_segment_size: u64,
    backup_cipher_pass: Option<&str>,
) -> Result<()> {
    let (start, stop) = match (&manifest.data.archive_start, &manifest.data.archive_stop) {
        (Some(start), Some(stop)) => (WalSegment::parse(start)?, WalSegment::parse(stop)?),
        _ => return Ok(()),
    };

    let archive_id = info_archive.archive_id();
    let timestamp = manifest.data.timestamp_stop.max(super::time_now());

    let mut segment = start;

    loop {
        let name = segment.to_string();
        let dir = layout::wal_segment_dir(&archive_id, &name);

        let file = storage
            .list_opt(&dir, InfoLevel::Type)?
            .into_iter()
            .find(|entry| entry.name.starts_with(&format!("{name}-")))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::FileMissing,
                    format!("wal segment {name} is missing from the archive"),
                )
            })?;

        let (_, checksum) = pgvault_repo::segment_file_split(&file.name)?;
        let (_, archive_compress) = pgvault_api_types::CompressType::from_name(&file.name);

        // Re-encode: archive files carry the archive subpass, the backup
        // carries its own.
        let mut read = storage.open_read(
            &format!("{dir}/{}", file.name),
            ReadOptions::default(),
        )?;

        {
            use pgvault_storage::filter::{CipherFilter, CipherMode, DecompressFilter};

            let filters = read.filters_mut();

            if repo.cipher_type != CipherType::None {
                let pass = info_archive.cipher_pass().ok_or_else(|| {
                    Error::new(ErrorKind::Crypto, "archive cipher passphrase not set")
                })?;
                filters.add(Box::new(CipherFilter::new(
                    CipherMode::Decrypt,
                    repo.cipher_type,
                    pass.as_bytes(),
                )?));
            }

            if archive_compress != pgvault_api_types::CompressType::None {
                filters.add(Box::new(DecompressFilter::new(archive_compress)?));
            }

            filters.add(Box::new(pgvault_storage::filter::SizeFilter::new()));
        }

        let manifest_name = format!("pg_data/pg_wal/{name}");
        let repo_file =
            layout::backup_file_path(label, &manifest_name, manifest.options.compress_type);

        let mut write = storage.new_write(&repo_file, WriteOptions::default())?;

        {
            use pgvault_storage::filter::{CipherFilter, CipherMode, CompressFilter};

            let filters = write.filters_mut();

            if manifest.options.compress_type != pgvault_api_types::CompressType::None {
                filters.add(Box::new(CompressFilter::new(
                    manifest.options.compress_type,
                    manifest.options.compress_level,
                )?));
            }

            if repo.cipher_type != CipherType::None {
                let pass = backup_cipher_pass.ok_or_else(|| {
                    Error::new(ErrorKind::Crypto, "backup cipher passphrase not set")
                })?;
                filters.add(Box::new(CipherFilter::new(
                    CipherMode::Encrypt,
                    repo.cipher_type,
                    pass.as_bytes(),
                )?));
            }

            filters.add(Box::new(pgvault_storage::filter::SizeFilter::new()));
        }

        let (read_filters, write_filters) = Storage::copy(read, write)?;
        let size = read_filters.result_required("size")?.as_u64()?;
        let size_repo = write_filters.result_required("size")?.as_u64()?;

        if size != wal_segment_size {
            log::warn!("wal segment {name} is {size} bytes, expected {wal_segment_size}");
        }

        if manifest.path("pg_data/pg_wal").is_none() {
            let base = manifest
                .path("pg_data")
                .cloned()
                .unwrap_or(pgvault_repo::ManifestPath {
                    mode: 0o700,
                    user: None,
                    group: None,
                });
            manifest.add_path("pg_data/pg_wal", base)?;
        }

        manifest.add_file(
            &manifest_name,
            ManifestFile {
                size,
                size_repo,
                timestamp,
                mode: 0o600,
                user: manifest.path("pg_data").and_then(|path| path.user.clone()),
                group: manifest.path("pg_data").and_then(|path| path.group.clone()),
                checksum: Some(checksum),
                ..Default::default()
            },
        )?;

        if segment == stop {
            break;
        }

        segment = segment.next(wal_segment_size);
    }

    Ok(())
}

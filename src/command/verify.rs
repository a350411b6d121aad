//! Verify command.
//!
//! Cross-checks the info files, walks the archive and every backup, runs
//! checksum jobs over the files and reconciles WAL coverage against backup
//! ranges. The output is a structured report; nothing in the repository is
//! modified.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;

use pgvault_api_types::{Error, ErrorKind, Result};
use pgvault_protocol::{Command, ParallelExecutor, ParallelJob, Value};
use pgvault_repo::{
    layout, segment_file_split, wal_ranges, InfoArchive, InfoBackup, Manifest, WalRange,
    WalSegment, WAL_SEGMENT_SIZE_DEFAULT,
};
use pgvault_storage::{FileType, InfoLevel};

use crate::config::{GlobalConfig, RepoConfig, VerifyOptions};
use crate::workers::{WorkerConfig, WorkerPool};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyWalRange {
    pub start: String,
    pub stop: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyArchiveResult {
    pub archive_id: String,
    pub total: u64,
    pub missing: u64,
    pub checksum_invalid: u64,
    pub size_invalid: u64,
    pub other: u64,
    pub duplicate: u64,
    pub ranges: Vec<VerifyWalRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyBackupStatus {
    Valid,
    Invalid,
    MissingManifest,
    InProgress,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBackupResult {
    pub label: String,
    pub status: VerifyBackupStatus,
    pub total: u64,
    pub missing: u64,
    pub checksum_invalid: u64,
    pub size_invalid: u64,
    pub wal_invalid: u64,
    pub other: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    pub status: String,
    pub warnings: Vec<String>,
    pub archives: Vec<VerifyArchiveResult>,
    pub backups: Vec<VerifyBackupResult>,
}

impl VerifyResult {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Clone)]
enum JobOwner {
    Archive { archive_id: String, segment: WalSegment },
    Backup { label: String },
}

struct VerifyJob {
    owner: JobOwner,
    param: Value,
}

pub fn verify(
    repo: &RepoConfig,
    global: &GlobalConfig,
    options: &VerifyOptions,
) -> Result<VerifyResult> {
    let storage = repo.storage();
    let mut warnings = Vec::new();

    // Info files: main or copy must load; disagreement is reported.
    let (info_backup, mut backup_warnings) = InfoBackup::load_checked(
        &storage,
        repo.cipher_type,
        repo.cipher_pass.as_deref(),
    )?;
    warnings.append(&mut backup_warnings);

    let (info_archive, mut archive_warnings) = InfoArchive::load_checked(
        &storage,
        repo.cipher_type,
        repo.cipher_pass.as_deref(),
    )?;
    warnings.append(&mut archive_warnings);

    if let Err(err) = info_backup.pg().check_match(info_archive.pg()) {
        warnings.push(err.message().to_string());
    }

    let mut jobs: VecDeque<VerifyJob> = VecDeque::new();

    // Archive walk: collect segments, flag duplicates, build ranges.
    let mut archives: BTreeMap<String, VerifyArchiveResult> = BTreeMap::new();
    let mut archive_segments: BTreeMap<String, Vec<WalSegment>> = BTreeMap::new();

    for archive_entry in storage.list_opt("archive", InfoLevel::Type)? {
        if archive_entry.info.file_type != FileType::Path {
            continue;
        }

        let archive_id = archive_entry.name;
        let mut segments: Vec<WalSegment> = Vec::new();
        let mut seen: BTreeMap<WalSegment, Vec<String>> = BTreeMap::new();
        let mut duplicate = 0u64;

        for prefix in storage.list_opt(&layout::archive_path(&archive_id), InfoLevel::Type)? {
            if prefix.info.file_type != FileType::Path {
                continue;
            }

            let dir = format!("{}/{}", layout::archive_path(&archive_id), prefix.name);

            for file in storage.list_opt(&dir, InfoLevel::Type)? {
                match segment_file_split(&file.name) {
                    Ok((segment, _)) => {
                        seen.entry(segment).or_default().push(format!("{dir}/{}", file.name));
                    }
                    Err(_) => warnings.push(format!(
                        "invalid file name '{}' in archive {archive_id}",
                        file.name
                    )),
                }
            }
        }

        for (segment, files) in seen {
            if files.len() > 1 {
                // Duplicates cannot be trusted; drop the segment from the
                // processing set entirely.
                duplicate += 1;
                warnings.push(format!(
                    "duplicate wal segment '{segment}' in archive {archive_id}"
                ));
                continue;
            }

            segments.push(segment);

            let file = &files[0];
            let (_, checksum) = segment_file_split(file.rsplit('/').next().unwrap_or(file))?;
            let (_, compress_type) = pgvault_api_types::CompressType::from_name(file);

            jobs.push_back(VerifyJob {
                owner: JobOwner::Archive {
                    archive_id: archive_id.clone(),
                    segment,
                },
                param: Value::obj([
                    ("file", Value::from(file.as_str())),
                    ("checksum", Value::from(checksum)),
                    // Segment size varies by cluster and is not recorded in
                    // the archive, so only content is checked.
                    ("size", Value::Null),
                    (
                        "compress",
                        Value::Bool(compress_type != pgvault_api_types::CompressType::None),
                    ),
                ]),
            });
        }

        segments.sort();
        let ranges = wal_ranges(&segments, WAL_SEGMENT_SIZE_DEFAULT);

        archives.insert(
            archive_id.clone(),
            VerifyArchiveResult {
                archive_id: archive_id.clone(),
                total: segments.len() as u64,
                missing: 0,
                checksum_invalid: 0,
                size_invalid: 0,
                other: 0,
                duplicate,
                ranges: ranges
                    .iter()
                    .map(|range| VerifyWalRange {
                        start: range.start.to_string(),
                        stop: range.stop.to_string(),
                    })
                    .collect(),
            },
        );
        archive_segments.insert(archive_id, segments);
    }

    // Backup walk.
    let mut backups: BTreeMap<String, VerifyBackupResult> = BTreeMap::new();
    let mut backup_meta: BTreeMap<String, (Option<String>, Option<String>, u32)> = BTreeMap::new();

    let mut backup_labels: Vec<String> = storage
        .list_opt("backup", InfoLevel::Type)?
        .into_iter()
        .filter(|entry| entry.info.file_type == FileType::Path)
        .map(|entry| entry.name)
        .collect();
    backup_labels.sort();

    if let Some(set) = &options.set {
        if !backup_labels.contains(set) {
            return Err(Error::new(
                ErrorKind::BackupSetInvalid,
                format!("backup set '{set}' does not exist"),
            ));
        }

        backup_labels.retain(|label| label == set);
    }

    // The newest label missing from backup.info may simply still be running.
    let in_progress_label = backup_labels
        .iter()
        .filter(|label| info_backup.get(label).is_none())
        .max()
        .cloned();

    for label in &backup_labels {
        let record = info_backup.get(label);

        let manifest = Manifest::load(
            &storage,
            &layout::backup_path(label),
            Some(label),
            repo.cipher_type,
            info_backup.cipher_pass(),
        );

        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(err) => {
                let status = if record.is_none() && Some(label) == in_progress_label.as_ref() {
                    VerifyBackupStatus::InProgress
                } else {
                    warnings.push(format!("unable to load manifest for '{label}': {err}"));
                    VerifyBackupStatus::MissingManifest
                };

                backups.insert(
                    label.clone(),
                    VerifyBackupResult {
                        label: label.clone(),
                        status,
                        total: 0,
                        missing: 0,
                        checksum_invalid: 0,
                        size_invalid: 0,
                        wal_invalid: 0,
                        other: 0,
                    },
                );
                continue;
            }
        };

        let mut result = VerifyBackupResult {
            label: label.clone(),
            status: VerifyBackupStatus::Valid,
            total: 0,
            missing: 0,
            checksum_invalid: 0,
            size_invalid: 0,
            wal_invalid: 0,
            other: 0,
        };

        // The manifest must describe a cluster this repository knows.
        let identity_known = info_archive.pg().history().iter().any(|entry| {
            entry.version == manifest.data.pg_version
                && entry.system_id == manifest.data.pg_system_id
        });

        if !identity_known {
            warnings.push(format!(
                "backup '{label}' was taken from a cluster unknown to this repository"
            ));
            result.status = VerifyBackupStatus::Invalid;
            result.other += 1;
        }

        for (name, file) in manifest.files() {
            if file.size == 0 {
                continue;
            }

            result.total += 1;

            let read_label = file.reference.as_deref().unwrap_or(label);

            // Prefer the stored-bytes checksum when the repo copy differs
            // from the source (compressed, encrypted or block mapped).
            let (param, checksum, size) = if let Some(checksum_repo) = &file.checksum_repo {
                (
                    vec![("verify-repo", Value::Bool(true))],
                    checksum_repo.clone(),
                    file.size_repo,
                )
            } else {
                match &file.checksum {
                    Some(checksum) => (Vec::new(), checksum.clone(), file.size),
                    None => {
                        warnings.push(format!("file '{name}' in '{label}' has no checksum"));
                        result.other += 1;
                        result.status = VerifyBackupStatus::Invalid;
                        continue;
                    }
                }
            };

            let compress_type = if file.block_incr_map_size.is_some() {
                pgvault_api_types::CompressType::None
            } else {
                manifest.options.compress_type
            };

            let verify_repo = !param.is_empty();
            let repo_file = layout::backup_file_path(read_label, name, compress_type);

            let mut fields = vec![
                ("file", Value::from(repo_file)),
                ("checksum", Value::from(checksum)),
                ("size", Value::from(size)),
                (
                    "compress",
                    Value::Bool(
                        !verify_repo
                            && compress_type != pgvault_api_types::CompressType::None,
                    ),
                ),
            ];
            fields.extend(param);

            if let (Some(bundle_id), Some(bundle_offset)) = (file.bundle_id, file.bundle_offset) {
                let _ = bundle_id;
                fields.push(("offset", Value::from(bundle_offset)));
                fields.push(("limit", Value::from(file.size_repo)));
            }

            jobs.push_back(VerifyJob {
                owner: JobOwner::Backup {
                    label: label.clone(),
                },
                param: Value::Object(
                    fields
                        .into_iter()
                        .map(|(key, value)| (key.to_string(), value))
                        .collect(),
                ),
            });
        }

        backup_meta.insert(
            label.clone(),
            (
                manifest.data.archive_start.clone(),
                manifest.data.archive_stop.clone(),
                manifest.data.pg_id,
            ),
        );
        backups.insert(label.clone(), result);
    }

    // Run the verify jobs.
    let worker_config = WorkerConfig {
        repo_root: repo.stanza_root(),
        pg_root: repo.stanza_root(),
        cipher_type: repo.cipher_type,
        cipher_pass: info_backup.cipher_pass().map(str::to_string),
        compress_type: pgvault_api_types::CompressType::Gz,
        compress_level: None,
    };

    // Archive files are encrypted with the archive subpass, backup files
    // with the backup subpass; run each class under its own worker pool.
    let mut invalid_segments: BTreeMap<String, BTreeSet<WalSegment>> = BTreeMap::new();

    let (archive_jobs, backup_jobs): (Vec<VerifyJob>, Vec<VerifyJob>) = jobs
        .into_iter()
        .partition(|job| matches!(job.owner, JobOwner::Archive { .. }));

    let archive_worker_config = WorkerConfig {
        cipher_pass: info_archive.cipher_pass().map(str::to_string),
        ..worker_config.clone()
    };

    run_jobs(
        global,
        &archive_worker_config,
        archive_jobs,
        &mut archives,
        &mut backups,
        &mut invalid_segments,
    )?;
    run_jobs(
        global,
        &worker_config,
        backup_jobs,
        &mut archives,
        &mut backups,
        &mut invalid_segments,
    )?;

    // Reconcile WAL coverage with backup ranges: a gap or an invalid
    // segment inside a backup's range invalidates the backup.
    for (archive_id, segments) in &archive_segments {
        let history_entry = info_archive
            .pg()
            .history()
            .iter()
            .find(|entry| entry.archive_id() == *archive_id);

        let pg_id = match history_entry {
            Some(entry) => entry.id,
            None => {
                warnings.push(format!("archive id {archive_id} is not in the history"));
                continue;
            }
        };

        let ranges = wal_ranges(segments, WAL_SEGMENT_SIZE_DEFAULT);
        let empty = BTreeSet::new();
        let invalid = invalid_segments.get(archive_id).unwrap_or(&empty);

        for (label, (start, stop, backup_pg_id)) in &backup_meta {
            if *backup_pg_id != pg_id {
                continue;
            }

            let (start, stop) = match (start, stop) {
                (Some(start), Some(stop)) => {
                    (WalSegment::parse(start)?, WalSegment::parse(stop)?)
                }
                _ => continue,
            };

            let backup_range = WalRange { start, stop };

            let missing = missing_in_range(&backup_range, &ranges, invalid);

            if missing > 0 {
                if let Some(result) = backups.get_mut(label) {
                    result.wal_invalid += missing;
                    result.status = VerifyBackupStatus::Invalid;
                }
            }
        }
    }

    let error = backups.values().any(|backup| {
        backup.status == VerifyBackupStatus::Invalid
            || backup.status == VerifyBackupStatus::MissingManifest
    }) || archives.values().any(|archive| {
        archive.missing + archive.checksum_invalid + archive.size_invalid + archive.other
            + archive.duplicate
            > 0
    });

    Ok(VerifyResult {
        status: if error { "error" } else { "ok" }.to_string(),
        warnings,
        archives: archives.into_values().collect(),
        backups: backups.into_values().collect(),
    })
}

/// Count segments of `backup_range` not covered by a continuous range or
/// flagged invalid.
fn missing_in_range(
    backup_range: &WalRange,
    ranges: &[WalRange],
    invalid: &BTreeSet<WalSegment>,
) -> u64 {
    let mut missing = 0;
    let mut segment = backup_range.start;

    loop {
        let covered = ranges
            .iter()
            .any(|range| range.contains(&segment, WAL_SEGMENT_SIZE_DEFAULT));

        if !covered || invalid.contains(&segment) {
            missing += 1;
        }

        if segment == backup_range.stop {
            break;
        }

        segment = segment.next(WAL_SEGMENT_SIZE_DEFAULT);
    }

    missing
}

fn run_jobs(
    global: &GlobalConfig,
    worker_config: &WorkerConfig,
    jobs: Vec<VerifyJob>,
    archives: &mut BTreeMap<String, VerifyArchiveResult>,
    backups: &mut BTreeMap<String, VerifyBackupResult>,
    invalid_segments: &mut BTreeMap<String, BTreeSet<WalSegment>>,
) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    let (clients, pool) = WorkerPool::spawn(global.process_max, worker_config, global)?;

    // Owners indexed by job id so results map back to their bucket.
    let owners: Vec<JobOwner> = jobs.iter().map(|job| job.owner.clone()).collect();
    let mut queue: VecDeque<(usize, Value)> = jobs
        .into_iter()
        .enumerate()
        .map(|(idx, job)| (idx, job.param))
        .collect();

    let executor = ParallelExecutor::new(
        clients,
        global.protocol_timeout,
        global.retry_interval.clone(),
        move |_| {
            Ok(queue.pop_front().map(|(idx, param)| {
                ParallelJob::new(Value::UInt(idx as u64), Command::new("verify-file", param))
            }))
        },
    );

    executor.run(|done| {
        let idx = done.key.as_u64()? as usize;
        let owner = owners
            .get(idx)
            .ok_or_else(|| Error::assert("verify job index out of range"))?;
        let owner = owner.clone();
        let owner = &owner;

        let result = done.result?;
        let reason = result.get("result").as_str()?;

        if let Some(message) = result.get("message").as_opt_str()? {
            log::debug!("verify: {message}");
        }

        match owner {
            JobOwner::Archive {
                archive_id,
                segment,
            } => {
                if let Some(archive) = archives.get_mut(archive_id) {
                    match reason {
                        "ok" => (),
                        "fileMissing" => archive.missing += 1,
                        "checksumMismatch" => archive.checksum_invalid += 1,
                        "sizeInvalid" => archive.size_invalid += 1,
                        _ => archive.other += 1,
                    }

                    if reason != "ok" {
                        invalid_segments
                            .entry(archive_id.clone())
                            .or_default()
                            .insert(*segment);
                    }
                }
            }
            JobOwner::Backup { label } => {
                if let Some(backup) = backups.get_mut(label) {
                    match reason {
                        "ok" => (),
                        "fileMissing" => backup.missing += 1,
                        "checksumMismatch" => backup.checksum_invalid += 1,
                        "sizeInvalid" => backup.size_invalid += 1,
                        _ => backup.other += 1,
                    }

                    if reason != "ok" {
                        backup.status = VerifyBackupStatus::Invalid;
                    }
                }
            }
        }

        Ok(())
    })?;

    pool.join()
}

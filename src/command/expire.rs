//! Expire command: enforce retention by removing old backups and the WAL
//! that only they needed.
//!
//! `backup.info` is updated before any file is deleted, so a crash
//! mid-expire leaves unreferenced files (cleaned up next run) rather than
//! referenced-but-missing ones.

use std::collections::BTreeSet;

use pgvault_api_types::{BackupType, Result};
use pgvault_repo::{exec_id_gen, layout, lock_acquire, LockType, WalSegment};
use pgvault_storage::{FileType, InfoLevel};

use crate::config::{ExpireOptions, GlobalConfig, RepoConfig};

pub struct ExpireResult {
    pub backups_removed: Vec<String>,
    pub wal_removed: u64,
}

pub fn expire(
    repo: &RepoConfig,
    global: &GlobalConfig,
    options: &ExpireOptions,
) -> Result<ExpireResult> {
    let exec_id = exec_id_gen();
    let _lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Backup,
        &exec_id,
        global.lock_timeout,
        true,
    )?;

    let storage = repo.storage();
    let mut info_backup = pgvault_repo::InfoBackup::load(
        &storage,
        repo.cipher_type,
        repo.cipher_pass.as_deref(),
    )?;

    let mut expire: BTreeSet<String> = BTreeSet::new();

    // Full retention: anything older than the newest N fulls goes, along
    // with every diff and incr that depends on it.
    if let Some(retention_full) = options.retention_full {
        let fulls: Vec<String> = info_backup
            .records()
            .filter(|record| record.backup_type == BackupType::Full)
            .map(|record| record.label.clone())
            .collect();

        if fulls.len() > retention_full as usize {
            for label in &fulls[..fulls.len() - retention_full as usize] {
                expire.insert(label.clone());
                expire.extend(info_backup.dependents(label));
            }
        }
    }

    // Diff retention within the remaining backups.
    if let Some(retention_diff) = options.retention_diff {
        let diffs: Vec<String> = info_backup
            .records()
            .filter(|record| record.backup_type == BackupType::Diff)
            .filter(|record| !expire.contains(&record.label))
            .map(|record| record.label.clone())
            .collect();

        if diffs.len() > retention_diff as usize {
            for label in &diffs[..diffs.len() - retention_diff as usize] {
                expire.insert(label.clone());
                expire.extend(info_backup.dependents(label));
            }
        }
    }

    if options.dry_run {
        for label in &expire {
            log::info!("[dry-run] expire backup '{label}'");
        }

        return Ok(ExpireResult {
            backups_removed: expire.into_iter().collect(),
            wal_removed: 0,
        });
    }

    if !expire.is_empty() {
        for label in &expire {
            info_backup.remove(label);
            log::info!("expire backup '{label}'");
        }

        // Registry first, files second.
        info_backup.save(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;

        for label in &expire {
            storage.path_remove(&layout::backup_path(label), true, false)?;
        }
    }

    // Archive retention: segments older than everything any remaining
    // backup needs, per archive id. Ids with no remaining backups are kept
    // only when current.
    let mut wal_removed = 0u64;
    let current_archive_id = info_backup.pg().current().archive_id();

    for entry in storage.list_opt("archive", InfoLevel::Type)? {
        if entry.info.file_type != FileType::Path {
            continue;
        }

        let archive_id = entry.name;

        let pg_id = match info_backup
            .pg()
            .history()
            .iter()
            .find(|history| history.archive_id() == archive_id)
        {
            Some(history) => history.id,
            None => continue,
        };

        let archive_min = info_backup
            .records()
            .filter(|record| record.db_id == pg_id)
            .filter_map(|record| record.backup_archive_start.clone())
            .min();

        let archive_min = match archive_min {
            Some(min) => WalSegment::parse(&min)?,
            None => {
                if archive_id != current_archive_id {
                    log::info!("expire archive {archive_id}: no remaining backups");
                    storage.path_remove(&layout::archive_path(&archive_id), true, false)?;
                }
                continue;
            }
        };

        for prefix in storage.list_opt(&layout::archive_path(&archive_id), InfoLevel::Type)? {
            if prefix.info.file_type != FileType::Path {
                continue;
            }

            let dir = format!("{}/{}", layout::archive_path(&archive_id), prefix.name);
            let mut remaining = false;

            for file in storage.list_opt(&dir, InfoLevel::Type)? {
                let segment = match pgvault_repo::segment_file_split(&file.name) {
                    Ok((segment, _)) => segment,
                    Err(_) => {
                        remaining = true;
                        continue;
                    }
                };

                if segment < archive_min && segment.timeline == archive_min.timeline {
                    storage.remove(&format!("{dir}/{}", file.name), false)?;
                    wal_removed += 1;
                } else {
                    remaining = true;
                }
            }

            if !remaining {
                storage.path_remove(&dir, false, false)?;
            }
        }
    }

    if wal_removed > 0 {
        log::info!("expired {wal_removed} wal segments");
    }

    Ok(ExpireResult {
        backups_removed: expire.into_iter().collect(),
        wal_removed,
    })
}

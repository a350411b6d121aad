//! Stanza lifecycle: create, upgrade, delete.

use pgvault_api_types::{CipherType, Error, ErrorKind, Result};
use pgvault_repo::{
    cipher_pass_gen, exec_id_gen, lock_acquire, InfoArchive, InfoBackup, LockType,
    INFO_ARCHIVE_FILE, INFO_BACKUP_FILE,
};
use pgvault_repo::info::INFO_COPY_EXT;
use pgvault_storage::Storage;

use crate::config::{GlobalConfig, RepoConfig};
use crate::pg::{postmaster_running, DbSource};

fn subpass(repo: &RepoConfig) -> Result<Option<String>> {
    match repo.cipher_type {
        CipherType::None => Ok(None),
        _ => Ok(Some(cipher_pass_gen()?)),
    }
}

/// Create the stanza: both info files and the base repository paths.
/// Re-running against an intact stanza is a no-op; a half-created stanza is
/// completed.
pub fn stanza_create(
    repo: &RepoConfig,
    global: &GlobalConfig,
    db: &mut dyn DbSource,
) -> Result<()> {
    let exec_id = exec_id_gen();
    let _backup_lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Backup,
        &exec_id,
        global.lock_timeout,
        true,
    )?;
    let _archive_lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Archive,
        &exec_id,
        global.lock_timeout,
        true,
    )?;

    let identity = db.identity()?;
    let storage = repo.storage();

    let backup_exists = storage.exists(INFO_BACKUP_FILE)?
        || storage.exists(&format!("{INFO_BACKUP_FILE}{INFO_COPY_EXT}"))?;
    let archive_exists = storage.exists(INFO_ARCHIVE_FILE)?
        || storage.exists(&format!("{INFO_ARCHIVE_FILE}{INFO_COPY_EXT}"))?;

    if backup_exists && archive_exists {
        // Validate rather than overwrite; create twice must be harmless.
        let info_backup =
            InfoBackup::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
        let info_archive =
            InfoArchive::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
        info_backup.pg().check_match(info_archive.pg())?;

        if !identity.matches(info_backup.pg().current()) {
            return Err(Error::new(
                ErrorKind::BackupMismatch,
                format!(
                    "stanza '{}' already exists for a different cluster\n\
                     HINT: use stanza-upgrade after a PostgreSQL upgrade",
                    repo.stanza
                ),
            ));
        }

        log::info!("stanza '{}' already exists and matches the cluster", repo.stanza);
        return Ok(());
    }

    if backup_exists != archive_exists {
        return Err(Error::format(format!(
            "stanza '{}' is partially created\n\
             HINT: use stanza-delete to remove it and run stanza-create again",
            repo.stanza
        )));
    }

    storage.path_create("archive", None)?;
    storage.path_create("backup", None)?;

    let entry = identity.history_entry(1);

    InfoBackup::new(entry.clone(), subpass(repo)?)?.save(
        &storage,
        repo.cipher_type,
        repo.cipher_pass.as_deref(),
    )?;
    InfoArchive::new(entry, subpass(repo)?)?.save(
        &storage,
        repo.cipher_type,
        repo.cipher_pass.as_deref(),
    )?;

    log::info!("stanza '{}' created", repo.stanza);
    Ok(())
}

/// Record a new PG history entry after a cluster upgrade.
pub fn stanza_upgrade(
    repo: &RepoConfig,
    global: &GlobalConfig,
    db: &mut dyn DbSource,
) -> Result<()> {
    let exec_id = exec_id_gen();
    let _backup_lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Backup,
        &exec_id,
        global.lock_timeout,
        true,
    )?;
    let _archive_lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Archive,
        &exec_id,
        global.lock_timeout,
        true,
    )?;

    let identity = db.identity()?;
    let storage = repo.storage();

    let mut info_backup =
        InfoBackup::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
    let mut info_archive =
        InfoArchive::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
    info_backup.pg().check_match(info_archive.pg())?;

    if identity.matches(info_backup.pg().current()) {
        log::info!("stanza '{}' is already up to date", repo.stanza);
        return Ok(());
    }

    let next_id = info_backup.pg().current().id + 1;
    let entry = identity.history_entry(next_id);

    info_backup.upgrade(entry.clone())?;
    info_archive.upgrade(entry)?;

    info_backup.save(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
    info_archive.save(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;

    log::info!(
        "stanza '{}' upgraded to {} ({})",
        repo.stanza,
        identity.version,
        identity.system_id
    );
    Ok(())
}

/// Remove the stanza's repository content. Refuses while the cluster runs.
pub fn stanza_delete(
    repo: &RepoConfig,
    global: &GlobalConfig,
    pg_storage: &Storage,
) -> Result<()> {
    if postmaster_running(pg_storage)? {
        return Err(Error::new(
            ErrorKind::PostmasterRunning,
            "stanza-delete requires the cluster to be stopped",
        ));
    }

    let exec_id = exec_id_gen();
    let _backup_lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Backup,
        &exec_id,
        global.lock_timeout,
        true,
    )?;
    let _archive_lock = lock_acquire(
        &global.lock_path,
        &repo.stanza,
        LockType::Archive,
        &exec_id,
        global.lock_timeout,
        true,
    )?;

    let storage = repo.storage();

    storage.path_remove("archive", true, false)?;
    storage.path_remove("backup", true, false)?;

    for name in [INFO_ARCHIVE_FILE, INFO_BACKUP_FILE] {
        storage.remove(name, false)?;
        storage.remove(&format!("{name}{INFO_COPY_EXT}"), false)?;
    }

    log::info!("stanza '{}' deleted", repo.stanza);
    Ok(())
}

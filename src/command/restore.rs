//! Restore command.
//!
//! Validates the destination, remaps targets, reconciles or clears what is
//! already there, then rebuilds every file through workers and writes the
//! recovery configuration. A manifest copy is placed in the destination
//! first so an interrupted restore is recognized and resumed in delta mode.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use pgvault_api_types::{CompressType, Error, ErrorKind, Result};
use pgvault_protocol::{Command, ParallelExecutor, ParallelJob, Value};
use pgvault_repo::{layout, Manifest, ManifestFile, TargetType, MANIFEST_TARGET_PGDATA};
use pgvault_storage::{FileType, InfoLevel, Storage};

use crate::config::{GlobalConfig, RepoConfig, RestoreOptions, RestoreTarget};
use crate::pg::{postmaster_running, DB_SYSTEM_OID_MAX};
use crate::workers::{WorkerConfig, WorkerPool};

static BUILTIN_DB_NAMES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["postgres", "template0", "template1"].into_iter().collect());

#[derive(Debug)]
pub struct RestoreResult {
    pub label: String,
    pub files_restored: u64,
    pub files_preserved: u64,
    pub files_zeroed: u64,
}

pub fn restore(
    repo: &RepoConfig,
    global: &GlobalConfig,
    pg_path: &str,
    options: &RestoreOptions,
) -> Result<RestoreResult> {
    let storage = repo.storage();
    let pg_path = options.pg_path.as_deref().unwrap_or(pg_path).to_string();
    let pg = Storage::posix(pg_path.clone());

    // Destination preconditions.
    let dest_info = pg.info_follow("", InfoLevel::Type)?;

    if !dest_info.exists {
        return Err(Error::new(
            ErrorKind::PathMissing,
            format!("restore destination '{pg_path}' does not exist"),
        ));
    }

    if postmaster_running(&pg)? {
        return Err(Error::new(
            ErrorKind::PostmasterRunning,
            format!(
                "unable to restore while PostgreSQL is running\n\
                 HINT: stop the cluster using '{pg_path}' and try again"
            ),
        ));
    }

    let mut delta = options.delta;
    let mut force = options.force;

    if delta || force {
        // Delta against an empty or foreign directory makes no sense.
        let looks_like_cluster =
            pg.exists(crate::pg::PG_VERSION_FILE)? || Manifest::exists(&pg, "")?;

        if !looks_like_cluster {
            log::warn!(
                "--delta or --force requires a data directory or manifest, \
                 the restore will proceed as if they were not set"
            );
            delta = false;
            force = false;
        }
    }

    // A manifest left in the destination marks an interrupted restore.
    if !delta && Manifest::exists(&pg, "")? {
        log::info!("partial restore detected, enabling delta");
        delta = true;
    }

    // Select the backup set.
    let info_backup = pgvault_repo::InfoBackup::load(
        &storage,
        repo.cipher_type,
        repo.cipher_pass.as_deref(),
    )?;

    let label = match &options.set {
        Some(set) => {
            if info_backup.get(set).is_none() {
                return Err(Error::new(
                    ErrorKind::BackupSetInvalid,
                    format!("backup set '{set}' does not exist"),
                ));
            }
            set.clone()
        }
        None => info_backup
            .latest()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::BackupSetInvalid,
                    format!("no backup exists to restore for stanza '{}'", repo.stanza),
                )
            })?
            .label
            .clone(),
    };

    let mut manifest = Manifest::load(
        &storage,
        &layout::backup_path(&label),
        Some(&label),
        repo.cipher_type,
        info_backup.cipher_pass(),
    )?;

    remap(&mut manifest, &pg_path, options)?;
    resolve_ownership(&mut manifest)?;

    let zero_expression = selective_expression(&manifest, &options.db_include)?;

    clean_targets(&manifest, delta, force)?;

    // Resumability marker; removed again once the restore completes.
    manifest.save(&pg, "", pgvault_api_types::CipherType::None, None)?;

    create_paths_and_links(&pg, &manifest)?;

    // Queues per target, large files first.
    struct JobSpec {
        name: String,
        size: u64,
        zero: bool,
    }

    let mut target_names: Vec<String> = manifest
        .targets()
        .map(|(name, _)| name.clone())
        .collect();
    target_names.sort();

    let mut queues: Vec<Vec<JobSpec>> = target_names.iter().map(|_| Vec::new()).collect();

    for (name, file) in manifest.files() {
        let zero = zero_expression
            .as_ref()
            .map(|expression| {
                expression.is_match(name) && !name.ends_with(crate::pg::PG_VERSION_FILE)
            })
            .unwrap_or(false);

        let queue_idx = target_names
            .iter()
            .position(|target| {
                target != MANIFEST_TARGET_PGDATA && name.starts_with(target.as_str())
            })
            .or_else(|| {
                target_names
                    .iter()
                    .position(|target| target == MANIFEST_TARGET_PGDATA)
            })
            .unwrap_or(0);

        queues[queue_idx].push(JobSpec {
            name: name.clone(),
            size: file.size,
            zero,
        });
    }

    for queue in &mut queues {
        queue.sort_by(|a, b| b.size.cmp(&a.size));
    }

    let mut queues: Vec<std::collections::VecDeque<JobSpec>> =
        queues.into_iter().map(Into::into).collect();

    let worker_config = WorkerConfig {
        repo_root: repo.stanza_root(),
        pg_root: pg_path.clone(),
        cipher_type: repo.cipher_type,
        cipher_pass: info_backup.cipher_pass().map(str::to_string),
        compress_type: manifest.options.compress_type,
        compress_level: manifest.options.compress_level,
    };

    let (clients, pool) = WorkerPool::spawn(global.process_max, &worker_config, global)?;

    let files: BTreeMap<String, ManifestFile> = manifest
        .files()
        .map(|(name, file)| (name.clone(), file.clone()))
        .collect();
    let set_label = label.clone();
    let compress_type = manifest.options.compress_type;

    let executor = ParallelExecutor::new(
        clients,
        global.protocol_timeout,
        global.retry_interval.clone(),
        move |worker_idx| {
            let queue_total = queues.len();

            for offset in 0..queue_total {
                let queue = &mut queues[(worker_idx + offset) % queue_total];

                let job = match queue.pop_front() {
                    Some(job) => job,
                    None => continue,
                };

                let file = files
                    .get(&job.name)
                    .ok_or_else(|| Error::assert("queued file not in manifest"))?;

                let read_label = file.reference.as_deref().unwrap_or(&set_label);
                let block_incr = match (file.block_incr_size, file.block_incr_map_size) {
                    (Some(block_size), Some(map_size)) => Value::obj([
                        ("block-size", Value::from(block_size)),
                        (
                            "map-file",
                            Value::from(layout::backup_file_path(
                                read_label,
                                &job.name,
                                CompressType::None,
                            )),
                        ),
                        (
                            "map-offset",
                            Value::from(file.size_repo.saturating_sub(map_size)),
                        ),
                        ("map-size", Value::from(map_size)),
                    ]),
                    _ => Value::Null,
                };

                let compress = block_incr.is_null() && compress_type != CompressType::None;

                let param = Value::obj([
                    (
                        "repo-file",
                        Value::from(layout::backup_file_path(
                            read_label,
                            &job.name,
                            if compress { compress_type } else { CompressType::None },
                        )),
                    ),
                    ("dest-file", Value::from(dest_path(&job.name))),
                    ("size", Value::from(file.size)),
                    ("checksum", file.checksum.clone().into()),
                    ("compress", Value::Bool(compress)),
                    ("zero", Value::Bool(job.zero)),
                    ("delta", Value::Bool(delta)),
                    ("force", Value::Bool(force)),
                    ("mode", Value::from(file.mode)),
                    ("user", file.user.clone().into()),
                    ("group", file.group.clone().into()),
                    ("timestamp", Value::Int(file.timestamp)),
                    ("block-incr", block_incr),
                ]);

                return Ok(Some(ParallelJob::new(
                    Value::from(job.name.as_str()),
                    Command::new("restore-file", param),
                )));
            }

            Ok(None)
        },
    );

    let mut restored: u64 = 0;
    let mut preserved: u64 = 0;
    let mut zeroed: u64 = 0;

    executor.run(|done| {
        let name = done.key.as_str()?.to_string();
        let result = done.result.map_err(|err| {
            Error::new(err.kind(), format!("unable to restore '{name}': {err}"))
        })?;

        match result.get("result").as_str()? {
            "copied" => restored += 1,
            "preserved" => preserved += 1,
            "zeroed" => zeroed += 1,
            other => {
                return Err(Error::protocol(format!("unknown restore-file result '{other}'")))
            }
        }

        Ok(())
    })?;

    pool.join()?;

    write_recovery_settings(&pg, repo, options)?;

    // The restore completed; drop the resume marker.
    pg.remove(layout::MANIFEST_FILE, false)?;
    pg.remove(&format!("{}{}", layout::MANIFEST_FILE, pgvault_repo::INFO_COPY_EXT), false)?;

    log::info!(
        "restore of backup '{label}' complete: {restored} restored, \
         {preserved} preserved, {zeroed} zeroed"
    );

    Ok(RestoreResult {
        label,
        files_restored: restored,
        files_preserved: preserved,
        files_zeroed: zeroed,
    })
}

/// Destination path relative to the data directory for a manifest name.
fn dest_path(name: &str) -> &str {
    name.strip_prefix("pg_data/").unwrap_or(name)
}

/// Apply data directory, tablespace and link remapping.
fn remap(manifest: &mut Manifest, pg_path: &str, options: &RestoreOptions) -> Result<()> {
    manifest
        .targets_mut()
        .get_mut(MANIFEST_TARGET_PGDATA)
        .ok_or_else(|| Error::format("manifest is missing the data directory target"))?
        .path = pg_path.to_string();

    // Tablespaces: match by oid or name; conflicting destinations from two
    // keys are an error.
    let mut tablespace_dest: BTreeMap<String, String> = BTreeMap::new();

    for (key, dest) in &options.tablespace_map {
        let mut matched = false;

        let targets: Vec<(String, Option<u32>, Option<String>)> = manifest
            .targets()
            .map(|(name, target)| {
                (name.clone(), target.tablespace_id, target.tablespace_name.clone())
            })
            .collect();

        for (name, tablespace_id, tablespace_name) in targets {
            let id_match = tablespace_id
                .map(|id| id.to_string() == *key)
                .unwrap_or(false);
            let name_match = tablespace_name.as_deref() == Some(key.as_str());

            if id_match || name_match {
                matched = true;

                if let Some(existing) = tablespace_dest.get(&name) {
                    if existing != dest {
                        return Err(Error::new(
                            ErrorKind::TablespaceMap,
                            format!(
                                "tablespace '{name}' remapped to both '{existing}' and '{dest}'"
                            ),
                        ));
                    }
                }

                tablespace_dest.insert(name, dest.clone());
            }
        }

        if !matched {
            return Err(Error::new(
                ErrorKind::TablespaceMap,
                format!("unable to remap invalid tablespace '{key}'"),
            ));
        }
    }

    for (name, dest) in &tablespace_dest {
        manifest
            .targets_mut()
            .get_mut(name)
            .ok_or_else(|| Error::assert("tablespace target vanished"))?
            .path = dest.clone();
    }

    // Links: explicit map first, then drop or keep the rest.
    let mut link_mapped: BTreeSet<String> = BTreeSet::new();

    for (name, dest) in &options.link_map {
        let target = manifest.targets_mut().get_mut(name).ok_or_else(|| {
            Error::new(
                ErrorKind::LinkMap,
                format!("unable to remap invalid link '{name}'"),
            )
        })?;

        if target.tablespace_id.is_some() {
            return Err(Error::new(
                ErrorKind::LinkMap,
                format!("'{name}' is a tablespace, use the tablespace map"),
            ));
        }

        target.path = dest.clone();
        link_mapped.insert(name.clone());
    }

    let link_names: Vec<String> = manifest.links().map(|(name, _)| name.clone()).collect();

    for name in link_names {
        let is_tablespace = manifest
            .target(&name)
            .map(|target| target.tablespace_id.is_some())
            .unwrap_or(false);

        if !is_tablespace && !link_mapped.contains(&name) && !options.link_all {
            log::warn!("link '{name}' not remapped, its content restores into the data directory");
            manifest.remove_link(&name);
            manifest.remove_target(&name);
        }
    }

    // Link entries drive symlink creation; point them at the (possibly
    // remapped) target paths.
    let targets: Vec<(String, String, Option<String>)> = manifest
        .targets()
        .filter(|(_, target)| target.target_type == TargetType::Link)
        .map(|(name, target)| (name.clone(), target.path.clone(), target.file.clone()))
        .collect();

    for (name, path, file) in targets {
        if let Some(link) = manifest.links_mut().get_mut(&name) {
            link.destination = match file {
                Some(file) => format!("{path}/{file}"),
                None => path,
            };
        }
    }

    Ok(())
}

/// Decide who restored files will belong to.
///
/// Root keeps recorded owners, substituting the data directory owner for
/// names unknown on this host. Everyone else gets the current user, since
/// chown would fail anyway.
fn resolve_ownership(manifest: &mut Manifest) -> Result<()> {
    let is_root = nix::unistd::geteuid().is_root();

    if is_root {
        let fallback_user = manifest
            .path(MANIFEST_TARGET_PGDATA)
            .and_then(|path| path.user.clone());
        let fallback_group = manifest
            .path(MANIFEST_TARGET_PGDATA)
            .and_then(|path| path.group.clone());

        let mut unknown: BTreeSet<String> = BTreeSet::new();

        let file_names: Vec<String> = manifest.files().map(|(name, _)| name.clone()).collect();
        for name in file_names {
            let user = manifest.file(&name)?.user.clone();
            let group = manifest.file(&name)?.group.clone();

            let user_known = match &user {
                Some(user) => pgvault_storage::posix::lookup_uid(user)?.is_some(),
                None => false,
            };
            let group_known = match &group {
                Some(group) => pgvault_storage::posix::lookup_gid(group)?.is_some(),
                None => false,
            };

            if !user_known || !group_known {
                if let Some(user) = &user {
                    unknown.insert(user.clone());
                }

                let fallback_user = fallback_user.clone();
                let fallback_group = fallback_group.clone();
                manifest.update_file(&name, |file| {
                    if !user_known {
                        file.user = fallback_user;
                    }
                    if !group_known {
                        file.group = fallback_group;
                    }
                })?;
            }
        }

        for owner in unknown {
            log::warn!("unknown user or group '{owner}' in manifest mapped to the data directory owner");
        }
    } else {
        log::warn!("not running as root, restored files will belong to the current user");

        let file_names: Vec<String> = manifest.files().map(|(name, _)| name.clone()).collect();
        for name in file_names {
            manifest.update_file(&name, |file| {
                file.user = None;
                file.group = None;
            })?;
        }
    }

    Ok(())
}

/// Build the expression matching files that restore as zeroed content.
fn selective_expression(
    manifest: &Manifest,
    db_include: &[String],
) -> Result<Option<Regex>> {
    if db_include.is_empty() {
        return Ok(None);
    }

    let mut include: BTreeSet<u32> = BTreeSet::new();

    for spec in db_include {
        let db = match spec.parse::<u32>() {
            Ok(oid) => manifest.db_by_id(oid).map(|(_, db)| db),
            Err(_) => manifest.db_by_name(spec),
        };

        let db = db.ok_or_else(|| {
            Error::new(
                ErrorKind::DbMissing,
                format!("database '{spec}' does not exist in the backup"),
            )
        })?;

        include.insert(db.id);
    }

    // User databases not included restore as zeroed files; built-in
    // databases are never excluded.
    let excluded: Vec<String> = manifest
        .dbs()
        .filter(|(_, db)| db.id > DB_SYSTEM_OID_MAX && !include.contains(&db.id))
        .filter(|(name, _)| !BUILTIN_DB_NAMES.contains(name.as_str()))
        .map(|(_, db)| db.id.to_string())
        .collect();

    if excluded.is_empty() {
        return Ok(None);
    }

    let expression = format!(
        r"^pg_data/(base|pg_tblspc/[0-9]+/[^/]+)/({})/",
        excluded.join("|")
    );

    Regex::new(&expression)
        .map(Some)
        .map_err(|err| Error::assert(format!("invalid selective expression: {err}")))
}

/// Verify or reconcile every target destination.
fn clean_targets(manifest: &Manifest, delta: bool, force: bool) -> Result<()> {
    for (target_name, target) in manifest.targets() {
        if target.target_type == TargetType::Link && target.tablespace_id.is_none() && target.file.is_some() {
            // File links clean up with their parent directory listing.
            continue;
        }

        let dest = Storage::posix(target.path.clone());
        let info = dest.info_follow("", InfoLevel::Basic)?;

        if !info.exists {
            let mode = manifest.path(target_name).map(|path| path.mode).unwrap_or(0o700);
            dest.path_create("", Some(mode))?;
            continue;
        }

        if info.file_type != FileType::Path {
            return Err(Error::new(
                ErrorKind::PathMissing,
                format!("restore target '{}' is not a directory", target.path),
            ));
        }

        if !delta {
            let entries = dest.list("", InfoLevel::Type)?;

            if !entries.is_empty() {
                return Err(Error::new(
                    ErrorKind::PathNotEmpty,
                    format!(
                        "unable to restore to path '{}' that contains files\n\
                         HINT: use --delta to reconcile an existing data directory",
                        target.path
                    ),
                ));
            }

            continue;
        }

        clean_path(&dest, manifest, target_name, "", force)?;
    }

    Ok(())
}

/// Delta clean of one directory level: remove entries the manifest does not
/// know, reconcile mode on the ones it does. Re-running is harmless.
fn clean_path(
    dest: &Storage,
    manifest: &Manifest,
    target_name: &str,
    rel: &str,
    force: bool,
) -> Result<()> {
    for entry in dest.list(rel, InfoLevel::Basic)? {
        let child_rel = if rel.is_empty() {
            entry.name.clone()
        } else {
            format!("{rel}/{}", entry.name)
        };
        let manifest_name = format!("{target_name}/{child_rel}");

        // The resume marker is ours.
        if rel.is_empty()
            && (entry.name == layout::MANIFEST_FILE
                || entry.name == format!("{}{}", layout::MANIFEST_FILE, pgvault_repo::INFO_COPY_EXT))
        {
            continue;
        }

        match entry.info.file_type {
            FileType::File => {
                let known = manifest.file_opt(&manifest_name).is_some();

                if !known {
                    log::info!("remove invalid file '{}'", dest.path(&child_rel));
                    dest.remove(&child_rel, false)?;
                } else if force {
                    // Force trusts size+timestamp, so a mismatched file must
                    // go now; matching ones are left for the copy phase.
                    let file = manifest.file(&manifest_name)?;

                    if file.size != entry.info.size || file.timestamp != entry.info.time {
                        dest.remove(&child_rel, false)?;
                    }
                }
            }
            FileType::Path => {
                if manifest.path(&manifest_name).is_some() {
                    clean_path(dest, manifest, target_name, &child_rel, force)?;
                } else {
                    log::info!("remove invalid path '{}'", dest.path(&child_rel));
                    dest.path_remove(&child_rel, true, false)?;
                }
            }
            FileType::Link => {
                let keep = manifest.link(&manifest_name).is_some()
                    || manifest
                        .target(&manifest_name)
                        .map(|target| target.target_type == TargetType::Link)
                        .unwrap_or(false);

                if !keep {
                    log::info!("remove invalid link '{}'", dest.path(&child_rel));
                    dest.remove(&child_rel, false)?;
                }
            }
            FileType::Special => {
                log::info!("remove special file '{}'", dest.path(&child_rel));
                dest.remove(&child_rel, false)?;
            }
        }
    }

    Ok(())
}

/// Create manifest paths and recreate links before any file job runs, so
/// tablespace and link paths resolve through the data directory.
fn create_paths_and_links(pg: &Storage, manifest: &Manifest) -> Result<()> {
    // Plain paths first, then links, then the paths reached through a link
    // (tablespace subdirectories traverse the symlink created in between).
    let link_names: Vec<String> = manifest.links().map(|(name, _)| name.clone()).collect();
    let through_link = |name: &str| {
        link_names
            .iter()
            .any(|link| name == link || name.starts_with(&format!("{link}/")))
    };

    for (name, path) in manifest.paths() {
        if through_link(name) {
            continue;
        }

        if let Some(rel) = name.strip_prefix("pg_data/") {
            pg.path_create(rel, Some(path.mode))?;
        }
    }

    for (name, link) in manifest.links() {
        let rel = dest_path(name);
        let link_path = pg.path(rel);

        match std::fs::read_link(&link_path) {
            Ok(existing) if existing.to_string_lossy() == link.destination => continue,
            Ok(_) => {
                std::fs::remove_file(&link_path).map_err(|err| {
                    Error::from_io(err, ErrorKind::FileRemove, &format!("remove '{link_path}'"))
                })?;
            }
            Err(_) => (),
        }

        std::os::unix::fs::symlink(&link.destination, &link_path).map_err(|err| {
            Error::from_io(
                err,
                ErrorKind::FileWrite,
                &format!("unable to create link '{link_path}' -> '{}'", link.destination),
            )
        })?;
    }

    for (name, path) in manifest.paths() {
        // The link location itself is the symlink, not a directory.
        if !through_link(name) || link_names.iter().any(|link| link == name) {
            continue;
        }

        if let Some(rel) = name.strip_prefix("pg_data/") {
            pg.path_create(rel, Some(path.mode))?;
        }
    }

    Ok(())
}

/// Recovery settings: how the cluster finds archived WAL and where replay
/// stops.
fn write_recovery_settings(
    pg: &Storage,
    repo: &RepoConfig,
    options: &RestoreOptions,
) -> Result<()> {
    let mut settings = format!(
        "# recovery settings written by pgvault\n\
         restore_command = 'pgvault --stanza={} archive-get %f \"%p\"'\n",
        repo.stanza
    );

    match &options.target {
        RestoreTarget::Default => (),
        RestoreTarget::Immediate => {
            settings.push_str("recovery_target = 'immediate'\n");
        }
        RestoreTarget::Time(time) => {
            settings.push_str(&format!("recovery_target_time = '{time}'\n"));
        }
        RestoreTarget::Xid(xid) => {
            settings.push_str(&format!("recovery_target_xid = '{xid}'\n"));
        }
        RestoreTarget::Name(name) => {
            settings.push_str(&format!("recovery_target_name = '{name}'\n"));
        }
        RestoreTarget::Lsn(lsn) => {
            settings.push_str(&format!("recovery_target_lsn = '{lsn}'\n"));
        }
    }

    // Append rather than replace; the cluster's own settings stay.
    let existing = pg.get("postgresql.auto.conf")?.unwrap_or_default();
    let mut content = existing;

    if !content.is_empty() && !content.ends_with(b"\n") {
        content.push(b'\n');
    }
    content.extend_from_slice(settings.as_bytes());

    pg.put("postgresql.auto.conf", &content)?;
    pg.put("recovery.signal", b"")?;

    Ok(())
}

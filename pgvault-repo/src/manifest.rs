//! Per-backup manifest.
//!
//! The complete inventory of one backup: targets (the data directory and
//! any tablespaces or links), directories, files with sizes and checksums,
//! links and databases, plus the header describing when and how the backup
//! was taken. Stored in the info-document format with two copies and an
//! internal checksum, encrypted with the backup subpass when the repository
//! is encrypted.
//!
//! Owner and mode repeat heavily across a cluster, so the most common
//! values are stored once in `*:default` sections and individual entries
//! record only differences.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Value as Json};

use pgvault_api_types::{BackupType, CipherType, CompressType, Error, ErrorKind, Result};
use pgvault_storage::Storage;

use crate::info::{info_load, InfoDoc, INFO_COPY_EXT};
use crate::layout::MANIFEST_FILE;

/// Target name of the data directory; always present.
pub const MANIFEST_TARGET_PGDATA: &str = "pg_data";
/// Prefix for tablespace targets, `pg_tblspc/<oid>`.
pub const MANIFEST_TARGET_TBLSPC: &str = "pg_tblspc";

const SECTION_BACKUP: &str = "backup";
const SECTION_BACKUP_DB: &str = "backup:db";
const SECTION_BACKUP_OPTION: &str = "backup:option";
const SECTION_BACKUP_TARGET: &str = "backup:target";
const SECTION_TARGET_PATH: &str = "target:path";
const SECTION_TARGET_PATH_DEFAULT: &str = "target:path:default";
const SECTION_TARGET_FILE: &str = "target:file";
const SECTION_TARGET_FILE_DEFAULT: &str = "target:file:default";
const SECTION_TARGET_LINK: &str = "target:link";
const SECTION_TARGET_LINK_DEFAULT: &str = "target:link:default";
const SECTION_DB: &str = "db";

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestData {
    pub backup_label: String,
    pub backup_prior: Option<String>,
    pub backup_type: BackupType,
    pub timestamp_copy_start: i64,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub archive_start: Option<String>,
    pub archive_stop: Option<String>,
    pub lsn_start: Option<String>,
    pub lsn_stop: Option<String>,
    pub pg_id: u32,
    pub pg_version: String,
    pub pg_system_id: u64,
    pub pg_catalog_version: u32,
    pub pg_control_version: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestOptions {
    pub archive_check: bool,
    pub archive_copy: bool,
    pub checksum_page: bool,
    pub compress_type: CompressType,
    pub compress_level: Option<i32>,
    pub delta: bool,
    pub hardlink: bool,
    pub online: bool,
    pub block_incr: bool,
    pub process_max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetType {
    Path,
    Link,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestTarget {
    pub target_type: TargetType,
    pub path: String,
    /// Set for file links: the link points at a single file, not a path.
    pub file: Option<String>,
    pub tablespace_id: Option<u32>,
    pub tablespace_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestPath {
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ManifestFile {
    pub size: u64,
    /// Stored size in the repository; equals `size` until the copy runs.
    pub size_repo: u64,
    pub timestamp: i64,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    /// SHA-1 of the source file, set once copied (or carried from the
    /// referenced backup).
    pub checksum: Option<String>,
    /// SHA-1 of the stored repository file when it differs from the source
    /// (compressed or encrypted copies).
    pub checksum_repo: Option<String>,
    pub checksum_page: Option<bool>,
    pub checksum_page_error: Vec<u64>,
    /// Label of the prior backup holding this file's content.
    pub reference: Option<String>,
    pub bundle_id: Option<u64>,
    pub bundle_offset: Option<u64>,
    /// Block size of the block-incremental map, when one is present.
    pub block_incr_size: Option<u64>,
    /// Size of the map appended to the repository file.
    pub block_incr_map_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestLink {
    pub destination: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDb {
    pub id: u32,
    pub last_system_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub data: ManifestData,
    pub options: ManifestOptions,
    targets: BTreeMap<String, ManifestTarget>,
    paths: BTreeMap<String, ManifestPath>,
    files: BTreeMap<String, ManifestFile>,
    links: BTreeMap<String, ManifestLink>,
    dbs: BTreeMap<String, ManifestDb>,
}

fn owner_to_json(owner: &Option<String>) -> Json {
    match owner {
        Some(name) => Json::from(name.as_str()),
        // Unknown owners are recorded as boolean false, not null, so they
        // are distinguishable from an omitted (defaulted) value.
        None => Json::Bool(false),
    }
}

fn owner_from_json(value: &Json) -> Result<Option<String>> {
    match value {
        Json::String(name) => Ok(Some(name.clone())),
        Json::Bool(false) => Ok(None),
        _ => Err(Error::format("invalid owner in manifest")),
    }
}

fn mode_to_json(mode: u32) -> Json {
    Json::from(format!("{mode:04o}"))
}

fn mode_from_json(value: &Json) -> Result<u32> {
    let text = value
        .as_str()
        .ok_or_else(|| Error::format("invalid mode in manifest"))?;
    u32::from_str_radix(text, 8).map_err(|_| Error::format(format!("invalid mode '{text}'")))
}

/// Most common value by key, used to pick `*:default` entries.
fn most_common<'a, T: Eq + std::hash::Hash + Clone, I: Iterator<Item = T>>(values: I) -> Option<T> {
    let mut counts: HashMap<T, usize> = HashMap::new();

    for value in values {
        *counts.entry(value).or_default() += 1;
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(value, _)| value)
}

impl Manifest {
    pub fn new(data: ManifestData, options: ManifestOptions) -> Self {
        Self {
            data,
            options,
            targets: BTreeMap::new(),
            paths: BTreeMap::new(),
            files: BTreeMap::new(),
            links: BTreeMap::new(),
            dbs: BTreeMap::new(),
        }
    }

    fn insert_unique<T>(
        map: &mut BTreeMap<String, T>,
        kind: &str,
        name: &str,
        value: T,
    ) -> Result<()> {
        if map.contains_key(name) {
            return Err(Error::format(format!("duplicate {kind} '{name}' in manifest")));
        }

        map.insert(name.to_string(), value);
        Ok(())
    }

    pub fn add_target(&mut self, name: &str, target: ManifestTarget) -> Result<()> {
        Self::insert_unique(&mut self.targets, "target", name, target)
    }

    pub fn add_path(&mut self, name: &str, path: ManifestPath) -> Result<()> {
        Self::insert_unique(&mut self.paths, "path", name, path)
    }

    pub fn add_file(&mut self, name: &str, file: ManifestFile) -> Result<()> {
        Self::insert_unique(&mut self.files, "file", name, file)
    }

    pub fn add_link(&mut self, name: &str, link: ManifestLink) -> Result<()> {
        Self::insert_unique(&mut self.links, "link", name, link)
    }

    pub fn add_db(&mut self, name: &str, db: ManifestDb) -> Result<()> {
        Self::insert_unique(&mut self.dbs, "db", name, db)
    }

    pub fn target(&self, name: &str) -> Result<&ManifestTarget> {
        self.targets
            .get(name)
            .ok_or_else(|| Error::format(format!("manifest is missing target '{name}'")))
    }

    pub fn targets(&self) -> impl Iterator<Item = (&String, &ManifestTarget)> {
        self.targets.iter()
    }

    pub fn targets_mut(&mut self) -> &mut BTreeMap<String, ManifestTarget> {
        &mut self.targets
    }

    pub fn paths(&self) -> impl Iterator<Item = (&String, &ManifestPath)> {
        self.paths.iter()
    }

    pub fn path(&self, name: &str) -> Option<&ManifestPath> {
        self.paths.get(name)
    }

    pub fn file(&self, name: &str) -> Result<&ManifestFile> {
        self.files
            .get(name)
            .ok_or_else(|| Error::format(format!("manifest is missing file '{name}'")))
    }

    pub fn file_opt(&self, name: &str) -> Option<&ManifestFile> {
        self.files.get(name)
    }

    pub fn files(&self) -> impl Iterator<Item = (&String, &ManifestFile)> {
        self.files.iter()
    }

    pub fn file_total(&self) -> usize {
        self.files.len()
    }

    pub fn update_file(&mut self, name: &str, update: impl FnOnce(&mut ManifestFile)) -> Result<()> {
        let file = self
            .files
            .get_mut(name)
            .ok_or_else(|| Error::format(format!("manifest is missing file '{name}'")))?;
        update(file);
        Ok(())
    }

    pub fn remove_file(&mut self, name: &str) -> Option<ManifestFile> {
        self.files.remove(name)
    }

    pub fn links(&self) -> impl Iterator<Item = (&String, &ManifestLink)> {
        self.links.iter()
    }

    pub fn links_mut(&mut self) -> &mut BTreeMap<String, ManifestLink> {
        &mut self.links
    }

    pub fn link(&self, name: &str) -> Option<&ManifestLink> {
        self.links.get(name)
    }

    pub fn remove_link(&mut self, name: &str) -> Option<ManifestLink> {
        self.links.remove(name)
    }

    pub fn remove_target(&mut self, name: &str) -> Option<ManifestTarget> {
        self.targets.remove(name)
    }

    pub fn dbs(&self) -> impl Iterator<Item = (&String, &ManifestDb)> {
        self.dbs.iter()
    }

    pub fn db_by_name(&self, name: &str) -> Option<&ManifestDb> {
        self.dbs.get(name)
    }

    pub fn db_by_id(&self, id: u32) -> Option<(&String, &ManifestDb)> {
        self.dbs.iter().find(|(_, db)| db.id == id)
    }

    /// Unique prior labels referenced by file entries, sorted.
    pub fn references(&self) -> Vec<String> {
        let mut references: Vec<String> = self
            .files
            .values()
            .filter_map(|file| file.reference.clone())
            .collect();
        references.sort();
        references.dedup();
        references
    }

    /// Structural invariants that hold for every valid manifest.
    pub fn validate(&self) -> Result<()> {
        if self.data.backup_label.is_empty() {
            return Err(Error::format("manifest has no backup label"));
        }

        if !self.targets.contains_key(MANIFEST_TARGET_PGDATA) {
            return Err(Error::format("manifest is missing the data directory target"));
        }

        if self.paths.is_empty() || self.files.is_empty() {
            return Err(Error::format(
                "manifest must contain at least one path and one file",
            ));
        }

        for name in self.files.keys() {
            let parent = match name.rsplit_once('/') {
                Some((parent, _)) => parent,
                None => {
                    return Err(Error::format(format!(
                        "manifest file '{name}' is not under a target"
                    )))
                }
            };

            if !self.paths.contains_key(parent) {
                return Err(Error::format(format!(
                    "manifest file '{name}' has no containing path '{parent}'"
                )));
            }
        }

        for (name, target) in &self.targets {
            if target.path.is_empty() {
                return Err(Error::format(format!("target '{name}' has an empty path")));
            }
        }

        Ok(())
    }

    pub fn to_doc(&self) -> InfoDoc {
        let mut doc = InfoDoc::new();
        let data = &self.data;

        doc.set(SECTION_BACKUP, "backup-label", Json::from(data.backup_label.as_str()));
        if let Some(prior) = &data.backup_prior {
            doc.set(SECTION_BACKUP, "backup-prior", Json::from(prior.as_str()));
        }
        doc.set(
            SECTION_BACKUP,
            "backup-type",
            serde_json::to_value(data.backup_type).unwrap(),
        );
        doc.set(
            SECTION_BACKUP,
            "backup-timestamp-copy-start",
            Json::from(data.timestamp_copy_start),
        );
        doc.set(
            SECTION_BACKUP,
            "backup-timestamp-start",
            Json::from(data.timestamp_start),
        );
        doc.set(
            SECTION_BACKUP,
            "backup-timestamp-stop",
            Json::from(data.timestamp_stop),
        );

        for (key, value) in [
            ("backup-archive-start", &data.archive_start),
            ("backup-archive-stop", &data.archive_stop),
            ("backup-lsn-start", &data.lsn_start),
            ("backup-lsn-stop", &data.lsn_stop),
        ] {
            if let Some(value) = value {
                doc.set(SECTION_BACKUP, key, Json::from(value.as_str()));
            }
        }

        doc.set(SECTION_BACKUP_DB, "db-id", Json::from(data.pg_id));
        doc.set(SECTION_BACKUP_DB, "db-version", Json::from(data.pg_version.as_str()));
        doc.set(SECTION_BACKUP_DB, "db-system-id", Json::from(data.pg_system_id));
        doc.set(
            SECTION_BACKUP_DB,
            "db-catalog-version",
            Json::from(data.pg_catalog_version),
        );
        doc.set(
            SECTION_BACKUP_DB,
            "db-control-version",
            Json::from(data.pg_control_version),
        );

        let options = &self.options;
        doc.set(SECTION_BACKUP_OPTION, "option-archive-check", Json::from(options.archive_check));
        doc.set(SECTION_BACKUP_OPTION, "option-archive-copy", Json::from(options.archive_copy));
        doc.set(SECTION_BACKUP_OPTION, "option-checksum-page", Json::from(options.checksum_page));
        doc.set(
            SECTION_BACKUP_OPTION,
            "option-compress",
            Json::from(options.compress_type != CompressType::None),
        );
        doc.set(
            SECTION_BACKUP_OPTION,
            "option-compress-type",
            serde_json::to_value(options.compress_type).unwrap(),
        );
        if let Some(level) = options.compress_level {
            doc.set(SECTION_BACKUP_OPTION, "option-compress-level", Json::from(level));
        }
        doc.set(SECTION_BACKUP_OPTION, "option-delta", Json::from(options.delta));
        doc.set(SECTION_BACKUP_OPTION, "option-hardlink", Json::from(options.hardlink));
        doc.set(SECTION_BACKUP_OPTION, "option-online", Json::from(options.online));
        doc.set(SECTION_BACKUP_OPTION, "option-block-incr", Json::from(options.block_incr));
        doc.set(
            SECTION_BACKUP_OPTION,
            "option-process-max",
            Json::from(options.process_max),
        );

        for (name, target) in &self.targets {
            let mut value = json!({
                "path": target.path,
                "type": match target.target_type {
                    TargetType::Path => "path",
                    TargetType::Link => "link",
                },
            });

            if let Some(file) = &target.file {
                value["file"] = Json::from(file.as_str());
            }
            if let Some(id) = target.tablespace_id {
                value["tablespace-id"] = Json::from(id);
            }
            if let Some(tablespace_name) = &target.tablespace_name {
                value["tablespace-name"] = Json::from(tablespace_name.as_str());
            }

            doc.set(SECTION_BACKUP_TARGET, name, value);
        }

        // Path defaults.
        let path_mode = most_common(self.paths.values().map(|path| path.mode)).unwrap_or(0o700);
        let path_user = most_common(self.paths.values().map(|path| path.user.clone())).flatten();
        let path_group = most_common(self.paths.values().map(|path| path.group.clone())).flatten();

        doc.set(SECTION_TARGET_PATH_DEFAULT, "mode", mode_to_json(path_mode));
        doc.set(
            SECTION_TARGET_PATH_DEFAULT,
            "user",
            owner_to_json(&path_user),
        );
        doc.set(
            SECTION_TARGET_PATH_DEFAULT,
            "group",
            owner_to_json(&path_group),
        );

        for (name, path) in &self.paths {
            let mut value = json!({});

            if path.mode != path_mode {
                value["mode"] = mode_to_json(path.mode);
            }
            if path.user != path_user {
                value["user"] = owner_to_json(&path.user);
            }
            if path.group != path_group {
                value["group"] = owner_to_json(&path.group);
            }

            doc.set(SECTION_TARGET_PATH, name, value);
        }

        // File defaults.
        let file_mode = most_common(self.files.values().map(|file| file.mode)).unwrap_or(0o600);
        let file_user = most_common(self.files.values().map(|file| file.user.clone())).flatten();
        let file_group = most_common(self.files.values().map(|file| file.group.clone())).flatten();

        doc.set(SECTION_TARGET_FILE_DEFAULT, "mode", mode_to_json(file_mode));
        doc.set(
            SECTION_TARGET_FILE_DEFAULT,
            "user",
            owner_to_json(&file_user),
        );
        doc.set(
            SECTION_TARGET_FILE_DEFAULT,
            "group",
            owner_to_json(&file_group),
        );

        for (name, file) in &self.files {
            let mut value = json!({
                "size": file.size,
                "timestamp": file.timestamp,
            });

            if file.size_repo != file.size {
                value["repo-size"] = Json::from(file.size_repo);
            }
            if let Some(checksum) = &file.checksum {
                value["checksum"] = Json::from(checksum.as_str());
            }
            if let Some(checksum_repo) = &file.checksum_repo {
                value["checksum-repo"] = Json::from(checksum_repo.as_str());
            }
            if let Some(checksum_page) = file.checksum_page {
                value["checksum-page"] = Json::from(checksum_page);
            }
            if !file.checksum_page_error.is_empty() {
                value["checksum-page-error"] =
                    Json::from(file.checksum_page_error.clone());
            }
            if let Some(reference) = &file.reference {
                value["reference"] = Json::from(reference.as_str());
            }
            if let Some(bundle_id) = file.bundle_id {
                value["bundle-id"] = Json::from(bundle_id);
            }
            if let Some(bundle_offset) = file.bundle_offset {
                value["bundle-offset"] = Json::from(bundle_offset);
            }
            if let Some(block_incr_size) = file.block_incr_size {
                value["block-incr-size"] = Json::from(block_incr_size);
            }
            if let Some(map_size) = file.block_incr_map_size {
                value["block-incr-map-size"] = Json::from(map_size);
            }
            if file.mode != file_mode {
                value["mode"] = mode_to_json(file.mode);
            }
            if file.user != file_user {
                value["user"] = owner_to_json(&file.user);
            }
            if file.group != file_group {
                value["group"] = owner_to_json(&file.group);
            }

            doc.set(SECTION_TARGET_FILE, name, value);
        }

        if !self.links.is_empty() {
            let link_user = most_common(self.links.values().map(|link| link.user.clone())).flatten();
            let link_group =
                most_common(self.links.values().map(|link| link.group.clone())).flatten();

            doc.set(SECTION_TARGET_LINK_DEFAULT, "user", owner_to_json(&link_user));
            doc.set(
                SECTION_TARGET_LINK_DEFAULT,
                "group",
                owner_to_json(&link_group),
            );

            for (name, link) in &self.links {
                let mut value = json!({ "destination": link.destination });

                if link.user != link_user {
                    value["user"] = owner_to_json(&link.user);
                }
                if link.group != link_group {
                    value["group"] = owner_to_json(&link.group);
                }

                doc.set(SECTION_TARGET_LINK, name, value);
            }
        }

        for (name, db) in &self.dbs {
            doc.set(
                SECTION_DB,
                name,
                json!({ "db-id": db.id, "db-last-system-id": db.last_system_id }),
            );
        }

        doc
    }

    pub fn from_doc(doc: &InfoDoc) -> Result<Self> {
        let backup = doc
            .section(SECTION_BACKUP)
            .ok_or_else(|| Error::format("manifest is missing the backup section"))?;

        let str_field = |map: &BTreeMap<String, Json>, key: &str| -> Result<String> {
            map.get(key)
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::format(format!("manifest is missing '{key}'")))
        };
        let opt_str = |map: &BTreeMap<String, Json>, key: &str| -> Option<String> {
            map.get(key).and_then(Json::as_str).map(str::to_string)
        };
        let int_field = |map: &BTreeMap<String, Json>, key: &str| -> Result<i64> {
            map.get(key)
                .and_then(Json::as_i64)
                .ok_or_else(|| Error::format(format!("manifest is missing '{key}'")))
        };

        let backup_type: BackupType = str_field(backup, "backup-type")?
            .parse()
            .map_err(|_| Error::format("manifest has an invalid backup type"))?;

        let db = doc
            .section(SECTION_BACKUP_DB)
            .ok_or_else(|| Error::format("manifest is missing the backup:db section"))?;

        let data = ManifestData {
            backup_label: str_field(backup, "backup-label")?,
            backup_prior: opt_str(backup, "backup-prior"),
            backup_type,
            timestamp_copy_start: int_field(backup, "backup-timestamp-copy-start")?,
            timestamp_start: int_field(backup, "backup-timestamp-start")?,
            timestamp_stop: int_field(backup, "backup-timestamp-stop")?,
            archive_start: opt_str(backup, "backup-archive-start"),
            archive_stop: opt_str(backup, "backup-archive-stop"),
            lsn_start: opt_str(backup, "backup-lsn-start"),
            lsn_stop: opt_str(backup, "backup-lsn-stop"),
            pg_id: int_field(db, "db-id")? as u32,
            pg_version: str_field(db, "db-version")?,
            pg_system_id: db
                .get("db-system-id")
                .and_then(Json::as_u64)
                .ok_or_else(|| Error::format("manifest is missing 'db-system-id'"))?,
            pg_catalog_version: int_field(db, "db-catalog-version")? as u32,
            pg_control_version: int_field(db, "db-control-version")? as u32,
        };

        let option_section = doc
            .section(SECTION_BACKUP_OPTION)
            .ok_or_else(|| Error::format("manifest is missing the backup:option section"))?;

        let bool_field = |key: &str| -> Result<bool> {
            option_section
                .get(key)
                .and_then(Json::as_bool)
                .ok_or_else(|| Error::format(format!("manifest is missing '{key}'")))
        };

        let compress_type: CompressType = opt_str(option_section, "option-compress-type")
            .unwrap_or_else(|| "none".to_string())
            .parse()
            .map_err(|_| Error::format("manifest has an invalid compress type"))?;

        let options = ManifestOptions {
            archive_check: bool_field("option-archive-check")?,
            archive_copy: bool_field("option-archive-copy")?,
            checksum_page: bool_field("option-checksum-page")?,
            compress_type,
            compress_level: option_section
                .get("option-compress-level")
                .and_then(Json::as_i64)
                .map(|level| level as i32),
            delta: bool_field("option-delta")?,
            hardlink: bool_field("option-hardlink")?,
            online: bool_field("option-online")?,
            block_incr: option_section
                .get("option-block-incr")
                .and_then(Json::as_bool)
                .unwrap_or(false),
            process_max: option_section
                .get("option-process-max")
                .and_then(Json::as_u64)
                .unwrap_or(1) as u32,
        };

        let mut manifest = Manifest::new(data, options);

        if let Some(section) = doc.section(SECTION_BACKUP_TARGET) {
            for (name, value) in section {
                let target_type = match value.get("type").and_then(Json::as_str) {
                    Some("path") => TargetType::Path,
                    Some("link") => TargetType::Link,
                    _ => return Err(Error::format(format!("target '{name}' has an invalid type"))),
                };

                manifest.add_target(
                    name,
                    ManifestTarget {
                        target_type,
                        path: value
                            .get("path")
                            .and_then(Json::as_str)
                            .ok_or_else(|| {
                                Error::format(format!("target '{name}' is missing its path"))
                            })?
                            .to_string(),
                        file: value.get("file").and_then(Json::as_str).map(str::to_string),
                        tablespace_id: value
                            .get("tablespace-id")
                            .and_then(Json::as_u64)
                            .map(|id| id as u32),
                        tablespace_name: value
                            .get("tablespace-name")
                            .and_then(Json::as_str)
                            .map(str::to_string),
                    },
                )?;
            }
        }

        // Defaults, then entries overriding them.
        let path_defaults = doc.section(SECTION_TARGET_PATH_DEFAULT);
        let default_owner = |section: Option<&BTreeMap<String, Json>>,
                             key: &str|
         -> Result<Option<String>> {
            match section.and_then(|map| map.get(key)) {
                Some(value) => owner_from_json(value),
                None => Ok(None),
            }
        };

        let path_mode_default = match path_defaults.and_then(|map| map.get("mode")) {
            Some(value) => mode_from_json(value)?,
            None => 0o700,
        };
        let path_user_default = default_owner(path_defaults, "user")?;
        let path_group_default = default_owner(path_defaults, "group")?;

        if let Some(section) = doc.section(SECTION_TARGET_PATH) {
            for (name, value) in section {
                manifest.add_path(
                    name,
                    ManifestPath {
                        mode: match value.get("mode") {
                            Some(mode) => mode_from_json(mode)?,
                            None => path_mode_default,
                        },
                        user: match value.get("user") {
                            Some(user) => owner_from_json(user)?,
                            None => path_user_default.clone(),
                        },
                        group: match value.get("group") {
                            Some(group) => owner_from_json(group)?,
                            None => path_group_default.clone(),
                        },
                    },
                )?;
            }
        }

        let file_defaults = doc.section(SECTION_TARGET_FILE_DEFAULT);
        let file_mode_default = match file_defaults.and_then(|map| map.get("mode")) {
            Some(value) => mode_from_json(value)?,
            None => 0o600,
        };
        let file_user_default = default_owner(file_defaults, "user")?;
        let file_group_default = default_owner(file_defaults, "group")?;

        if let Some(section) = doc.section(SECTION_TARGET_FILE) {
            for (name, value) in section {
                let size = value
                    .get("size")
                    .and_then(Json::as_u64)
                    .ok_or_else(|| Error::format(format!("file '{name}' is missing its size")))?;

                let checksum_page_error = match value.get("checksum-page-error") {
                    Some(Json::Array(list)) => list
                        .iter()
                        .map(|page| {
                            page.as_u64().ok_or_else(|| {
                                Error::format(format!("file '{name}' has invalid page errors"))
                            })
                        })
                        .collect::<Result<Vec<u64>>>()?,
                    Some(_) => {
                        return Err(Error::format(format!(
                            "file '{name}' has invalid page errors"
                        )))
                    }
                    None => Vec::new(),
                };

                manifest.add_file(
                    name,
                    ManifestFile {
                        size,
                        size_repo: value.get("repo-size").and_then(Json::as_u64).unwrap_or(size),
                        timestamp: value.get("timestamp").and_then(Json::as_i64).ok_or_else(
                            || Error::format(format!("file '{name}' is missing its timestamp")),
                        )?,
                        mode: match value.get("mode") {
                            Some(mode) => mode_from_json(mode)?,
                            None => file_mode_default,
                        },
                        user: match value.get("user") {
                            Some(user) => owner_from_json(user)?,
                            None => file_user_default.clone(),
                        },
                        group: match value.get("group") {
                            Some(group) => owner_from_json(group)?,
                            None => file_group_default.clone(),
                        },
                        checksum: value.get("checksum").and_then(Json::as_str).map(str::to_string),
                        checksum_repo: value
                            .get("checksum-repo")
                            .and_then(Json::as_str)
                            .map(str::to_string),
                        checksum_page: value.get("checksum-page").and_then(Json::as_bool),
                        checksum_page_error,
                        reference: value
                            .get("reference")
                            .and_then(Json::as_str)
                            .map(str::to_string),
                        bundle_id: value.get("bundle-id").and_then(Json::as_u64),
                        bundle_offset: value.get("bundle-offset").and_then(Json::as_u64),
                        block_incr_size: value.get("block-incr-size").and_then(Json::as_u64),
                        block_incr_map_size: value
                            .get("block-incr-map-size")
                            .and_then(Json::as_u64),
                    },
                )?;
            }
        }

        let link_defaults = doc.section(SECTION_TARGET_LINK_DEFAULT);
        let link_user_default = default_owner(link_defaults, "user")?;
        let link_group_default = default_owner(link_defaults, "group")?;

        if let Some(section) = doc.section(SECTION_TARGET_LINK) {
            for (name, value) in section {
                manifest.add_link(
                    name,
                    ManifestLink {
                        destination: value
                            .get("destination")
                            .and_then(Json::as_str)
                            .ok_or_else(|| {
                                Error::format(format!("link '{name}' is missing its destination"))
                            })?
                            .to_string(),
                        user: match value.get("user") {
                            Some(user) => owner_from_json(user)?,
                            None => link_user_default.clone(),
                        },
                        group: match value.get("group") {
                            Some(group) => owner_from_json(group)?,
                            None => link_group_default.clone(),
                        },
                    },
                )?;
            }
        }

        if let Some(section) = doc.section(SECTION_DB) {
            for (name, value) in section {
                manifest.add_db(
                    name,
                    ManifestDb {
                        id: value
                            .get("db-id")
                            .and_then(Json::as_u64)
                            .ok_or_else(|| Error::format(format!("db '{name}' is missing its id")))?
                            as u32,
                        last_system_id: value
                            .get("db-last-system-id")
                            .and_then(Json::as_u64)
                            .unwrap_or(0) as u32,
                    },
                )?;
            }
        }

        manifest.validate()?;
        Ok(manifest)
    }

    /// Save main and copy under `base` (the backup path in the repository,
    /// or a restore destination for resume detection).
    pub fn save(
        &self,
        storage: &Storage,
        base: &str,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<()> {
        self.validate()?;

        let mut doc = self.to_doc();
        let name = if base.is_empty() {
            MANIFEST_FILE.to_string()
        } else {
            format!("{base}/{MANIFEST_FILE}")
        };

        crate::info::info_save(storage, &name, &mut doc, cipher_type, cipher_pass)
    }

    /// Load from `base`, verifying the label matches when given.
    pub fn load(
        storage: &Storage,
        base: &str,
        expect_label: Option<&str>,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<Self> {
        let name = if base.is_empty() {
            MANIFEST_FILE.to_string()
        } else {
            format!("{base}/{MANIFEST_FILE}")
        };

        let doc = info_load(storage, &name, cipher_type, cipher_pass)?;
        let manifest = Self::from_doc(&doc)?;

        if let Some(expect) = expect_label {
            if manifest.data.backup_label != expect {
                return Err(Error::format(format!(
                    "manifest labeled '{}' but expected '{expect}'",
                    manifest.data.backup_label
                )));
            }
        }

        Ok(manifest)
    }

    /// Does a loadable manifest (or copy) exist under `base`?
    pub fn exists(storage: &Storage, base: &str) -> Result<bool> {
        let name = format!("{base}/{MANIFEST_FILE}");
        Ok(storage.exists(&name)? || storage.exists(&format!("{name}{INFO_COPY_EXT}"))?)
    }

    /// Total size and file count, for progress accounting.
    pub fn totals(&self) -> (u64, u64) {
        let size = self.files.values().map(|file| file.size).sum();
        (size, self.files.len() as u64)
    }
}

/// Map a file-missing error during manifest load to a clearer verify state.
pub fn manifest_missing(err: &Error) -> bool {
    err.kind() == ErrorKind::FileMissing
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TempPath;

    pub fn sample_manifest() -> Manifest {
        let data = ManifestData {
            backup_label: "20240101-000000F".to_string(),
            backup_prior: None,
            backup_type: BackupType::Full,
            timestamp_copy_start: 1_704_067_205,
            timestamp_start: 1_704_067_200,
            timestamp_stop: 1_704_067_260,
            archive_start: Some("000000010000000000000002".to_string()),
            archive_stop: Some("000000010000000000000003".to_string()),
            lsn_start: Some("0/2000028".to_string()),
            lsn_stop: Some("0/3000050".to_string()),
            pg_id: 1,
            pg_version: "15".to_string(),
            pg_system_id: 6_569_239_123_849_665_679,
            pg_catalog_version: 202_209_061,
            pg_control_version: 1300,
        };

        let options = ManifestOptions {
            archive_check: true,
            archive_copy: false,
            checksum_page: true,
            compress_type: CompressType::Gz,
            compress_level: Some(6),
            delta: false,
            hardlink: false,
            online: true,
            block_incr: false,
            process_max: 2,
        };

        let mut manifest = Manifest::new(data, options);

        manifest
            .add_target(
                MANIFEST_TARGET_PGDATA,
                ManifestTarget {
                    target_type: TargetType::Path,
                    path: "/var/lib/postgresql/15/main".to_string(),
                    file: None,
                    tablespace_id: None,
                    tablespace_name: None,
                },
            )
            .unwrap();

        let path = |mode| ManifestPath {
            mode,
            user: Some("postgres".to_string()),
            group: Some("postgres".to_string()),
        };
        manifest.add_path("pg_data", path(0o700)).unwrap();
        manifest.add_path("pg_data/base", path(0o700)).unwrap();
        manifest.add_path("pg_data/base/1", path(0o755)).unwrap();
        manifest.add_path("pg_data/global", path(0o700)).unwrap();

        let file = |size, timestamp| ManifestFile {
            size,
            size_repo: size,
            timestamp,
            mode: 0o600,
            user: Some("postgres".to_string()),
            group: Some("postgres".to_string()),
            ..Default::default()
        };

        manifest.add_file("pg_data/PG_VERSION", file(3, 1_704_000_000)).unwrap();
        manifest
            .add_file("pg_data/global/pg_control", file(8192, 1_704_000_100))
            .unwrap();

        let mut big = file(1_048_576, 1_704_000_200);
        big.checksum = Some("a9993e364706816aba3e25717850c26c9cd0d89d".to_string());
        big.checksum_page = Some(true);
        big.mode = 0o640;
        manifest.add_file("pg_data/base/1/1249", big).unwrap();

        manifest
            .add_link(
                "pg_data/pg_wal",
                ManifestLink {
                    destination: "/mnt/wal".to_string(),
                    user: Some("postgres".to_string()),
                    group: Some("postgres".to_string()),
                },
            )
            .unwrap();

        manifest
            .add_db("postgres", ManifestDb { id: 5, last_system_id: 13_000 })
            .unwrap();
        manifest
            .add_db("userdb1", ManifestDb { id: 16_385, last_system_id: 13_000 })
            .unwrap();

        manifest
    }

    #[test]
    fn doc_round_trip_preserves_everything() {
        let manifest = sample_manifest();
        let doc = manifest.to_doc();
        let loaded = Manifest::from_doc(&doc).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn defaults_compress_common_values() {
        let manifest = sample_manifest();
        let doc = manifest.to_doc();

        // The dominant mode lands in the default section.
        assert_eq!(
            doc.get(SECTION_TARGET_FILE_DEFAULT, "mode").unwrap(),
            &Json::from("0600")
        );

        // A file with the default mode does not repeat it.
        let plain = doc.get(SECTION_TARGET_FILE, "pg_data/PG_VERSION").unwrap();
        assert!(plain.get("mode").is_none());

        // A divergent file records its own.
        let odd = doc.get(SECTION_TARGET_FILE, "pg_data/base/1/1249").unwrap();
        assert_eq!(odd.get("mode").unwrap(), &Json::from("0640"));
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = TempPath::new("manifest");
        let storage = Storage::posix(tmp.str());

        let manifest = sample_manifest();
        manifest
            .save(&storage, "backup/20240101-000000F", CipherType::None, None)
            .unwrap();

        assert!(storage
            .exists("backup/20240101-000000F/backup.manifest.copy")
            .unwrap());

        let loaded = Manifest::load(
            &storage,
            "backup/20240101-000000F",
            Some("20240101-000000F"),
            CipherType::None,
            None,
        )
        .unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn label_mismatch_is_format_error() {
        let tmp = TempPath::new("manifest-label");
        let storage = Storage::posix(tmp.str());

        let manifest = sample_manifest();
        manifest
            .save(&storage, "backup/20240102-000000F", CipherType::None, None)
            .unwrap();

        let err = Manifest::load(
            &storage,
            "backup/20240102-000000F",
            Some("20240102-000000F"),
            CipherType::None,
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn validation_rejects_orphan_files() {
        let mut manifest = sample_manifest();
        manifest
            .add_file(
                "pg_data/base/999/1",
                ManifestFile {
                    size: 1,
                    size_repo: 1,
                    timestamp: 0,
                    mode: 0o600,
                    ..Default::default()
                },
            )
            .unwrap();

        let err = manifest.validate().unwrap_err();
        assert!(err.message().contains("no containing path"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut manifest = sample_manifest();
        let err = manifest
            .add_file("pg_data/PG_VERSION", ManifestFile::default())
            .unwrap_err();
        assert!(err.message().contains("duplicate file"));
    }

    #[test]
    fn references_are_unique_and_sorted() {
        let mut manifest = sample_manifest();
        manifest
            .update_file("pg_data/PG_VERSION", |file| {
                file.reference = Some("20231230-000000F".to_string())
            })
            .unwrap();
        manifest
            .update_file("pg_data/global/pg_control", |file| {
                file.reference = Some("20231230-000000F".to_string())
            })
            .unwrap();

        assert_eq!(manifest.references(), ["20231230-000000F"]);
    }

    #[test]
    fn unknown_owner_round_trips_as_false() {
        let mut manifest = sample_manifest();
        manifest
            .update_file("pg_data/PG_VERSION", |file| file.user = None)
            .unwrap();

        let doc = manifest.to_doc();
        let loaded = Manifest::from_doc(&doc).unwrap();
        assert_eq!(loaded.file("pg_data/PG_VERSION").unwrap().user, None);
    }
}

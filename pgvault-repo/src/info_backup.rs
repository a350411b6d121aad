//! Backup info file: PG history plus the record of every completed backup.
//!
//! A backup exists once its record lands here, and only then; the manifest
//! is written first and this file last, so an interrupted backup leaves no
//! half-registered state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use pgvault_api_types::{BackupType, CipherType, Error, ErrorKind, Result};
use pgvault_storage::Storage;

use crate::info::{info_load, info_load_checked, info_save, InfoDoc};
use crate::info_pg::{InfoPg, InfoPgKind, PgHistoryEntry};

pub const INFO_BACKUP_FILE: &str = "backup.info";

const SECTION_BACKUP_CURRENT: &str = "backup:current";

/// Format a unix time as the `YYYYMMDD-HHMMSS` label stamp (UTC).
pub fn format_label_time(time: i64) -> String {
    let days = time.div_euclid(86_400);
    let secs = time.rem_euclid(86_400);

    // Civil-from-days, valid for all times a repository will ever see.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        year,
        month,
        day,
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// Record of one completed backup as stored in `backup:current`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupRecord {
    #[serde(skip)]
    pub label: String,

    pub backup_type: BackupType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_prior: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_archive_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_archive_stop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_lsn_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_lsn_stop: Option<String>,
    pub backup_timestamp_start: i64,
    pub backup_timestamp_stop: i64,

    /// Original cluster size.
    pub backup_info_size: u64,
    /// Bytes actually copied (differs from size for diff/incr).
    pub backup_info_size_delta: u64,
    /// Size in the repository after compression.
    pub backup_info_repo_size: u64,
    pub backup_info_repo_size_delta: u64,

    pub db_id: u32,

    /// Labels this backup references for unchanged files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_reference: Vec<String>,

    pub option_archive_check: bool,
    pub option_archive_copy: bool,
    pub option_backup_standby: bool,
    pub option_checksum_page: bool,
    pub option_compress: bool,
    pub option_delta: bool,
    pub option_hardlink: bool,
    pub option_online: bool,
    #[serde(default)]
    pub option_block_incr: bool,
}

impl BackupRecord {
    /// The label chain this backup depends on, nearest first.
    pub fn prior(&self) -> Option<&str> {
        self.backup_prior.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfoBackup {
    pg: InfoPg,
    current: BTreeMap<String, BackupRecord>,
    cipher_pass: Option<String>,
}

impl InfoBackup {
    pub fn new(entry: PgHistoryEntry, cipher_pass: Option<String>) -> Result<Self> {
        Ok(Self {
            pg: InfoPg::new(InfoPgKind::Backup, entry)?,
            current: BTreeMap::new(),
            cipher_pass,
        })
    }

    pub fn load(
        storage: &Storage,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<Self> {
        let doc = info_load(storage, INFO_BACKUP_FILE, cipher_type, cipher_pass)?;
        Self::from_doc(&doc)
    }

    pub fn load_checked(
        storage: &Storage,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<(Self, Vec<String>)> {
        let (doc, warnings) =
            info_load_checked(storage, INFO_BACKUP_FILE, cipher_type, cipher_pass)?;
        Ok((Self::from_doc(&doc)?, warnings))
    }

    fn from_doc(doc: &InfoDoc) -> Result<Self> {
        let pg = InfoPg::from_doc(InfoPgKind::Backup, doc)?;
        let mut current = BTreeMap::new();

        if let Some(section) = doc.section(SECTION_BACKUP_CURRENT) {
            for (label, value) in section {
                let mut record: BackupRecord = serde_json::from_value(value.clone())
                    .map_err(|err| {
                        Error::format(format!("invalid backup record '{label}': {err}"))
                    })?;
                record.label = label.clone();
                current.insert(label.clone(), record);
            }
        }

        Ok(Self {
            pg,
            current,
            cipher_pass: doc.cipher_pass(),
        })
    }

    pub fn save(
        &self,
        storage: &Storage,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<()> {
        let mut doc = InfoDoc::new();
        self.pg.to_doc(&mut doc);

        if let Some(pass) = &self.cipher_pass {
            doc.set_cipher_pass(pass);
        }

        for (label, record) in &self.current {
            let value = serde_json::to_value(record)?;
            doc.set(SECTION_BACKUP_CURRENT, label, value);
        }

        info_save(storage, INFO_BACKUP_FILE, &mut doc, cipher_type, cipher_pass)
    }

    pub fn pg(&self) -> &InfoPg {
        &self.pg
    }

    pub fn cipher_pass(&self) -> Option<&str> {
        self.cipher_pass.as_deref()
    }

    pub fn upgrade(&mut self, entry: PgHistoryEntry) -> Result<()> {
        self.pg.add(entry)
    }

    /// Records ordered by label, which is also chronological order.
    pub fn records(&self) -> impl Iterator<Item = &BackupRecord> {
        self.current.values()
    }

    pub fn labels(&self) -> Vec<String> {
        self.current.keys().cloned().collect()
    }

    pub fn get(&self, label: &str) -> Option<&BackupRecord> {
        self.current.get(label)
    }

    pub fn latest(&self) -> Option<&BackupRecord> {
        self.current.values().next_back()
    }

    /// The backup a new backup of `backup_type` must be based on: the
    /// newest full for a diff, the newest backup of any type for an incr.
    pub fn prior_for(&self, backup_type: BackupType) -> Option<&BackupRecord> {
        match backup_type {
            BackupType::Full => None,
            BackupType::Diff => self
                .current
                .values()
                .filter(|record| record.backup_type == BackupType::Full)
                .next_back(),
            BackupType::Incr => self.latest(),
        }
    }

    /// Register a completed backup.
    pub fn add(&mut self, record: BackupRecord) -> Result<()> {
        if record.label.is_empty() {
            return Err(Error::assert("backup record has no label"));
        }

        if self.current.contains_key(&record.label) {
            return Err(Error::new(
                ErrorKind::BackupMismatch,
                format!("backup '{}' already exists", record.label),
            ));
        }

        match (&record.backup_type, &record.backup_prior) {
            (BackupType::Full, Some(prior)) => {
                return Err(Error::assert(format!(
                    "full backup may not have prior '{prior}'"
                )))
            }
            (BackupType::Full, None) => (),
            (backup_type, None) => {
                return Err(Error::assert(format!("{backup_type} backup requires a prior")))
            }
            (backup_type, Some(prior)) => {
                let prior_record = self.current.get(prior).ok_or_else(|| {
                    Error::new(
                        ErrorKind::BackupMismatch,
                        format!("prior backup '{prior}' does not exist"),
                    )
                })?;

                if !backup_type.can_follow(prior_record.backup_type) {
                    return Err(Error::new(
                        ErrorKind::BackupMismatch,
                        format!(
                            "{} backup may not be based on {} backup '{prior}'",
                            backup_type, prior_record.backup_type
                        ),
                    ));
                }
            }
        }

        if self.pg.find(record.db_id).is_none() {
            return Err(Error::new(
                ErrorKind::BackupMismatch,
                format!("backup '{}' references unknown db id {}", record.label, record.db_id),
            ));
        }

        self.current.insert(record.label.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, label: &str) -> Option<BackupRecord> {
        self.current.remove(label)
    }

    /// Labels of backups that depend on `label` through their prior chain.
    pub fn dependents(&self, label: &str) -> Vec<String> {
        self.current
            .values()
            .filter(|record| {
                let mut prior = record.prior();

                while let Some(name) = prior {
                    if name == label {
                        return true;
                    }
                    prior = self.current.get(name).and_then(BackupRecord::prior);
                }

                false
            })
            .map(|record| record.label.clone())
            .collect()
    }

    /// Generate the label for a new backup starting at `time`.
    pub fn label_new(
        &self,
        backup_type: BackupType,
        prior: Option<&str>,
        time: i64,
    ) -> Result<String> {
        let stamp = format_label_time(time);

        let label = match backup_type {
            BackupType::Full => format!("{stamp}F"),
            BackupType::Diff | BackupType::Incr => {
                let prior = prior.ok_or_else(|| {
                    Error::assert(format!("{backup_type} label requires a prior"))
                })?;

                // The full portion is shared by the whole dependency chain.
                let full_part = prior.split('_').next().unwrap_or(prior);
                let suffix = if backup_type == BackupType::Diff { 'D' } else { 'I' };
                format!("{full_part}_{stamp}{suffix}")
            }
        };

        if self.current.contains_key(&label) {
            return Err(Error::new(
                ErrorKind::BackupMismatch,
                format!("new backup label '{label}' already exists, clock went backwards?"),
            ));
        }

        Ok(label)
    }

    /// Earliest archive segment still needed by the current backups.
    pub fn archive_min(&self) -> Option<String> {
        self.current
            .values()
            .filter_map(|record| record.backup_archive_start.clone())
            .min()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{pg_entry, TempPath};

    pub fn record(label: &str, backup_type: BackupType, prior: Option<&str>) -> BackupRecord {
        BackupRecord {
            label: label.to_string(),
            backup_type,
            backup_prior: prior.map(str::to_string),
            backup_archive_start: Some("000000010000000000000002".to_string()),
            backup_archive_stop: Some("000000010000000000000002".to_string()),
            backup_lsn_start: Some("0/2000028".to_string()),
            backup_lsn_stop: Some("0/2000100".to_string()),
            backup_timestamp_start: 1_700_000_000,
            backup_timestamp_stop: 1_700_000_060,
            backup_info_size: 1_000_000,
            backup_info_size_delta: 1_000_000,
            backup_info_repo_size: 300_000,
            backup_info_repo_size_delta: 300_000,
            db_id: 1,
            backup_reference: Vec::new(),
            option_archive_check: true,
            option_archive_copy: false,
            option_backup_standby: false,
            option_checksum_page: true,
            option_compress: true,
            option_delta: false,
            option_hardlink: false,
            option_online: true,
            option_block_incr: false,
        }
    }

    #[test]
    fn label_time_formatting() {
        assert_eq!(format_label_time(0), "19700101-000000");
        assert_eq!(format_label_time(1_600_000_000), "20200913-122640");
        assert_eq!(format_label_time(951_868_800), "20000301-000000");
    }

    #[test]
    fn label_generation() {
        let info = InfoBackup::new(pg_entry(1, "15", 1111), None).unwrap();

        let full = info.label_new(BackupType::Full, None, 1_600_000_000).unwrap();
        assert_eq!(full, "20200913-122640F");

        let diff = info
            .label_new(BackupType::Diff, Some(&full), 1_600_003_600)
            .unwrap();
        assert_eq!(diff, "20200913-122640F_20200913-132640D");

        let incr = info
            .label_new(BackupType::Incr, Some(&diff), 1_600_007_200)
            .unwrap();
        assert_eq!(incr, "20200913-122640F_20200913-142640I");
    }

    #[test]
    fn dependency_validation() {
        let mut info = InfoBackup::new(pg_entry(1, "15", 1111), None).unwrap();

        info.add(record("20240101-000000F", BackupType::Full, None))
            .unwrap();

        // Diff on a full is fine; diff on a diff is not.
        info.add(record(
            "20240101-000000F_20240102-000000D",
            BackupType::Diff,
            Some("20240101-000000F"),
        ))
        .unwrap();

        let err = info
            .add(record(
                "20240101-000000F_20240103-000000D",
                BackupType::Diff,
                Some("20240101-000000F_20240102-000000D"),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupMismatch);

        // Incr may follow anything.
        info.add(record(
            "20240101-000000F_20240103-000000I",
            BackupType::Incr,
            Some("20240101-000000F_20240102-000000D"),
        ))
        .unwrap();

        // Missing prior is rejected.
        let err = info
            .add(record(
                "20240101-000000F_20240104-000000I",
                BackupType::Incr,
                Some("20231231-000000F"),
            ))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackupMismatch);
    }

    #[test]
    fn prior_selection() {
        let mut info = InfoBackup::new(pg_entry(1, "15", 1111), None).unwrap();
        assert!(info.prior_for(BackupType::Diff).is_none());

        info.add(record("20240101-000000F", BackupType::Full, None))
            .unwrap();
        info.add(record(
            "20240101-000000F_20240102-000000I",
            BackupType::Incr,
            Some("20240101-000000F"),
        ))
        .unwrap();
        info.add(record("20240105-000000F", BackupType::Full, None))
            .unwrap();

        // Diff goes back to the newest full; incr to the newest anything.
        assert_eq!(info.prior_for(BackupType::Diff).unwrap().label, "20240105-000000F");
        assert_eq!(info.prior_for(BackupType::Incr).unwrap().label, "20240105-000000F");
        assert_eq!(info.prior_for(BackupType::Full), None);
    }

    #[test]
    fn dependents_walk_the_chain() {
        let mut info = InfoBackup::new(pg_entry(1, "15", 1111), None).unwrap();

        info.add(record("20240101-000000F", BackupType::Full, None))
            .unwrap();
        info.add(record(
            "20240101-000000F_20240102-000000D",
            BackupType::Diff,
            Some("20240101-000000F"),
        ))
        .unwrap();
        info.add(record(
            "20240101-000000F_20240103-000000I",
            BackupType::Incr,
            Some("20240101-000000F_20240102-000000D"),
        ))
        .unwrap();
        info.add(record("20240105-000000F", BackupType::Full, None))
            .unwrap();

        let mut dependents = info.dependents("20240101-000000F");
        dependents.sort();
        assert_eq!(
            dependents,
            [
                "20240101-000000F_20240102-000000D",
                "20240101-000000F_20240103-000000I"
            ]
        );

        assert!(info.dependents("20240105-000000F").is_empty());
    }

    #[test]
    fn save_and_load() {
        let tmp = TempPath::new("info-backup");
        let storage = Storage::posix(tmp.str());

        let mut info = InfoBackup::new(pg_entry(1, "15", 1111), None).unwrap();
        info.add(record("20240101-000000F", BackupType::Full, None))
            .unwrap();

        let mut rec = record(
            "20240101-000000F_20240102-000000I",
            BackupType::Incr,
            Some("20240101-000000F"),
        );
        rec.backup_reference = vec!["20240101-000000F".to_string()];
        info.add(rec).unwrap();

        info.save(&storage, CipherType::None, None).unwrap();

        let loaded = InfoBackup::load(&storage, CipherType::None, None).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.latest().unwrap().label, "20240101-000000F_20240102-000000I");
        assert_eq!(
            loaded
                .get("20240101-000000F_20240102-000000I")
                .unwrap()
                .backup_reference,
            ["20240101-000000F"]
        );
    }
}

//! PostgreSQL history shared by the archive and backup info files.
//!
//! Every stanza upgrade appends an entry; the current entry is always last
//! and must match the running cluster. The archive flavor stores the subset
//! of fields WAL archiving needs; the backup flavor carries the full
//! control-file identity.

use serde_json::{json, Value as Json};

use pgvault_api_types::{Error, Result};

use crate::info::InfoDoc;

const SECTION_DB: &str = "db";
const SECTION_DB_HISTORY: &str = "db:history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoPgKind {
    Archive,
    Backup,
}

/// One cluster identity as recorded at stanza create or upgrade time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgHistoryEntry {
    pub id: u32,
    /// Version string as PostgreSQL reports it, e.g. "15".
    pub version: String,
    pub system_id: u64,
    pub catalog_version: u32,
    pub control_version: u32,
}

impl PgHistoryEntry {
    /// Archive id partitioning WAL storage, `<version>-<id>`.
    pub fn archive_id(&self) -> String {
        format!("{}-{}", self.version, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPg {
    kind: InfoPgKind,
    history: Vec<PgHistoryEntry>,
}

impl InfoPg {
    pub fn new(kind: InfoPgKind, entry: PgHistoryEntry) -> Result<Self> {
        let mut info = Self {
            kind,
            history: Vec::new(),
        };
        info.add(entry)?;
        Ok(info)
    }

    /// Append a new current entry. Ids must be strictly increasing.
    pub fn add(&mut self, entry: PgHistoryEntry) -> Result<()> {
        if let Some(current) = self.history.last() {
            if entry.id <= current.id {
                return Err(Error::assert(format!(
                    "history id {} is not greater than current id {}",
                    entry.id, current.id
                )));
            }
        }

        self.history.push(entry);
        Ok(())
    }

    pub fn current(&self) -> &PgHistoryEntry {
        self.history.last().expect("history is never empty")
    }

    pub fn history(&self) -> &[PgHistoryEntry] {
        &self.history
    }

    pub fn find(&self, id: u32) -> Option<&PgHistoryEntry> {
        self.history.iter().find(|entry| entry.id == id)
    }

    /// Archive ids newest first, for archive-get fallback after an upgrade.
    pub fn archive_ids(&self) -> Vec<String> {
        self.history
            .iter()
            .rev()
            .map(PgHistoryEntry::archive_id)
            .collect()
    }

    /// Histories must match id for id between archive.info and backup.info.
    pub fn check_match(&self, other: &InfoPg) -> Result<()> {
        let matches = self.history.len() == other.history.len()
            && self.history.iter().zip(other.history.iter()).all(|(a, b)| {
                a.id == b.id && a.version == b.version && a.system_id == b.system_id
            });

        if !matches {
            return Err(Error::format(
                "archive and backup info files do not match\n\
                 HINT: this may be a symptom of repository corruption",
            ));
        }

        Ok(())
    }

    pub fn to_doc(&self, doc: &mut InfoDoc) {
        let current = self.current();

        doc.set(SECTION_DB, "db-id", Json::from(current.id));
        doc.set(SECTION_DB, "db-system-id", Json::from(current.system_id));
        doc.set(SECTION_DB, "db-version", Json::from(current.version.as_str()));

        if self.kind == InfoPgKind::Backup {
            doc.set(
                SECTION_DB,
                "db-catalog-version",
                Json::from(current.catalog_version),
            );
            doc.set(
                SECTION_DB,
                "db-control-version",
                Json::from(current.control_version),
            );
        }

        for entry in &self.history {
            let value = match self.kind {
                InfoPgKind::Archive => json!({
                    "db-system-id": entry.system_id,
                    "db-version": entry.version,
                }),
                InfoPgKind::Backup => json!({
                    "db-catalog-version": entry.catalog_version,
                    "db-control-version": entry.control_version,
                    "db-system-id": entry.system_id,
                    "db-version": entry.version,
                }),
            };

            doc.set(SECTION_DB_HISTORY, &entry.id.to_string(), value);
        }
    }

    pub fn from_doc(kind: InfoPgKind, doc: &InfoDoc) -> Result<Self> {
        let section = doc
            .section(SECTION_DB_HISTORY)
            .ok_or_else(|| Error::format("info file is missing the db history"))?;

        let mut history = Vec::new();

        for (id, value) in section {
            let id: u32 = id
                .parse()
                .map_err(|_| Error::format(format!("invalid history id '{id}'")))?;

            let field = |name: &str| -> Result<&Json> {
                value
                    .get(name)
                    .ok_or_else(|| Error::format(format!("history {id} is missing '{name}'")))
            };

            let u32_field = |name: &str| -> Result<u32> {
                field(name)?
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| Error::format(format!("history {id} has invalid '{name}'")))
            };

            let entry = PgHistoryEntry {
                id,
                version: field("db-version")?
                    .as_str()
                    .ok_or_else(|| Error::format(format!("history {id} has invalid version")))?
                    .to_string(),
                system_id: field("db-system-id")?
                    .as_u64()
                    .ok_or_else(|| Error::format(format!("history {id} has invalid system id")))?,
                catalog_version: match kind {
                    InfoPgKind::Archive => 0,
                    InfoPgKind::Backup => u32_field("db-catalog-version")?,
                },
                control_version: match kind {
                    InfoPgKind::Archive => 0,
                    InfoPgKind::Backup => u32_field("db-control-version")?,
                },
            };

            history.push(entry);
        }

        // Section keys sort as strings; order by id and require the current
        // section to agree with the last entry.
        history.sort_by_key(|entry| entry.id);

        if history.is_empty() {
            return Err(Error::format("info file has an empty db history"));
        }

        let current_id = doc
            .get(SECTION_DB, "db-id")
            .and_then(Json::as_u64)
            .ok_or_else(|| Error::format("info file is missing the current db id"))?;

        let info = Self { kind, history };

        if u64::from(info.current().id) != current_id {
            return Err(Error::format(format!(
                "current db id {current_id} does not match history id {}",
                info.current().id
            )));
        }

        Ok(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    pub fn entry(id: u32, version: &str, system_id: u64) -> PgHistoryEntry {
        PgHistoryEntry {
            id,
            version: version.to_string(),
            system_id,
            catalog_version: 202_307_071,
            control_version: 1300,
        }
    }

    #[test]
    fn history_is_strictly_ordered() {
        let mut info = InfoPg::new(InfoPgKind::Backup, entry(1, "14", 1111)).unwrap();
        info.add(entry(2, "15", 2222)).unwrap();

        assert!(info.add(entry(2, "15", 3333)).is_err());
        assert_eq!(info.current().id, 2);
        assert_eq!(info.current().archive_id(), "15-2");
        assert_eq!(info.archive_ids(), ["15-2", "14-1"]);
    }

    #[test]
    fn doc_round_trip() {
        for kind in [InfoPgKind::Archive, InfoPgKind::Backup] {
            let mut info = InfoPg::new(kind, entry(1, "14", 1111)).unwrap();
            info.add(entry(2, "15", 2222)).unwrap();

            let mut doc = InfoDoc::new();
            info.to_doc(&mut doc);

            let loaded = InfoPg::from_doc(kind, &doc).unwrap();
            assert_eq!(loaded.history().len(), 2);
            assert_eq!(loaded.current().id, 2);
            assert_eq!(loaded.current().version, "15");
            assert_eq!(loaded.current().system_id, 2222);

            if kind == InfoPgKind::Backup {
                assert_eq!(loaded, info);
            }
        }
    }

    #[test]
    fn mismatched_histories_are_rejected() {
        let a = InfoPg::new(InfoPgKind::Archive, entry(1, "15", 1111)).unwrap();
        let b = InfoPg::new(InfoPgKind::Backup, entry(1, "15", 1111)).unwrap();
        assert!(a.check_match(&b).is_ok());

        let c = InfoPg::new(InfoPgKind::Backup, entry(1, "15", 9999)).unwrap();
        assert!(a.check_match(&c).is_err());

        let mut d = InfoPg::new(InfoPgKind::Backup, entry(1, "15", 1111)).unwrap();
        d.add(entry(2, "16", 1111)).unwrap();
        assert!(a.check_match(&d).is_err());
    }

    #[test]
    fn history_ids_sort_numerically_not_lexically() {
        let mut info = InfoPg::new(InfoPgKind::Archive, entry(1, "12", 1)).unwrap();
        for id in 2..=12 {
            info.add(entry(id, "13", u64::from(id))).unwrap();
        }

        let mut doc = InfoDoc::new();
        info.to_doc(&mut doc);

        // "10" < "2" as strings; from_doc must still order by numeric id.
        let loaded = InfoPg::from_doc(InfoPgKind::Archive, &doc).unwrap();
        let ids: Vec<u32> = loaded.history().iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=12).collect::<Vec<_>>());
    }
}

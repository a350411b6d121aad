//! Archive info file: the PG history that partitions WAL storage, plus the
//! subpass encrypting archived segments.

use pgvault_api_types::{CipherType, Result};
use pgvault_storage::Storage;

use crate::info::{info_load, info_load_checked, info_save, InfoDoc};
use crate::info_pg::{InfoPg, InfoPgKind, PgHistoryEntry};

pub const INFO_ARCHIVE_FILE: &str = "archive.info";

#[derive(Debug, Clone, PartialEq)]
pub struct InfoArchive {
    pg: InfoPg,
    cipher_pass: Option<String>,
}

impl InfoArchive {
    pub fn new(entry: PgHistoryEntry, cipher_pass: Option<String>) -> Result<Self> {
        Ok(Self {
            pg: InfoPg::new(InfoPgKind::Archive, entry)?,
            cipher_pass,
        })
    }

    pub fn load(
        storage: &Storage,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<Self> {
        let doc = info_load(storage, INFO_ARCHIVE_FILE, cipher_type, cipher_pass)?;
        Self::from_doc(&doc)
    }

    /// Verify flavor: tolerate a divergent or broken copy, reporting it.
    pub fn load_checked(
        storage: &Storage,
        cipher_type: CipherType,
        cipher_pass: Option<&str>,
    ) -> Result<(Self, Vec<String>)> {
        let (doc, warnings) =
            info_load_checked(storage, INFO_ARCHIVE_FILE, cipher_type, cipher_pass)?;
        Ok((Self::from_doc(&doc)?, warnings))
    }

    fn from_doc(doc: &InfoDoc) -> Result<Self> {
        Ok(Self {
            pg: InfoPg::from_doc(InfoPgKind::Archive, doc)?,
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

        info_save(storage, INFO_ARCHIVE_FILE, &mut doc, cipher_type, cipher_pass)
    }

    pub fn pg(&self) -> &InfoPg {
        &self.pg
    }

    /// Archive id for the current history entry.
    pub fn archive_id(&self) -> String {
        self.pg.current().archive_id()
    }

    /// Subpass for segment encryption, when the repo is encrypted.
    pub fn cipher_pass(&self) -> Option<&str> {
        self.cipher_pass.as_deref()
    }

    pub fn upgrade(&mut self, entry: PgHistoryEntry) -> Result<()> {
        self.pg.add(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{pg_entry, TempPath};

    #[test]
    fn save_and_load() {
        let tmp = TempPath::new("info-archive");
        let storage = Storage::posix(tmp.str());

        let mut info = InfoArchive::new(pg_entry(1, "14", 1111), None).unwrap();
        info.upgrade(pg_entry(2, "15", 2222)).unwrap();
        info.save(&storage, CipherType::None, None).unwrap();

        let loaded = InfoArchive::load(&storage, CipherType::None, None).unwrap();
        assert_eq!(loaded.archive_id(), "15-2");
        assert_eq!(loaded.pg().history().len(), 2);
        assert_eq!(loaded.cipher_pass(), None);
    }

    #[test]
    fn encrypted_save_keeps_subpass() {
        let tmp = TempPath::new("info-archive-cipher");
        let storage = Storage::posix(tmp.str());

        let info = InfoArchive::new(pg_entry(1, "15", 1111), Some("sub".into())).unwrap();
        info.save(&storage, CipherType::Aes256Cbc, Some("repo")).unwrap();

        let loaded =
            InfoArchive::load(&storage, CipherType::Aes256Cbc, Some("repo")).unwrap();
        assert_eq!(loaded.cipher_pass(), Some("sub"));
    }
}

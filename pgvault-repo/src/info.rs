//! Info document core.
//!
//! Small durable metadata files: line-oriented sections with JSON-encoded
//! values, an internal SHA-1 checksum over a canonical JSON rendering, and
//! a `.copy` sibling written after the main file. Readers fall back to the
//! copy when the main file is corrupt, so a crash between the two writes
//! never loses the document.

use std::collections::BTreeMap;

use openssl::hash::{Hasher, MessageDigest};
use serde_json::Value as Json;

use pgvault_api_types::{
    CipherType, Error, ErrorKind, Result, PGVAULT_VERSION, REPOSITORY_FORMAT,
};
use pgvault_storage::filter::{CipherFilter, CipherMode};
use pgvault_storage::{ReadOptions, Storage, WriteOptions};

pub const INFO_COPY_EXT: &str = ".copy";

const SECTION_BACKREST: &str = "backrest";
const SECTION_CIPHER: &str = "cipher";
const KEY_CHECKSUM: &str = "backrest-checksum";
const KEY_FORMAT: &str = "backrest-format";
const KEY_VERSION: &str = "backrest-version";
const KEY_CIPHER_PASS: &str = "cipher-pass";

/// Parsed info document: sections of JSON values. The `backrest` bookkeeping
/// section is managed here; everything else belongs to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoDoc {
    sections: BTreeMap<String, BTreeMap<String, Json>>,
}

impl InfoDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Json) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Json> {
        self.sections.get(section)?.get(key)
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, Json>> {
        self.sections.get(section)
    }

    pub fn remove_section(&mut self, section: &str) {
        self.sections.remove(section);
    }

    pub fn sections(&self) -> impl Iterator<Item = &String> {
        self.sections.keys()
    }

    pub fn cipher_pass(&self) -> Option<String> {
        self.get(SECTION_CIPHER, KEY_CIPHER_PASS)?
            .as_str()
            .map(str::to_string)
    }

    pub fn set_cipher_pass(&mut self, pass: &str) {
        self.set(SECTION_CIPHER, KEY_CIPHER_PASS, Json::from(pass));
    }

    /// Canonical JSON text the checksum covers: the `backrest` section first
    /// (checksum key excluded), then every other section in sorted order.
    fn canonical(&self) -> String {
        let mut text = String::from("{");
        let mut first_section = true;

        let mut render_section = |name: &str, keys: &BTreeMap<String, Json>, text: &mut String| {
            let mut body = String::new();
            let mut first_key = true;

            for (key, value) in keys {
                if name == SECTION_BACKREST && key == KEY_CHECKSUM {
                    continue;
                }

                if !first_key {
                    body.push(',');
                }
                first_key = false;

                body.push('"');
                body.push_str(key);
                body.push_str("\":");
                body.push_str(&value.to_string());
            }

            if !first_section {
                text.push(',');
            }
            first_section = false;

            text.push('"');
            text.push_str(name);
            text.push_str("\":{");
            text.push_str(&body);
            text.push('}');
        };

        if let Some(keys) = self.sections.get(SECTION_BACKREST) {
            render_section(SECTION_BACKREST, keys, &mut text);
        }

        for (name, keys) in &self.sections {
            if name != SECTION_BACKREST {
                render_section(name, keys, &mut text);
            }
        }

        text.push('}');
        text
    }

    pub fn checksum(&self) -> Result<String> {
        let mut hasher = Hasher::new(MessageDigest::sha1())?;
        hasher.update(self.canonical().as_bytes())?;
        Ok(hex::encode(hasher.finish()?))
    }

    /// Render the document, stamping format, version and checksum.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.set(SECTION_BACKREST, KEY_FORMAT, Json::from(REPOSITORY_FORMAT));
        self.set(SECTION_BACKREST, KEY_VERSION, Json::from(PGVAULT_VERSION));

        let checksum = self.checksum()?;
        self.set(SECTION_BACKREST, KEY_CHECKSUM, Json::from(checksum));

        let mut out = String::new();
        let mut first = true;

        for (name, keys) in &self.sections {
            if !first {
                out.push('\n');
            }
            first = false;

            out.push('[');
            out.push_str(name);
            out.push_str("]\n");

            for (key, value) in keys {
                out.push_str(key);
                out.push('=');
                out.push_str(&value.to_string());
                out.push('\n');
            }
        }

        Ok(out.into_bytes())
    }

    /// Parse and verify. The checksum must be present and match; the format
    /// must be the current repository format.
    pub fn from_bytes(data: &[u8], file_name: &str) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::format(format!("'{file_name}' is not valid utf-8")))?;

        let mut doc = InfoDoc::new();
        let mut section: Option<String> = None;

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim_end();

            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[') {
                let name = name.strip_suffix(']').ok_or_else(|| {
                    Error::format(format!("'{file_name}' line {}: bad section", line_no + 1))
                })?;
                section = Some(name.to_string());
                continue;
            }

            let section = section.as_deref().ok_or_else(|| {
                Error::format(format!(
                    "'{file_name}' line {}: key before any section",
                    line_no + 1
                ))
            })?;

            let (key, raw) = line.split_once('=').ok_or_else(|| {
                Error::format(format!("'{file_name}' line {}: missing '='", line_no + 1))
            })?;

            let value: Json = serde_json::from_str(raw).map_err(|_| {
                Error::new(
                    ErrorKind::JsonFormat,
                    format!("'{file_name}' line {}: invalid json value", line_no + 1),
                )
            })?;

            doc.set(section, key, value);
        }

        // Format check precedes the checksum so a newer repository reports
        // clearly.
        match doc.get(SECTION_BACKREST, KEY_FORMAT).and_then(Json::as_u64) {
            Some(format) if format == u64::from(REPOSITORY_FORMAT) => (),
            Some(format) => {
                return Err(Error::format(format!(
                    "invalid format in '{file_name}', expected {REPOSITORY_FORMAT} but found {format}"
                )))
            }
            None => {
                return Err(Error::format(format!(
                    "invalid format in '{file_name}', expected {REPOSITORY_FORMAT} but none found"
                )))
            }
        }

        let expected = match doc.get(SECTION_BACKREST, KEY_CHECKSUM).and_then(Json::as_str) {
            Some(expected) => expected.to_string(),
            None => {
                return Err(Error::checksum(format!(
                    "invalid checksum in '{file_name}', no checksum found"
                )))
            }
        };

        let actual = doc.checksum()?;

        if expected != actual {
            return Err(Error::checksum(format!(
                "invalid checksum in '{file_name}', expected '{actual}' but found '{expected}'"
            )));
        }

        Ok(doc)
    }
}

fn read_one(
    storage: &Storage,
    name: &str,
    cipher_type: CipherType,
    cipher_pass: Option<&str>,
) -> Result<InfoDoc> {
    let mut read = storage.open_read(name, ReadOptions::default().compressible(true))?;

    if cipher_type != CipherType::None {
        let pass = cipher_pass
            .ok_or_else(|| Error::new(ErrorKind::Crypto, "cipher passphrase not set"))?;
        read.filters_mut().add(Box::new(CipherFilter::new(
            CipherMode::Decrypt,
            cipher_type,
            pass.as_bytes(),
        )?));
    }

    let data = read.read_all().map_err(|err| {
        if err.kind() == ErrorKind::Crypto {
            Error::new(
                ErrorKind::Crypto,
                format!("unable to load '{name}': {err}\nHINT: is or was the repo encrypted?"),
            )
        } else {
            err
        }
    })?;

    InfoDoc::from_bytes(&data, name)
}

/// Load an info document, falling back to the `.copy` sibling. When both
/// fail, prefer the more interesting error: matching kinds are reported as
/// is, a missing file defers to the other file's failure.
pub fn info_load(
    storage: &Storage,
    name: &str,
    cipher_type: CipherType,
    cipher_pass: Option<&str>,
) -> Result<InfoDoc> {
    let main = match read_one(storage, name, cipher_type, cipher_pass) {
        Ok(doc) => return Ok(doc),
        Err(err) => err,
    };

    let copy_name = format!("{name}{INFO_COPY_EXT}");

    match read_one(storage, &copy_name, cipher_type, cipher_pass) {
        Ok(doc) => {
            log::warn!("'{name}' is invalid ({main}), using '{copy_name}'");
            Ok(doc)
        }
        Err(copy) => {
            let kind = if main.kind() == copy.kind() {
                main.kind()
            } else if copy.kind() == ErrorKind::FileMissing {
                main.kind()
            } else if main.kind() == ErrorKind::FileMissing {
                copy.kind()
            } else {
                ErrorKind::FileOpen
            };

            Err(Error::new(
                kind,
                format!("unable to load info file '{name}' or '{copy_name}':\n{main}\n{copy}"),
            ))
        }
    }
}

/// Check whether main and copy agree, for verify. Returns the loaded doc and
/// a warning list instead of failing on a divergent copy.
pub fn info_load_checked(
    storage: &Storage,
    name: &str,
    cipher_type: CipherType,
    cipher_pass: Option<&str>,
) -> Result<(InfoDoc, Vec<String>)> {
    let mut warnings = Vec::new();
    let copy_name = format!("{name}{INFO_COPY_EXT}");

    let main = read_one(storage, name, cipher_type, cipher_pass);
    let copy = read_one(storage, &copy_name, cipher_type, cipher_pass);

    match (main, copy) {
        (Ok(main_doc), Ok(copy_doc)) => {
            if main_doc.checksum()? != copy_doc.checksum()? {
                warnings.push(format!("'{name}' does not match '{copy_name}'"));
            }
            Ok((main_doc, warnings))
        }
        (Ok(doc), Err(err)) => {
            warnings.push(format!("'{copy_name}' is invalid: {err}"));
            Ok((doc, warnings))
        }
        (Err(err), Ok(doc)) => {
            warnings.push(format!("'{name}' is invalid: {err}"));
            Ok((doc, warnings))
        }
        (Err(main_err), Err(copy_err)) => Err(Error::new(
            main_err.kind(),
            format!(
                "unable to load info file '{name}' or '{copy_name}':\n{main_err}\n{copy_err}"
            ),
        )),
    }
}

/// Write the main file, then the copy. Both carry the same checksum.
pub fn info_save(
    storage: &Storage,
    name: &str,
    doc: &mut InfoDoc,
    cipher_type: CipherType,
    cipher_pass: Option<&str>,
) -> Result<()> {
    let data = doc.to_bytes()?;

    for target in [name.to_string(), format!("{name}{INFO_COPY_EXT}")] {
        let mut write = storage.new_write(&target, WriteOptions::default())?;

        if cipher_type != CipherType::None {
            let pass = cipher_pass
                .ok_or_else(|| Error::new(ErrorKind::Crypto, "cipher passphrase not set"))?;
            write.filters_mut().add(Box::new(CipherFilter::new(
                CipherMode::Encrypt,
                cipher_type,
                pass.as_bytes(),
            )?));
        }

        write.write(&data)?;
        write.close()?;
    }

    Ok(())
}

/// Generate a random subpass for encrypting files described by an info file.
pub fn cipher_pass_gen() -> Result<String> {
    let mut random = [0u8; 48];
    openssl::rand::rand_bytes(&mut random)?;
    Ok(base64::encode(random))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TempPath;

    fn sample_doc() -> InfoDoc {
        let mut doc = InfoDoc::new();
        doc.set("db", "db-id", Json::from(1));
        doc.set("db", "db-version", Json::from("15"));
        doc.set(
            "db:history",
            "1",
            serde_json::json!({"db-version": "15", "db-system-id": 6_569_239_123_849_665_679u64}),
        );
        doc
    }

    #[test]
    fn round_trip() {
        let mut doc = sample_doc();
        let bytes = doc.to_bytes().unwrap();

        let parsed = InfoDoc::from_bytes(&bytes, "test.info").unwrap();
        assert_eq!(parsed, doc);
        assert_eq!(parsed.checksum().unwrap(), doc.checksum().unwrap());
    }

    #[test]
    fn corrupt_value_is_checksum_error() {
        let mut doc = sample_doc();
        let bytes = doc.to_bytes().unwrap();

        let text = String::from_utf8(bytes).unwrap();
        let tampered = text.replace("\"db-version\":\"15\"", "\"db-version\":\"16\"");
        assert_ne!(text, tampered);

        let err = InfoDoc::from_bytes(tampered.as_bytes(), "test.info").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checksum);
    }

    #[test]
    fn missing_checksum_is_rejected() {
        let data = b"[backrest]\nbackrest-format=5\nbackrest-version=\"0.0\"\n";
        let err = InfoDoc::from_bytes(data, "test.info").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Checksum);
    }

    #[test]
    fn wrong_format_is_rejected() {
        let mut doc = sample_doc();
        let bytes = doc.to_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap().replace(
            "backrest-format=5",
            "backrest-format=4",
        );

        let err = InfoDoc::from_bytes(text.as_bytes(), "test.info").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.message().contains("expected 5 but found 4"));
    }

    #[test]
    fn bad_json_value_is_json_error() {
        let data = b"[db]\ndb-id=nope\n";
        let err = InfoDoc::from_bytes(data, "test.info").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JsonFormat);
    }

    #[test]
    fn save_load_with_copy_fallback() {
        let tmp = TempPath::new("info");
        let storage = Storage::posix(tmp.str());

        let mut doc = sample_doc();
        info_save(&storage, "backup.info", &mut doc, CipherType::None, None).unwrap();

        assert!(storage.exists("backup.info").unwrap());
        assert!(storage.exists("backup.info.copy").unwrap());

        // Corrupt the main file; the copy must satisfy the load.
        storage.put("backup.info", b"garbage").unwrap();
        let loaded = info_load(&storage, "backup.info", CipherType::None, None).unwrap();
        assert_eq!(loaded.get("db", "db-version"), Some(&Json::from("15")));

        // Corrupt both and the error reports both files.
        storage.put("backup.info.copy", b"garbage").unwrap();
        let err = info_load(&storage, "backup.info", CipherType::None, None).unwrap_err();
        assert!(err.message().contains("backup.info.copy"));
    }

    #[test]
    fn both_missing_is_file_missing() {
        let tmp = TempPath::new("info-missing");
        let storage = Storage::posix(tmp.str());

        let err = info_load(&storage, "backup.info", CipherType::None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileMissing);
    }

    #[test]
    fn encrypted_round_trip() {
        let tmp = TempPath::new("info-cipher");
        let storage = Storage::posix(tmp.str());

        let mut doc = sample_doc();
        doc.set_cipher_pass("sub-pass");

        info_save(
            &storage,
            "archive.info",
            &mut doc,
            CipherType::Aes256Cbc,
            Some("repo-pass"),
        )
        .unwrap();

        // On-disk bytes are unreadable without the passphrase.
        let raw = storage.get("archive.info").unwrap().unwrap();
        assert_eq!(&raw[..8], b"Salted__");

        let loaded = info_load(
            &storage,
            "archive.info",
            CipherType::Aes256Cbc,
            Some("repo-pass"),
        )
        .unwrap();
        assert_eq!(loaded.cipher_pass().as_deref(), Some("sub-pass"));

        let err = info_load(
            &storage,
            "archive.info",
            CipherType::Aes256Cbc,
            Some("wrong"),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[test]
    fn checked_load_warns_on_divergent_copy() {
        let tmp = TempPath::new("info-checked");
        let storage = Storage::posix(tmp.str());

        let mut doc = sample_doc();
        info_save(&storage, "backup.info", &mut doc, CipherType::None, None).unwrap();

        let mut other = sample_doc();
        other.set("db", "db-id", Json::from(2));
        let bytes = other.to_bytes().unwrap();
        storage.put("backup.info.copy", &bytes).unwrap();

        let (_, warnings) =
            info_load_checked(&storage, "backup.info", CipherType::None, None).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("does not match"));
    }

    #[test]
    fn generated_subpass_is_unique() {
        let a = cipher_pass_gen().unwrap();
        let b = cipher_pass_gen().unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}

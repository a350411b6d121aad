//! Archive get: fetch one WAL segment for the recovering cluster.
//!
//! Gets are stateless and take no lock. The current archive id is searched
//! first, then prior history entries, so recovery keeps working right after
//! a stanza upgrade.

use pgvault_api_types::{CompressType, Error, ErrorKind, Result};
use pgvault_repo::{layout, InfoArchive, WalSegment};
use pgvault_storage::filter::{CipherFilter, CipherMode, DecompressFilter, HashFilter};
use pgvault_storage::{InfoLevel, ReadOptions, Storage, WriteOptions};

use crate::config::{GlobalConfig, RepoConfig};

/// Fetch `segment_name` into `dest_file` (the `%p` path the cluster
/// supplies). Returns false when the segment is not archived, which the
/// caller maps to the exit status recovery expects.
pub fn archive_get(
    repo: &RepoConfig,
    _global: &GlobalConfig,
    segment_name: &str,
    dest_file: &str,
) -> Result<bool> {
    let storage = repo.storage();
    let info_archive =
        InfoArchive::load(&storage, repo.cipher_type, repo.cipher_pass.as_deref())?;

    let is_segment = WalSegment::is_segment_name(segment_name) && segment_name.len() == 24;

    for archive_id in info_archive.pg().archive_ids() {
        let found = if is_segment {
            find_segment(&storage, &archive_id, segment_name)?
        } else {
            find_history(&storage, &archive_id, segment_name)?
        };

        let (path, checksum) = match found {
            Some(found) => found,
            None => continue,
        };

        fetch(repo, &info_archive, &storage, &path, checksum.as_deref(), dest_file)?;
        log::info!("got wal file '{segment_name}' from archive {archive_id}");
        return Ok(true);
    }

    log::info!("wal file '{segment_name}' not found in the archive");
    Ok(false)
}

/// Locate a segment in one archive id. Multiple files for one segment name
/// are invalid and refused so recovery cannot replay ambiguous WAL.
fn find_segment(
    storage: &Storage,
    archive_id: &str,
    segment_name: &str,
) -> Result<Option<(String, Option<String>)>> {
    let dir = layout::wal_segment_dir(archive_id, segment_name);

    let matches: Vec<String> = storage
        .list_opt(&dir, InfoLevel::Type)?
        .into_iter()
        .map(|entry| entry.name)
        .filter(|name| name.starts_with(&format!("{segment_name}-")))
        .collect();

    match matches.len() {
        0 => Ok(None),
        1 => {
            let (_, checksum) = pgvault_repo::segment_file_split(&matches[0])?;
            Ok(Some((format!("{dir}/{}", matches[0]), Some(checksum))))
        }
        _ => Err(Error::format(format!(
            "duplicates found for wal segment '{segment_name}': {}",
            matches.join(", ")
        ))),
    }
}

fn find_history(
    storage: &Storage,
    archive_id: &str,
    name: &str,
) -> Result<Option<(String, Option<String>)>> {
    let dir = layout::archive_path(archive_id);

    let found = storage
        .list_opt(&dir, InfoLevel::Type)?
        .into_iter()
        .map(|entry| entry.name)
        .find(|entry| {
            let (base, _) = CompressType::from_name(entry);
            base == name
        });

    Ok(found.map(|entry| (format!("{dir}/{entry}"), None)))
}

fn fetch(
    repo: &RepoConfig,
    info_archive: &InfoArchive,
    storage: &Storage,
    path: &str,
    checksum: Option<&str>,
    dest_file: &str,
) -> Result<()> {
    let (_, compress_type) = CompressType::from_name(path);

    let mut read = storage.open_read(path, ReadOptions::default())?;

    if repo.cipher_type != pgvault_api_types::CipherType::None {
        let pass = info_archive.cipher_pass().ok_or_else(|| {
            Error::new(ErrorKind::Crypto, "archive cipher passphrase not set")
        })?;
        read.filters_mut().add(Box::new(CipherFilter::new(
            CipherMode::Decrypt,
            repo.cipher_type,
            pass.as_bytes(),
        )?));
    }

    if compress_type != CompressType::None {
        read.filters_mut()
            .add(Box::new(DecompressFilter::new(compress_type)?));
    }

    read.filters_mut().add(Box::new(HashFilter::sha1()?));

    // The destination is wherever the cluster asked; write through the
    // filesystem root.
    let dest = Storage::posix("/");
    let mut write = dest.new_write(
        dest_file.trim_start_matches('/'),
        WriteOptions {
            sync_path: false,
            ..WriteOptions::default()
        },
    )?;

    while let Some(block) = read.read_block()? {
        write.write(&block)?;
    }
    write.close()?;

    // The archived name embeds the checksum of the original bytes; what we
    // handed the cluster must match it.
    if let Some(expected) = checksum {
        let actual = read.filters().result_required("hash")?.as_str()?.to_string();

        if actual != expected {
            return Err(Error::checksum(format!(
                "wal file '{path}' has checksum {actual}, expected {expected}"
            )));
        }
    }

    Ok(())
}

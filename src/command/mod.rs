//! Command orchestrators.
//!
//! Each command is an entry point taking the repository and global configs
//! plus its own immutable options. Commands compose the repo metadata,
//! storage and the parallel executor; all bulk file work runs in workers.

use pgvault_api_types::Result;
use pgvault_repo::{InfoArchive, InfoBackup};
use pgvault_storage::Storage;

use crate::config::RepoConfig;

pub mod archive_get;
pub mod archive_push;
pub mod backup;
pub mod expire;
pub mod restore;
pub mod stanza;
pub mod verify;

/// Load both info files and confirm their histories agree.
pub(crate) fn load_info_pair(
    storage: &Storage,
    repo: &RepoConfig,
) -> Result<(InfoBackup, InfoArchive)> {
    let info_backup = InfoBackup::load(storage, repo.cipher_type, repo.cipher_pass.as_deref())?;
    let info_archive = InfoArchive::load(storage, repo.cipher_type, repo.cipher_pass.as_deref())?;

    info_backup.pg().check_match(info_archive.pg())?;

    Ok((info_backup, info_archive))
}

/// Current unix time; a single seam for the commands that stamp labels and
/// manifests.
pub(crate) fn time_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

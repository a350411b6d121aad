//! The `restore-file` job: reconstruct one cluster file from the
//! repository.

use std::io::{Seek, SeekFrom, Write};

use pgvault_api_types::{Error, ErrorKind, Result};
use pgvault_protocol::Value;
use pgvault_storage::filter::{digest_list, BlockMap, DeltaMapFilter, HashFilter, SHA1_EMPTY};
use pgvault_storage::{ReadOptions, Storage, WriteOptions};

use super::WorkerConfig;

pub fn run(config: &WorkerConfig, param: &Value) -> Result<Value> {
    let dest_file = param.get("dest-file").as_str()?;
    let size = param.get("size").as_u64()?;
    let checksum = param.get("checksum").as_opt_str()?.map(str::to_string);
    let mode = param.get("mode").as_u64()? as u32;
    let user = param.get("user").as_opt_str()?.map(str::to_string);
    let group = param.get("group").as_opt_str()?.map(str::to_string);
    let timestamp = param.get("timestamp").as_i64()?;
    let zero = param.get("zero").as_bool().unwrap_or(false);
    let delta = param.get("delta").as_bool().unwrap_or(false);
    let force = param.get("force").as_bool().unwrap_or(false);

    let pg = config.pg();
    let repo = config.repo();

    let write_options = WriteOptions {
        mode_file: Some(mode),
        user: user.clone(),
        group: group.clone(),
        time_modified: Some(timestamp),
        create_path: true,
        sync_file: false,
        sync_path: false,
        atomic: false,
        ..WriteOptions::default()
    };

    // Selective-restore files become zeroed content of the recorded size;
    // the cluster drops them at first connect.
    if zero {
        let mut write = pg.new_write(dest_file, write_options.clone())?;
        let buf = vec![0u8; pgvault_storage::BUFFER_SIZE.min(size as usize).max(1)];
        let mut remaining = size;

        while remaining > 0 {
            let len = remaining.min(buf.len() as u64) as usize;
            write.write(&buf[..len])?;
            remaining -= len as u64;
        }

        write.close()?;
        return Ok(result("zeroed", size));
    }

    // Force trusts size and timestamp; delta re-hashes. Either way a
    // matching file is reconciled, not rewritten.
    if force && pg.exists(dest_file)? {
        let info = pg.info_follow(dest_file, pgvault_storage::InfoLevel::Basic)?;

        if info.size == size && info.time == timestamp {
            apply_meta(&pg, dest_file, mode, &user, &group, timestamp)?;
            return Ok(result("preserved", 0));
        }
    } else if delta && pg.exists(dest_file)? {
        if let Some(expected) = &checksum {
            let mut read = pg.open_read(dest_file, ReadOptions::default())?;
            read.filters_mut().add(Box::new(HashFilter::sha1()?));
            let info = pg.info_follow(dest_file, pgvault_storage::InfoLevel::Basic)?;
            read.drain()?;

            let actual = read.filters().result_required("hash")?.as_str()?.to_string();

            if actual == *expected && info.size == size {
                apply_meta(&pg, dest_file, mode, &user, &group, timestamp)?;
                return Ok(result("preserved", 0));
            }
        }
    }

    if size == 0 {
        let write = pg.new_write(dest_file, write_options.clone())?;
        write.close()?;
        return Ok(result("copied", 0));
    }

    if !param.get("block-incr").is_null() {
        return block_incr_restore(&pg, &repo, dest_file, size, checksum.as_deref(), param, mode, &user, &group, timestamp, delta);
    }

    let repo_file = param.get("repo-file").as_str()?;
    let compressed = param.get("compress").as_bool()?;

    let mut read = repo.open_read(repo_file, ReadOptions::default().compressible(!compressed))?;
    super::repo_read_filters(&mut read, config, compressed)?;

    let mut write = pg.new_write(dest_file, write_options)?;

    while let Some(block) = read.read_block()? {
        write.write(&block)?;
    }
    write.close()?;

    let actual = read.filters().result_required("hash")?.as_str()?.to_string();
    let actual_size = read.filters().result_required("size")?.as_u64()?;

    if let Some(expected) = &checksum {
        if actual != *expected {
            return Err(Error::checksum(format!(
                "restored file '{dest_file}' has checksum {actual}, expected {expected}"
            )));
        }
    }

    if actual_size != size {
        return Err(Error::new(
            ErrorKind::Format,
            format!("restored file '{dest_file}' is {actual_size} bytes, expected {size}"),
        ));
    }

    Ok(result("copied", actual_size))
}

fn result(kind: &str, size: u64) -> Value {
    Value::obj([("result", Value::from(kind)), ("size", Value::from(size))])
}

fn apply_meta(
    pg: &Storage,
    dest_file: &str,
    mode: u32,
    user: &Option<String>,
    group: &Option<String>,
    timestamp: i64,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = pg.path(dest_file);

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
        .map_err(|err| Error::from_io(err, ErrorKind::FileWrite, &format!("chmod '{path}'")))?;

    if user.is_some() || group.is_some() {
        let uid = match user {
            Some(name) => pgvault_storage::posix::lookup_uid(name)?,
            None => None,
        };
        let gid = match group {
            Some(name) => pgvault_storage::posix::lookup_gid(name)?,
            None => None,
        };

        if nix::unistd::chown(std::path::Path::new(&path), uid, gid).is_err() {
            // Non-root restores cannot change ownership; the orchestrator
            // already warned about the owner mapping.
            log::debug!("unable to set owner of '{path}'");
        }
    }

    let timespec = nix::sys::time::TimeSpec::new(timestamp, 0);
    nix::sys::stat::utimensat(
        None,
        std::path::Path::new(&path),
        &timespec,
        &timespec,
        nix::sys::stat::UtimensatFlags::FollowSymlink,
    )
    .map_err(|err| {
        Error::new(ErrorKind::FileWrite, format!("unable to set time of '{path}': {err}"))
    })?;

    Ok(())
}

/// Rebuild a block-incremental file: fetch only blocks the destination does
/// not already have, reading each from the backup the map references.
#[allow(clippy::too_many_arguments)]
fn block_incr_restore(
    pg: &Storage,
    repo: &Storage,
    dest_file: &str,
    size: u64,
    checksum: Option<&str>,
    param: &Value,
    mode: u32,
    user: &Option<String>,
    group: &Option<String>,
    timestamp: i64,
    delta: bool,
) -> Result<Value> {
    let spec = param.get("block-incr");
    let map_file = spec.get("map-file").as_str()?;
    let map_offset = spec.get("map-offset").as_u64()?;
    let map_size = spec.get("map-size").as_u64()?;

    let mut map_read = repo.open_read(
        map_file,
        ReadOptions::default().range(map_offset, Some(map_size)),
    )?;
    let map = BlockMap::from_bytes(&map_read.read_all()?)?;

    // Hash the existing destination per block so unchanged blocks are kept.
    let local_digests = if delta && pg.exists(dest_file)? {
        let mut read = pg.open_read(dest_file, ReadOptions::default())?;
        read.filters_mut()
            .add(Box::new(DeltaMapFilter::new(map.block_size as usize)));
        read.drain()?;

        digest_list(read.filters().result_required("delta-map")?.as_bytes()?)?
    } else {
        Vec::new()
    };

    // The map references files by backup label; the file name within each
    // backup is constant.
    let name = map_file
        .splitn(3, '/')
        .nth(2)
        .ok_or_else(|| Error::format(format!("'{map_file}' is not a backup file path")))?;

    let dest_path = pg.path(dest_file);

    if let Some(parent) = std::path::Path::new(&dest_path).parent() {
        std::fs::create_dir_all(parent).map_err(|err| {
            Error::from_io(err, ErrorKind::PathCreate, &format!("create '{}'", parent.display()))
        })?;
    }

    let mut dest = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&dest_path)
        .map_err(|err| {
            Error::from_io(err, ErrorKind::FileOpen, &format!("open '{dest_path}' for restore"))
        })?;

    let mut fetched: u64 = 0;

    for (block_no, entry) in map.entries.iter().enumerate() {
        if local_digests
            .get(block_no)
            .map(|digest| *digest == entry.checksum)
            .unwrap_or(false)
        {
            continue;
        }

        let label = map.label(entry.reference)?;
        let block_file = format!("backup/{label}/{name}");

        let mut read = repo.open_read(
            &block_file,
            ReadOptions::default().range(entry.offset, Some(entry.size)),
        )?;
        let block = read.read_all()?;

        if block.len() as u64 != entry.size {
            return Err(Error::format(format!(
                "block {block_no} of '{block_file}' is truncated"
            )));
        }

        let offset = block_no as u64 * map.block_size;
        dest.seek(SeekFrom::Start(offset)).and_then(|_| dest.write_all(&block)).map_err(
            |err| Error::from_io(err, ErrorKind::FileWrite, &format!("write '{dest_path}'")),
        )?;

        fetched += block.len() as u64;
    }

    dest.set_len(size).map_err(|err| {
        Error::from_io(err, ErrorKind::FileWrite, &format!("truncate '{dest_path}'"))
    })?;
    drop(dest);

    // The reassembled file must hash to the recorded source checksum.
    let mut read = pg.open_read(dest_file, ReadOptions::default())?;
    read.filters_mut().add(Box::new(HashFilter::sha1()?));
    read.drain()?;
    let actual = read.filters().result_required("hash")?.as_str()?.to_string();

    let expected = checksum.unwrap_or(SHA1_EMPTY);
    if actual != expected {
        return Err(Error::checksum(format!(
            "restored file '{dest_file}' has checksum {actual}, expected {expected}"
        )));
    }

    apply_meta(pg, dest_file, mode, user, group, timestamp)?;

    Ok(Value::obj([
        ("result", Value::from("copied")),
        ("size", Value::from(fetched)),
    ]))
}

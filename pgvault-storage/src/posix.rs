//! Posix filesystem driver.
//!
//! Plain `std::fs` plus `nix` for ownership and timestamps. Atomic writes go
//! to `<path>.tmp` and rename into place on close; rename on one filesystem
//! is atomic, which is exactly the contract the repository needs.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::UtimensatFlags;
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, Uid};

use pgvault_api_types::{Error, ErrorKind, Result};

use crate::storage::{
    DriverWrite, FileType, InfoLevel, ReadOptions, StorageDriver, StorageEntry, StorageInfo,
    WriteOptions,
};

#[derive(Default)]
pub struct PosixDriver;

impl PosixDriver {
    pub fn new() -> Self {
        Self
    }
}

fn user_name(uid: u32) -> Option<String> {
    nix::unistd::User::from_uid(Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|user| user.name)
}

fn group_name(gid: u32) -> Option<String> {
    nix::unistd::Group::from_gid(Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|group| group.name)
}

pub fn lookup_uid(name: &str) -> Result<Option<Uid>> {
    Ok(nix::unistd::User::from_name(name)
        .map_err(|err| Error::new(ErrorKind::FileOwner, format!("user lookup failed: {err}")))?
        .map(|user| user.uid))
}

pub fn lookup_gid(name: &str) -> Result<Option<Gid>> {
    Ok(nix::unistd::Group::from_name(name)
        .map_err(|err| Error::new(ErrorKind::FileOwner, format!("group lookup failed: {err}")))?
        .map(|group| group.gid))
}

fn info_from_metadata(metadata: &fs::Metadata, path: &Path, level: InfoLevel) -> StorageInfo {
    let file_type = if metadata.file_type().is_symlink() {
        FileType::Link
    } else if metadata.is_dir() {
        FileType::Path
    } else if metadata.is_file() {
        FileType::File
    } else {
        FileType::Special
    };

    let mut info = StorageInfo {
        exists: true,
        file_type,
        ..StorageInfo::missing()
    };

    if level >= InfoLevel::Basic {
        info.size = metadata.len();
        info.time = metadata.mtime();
        info.mode = metadata.mode() & 0o7777;
        info.user_id = metadata.uid();
        info.group_id = metadata.gid();
    }

    if level >= InfoLevel::Detail {
        info.user = user_name(metadata.uid());
        info.group = group_name(metadata.gid());

        if file_type == FileType::Link {
            info.link_destination = fs::read_link(path)
                .ok()
                .map(|dest| dest.to_string_lossy().into_owned());
        }
    }

    info
}

/// Reader that stops after a byte budget, for drivers without native ranged
/// reads.
struct LimitReader {
    inner: File,
    remaining: u64,
}

impl Read for LimitReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let len = buf.len().min(self.remaining as usize);
        let read = self.inner.read(&mut buf[..len])?;
        self.remaining -= read as u64;
        Ok(read)
    }
}

pub(crate) fn create_path_with_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    // Walk down so every directory created on the way gets the mode.
    let mut missing = Vec::new();
    let mut probe = path.to_path_buf();

    while !probe.exists() {
        missing.push(probe.clone());

        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent.to_path_buf(),
            _ => break,
        }
    }

    for dir in missing.iter().rev() {
        match fs::create_dir(dir) {
            Ok(()) => {
                if let Some(mode) = mode {
                    fs::set_permissions(dir, fs::Permissions::from_mode(mode)).map_err(|err| {
                        Error::from_io(err, ErrorKind::PathCreate, &format!("chmod '{}'", dir.display()))
                    })?;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => (),
            Err(err) => {
                return Err(Error::from_io(
                    err,
                    ErrorKind::PathCreate,
                    &format!("unable to create path '{}'", dir.display()),
                ))
            }
        }
    }

    Ok(())
}

struct PosixWrite {
    file: Option<File>,
    write_path: PathBuf,
    final_path: PathBuf,
    options: WriteOptions,
    closed: bool,
}

impl Write for PosixWrite {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.file
            .as_mut()
            .expect("write after close")
            .write(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.as_mut().expect("flush after close").flush()
    }
}

impl DriverWrite for PosixWrite {
    fn close(&mut self) -> Result<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::assert("storage write already closed"))?;

        let write_err = |err: std::io::Error| {
            Error::from_io(
                err,
                ErrorKind::FileWrite,
                &format!("unable to finalize '{}'", self.final_path.display()),
            )
        };

        if self.options.sync_file {
            file.sync_all().map_err(write_err)?;
        }

        if let Some(mode) = self.options.mode_file {
            file.set_permissions(fs::Permissions::from_mode(mode))
                .map_err(write_err)?;
        }

        if self.options.user.is_some() || self.options.group.is_some() {
            let uid = match &self.options.user {
                Some(user) => lookup_uid(user)?,
                None => None,
            };
            let gid = match &self.options.group {
                Some(group) => lookup_gid(group)?,
                None => None,
            };

            nix::unistd::fchown(std::os::unix::io::AsRawFd::as_raw_fd(&file), uid, gid).map_err(
                |err| {
                    Error::new(
                        ErrorKind::FileOwner,
                        format!("unable to set owner of '{}': {err}", self.final_path.display()),
                    )
                },
            )?;
        }

        drop(file);

        if let Some(time) = self.options.time_modified {
            let timespec = TimeSpec::new(time, 0);
            nix::sys::stat::utimensat(
                None,
                &self.write_path,
                &timespec,
                &timespec,
                UtimensatFlags::FollowSymlink,
            )
            .map_err(|err| {
                Error::new(
                    ErrorKind::FileWrite,
                    format!("unable to set time of '{}': {err}", self.final_path.display()),
                )
            })?;
        }

        if self.options.atomic {
            fs::rename(&self.write_path, &self.final_path).map_err(write_err)?;
        }

        if self.options.sync_path {
            if let Some(parent) = self.final_path.parent() {
                File::open(parent)
                    .and_then(|dir| dir.sync_all())
                    .map_err(write_err)?;
            }
        }

        self.closed = true;
        Ok(())
    }
}

impl Drop for PosixWrite {
    fn drop(&mut self) {
        // An abandoned write must not leave content under the final name.
        if !self.closed {
            drop(self.file.take());

            if self.options.atomic {
                let _ = fs::remove_file(&self.write_path);
            } else {
                let _ = fs::remove_file(&self.final_path);
            }
        }
    }
}

impl StorageDriver for PosixDriver {
    fn name(&self) -> &'static str {
        "posix"
    }

    fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> Result<StorageInfo> {
        let path = Path::new(path);

        let metadata = if follow_link {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        };

        match metadata {
            Ok(metadata) => Ok(info_from_metadata(&metadata, path, level)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StorageInfo::missing()),
            Err(err) => Err(Error::from_io(
                err,
                ErrorKind::FileOpen,
                &format!("unable to stat '{}'", path.display()),
            )),
        }
    }

    fn list(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageEntry>> {
        let dir = Path::new(path);

        let read_dir = fs::read_dir(dir).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::new(
                    ErrorKind::PathMissing,
                    format!("unable to list missing path '{}'", dir.display()),
                )
            } else {
                Error::from_io(err, ErrorKind::FileOpen, &format!("unable to list '{}'", dir.display()))
            }
        })?;

        let mut entries = Vec::new();

        for entry in read_dir {
            let entry = entry.map_err(|err| {
                Error::from_io(err, ErrorKind::FileRead, &format!("unable to list '{}'", dir.display()))
            })?;

            let name = entry.file_name().to_string_lossy().into_owned();
            let info = self.info(&entry.path().to_string_lossy(), level, false)?;

            // Entries that vanish mid-listing are treated as absent.
            if !info.exists {
                continue;
            }

            entries.push(StorageEntry { name, info });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn read(&self, path: &str, options: &ReadOptions) -> Result<Option<Box<dyn Read + Send>>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && options.ignore_missing => {
                return Ok(None)
            }
            Err(err) => {
                return Err(Error::from_io(
                    err,
                    ErrorKind::FileOpen,
                    &format!("unable to open '{path}' for read"),
                ))
            }
        };

        if options.offset > 0 {
            file.seek(SeekFrom::Start(options.offset)).map_err(|err| {
                Error::from_io(err, ErrorKind::FileRead, &format!("unable to seek '{path}'"))
            })?;
        }

        Ok(Some(match options.limit {
            Some(limit) => Box::new(LimitReader {
                inner: file,
                remaining: limit,
            }),
            None => Box::new(file),
        }))
    }

    fn write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn DriverWrite>> {
        let final_path = PathBuf::from(path);

        if options.create_path {
            if let Some(parent) = final_path.parent() {
                create_path_with_mode(parent, options.mode_path)?;
            }
        }

        let write_path = if options.atomic {
            let mut tmp = final_path.clone().into_os_string();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        } else {
            final_path.clone()
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(options.truncate || options.atomic)
            .open(&write_path)
            .map_err(|err| {
                Error::from_io(
                    err,
                    ErrorKind::FileOpen,
                    &format!("unable to open '{}' for write", write_path.display()),
                )
            })?;

        Ok(Box::new(PosixWrite {
            file: Some(file),
            write_path,
            final_path,
            options: options.clone(),
            closed: false,
        }))
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !error_on_missing => Ok(()),
            Err(err) => Err(Error::from_io(
                err,
                ErrorKind::FileRemove,
                &format!("unable to remove '{path}'"),
            )),
        }
    }

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: Option<u32>,
    ) -> Result<()> {
        let dir = Path::new(path);

        if no_parent_create {
            match fs::create_dir(dir) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if error_on_exists {
                        return Err(Error::new(
                            ErrorKind::PathExists,
                            format!("path '{}' already exists", dir.display()),
                        ));
                    }

                    return Ok(());
                }
                Err(err) => {
                    return Err(Error::from_io(
                        err,
                        ErrorKind::PathCreate,
                        &format!("unable to create path '{}'", dir.display()),
                    ))
                }
            }

            if let Some(mode) = mode {
                fs::set_permissions(dir, fs::Permissions::from_mode(mode)).map_err(|err| {
                    Error::from_io(err, ErrorKind::PathCreate, &format!("chmod '{}'", dir.display()))
                })?;
            }

            return Ok(());
        }

        if error_on_exists && dir.exists() {
            return Err(Error::new(
                ErrorKind::PathExists,
                format!("path '{}' already exists", dir.display()),
            ));
        }

        create_path_with_mode(dir, mode)
    }

    fn path_remove(&self, path: &str, recurse: bool, error_on_missing: bool) -> Result<()> {
        let result = if recurse {
            fs::remove_dir_all(path)
        } else {
            fs::remove_dir(path)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !error_on_missing => Ok(()),
            Err(err) => Err(Error::from_io(
                err,
                ErrorKind::PathRemove,
                &format!("unable to remove path '{path}'"),
            )),
        }
    }

    fn path_sync(&self, path: &str) -> Result<()> {
        match File::open(path).and_then(|dir| dir.sync_all()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(Error::new(
                ErrorKind::PathMissing,
                format!("unable to sync missing path '{path}'"),
            )),
            Err(err) => Err(Error::from_io(
                err,
                ErrorKind::FileOpen,
                &format!("unable to sync path '{path}'"),
            )),
        }
    }
}

//! Stanza operation locks.
//!
//! One fcntl write lock per `(stanza, lock type)` in the lock path, held for
//! the life of the process that acquired it. The file content names the
//! holder and, for long operations, a progress percentage; readers treat it
//! as informational only since it can be stale by the time it is read.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use pgvault_api_types::{Error, ErrorKind, Result, StanzaName};

pub const LOCK_FILE_EXT: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Archive,
    Backup,
}

impl LockType {
    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Archive => "archive",
            LockType::Backup => "backup",
        }
    }
}

/// Process-unique execution id written into lock files, `<pid>-<hex>`.
pub fn exec_id_gen() -> String {
    let mut random = [0u8; 4];

    if openssl::rand::rand_bytes(&mut random).is_err() {
        random = (std::process::id() ^ 0x5a5a_5a5a).to_le_bytes();
    }

    format!("{}-{}", std::process::id(), hex::encode(random))
}

pub fn lock_file_name(lock_path: &Path, stanza: &StanzaName, lock_type: LockType) -> PathBuf {
    lock_path.join(format!("{stanza}-{}{LOCK_FILE_EXT}", lock_type.as_str()))
}

/// Held lock. Dropping the handle releases the fcntl lock with the fd.
pub struct LockHandle {
    file: std::fs::File,
    path: PathBuf,
    exec_id: String,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Refresh the progress percentage in the lock file.
    pub fn write_progress(&mut self, percent: f64) -> Result<()> {
        self.write_content(Some(percent))
    }

    fn write_content(&mut self, percent: Option<f64>) -> Result<()> {
        let mut content = format!("{}\n", self.exec_id);

        if let Some(percent) = percent {
            content.push_str(&format!("{:.2}\n", percent.clamp(0.0, 100.0)));
        }

        let write_err = |err: std::io::Error| {
            Error::from_io(
                err,
                ErrorKind::FileWrite,
                &format!("unable to write lock file '{}'", self.path.display()),
            )
        };

        self.file.set_len(0).map_err(write_err)?;
        self.file.seek(SeekFrom::Start(0)).map_err(write_err)?;
        self.file.write_all(content.as_bytes()).map_err(write_err)?;
        self.file.flush().map_err(write_err)?;

        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // Content is cleared so a later reader does not see a stale holder;
        // the lock itself dies with the fd.
        let _ = self.file.set_len(0);
    }
}

fn try_lock(file: &std::fs::File) -> std::result::Result<(), nix::errno::Errno> {
    let op = libc::flock {
        l_type: libc::F_WRLCK as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };

    nix::fcntl::fcntl(file.as_raw_fd(), nix::fcntl::FcntlArg::F_SETLK(&op)).map(|_| ())
}

/// Acquire a stanza lock, retrying until the timeout. With `fail_on_no_lock`
/// unset a held lock returns `None` instead of an error.
pub fn lock_acquire(
    lock_path: &Path,
    stanza: &StanzaName,
    lock_type: LockType,
    exec_id: &str,
    timeout: Duration,
    fail_on_no_lock: bool,
) -> Result<Option<LockHandle>> {
    std::fs::create_dir_all(lock_path).map_err(|err| {
        Error::from_io(
            err,
            ErrorKind::PathCreate,
            &format!("unable to create lock path '{}'", lock_path.display()),
        )
    })?;

    let path = lock_file_name(lock_path, stanza, lock_type);
    let deadline = Instant::now() + timeout;

    loop {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| {
                Error::from_io(
                    err,
                    ErrorKind::FileOpen,
                    &format!("unable to open lock file '{}'", path.display()),
                )
            })?;

        match try_lock(&file) {
            Ok(()) => {
                let mut handle = LockHandle {
                    file,
                    path,
                    exec_id: exec_id.to_string(),
                };
                handle.write_content(None)?;
                return Ok(Some(handle));
            }
            Err(nix::errno::Errno::EACCES) | Err(nix::errno::Errno::EAGAIN) => {
                if Instant::now() >= deadline {
                    if !fail_on_no_lock {
                        return Ok(None);
                    }

                    let holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|content| content.lines().next().map(str::to_string))
                        .unwrap_or_default();

                    return Err(Error::new(
                        ErrorKind::LockAcquire,
                        format!(
                            "unable to acquire lock on file '{}': held by process {holder}\n\
                             HINT: is another {} operation already running on this stanza?",
                            path.display(),
                            lock_type.as_str()
                        ),
                    ));
                }

                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => {
                return Err(Error::new(
                    ErrorKind::LockAcquire,
                    format!("unable to acquire lock on file '{}': {err}", path.display()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::TempPath;

    fn stanza() -> StanzaName {
        StanzaName::new("demo").unwrap()
    }

    #[test]
    fn acquire_and_release() {
        let tmp = TempPath::new("lock");
        let exec_id = exec_id_gen();

        let handle = lock_acquire(
            &tmp.path,
            &stanza(),
            LockType::Backup,
            &exec_id,
            Duration::from_millis(100),
            true,
        )
        .unwrap()
        .unwrap();

        let content = std::fs::read_to_string(handle.path()).unwrap();
        assert_eq!(content.lines().next().unwrap(), exec_id);

        // Both types coexist.
        let _archive = lock_acquire(
            &tmp.path,
            &stanza(),
            LockType::Archive,
            &exec_id,
            Duration::from_millis(100),
            true,
        )
        .unwrap()
        .unwrap();
    }

    #[test]
    fn progress_is_written() {
        let tmp = TempPath::new("lock-progress");

        let mut handle = lock_acquire(
            &tmp.path,
            &stanza(),
            LockType::Backup,
            "1234-abcd",
            Duration::from_millis(100),
            true,
        )
        .unwrap()
        .unwrap();

        handle.write_progress(42.5).unwrap();

        let content = std::fs::read_to_string(handle.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, ["1234-abcd", "42.50"]);
    }

    // Note: fcntl locks are per-process, so same-process contention cannot
    // be tested here; the second acquire below exercises the no-fail path
    // against a lock held by this process, which fcntl will grant.
    #[test]
    fn reacquire_within_process_succeeds() {
        let tmp = TempPath::new("lock-re");

        let _first = lock_acquire(
            &tmp.path,
            &stanza(),
            LockType::Backup,
            "a",
            Duration::from_millis(50),
            true,
        )
        .unwrap()
        .unwrap();

        let second = lock_acquire(
            &tmp.path,
            &stanza(),
            LockType::Backup,
            "b",
            Duration::from_millis(50),
            false,
        )
        .unwrap();
        assert!(second.is_some());
    }
}

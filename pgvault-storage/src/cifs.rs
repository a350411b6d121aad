//! CIFS driver.
//!
//! CIFS mounts behave like a posix filesystem except that directory handles
//! cannot be fsynced, so path sync is a no-op. Everything else delegates.

use std::io::Read;

use pgvault_api_types::Result;

use crate::posix::PosixDriver;
use crate::storage::{
    DriverWrite, InfoLevel, ReadOptions, StorageDriver, StorageEntry, StorageInfo, WriteOptions,
};

#[derive(Default)]
pub struct CifsDriver {
    posix: PosixDriver,
}

impl CifsDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageDriver for CifsDriver {
    fn name(&self) -> &'static str {
        "cifs"
    }

    fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> Result<StorageInfo> {
        self.posix.info(path, level, follow_link)
    }

    fn list(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageEntry>> {
        self.posix.list(path, level)
    }

    fn read(&self, path: &str, options: &ReadOptions) -> Result<Option<Box<dyn Read + Send>>> {
        self.posix.read(path, options)
    }

    fn write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn DriverWrite>> {
        // Path sync after rename would fail on CIFS, so it is disabled at
        // the handle level too.
        let mut options = options.clone();
        options.sync_path = false;
        self.posix.write(path, &options)
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        self.posix.remove(path, error_on_missing)
    }

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: Option<u32>,
    ) -> Result<()> {
        self.posix
            .path_create(path, error_on_exists, no_parent_create, mode)
    }

    fn path_remove(&self, path: &str, recurse: bool, error_on_missing: bool) -> Result<()> {
        self.posix.path_remove(path, recurse, error_on_missing)
    }

    fn path_sync(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

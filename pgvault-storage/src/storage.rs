//! Storage abstraction.
//!
//! A [`Storage`] binds a driver to a root path. All paths given to storage
//! operations are relative to that root; the facade resolves them before the
//! driver sees them, so drivers never carry path state of their own.

use std::io::Read;
use std::sync::Arc;

use pgvault_api_types::{Error, ErrorKind, Result};
use pgvault_protocol::Value;

use crate::filter::FilterGroup;
use crate::read::StorageRead;
use crate::write::StorageWrite;

/// How much of [`StorageInfo`] a caller needs. Higher levels cost extra
/// syscalls (or protocol round trips) on some drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InfoLevel {
    Exists,
    Type,
    Basic,
    Detail,
}

impl InfoLevel {
    pub fn to_u64(self) -> u64 {
        match self {
            InfoLevel::Exists => 0,
            InfoLevel::Type => 1,
            InfoLevel::Basic => 2,
            InfoLevel::Detail => 3,
        }
    }

    pub fn from_u64(value: u64) -> Result<Self> {
        match value {
            0 => Ok(InfoLevel::Exists),
            1 => Ok(InfoLevel::Type),
            2 => Ok(InfoLevel::Basic),
            3 => Ok(InfoLevel::Detail),
            _ => Err(Error::protocol(format!("invalid info level {value}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Path,
    Link,
    Special,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Path => "path",
            FileType::Link => "link",
            FileType::Special => "special",
        }
    }

    pub fn from_str(value: &str) -> Result<Self> {
        match value {
            "file" => Ok(FileType::File),
            "path" => Ok(FileType::Path),
            "link" => Ok(FileType::Link),
            "special" => Ok(FileType::Special),
            _ => Err(Error::protocol(format!("invalid file type '{value}'"))),
        }
    }
}

/// Metadata for one filesystem entry, populated up to the requested level.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub exists: bool,
    pub file_type: FileType,
    pub size: u64,
    pub time: i64,
    pub mode: u32,
    pub user: Option<String>,
    pub user_id: u32,
    pub group: Option<String>,
    pub group_id: u32,
    pub link_destination: Option<String>,
}

impl StorageInfo {
    pub fn missing() -> Self {
        Self {
            exists: false,
            file_type: FileType::Special,
            size: 0,
            time: 0,
            mode: 0,
            user: None,
            user_id: 0,
            group: None,
            group_id: 0,
            link_destination: None,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::obj([
            ("exists", Value::Bool(self.exists)),
            ("type", Value::from(self.file_type.as_str())),
            ("size", Value::from(self.size)),
            ("time", Value::Int(self.time)),
            ("mode", Value::from(self.mode)),
            ("user", self.user.clone().into()),
            ("user-id", Value::from(u64::from(self.user_id))),
            ("group", self.group.clone().into()),
            ("group-id", Value::from(u64::from(self.group_id))),
            ("link-destination", self.link_destination.clone().into()),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(Self {
            exists: value.get("exists").as_bool()?,
            file_type: FileType::from_str(value.get("type").as_str()?)?,
            size: value.get("size").as_u64()?,
            time: value.get("time").as_i64()?,
            mode: value.get("mode").as_u64()? as u32,
            user: value.get("user").as_opt_str()?.map(str::to_string),
            user_id: value.get("user-id").as_u64()? as u32,
            group: value.get("group").as_opt_str()?.map(str::to_string),
            group_id: value.get("group-id").as_u64()? as u32,
            link_destination: value
                .get("link-destination")
                .as_opt_str()?
                .map(str::to_string),
        })
    }
}

/// One directory entry from [`Storage::list`]. The name is relative to the
/// listed path.
#[derive(Debug, Clone)]
pub struct StorageEntry {
    pub name: String,
    pub info: StorageInfo,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub ignore_missing: bool,
    pub offset: u64,
    pub limit: Option<u64>,
    /// Hint that the content compresses well, for drivers with transport
    /// compression. Filesystem drivers ignore it.
    pub compressible: bool,
}

impl ReadOptions {
    pub fn ignore_missing(mut self, ignore_missing: bool) -> Self {
        self.ignore_missing = ignore_missing;
        self
    }

    pub fn range(mut self, offset: u64, limit: Option<u64>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn compressible(mut self, compressible: bool) -> Self {
        self.compressible = compressible;
        self
    }
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub mode_file: Option<u32>,
    pub mode_path: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub time_modified: Option<i64>,
    pub create_path: bool,
    pub sync_file: bool,
    pub sync_path: bool,
    /// Write to a temporary name and rename into place on close so a reader
    /// never sees partial content under the final name.
    pub atomic: bool,
    /// Discard existing content on open. Disabling this only makes sense
    /// with non-atomic writes.
    pub truncate: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode_file: None,
            mode_path: None,
            user: None,
            group: None,
            time_modified: None,
            create_path: true,
            sync_file: true,
            sync_path: true,
            atomic: true,
            truncate: true,
        }
    }
}

impl WriteOptions {
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode_file = Some(mode);
        self
    }

    pub fn owner(mut self, user: Option<String>, group: Option<String>) -> Self {
        self.user = user;
        self.group = group;
        self
    }

    pub fn time_modified(mut self, time: i64) -> Self {
        self.time_modified = Some(time);
        self
    }

    pub fn no_atomic(mut self) -> Self {
        self.atomic = false;
        self.sync_file = false;
        self.sync_path = false;
        self
    }
}

/// Raw write handle produced by a driver. `close` finalizes the write; a
/// handle dropped without close must not leave content under the final name.
pub trait DriverWrite: std::io::Write + Send {
    fn close(&mut self) -> Result<()>;
}

pub trait StorageDriver: Send + Sync {
    fn name(&self) -> &'static str;

    fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> Result<StorageInfo>;

    /// Directory entries sorted by name. Fails with `PathMissing` when the
    /// path does not exist.
    fn list(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageEntry>>;

    fn read(&self, path: &str, options: &ReadOptions) -> Result<Option<Box<dyn Read + Send>>>;

    fn write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn DriverWrite>>;

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()>;

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: Option<u32>,
    ) -> Result<()>;

    fn path_remove(&self, path: &str, recurse: bool, error_on_missing: bool) -> Result<()>;

    fn path_sync(&self, path: &str) -> Result<()>;
}

/// A driver bound to a root path.
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn StorageDriver>,
    root: String,
}

impl Storage {
    pub fn new(driver: Arc<dyn StorageDriver>, root: impl Into<String>) -> Self {
        let mut root = root.into();

        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }

        Self { driver, root }
    }

    pub fn posix(root: impl Into<String>) -> Self {
        Self::new(Arc::new(crate::posix::PosixDriver::new()), root)
    }

    pub fn cifs(root: impl Into<String>) -> Self {
        Self::new(Arc::new(crate::cifs::CifsDriver::new()), root)
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Resolve a storage-relative path against the root. An empty path names
    /// the root itself.
    pub fn path(&self, path: &str) -> String {
        if path.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{}", self.root, path)
        }
    }

    pub fn info(&self, path: &str, level: InfoLevel) -> Result<StorageInfo> {
        self.driver.info(&self.path(path), level, false)
    }

    pub fn info_follow(&self, path: &str, level: InfoLevel) -> Result<StorageInfo> {
        self.driver.info(&self.path(path), level, true)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        let info = self.info_follow(path, InfoLevel::Type)?;
        Ok(info.exists && info.file_type == FileType::File)
    }

    pub fn path_exists(&self, path: &str) -> Result<bool> {
        let info = self.info_follow(path, InfoLevel::Type)?;
        Ok(info.exists && info.file_type == FileType::Path)
    }

    pub fn list(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageEntry>> {
        self.driver.list(&self.path(path), level)
    }

    /// Like [`Storage::list`] but an absent path yields an empty list.
    pub fn list_opt(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageEntry>> {
        match self.list(path, level) {
            Ok(entries) => Ok(entries),
            Err(err) if err.kind() == ErrorKind::PathMissing => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub fn new_read(&self, path: &str, options: ReadOptions) -> Result<Option<StorageRead>> {
        let resolved = self.path(path);

        match self.driver.read(&resolved, &options)? {
            Some(inner) => Ok(Some(StorageRead::new(inner, resolved))),
            None => Ok(None),
        }
    }

    /// Open for read, failing with `FileMissing` when absent.
    pub fn open_read(&self, path: &str, options: ReadOptions) -> Result<StorageRead> {
        self.new_read(path, options)?.ok_or_else(|| {
            Error::new(
                ErrorKind::FileMissing,
                format!("unable to open '{}' for read: missing", self.path(path)),
            )
        })
    }

    pub fn new_write(&self, path: &str, options: WriteOptions) -> Result<StorageWrite> {
        let resolved = self.path(path);
        let inner = self.driver.write(&resolved, &options)?;
        Ok(StorageWrite::new(inner, resolved))
    }

    pub fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        self.driver.remove(&self.path(path), error_on_missing)
    }

    pub fn path_create(&self, path: &str, mode: Option<u32>) -> Result<()> {
        self.driver.path_create(&self.path(path), false, false, mode)
    }

    pub fn path_create_strict(&self, path: &str, mode: Option<u32>) -> Result<()> {
        self.driver.path_create(&self.path(path), true, true, mode)
    }

    pub fn path_remove(&self, path: &str, recurse: bool, error_on_missing: bool) -> Result<()> {
        self.driver
            .path_remove(&self.path(path), recurse, error_on_missing)
    }

    pub fn path_sync(&self, path: &str) -> Result<()> {
        self.driver.path_sync(&self.path(path))
    }

    /// Read a whole file into memory. `None` when absent.
    pub fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.new_read(path, ReadOptions::default().ignore_missing(true))? {
            Some(mut read) => Ok(Some(read.read_all()?)),
            None => Ok(None),
        }
    }

    /// Write a whole file with default options.
    pub fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut write = self.new_write(path, WriteOptions::default())?;
        write.write(data)?;
        write.close()?;
        Ok(())
    }

    /// Stream a read into a write, returning both filter result sets.
    pub fn copy(
        mut read: StorageRead,
        mut write: StorageWrite,
    ) -> Result<(FilterGroup, FilterGroup)> {
        while let Some(block) = read.read_block()? {
            write.write(&block)?;
        }

        let write_filters = write.close()?;
        Ok((read.into_filters(), write_filters))
    }
}

//! Remote storage driver.
//!
//! Proxies every driver operation over the worker protocol to a process
//! that holds the real storage, typically reached through an ssh transport.
//! Metadata operations are one-shot commands; reads stream data frames and
//! writes run in a server-side session so blocks can be pushed one at a
//! time.

use std::io::Read;
use std::sync::{Arc, Mutex};

use pgvault_api_types::{Error, ErrorKind, Result};
use pgvault_protocol::{Command, ProtocolClient, Value};

use crate::storage::{
    DriverWrite, InfoLevel, ReadOptions, Storage, StorageDriver, StorageEntry, StorageInfo,
    WriteOptions,
};

pub const CMD_STORAGE_INFO: &str = "storage-info";
pub const CMD_STORAGE_LIST: &str = "storage-list";
pub const CMD_STORAGE_READ: &str = "storage-read";
pub const CMD_STORAGE_WRITE: &str = "storage-write";
pub const CMD_STORAGE_REMOVE: &str = "storage-remove";
pub const CMD_STORAGE_PATH_CREATE: &str = "storage-path-create";
pub const CMD_STORAGE_PATH_REMOVE: &str = "storage-path-remove";
pub const CMD_STORAGE_PATH_SYNC: &str = "storage-path-sync";

pub fn read_options_to_value(path: &str, options: &ReadOptions) -> Value {
    Value::obj([
        ("path", Value::from(path)),
        ("ignore-missing", Value::Bool(options.ignore_missing)),
        ("offset", Value::from(options.offset)),
        ("limit", options.limit.into()),
    ])
}

pub fn read_options_from_value(value: &Value) -> Result<(String, ReadOptions)> {
    let limit = match value.get("limit") {
        Value::Null => None,
        other => Some(other.as_u64()?),
    };

    Ok((
        value.get("path").as_str()?.to_string(),
        ReadOptions {
            ignore_missing: value.get("ignore-missing").as_bool()?,
            offset: value.get("offset").as_u64()?,
            limit,
            compressible: false,
        },
    ))
}

pub fn write_options_to_value(path: &str, options: &WriteOptions) -> Value {
    Value::obj([
        ("path", Value::from(path)),
        ("mode-file", options.mode_file.into()),
        ("mode-path", options.mode_path.into()),
        ("user", options.user.clone().into()),
        ("group", options.group.clone().into()),
        ("time-modified", options.time_modified.map(Value::Int).unwrap_or(Value::Null)),
        ("create-path", Value::Bool(options.create_path)),
        ("sync-file", Value::Bool(options.sync_file)),
        ("sync-path", Value::Bool(options.sync_path)),
        ("atomic", Value::Bool(options.atomic)),
        ("truncate", Value::Bool(options.truncate)),
    ])
}

pub fn write_options_from_value(value: &Value) -> Result<(String, WriteOptions)> {
    let opt_u32 = |field: &Value| -> Result<Option<u32>> {
        match field {
            Value::Null => Ok(None),
            other => Ok(Some(other.as_u64()? as u32)),
        }
    };

    let time_modified = match value.get("time-modified") {
        Value::Null => None,
        other => Some(other.as_i64()?),
    };

    Ok((
        value.get("path").as_str()?.to_string(),
        WriteOptions {
            mode_file: opt_u32(value.get("mode-file"))?,
            mode_path: opt_u32(value.get("mode-path"))?,
            user: value.get("user").as_opt_str()?.map(str::to_string),
            group: value.get("group").as_opt_str()?.map(str::to_string),
            time_modified,
            create_path: value.get("create-path").as_bool()?,
            sync_file: value.get("sync-file").as_bool()?,
            sync_path: value.get("sync-path").as_bool()?,
            atomic: value.get("atomic").as_bool()?,
            truncate: value.get("truncate").as_bool()?,
        },
    ))
}

pub fn entries_to_value(entries: &[StorageEntry]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|entry| {
                Value::obj([
                    ("name", Value::from(entry.name.as_str())),
                    ("info", entry.info.to_value()),
                ])
            })
            .collect(),
    )
}

struct Link {
    client: ProtocolClient,
    /// A streaming read is draining data frames; other commands must wait
    /// for it or the framing desyncs.
    streaming: bool,
}

impl Link {
    fn checked(&mut self) -> Result<&mut ProtocolClient> {
        if self.streaming {
            return Err(Error::protocol(
                "remote storage is busy with a streaming read",
            ));
        }

        Ok(&mut self.client)
    }
}

pub struct RemoteDriver {
    link: Arc<Mutex<Link>>,
}

impl RemoteDriver {
    pub fn new(client: ProtocolClient) -> Self {
        Self {
            link: Arc::new(Mutex::new(Link {
                client,
                streaming: false,
            })),
        }
    }

    /// Convenience: a [`Storage`] over this driver.
    pub fn storage(client: ProtocolClient, root: impl Into<String>) -> Storage {
        Storage::new(Arc::new(Self::new(client)), root)
    }

    fn execute(&self, command: &str, param: Value, result_required: bool) -> Result<Option<Value>> {
        let mut link = self.link.lock().unwrap();
        link.checked()?.execute(&Command::new(command, param), result_required)
    }
}

struct RemoteRead {
    link: Arc<Mutex<Link>>,
    buffer: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl RemoteRead {
    fn fill(&mut self) -> Result<()> {
        let mut link = self.link.lock().unwrap();

        match link.client.data_get()? {
            Some(payload) => {
                self.buffer = payload.as_bytes()?.to_vec();
                self.pos = 0;
            }
            None => {
                self.eof = true;
                link.streaming = false;
            }
        }

        Ok(())
    }
}

impl Read for RemoteRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.buffer.len() {
            if self.eof {
                return Ok(0);
            }

            self.fill()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
        }

        let len = buf.len().min(self.buffer.len() - self.pos);
        buf[..len].copy_from_slice(&self.buffer[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }
}

impl Drop for RemoteRead {
    fn drop(&mut self) {
        // Resync the connection if the reader was abandoned mid-stream.
        if !self.eof {
            let mut link = self.link.lock().unwrap();

            while let Ok(Some(_)) = link.client.data_get() {}
            link.streaming = false;
        }
    }
}

struct RemoteWrite {
    link: Arc<Mutex<Link>>,
    session_id: u64,
    closed: bool,
}

impl std::io::Write for RemoteWrite {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut link = self.link.lock().unwrap();

        link.checked()
            .and_then(|client| {
                client.session_process(CMD_STORAGE_WRITE, self.session_id, Value::Bytes(data.to_vec()))
            })
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl DriverWrite for RemoteWrite {
    fn close(&mut self) -> Result<()> {
        let mut link = self.link.lock().unwrap();
        link.checked()?
            .session_close(CMD_STORAGE_WRITE, self.session_id, Value::Null)?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for RemoteWrite {
    fn drop(&mut self) {
        if !self.closed {
            if let Ok(mut link) = self.link.lock() {
                if let Ok(client) = link.checked() {
                    let _ = client.session_cancel(CMD_STORAGE_WRITE, self.session_id);
                }
            }
        }
    }
}

impl StorageDriver for RemoteDriver {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn info(&self, path: &str, level: InfoLevel, follow_link: bool) -> Result<StorageInfo> {
        let result = self
            .execute(
                CMD_STORAGE_INFO,
                Value::obj([
                    ("path", Value::from(path)),
                    ("level", Value::from(level.to_u64())),
                    ("follow", Value::Bool(follow_link)),
                ]),
                true,
            )?
            .unwrap_or(Value::Null);

        StorageInfo::from_value(&result)
    }

    fn list(&self, path: &str, level: InfoLevel) -> Result<Vec<StorageEntry>> {
        let result = self
            .execute(
                CMD_STORAGE_LIST,
                Value::obj([
                    ("path", Value::from(path)),
                    ("level", Value::from(level.to_u64())),
                ]),
                true,
            )?
            .unwrap_or(Value::Null);

        result
            .as_array()?
            .iter()
            .map(|entry| {
                Ok(StorageEntry {
                    name: entry.get("name").as_str()?.to_string(),
                    info: StorageInfo::from_value(entry.get("info"))?,
                })
            })
            .collect()
    }

    fn read(&self, path: &str, options: &ReadOptions) -> Result<Option<Box<dyn Read + Send>>> {
        let mut link = self.link.lock().unwrap();

        link.checked()?
            .send(&Command::new(CMD_STORAGE_READ, read_options_to_value(path, options)))?;

        // First frame reports existence; the data frames follow.
        let exists = match link.client.data_get()? {
            Some(value) => value.as_bool()?,
            None => {
                return Err(Error::protocol("storage read returned no status"));
            }
        };

        if !exists {
            link.client.data_end_get()?;

            if options.ignore_missing {
                return Ok(None);
            }

            return Err(Error::new(
                ErrorKind::FileMissing,
                format!("unable to open '{path}' for read: missing"),
            ));
        }

        link.streaming = true;
        drop(link);

        Ok(Some(Box::new(RemoteRead {
            link: Arc::clone(&self.link),
            buffer: Vec::new(),
            pos: 0,
            eof: false,
        })))
    }

    fn write(&self, path: &str, options: &WriteOptions) -> Result<Box<dyn DriverWrite>> {
        let mut link = self.link.lock().unwrap();

        let session_id = link
            .checked()?
            .session_open(CMD_STORAGE_WRITE, write_options_to_value(path, options))?;

        drop(link);

        Ok(Box::new(RemoteWrite {
            link: Arc::clone(&self.link),
            session_id,
            closed: false,
        }))
    }

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        self.execute(
            CMD_STORAGE_REMOVE,
            Value::obj([
                ("path", Value::from(path)),
                ("error-on-missing", Value::Bool(error_on_missing)),
            ]),
            false,
        )?;
        Ok(())
    }

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: Option<u32>,
    ) -> Result<()> {
        self.execute(
            CMD_STORAGE_PATH_CREATE,
            Value::obj([
                ("path", Value::from(path)),
                ("error-on-exists", Value::Bool(error_on_exists)),
                ("no-parent-create", Value::Bool(no_parent_create)),
                ("mode", mode.into()),
            ]),
            false,
        )?;
        Ok(())
    }

    fn path_remove(&self, path: &str, recurse: bool, error_on_missing: bool) -> Result<()> {
        self.execute(
            CMD_STORAGE_PATH_REMOVE,
            Value::obj([
                ("path", Value::from(path)),
                ("recurse", Value::Bool(recurse)),
                ("error-on-missing", Value::Bool(error_on_missing)),
            ]),
            false,
        )?;
        Ok(())
    }

    fn path_sync(&self, path: &str) -> Result<()> {
        self.execute(
            CMD_STORAGE_PATH_SYNC,
            Value::obj([("path", Value::from(path))]),
            false,
        )?;
        Ok(())
    }
}

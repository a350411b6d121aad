//! Server side of the remote storage driver.
//!
//! A `pgvault` process on the repository host serves these handlers over
//! its stdio (or any stream); the client side is the remote driver in the
//! storage crate. Reads stream data frames; writes run as sessions so the
//! client can push blocks one at a time.

use pgvault_api_types::{Error, Result};
use pgvault_protocol::server::{Handler, Responder, SessionHandler};
use pgvault_protocol::{ProtocolServer, ProtocolStream, Value};
use pgvault_storage::remote::{
    entries_to_value, read_options_from_value, write_options_from_value, CMD_STORAGE_INFO,
    CMD_STORAGE_LIST, CMD_STORAGE_PATH_CREATE, CMD_STORAGE_PATH_REMOVE, CMD_STORAGE_PATH_SYNC,
    CMD_STORAGE_READ, CMD_STORAGE_REMOVE, CMD_STORAGE_WRITE,
};
use pgvault_storage::{InfoLevel, Storage, StorageWrite};

pub const REMOTE_SERVICE: &str = "remote-storage";

/// A storage write kept open across session commands.
struct WriteSession {
    write: Option<StorageWrite>,
}

impl SessionHandler for WriteSession {
    fn process(&mut self, param: &Value, _out: &mut Responder) -> Result<bool> {
        let write = self
            .write
            .as_mut()
            .ok_or_else(|| Error::protocol("write session already closed"))?;

        write.write(param.as_bytes()?)?;
        Ok(true)
    }

    fn close(&mut self, _param: &Value, _out: &mut Responder) -> Result<()> {
        let write = self
            .write
            .take()
            .ok_or_else(|| Error::protocol("write session already closed"))?;

        write.close()?;
        Ok(())
    }

    fn cancel(&mut self) {
        // Dropping the write discards the temp file.
        self.write = None;
    }
}

/// Handler table serving local storage to a remote client. Paths arrive
/// already resolved against the remote root, so the local storage is rooted
/// at the filesystem.
pub fn remote_storage_handlers(storage: Storage) -> Vec<Handler<'static>> {
    let info_storage = storage.clone();
    let list_storage = storage.clone();
    let read_storage = storage.clone();
    let write_storage = storage.clone();
    let remove_storage = storage.clone();
    let path_create_storage = storage.clone();
    let path_remove_storage = storage.clone();
    let path_sync_storage = storage;

    vec![
        Handler::process(CMD_STORAGE_INFO, move |param: &Value| {
            let level = InfoLevel::from_u64(param.get("level").as_u64()?)?;
            let follow = param.get("follow").as_bool()?;
            let path = param.get("path").as_str()?;

            let info = if follow {
                info_storage.info_follow(path, level)?
            } else {
                info_storage.info(path, level)?
            };

            Ok(info.to_value())
        }),
        Handler::process(CMD_STORAGE_LIST, move |param: &Value| {
            let level = InfoLevel::from_u64(param.get("level").as_u64()?)?;
            let entries = list_storage.list(param.get("path").as_str()?, level)?;
            Ok(entries_to_value(&entries))
        }),
        Handler::process_streaming(CMD_STORAGE_READ, move |param: &Value, out: &mut Responder| {
            let (path, options) = read_options_from_value(param)?;

            // Force ignore-missing so absence is reported in-band; the
            // client decides whether that is an error.
            let mut read = match read_storage
                .new_read(&path, options.ignore_missing(true))?
            {
                Some(read) => read,
                None => {
                    out.data(Value::Bool(false))?;
                    return Ok(());
                }
            };

            out.data(Value::Bool(true))?;

            while let Some(block) = read.read_block()? {
                out.data(Value::Bytes(block))?;
            }

            Ok(())
        }),
        Handler::session(CMD_STORAGE_WRITE, move |param: &Value| {
            let (path, options) = write_options_from_value(param)?;
            let write = write_storage.new_write(&path, options)?;

            Ok(Box::new(WriteSession { write: Some(write) }) as Box<dyn SessionHandler>)
        }),
        Handler::process(CMD_STORAGE_REMOVE, move |param: &Value| {
            remove_storage.remove(
                param.get("path").as_str()?,
                param.get("error-on-missing").as_bool()?,
            )?;
            Ok(Value::Null)
        }),
        Handler::process(CMD_STORAGE_PATH_CREATE, move |param: &Value| {
            let mode = match param.get("mode") {
                Value::Null => None,
                other => Some(other.as_u64()? as u32),
            };

            if param.get("error-on-exists").as_bool()? || param.get("no-parent-create").as_bool()? {
                path_create_storage.path_create_strict(param.get("path").as_str()?, mode)?;
            } else {
                path_create_storage.path_create(param.get("path").as_str()?, mode)?;
            }

            Ok(Value::Null)
        }),
        Handler::process(CMD_STORAGE_PATH_REMOVE, move |param: &Value| {
            path_remove_storage.path_remove(
                param.get("path").as_str()?,
                param.get("recurse").as_bool()?,
                param.get("error-on-missing").as_bool()?,
            )?;
            Ok(Value::Null)
        }),
        Handler::process(CMD_STORAGE_PATH_SYNC, move |param: &Value| {
            path_sync_storage.path_sync(param.get("path").as_str()?)?;
            Ok(Value::Null)
        }),
    ]
}

/// Serve local storage over a stream until the peer disconnects or sends
/// exit. The root is usually `/` since clients send resolved paths.
pub fn run_remote_server(
    stream: Box<dyn ProtocolStream + 'static>,
    name: &str,
    storage: Storage,
    retry_interval: Vec<std::time::Duration>,
) -> Result<()> {
    let mut server = ProtocolServer::new(stream, name, REMOTE_SERVICE, retry_interval)?;
    server.run(&mut remote_storage_handlers(storage))
}

//! Worker processes.
//!
//! Each worker runs a protocol server on its end of a socket pair and
//! executes file jobs against its own storage handles. The orchestrator
//! drives the other ends through the parallel executor. Workers are spawned
//! as threads here; the protocol is identical when they run as separate
//! processes over ssh.

use std::os::unix::net::UnixStream;
use std::thread::JoinHandle;

use pgvault_api_types::{CipherType, CompressType, Error, Result};
use pgvault_protocol::server::Handler;
use pgvault_protocol::{ProtocolClient, ProtocolServer};
use pgvault_storage::filter::{
    CipherFilter, CipherMode, CompressFilter, DecompressFilter, HashFilter, SizeFilter,
};
use pgvault_storage::{Storage, StorageRead, StorageWrite};

use crate::config::GlobalConfig;

mod backup_file;
mod restore_file;
mod storage_server;
mod verify_file;

pub use storage_server::{remote_storage_handlers, run_remote_server, REMOTE_SERVICE};

pub const WORKER_SERVICE: &str = "worker";

/// The option subset workers need, passed at spawn time.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Absolute root of the stanza's repository slice.
    pub repo_root: String,
    /// Absolute path of the cluster data directory.
    pub pg_root: String,
    pub cipher_type: CipherType,
    /// Subpass protecting the files this command touches.
    pub cipher_pass: Option<String>,
    pub compress_type: CompressType,
    pub compress_level: Option<i32>,
}

impl WorkerConfig {
    fn repo(&self) -> Storage {
        Storage::posix(self.repo_root.clone())
    }

    fn pg(&self) -> Storage {
        Storage::posix(self.pg_root.clone())
    }
}

/// Attach the repository-side write filters: compression, then encryption,
/// then the hash and size of the stored bytes.
fn repo_write_filters(
    write: &mut StorageWrite,
    config: &WorkerConfig,
    compress: bool,
) -> Result<()> {
    let filters = write.filters_mut();

    if compress && config.compress_type != CompressType::None {
        filters.add(Box::new(CompressFilter::new(
            config.compress_type,
            config.compress_level,
        )?));
    }

    if config.cipher_type != CipherType::None {
        let pass = cipher_pass(config)?;
        filters.add(Box::new(CipherFilter::new(
            CipherMode::Encrypt,
            config.cipher_type,
            pass.as_bytes(),
        )?));
    }

    filters.add(Box::new(HashFilter::sha1()?));
    filters.add(Box::new(SizeFilter::new()));
    Ok(())
}

/// Inverse of [`repo_write_filters`]: decrypt, decompress, then hash and
/// size of the recovered source bytes.
fn repo_read_filters(read: &mut StorageRead, config: &WorkerConfig, compressed: bool) -> Result<()> {
    let filters = read.filters_mut();

    if config.cipher_type != CipherType::None {
        let pass = cipher_pass(config)?;
        filters.add(Box::new(CipherFilter::new(
            CipherMode::Decrypt,
            config.cipher_type,
            pass.as_bytes(),
        )?));
    }

    if compressed && config.compress_type != CompressType::None {
        filters.add(Box::new(DecompressFilter::new(config.compress_type)?));
    }

    filters.add(Box::new(HashFilter::sha1()?));
    filters.add(Box::new(SizeFilter::new()));
    Ok(())
}

fn cipher_pass(config: &WorkerConfig) -> Result<String> {
    config
        .cipher_pass
        .clone()
        .ok_or_else(|| Error::assert("cipher type set without a passphrase"))
}

/// Handler table for a job worker.
pub fn worker_handlers(config: WorkerConfig) -> Vec<Handler<'static>> {
    let backup = config.clone();
    let restore = config.clone();
    let verify = config.clone();
    let archive = config;

    vec![
        Handler::process("backup-file", move |param| backup_file::run(&backup, param)),
        Handler::process("restore-file", move |param| restore_file::run(&restore, param)),
        Handler::process("verify-file", move |param| verify_file::run(&verify, param)),
        Handler::process("archive-push-file", move |param| {
            crate::command::archive_push::push_file_job(&archive, param)
        }),
    ]
}

/// Running worker threads; join after the executor has sent exit.
pub struct WorkerPool {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Spawn `count` workers and return their protocol clients.
    pub fn spawn(
        count: u32,
        config: &WorkerConfig,
        global: &GlobalConfig,
    ) -> Result<(Vec<ProtocolClient>, WorkerPool)> {
        let mut clients = Vec::new();
        let mut handles = Vec::new();

        for idx in 0..count.max(1) {
            let (client_stream, server_stream) = UnixStream::pair().map_err(|err| {
                Error::protocol(format!("unable to create worker socket pair: {err}"))
            })?;

            let worker_config = config.clone();
            let retry = global.retry_interval.clone();
            let name = format!("worker-{idx}");
            let thread_name = name.clone();

            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let mut server = ProtocolServer::new(
                        Box::new(server_stream),
                        name,
                        WORKER_SERVICE,
                        retry,
                    )?;
                    server.run(&mut worker_handlers(worker_config))
                })
                .map_err(|err| Error::protocol(format!("unable to spawn worker: {err}")))?;

            handles.push(handle);

            clients.push(ProtocolClient::new(
                Box::new(client_stream),
                format!("worker-{idx}"),
                WORKER_SERVICE,
                global.protocol_timeout,
            )?);
        }

        Ok((clients, WorkerPool { handles }))
    }

    /// Join every worker and surface the first failure.
    pub fn join(self) -> Result<()> {
        let mut first_error = None;

        for handle in self.handles {
            match handle.join() {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    log::warn!("worker exited with error: {err}");
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(Error::assert("worker thread panicked"));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

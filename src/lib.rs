//! pgvault: reliable, parallel backup and restore for PostgreSQL clusters.
//!
//! The engine takes full, differential and incremental physical backups of
//! a cluster into a checksummed repository, archives WAL segments, restores
//! to a recovery point and verifies the whole repository end to end. Bulk
//! file work runs in parallel workers behind a framed protocol; this crate
//! holds the command orchestrators, the worker handlers and the cluster
//! interface.
//!
//! Option parsing and the command line live outside the engine. Every
//! command is a function over immutable option structs from [`config`].

pub mod command;
pub mod config;
pub mod pg;
pub mod workers;

pub use command::archive_get::archive_get;
pub use command::archive_push::{archive_push, archive_push_flush};
pub use command::backup::{backup, BackupResult};
pub use command::expire::{expire, ExpireResult};
pub use command::restore::{restore, RestoreResult};
pub use command::stanza::{stanza_create, stanza_delete, stanza_upgrade};
pub use command::verify::{verify, VerifyResult};
pub use config::{
    ArchivePushOptions, BackupOptions, ExpireOptions, GlobalConfig, RepoConfig, RestoreOptions,
    RestoreTarget, VerifyOptions,
};

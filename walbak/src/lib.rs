//! walbak: a physical backup and recovery manager for PostgreSQL clusters.
//!
//! The catalog keeps per-instance backups under `backups/<instance>/<id>/`
//! and archived WAL under `wal/<instance>/`. Backups form chains: a FULL
//! backup followed by incremental PAGE/DELTA/PTRACK descendants. The engines
//! in this crate take backups, validate them, fold incrementals into their
//! FULL ancestor, and rebuild a data directory from a chain with optional
//! point-in-time recovery.

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod checkdb;
pub mod config;
pub mod delete;
pub mod error;
pub mod filelist;
pub mod headermap;
pub mod incremental;
pub mod merge;
pub mod node;
pub mod pagefile;
pub mod restore;
pub mod show;
pub mod validate;
pub mod walscan;

#[cfg(test)]
pub mod testenv;

/// Name of the per-backup metadata file.
pub const BACKUP_CONTROL_FILE: &str = "backup.control";
/// Name of the serialized file list.
pub const BACKUP_CONTENT_FILE: &str = "backup_content.control";
/// Name of the per-backup page header map side file.
pub const PAGE_HEADER_MAP_FILE: &str = "page_header_map";
/// Subdirectory of a backup holding the data directory image.
pub const DATABASE_DIR: &str = "database";
/// Subdirectory of a backup holding copies of external directories.
pub const EXTERNAL_DIR: &str = "external";
/// Lock file inside a backup directory (shared by readers, exclusive by
/// writers) and at the instance level (exclusive only).
pub const BACKUP_LOCK_FILE: &str = "backup.pid";
/// Suffix of files that are not yet committed by rename.
pub const TEMP_FILE_SUFFIX: &str = "tmp";

/// The relative path of the cluster control file inside a data directory.
pub const PG_CONTROL_PATH: &str = "global/pg_control";

utils::project_git_version!(GIT_VERSION);

/// Program version recorded in `backup.control` and checked on read.
pub fn program_version() -> String {
    format!("{} {}", env!("CARGO_PKG_VERSION"), GIT_VERSION)
}

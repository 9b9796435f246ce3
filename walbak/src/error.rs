//! Error kinds that operator scripts depend on, and their mapping to exit
//! codes. The mapping is stable; new failure classes get new codes.

use utils::lock_file::LockError;

/// Process exit codes. `0` is success; everything else is a distinct
/// failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// Bad CLI flag, missing required path, malformed range. No I/O happened.
    ArgumentError = 1,
    /// Catalog metadata unreadable or chain unresolvable for the selected backup.
    CatalogCorrupt = 2,
    /// The selected backup failed validation.
    BackupCorrupt = 3,
    /// Block size / WAL size / system id mismatch with the catalog.
    ServerIncompatible = 4,
    /// Another run holds the instance lock.
    AlreadyRunning = 5,
    /// Interrupted by a signal.
    Interrupted = 6,
    /// WAL was not archived within the timeout, or a required segment is missing.
    WalArchiveFailed = 7,
    /// Anything else.
    Failure = 12,
}

/// Raised by workers when the process-wide interrupt flag is set. Carried
/// through anyhow chains and recognized by [`classify_error`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("interrupted")]
pub struct Interrupted;

/// The selected backup (or a chain member needed for it) is corrupt.
#[derive(thiserror::Error, Debug)]
#[error("backup {0} is corrupt: {1}")]
pub struct BackupCorrupt(pub crate::catalog::BackupId, pub String);

/// The catalog itself cannot be used for the requested operation.
#[derive(thiserror::Error, Debug)]
#[error("catalog is corrupt: {0}")]
pub struct CatalogCorrupt(pub String);

/// Source cluster is incompatible with this catalog instance.
#[derive(thiserror::Error, Debug)]
#[error("server is incompatible with the catalog: {0}")]
pub struct ServerIncompatible(pub String);

/// WAL needed by the current operation could not be obtained.
#[derive(thiserror::Error, Debug)]
#[error("WAL archive failure: {0}")]
pub struct WalArchiveFailed(pub String);

/// Walk an anyhow chain and decide which exit code the process should use.
pub fn classify_error(err: &anyhow::Error) -> ExitCode {
    for cause in err.chain() {
        if cause.downcast_ref::<Interrupted>().is_some() {
            return ExitCode::Interrupted;
        }
        if let Some(LockError::AlreadyLocked { .. }) = cause.downcast_ref::<LockError>() {
            return ExitCode::AlreadyRunning;
        }
        if cause.downcast_ref::<BackupCorrupt>().is_some() {
            return ExitCode::BackupCorrupt;
        }
        if cause.downcast_ref::<CatalogCorrupt>().is_some() {
            return ExitCode::CatalogCorrupt;
        }
        if cause.downcast_ref::<ServerIncompatible>().is_some() {
            return ExitCode::ServerIncompatible;
        }
        if cause.downcast_ref::<WalArchiveFailed>().is_some() {
            return ExitCode::WalArchiveFailed;
        }
    }
    ExitCode::Failure
}

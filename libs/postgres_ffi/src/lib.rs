//! On-disk structures of a PostgreSQL cluster, as far as a physical backup
//! tool needs to understand them: data-file pages, the control file, WAL
//! segment and record headers, and relation file naming.
//!
//! Everything here is a plain byte-level codec. There is no libpq and no
//! generated bindings; the handful of structures we touch is small and the
//! layouts are stable within a major version. The layout implemented here is
//! the PostgreSQL 14 one; `pg_control_version` / page layout version checks
//! reject incompatible clusters instead of misreading them.

pub mod controlfile;
pub mod page_layout;
pub mod pg_constants;
pub mod relpath;
pub mod xlog_utils;

pub use controlfile::ControlFileData;
pub use page_layout::PageHeaderData;
pub use relpath::RelFileTag;

/// Size of one data-file page.
pub const BLCKSZ: u16 = 8192;

/// Size of one WAL page. WAL segments are arrays of these.
pub const XLOG_BLCKSZ: usize = 8192;

/// Default WAL segment size. The actual size of a cluster's segments is read
/// from its control file; this is the initdb default.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Relations are split into segments of this many blocks (1 GiB files).
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / (BLCKSZ as u32);

pub type XLogSegNo = u64;
pub type TimeLineID = u32;
pub type TimestampTz = i64;
pub type TransactionId = u32;
pub type Oid = u32;

/// Interval of the PostgreSQL timestamptz epoch (2000-01-01) from the Unix
/// epoch, in seconds.
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

pub fn to_unix_secs(pg_timestamp: TimestampTz) -> i64 {
    pg_timestamp / 1_000_000 + PG_EPOCH_OFFSET_SECS
}

/// Compute an XLogFileName, the canonical name of one WAL segment file.
#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, logseg: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        logseg / XLogSegmentsPerXLogId(wal_segsz_bytes),
        logseg % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(
    segno: XLogSegNo,
    offset: u32,
    wal_segsz_bytes: usize,
) -> utils::lsn::Lsn {
    utils::lsn::Lsn(segno * (wal_segsz_bytes as u64) + offset as u64)
}

/// Parse a WAL segment file name back into (timeline, segment number).
///
/// Only accepts the exact 24-hex-digit form; suffixes like `.gz` or
/// `.partial` must be stripped by the caller.
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> Option<(XLogSegNo, TimeLineID)> {
    if fname.len() != 24 || !fname.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u64::from_str_radix(&fname[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&fname[16..24], 16).ok()?;
    Some((log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli))
}

/// True for names that look like a WAL segment file (no suffix).
pub fn is_xlog_file_name(fname: &str) -> bool {
    fname.len() == 24 && fname.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True for timeline history file names, `<tli>.history`.
pub fn is_history_file_name(fname: &str) -> bool {
    match fname.strip_suffix(".history") {
        Some(stem) => stem.len() == 8 && stem.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}

//! Reading and (narrowly) rewriting the cluster control file, `global/pg_control`.
//!
//! The control file is a fixed struct followed by zero padding up to 8 KiB,
//! with a CRC-32C over the struct placed in its last member. We parse the
//! PostgreSQL 14 layout; `pg_control_version` is checked so an incompatible
//! cluster is rejected rather than misread. The only mutation this tool ever
//! performs is bumping `minRecoveryPoint` after a backup taken from a
//! replica, so the write path patches fields in the original image instead of
//! re-serializing the whole struct.

use byteorder::{ByteOrder, LittleEndian};
use utils::lsn::Lsn;

use crate::TimeLineID;

/// Total size of the file. Writes are padded to this to make the write atomic
/// at the disk level.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;

/// `PG_CONTROL_VERSION` of the layout parsed here (PostgreSQL 13+v14 family).
pub const PG_CONTROL_VERSION: u32 = 1300;

// Byte offsets of the fields we touch, for the layout above. The struct is
// 8-byte aligned throughout; offsets account for the paddings.
const OFF_SYSTEM_IDENTIFIER: usize = 0;
const OFF_PG_CONTROL_VERSION: usize = 8;
const OFF_CATALOG_VERSION_NO: usize = 12;
const OFF_STATE: usize = 16;
const OFF_TIME: usize = 24;
const OFF_CHECKPOINT: usize = 32;
// CheckPoint copy, embedded:
const OFF_CHECKPOINT_REDO: usize = 40;
const OFF_CHECKPOINT_TLI: usize = 48;
const OFF_CHECKPOINT_PREV_TLI: usize = 52;
const OFF_CHECKPOINT_NEXT_XID: usize = 64;
const OFF_CHECKPOINT_OLDEST_XID: usize = 84;
const OFF_CHECKPOINT_OLDEST_ACTIVE_XID: usize = 120;
// back to ControlFileData proper:
const OFF_UNLOGGED_LSN: usize = 128;
const OFF_MIN_RECOVERY_POINT: usize = 136;
const OFF_MIN_RECOVERY_POINT_TLI: usize = 144;
const OFF_BACKUP_START_POINT: usize = 152;
const OFF_BACKUP_END_POINT: usize = 160;
const OFF_BACKUP_END_REQUIRED: usize = 168;
const OFF_WAL_LEVEL: usize = 172;
const OFF_MAXALIGN: usize = 200;
const OFF_BLCKSZ: usize = 212;
const OFF_RELSEG_SIZE: usize = 216;
const OFF_XLOG_BLCKSZ: usize = 220;
const OFF_XLOG_SEG_SIZE: usize = 224;
const OFF_DATA_CHECKSUM_VERSION: usize = 244;
const OFF_MOCK_AUTH_NONCE: usize = 248;
const OFF_CRC: usize = OFF_MOCK_AUTH_NONCE + 32;

/// Database cluster state, a subset of `DBState`.
pub const DB_SHUTDOWNED: u32 = 1;
pub const DB_IN_PRODUCTION: u32 = 6;

#[derive(Debug, Clone)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: u32,
    pub checkpoint: Lsn,
    pub checkpoint_redo: Lsn,
    pub checkpoint_tli: TimeLineID,
    pub checkpoint_prev_tli: TimeLineID,
    pub next_xid: u64,
    pub oldest_xid: u32,
    pub oldest_active_xid: u32,
    pub min_recovery_point: Lsn,
    pub min_recovery_point_tli: TimeLineID,
    pub backup_start_point: Lsn,
    pub backup_end_point: Lsn,
    pub wal_level: u32,
    pub blcksz: u32,
    pub relseg_size: u32,
    pub xlog_blcksz: u32,
    pub xlog_seg_size: u32,
    pub data_checksum_version: u32,
    pub crc: u32,

    /// The raw image the struct was parsed from. Kept so that the narrow
    /// write path can patch fields without re-deriving padding.
    raw: Vec<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum ControlFileError {
    #[error("control file is too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported pg_control version {found} (supported: {PG_CONTROL_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("control file CRC mismatch: stored {stored:#x}, computed {computed:#x}")]
    BadCrc { stored: u32, computed: u32 },
}

fn read_lsn(buf: &[u8], off: usize) -> Lsn {
    Lsn(LittleEndian::read_u64(&buf[off..off + 8]))
}

impl ControlFileData {
    /// Parse and CRC-check a control file image.
    pub fn decode(buf: &[u8]) -> Result<ControlFileData, ControlFileError> {
        if buf.len() < OFF_CRC + 4 {
            return Err(ControlFileError::TooShort(buf.len()));
        }

        let pg_control_version = LittleEndian::read_u32(&buf[OFF_PG_CONTROL_VERSION..]);
        if pg_control_version != PG_CONTROL_VERSION {
            return Err(ControlFileError::UnsupportedVersion {
                found: pg_control_version,
            });
        }

        let stored_crc = LittleEndian::read_u32(&buf[OFF_CRC..]);
        let computed_crc = crc32c::crc32c(&buf[0..OFF_CRC]);
        if stored_crc != computed_crc {
            return Err(ControlFileError::BadCrc {
                stored: stored_crc,
                computed: computed_crc,
            });
        }

        Ok(ControlFileData {
            system_identifier: LittleEndian::read_u64(&buf[OFF_SYSTEM_IDENTIFIER..]),
            pg_control_version,
            catalog_version_no: LittleEndian::read_u32(&buf[OFF_CATALOG_VERSION_NO..]),
            state: LittleEndian::read_u32(&buf[OFF_STATE..]),
            checkpoint: read_lsn(buf, OFF_CHECKPOINT),
            checkpoint_redo: read_lsn(buf, OFF_CHECKPOINT_REDO),
            checkpoint_tli: LittleEndian::read_u32(&buf[OFF_CHECKPOINT_TLI..]),
            checkpoint_prev_tli: LittleEndian::read_u32(&buf[OFF_CHECKPOINT_PREV_TLI..]),
            next_xid: LittleEndian::read_u64(&buf[OFF_CHECKPOINT_NEXT_XID..]),
            oldest_xid: LittleEndian::read_u32(&buf[OFF_CHECKPOINT_OLDEST_XID..]),
            oldest_active_xid: LittleEndian::read_u32(&buf[OFF_CHECKPOINT_OLDEST_ACTIVE_XID..]),
            min_recovery_point: read_lsn(buf, OFF_MIN_RECOVERY_POINT),
            min_recovery_point_tli: LittleEndian::read_u32(&buf[OFF_MIN_RECOVERY_POINT_TLI..]),
            backup_start_point: read_lsn(buf, OFF_BACKUP_START_POINT),
            backup_end_point: read_lsn(buf, OFF_BACKUP_END_POINT),
            wal_level: LittleEndian::read_u32(&buf[OFF_WAL_LEVEL..]),
            blcksz: LittleEndian::read_u32(&buf[OFF_BLCKSZ..]),
            relseg_size: LittleEndian::read_u32(&buf[OFF_RELSEG_SIZE..]),
            xlog_blcksz: LittleEndian::read_u32(&buf[OFF_XLOG_BLCKSZ..]),
            xlog_seg_size: LittleEndian::read_u32(&buf[OFF_XLOG_SEG_SIZE..]),
            data_checksum_version: LittleEndian::read_u32(&buf[OFF_DATA_CHECKSUM_VERSION..]),
            crc: stored_crc,
            raw: buf.to_vec(),
        })
    }

    /// Patch `minRecoveryPoint` (and its timeline), recompute the CRC, and
    /// return a full-size image ready to be written back.
    pub fn encode_with_min_recovery_point(&self, lsn: Lsn, tli: TimeLineID) -> Vec<u8> {
        let mut buf = self.raw.clone();
        buf.resize(PG_CONTROL_FILE_SIZE, 0);
        LittleEndian::write_u64(&mut buf[OFF_MIN_RECOVERY_POINT..], lsn.0);
        LittleEndian::write_u32(&mut buf[OFF_MIN_RECOVERY_POINT_TLI..], tli);
        // Taking a backup clears any inherited in-backup markers.
        LittleEndian::write_u64(&mut buf[OFF_BACKUP_START_POINT..], 0);
        LittleEndian::write_u64(&mut buf[OFF_BACKUP_END_POINT..], 0);
        buf[OFF_BACKUP_END_REQUIRED] = 0;
        let crc = crc32c::crc32c(&buf[0..OFF_CRC]);
        LittleEndian::write_u32(&mut buf[OFF_CRC..], crc);
        buf
    }

    pub fn maxalign(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[OFF_MAXALIGN..])
    }

    pub fn checksums_enabled(&self) -> bool {
        self.data_checksum_version != 0
    }
}

/// Build a minimal, CRC-valid control file image. Test fixture for this
/// crate and its dependents; never used on a live cluster.
#[doc(hidden)]
pub fn make_test_controlfile(
    system_identifier: u64,
    redo: Lsn,
    tli: TimeLineID,
    xlog_seg_size: u32,
    data_checksum_version: u32,
) -> Vec<u8> {
    let mut buf = vec![0u8; PG_CONTROL_FILE_SIZE];
    LittleEndian::write_u64(&mut buf[OFF_SYSTEM_IDENTIFIER..], system_identifier);
    LittleEndian::write_u32(&mut buf[OFF_PG_CONTROL_VERSION..], PG_CONTROL_VERSION);
    LittleEndian::write_u32(&mut buf[OFF_CATALOG_VERSION_NO..], 202107181);
    LittleEndian::write_u32(&mut buf[OFF_STATE..], DB_IN_PRODUCTION);
    LittleEndian::write_u64(&mut buf[OFF_CHECKPOINT..], redo.0);
    LittleEndian::write_u64(&mut buf[OFF_CHECKPOINT_REDO..], redo.0);
    LittleEndian::write_u32(&mut buf[OFF_CHECKPOINT_TLI..], tli);
    LittleEndian::write_u32(&mut buf[OFF_CHECKPOINT_PREV_TLI..], tli);
    LittleEndian::write_u32(&mut buf[OFF_MAXALIGN..], 8);
    LittleEndian::write_u32(&mut buf[OFF_BLCKSZ..], crate::BLCKSZ as u32);
    LittleEndian::write_u32(&mut buf[OFF_RELSEG_SIZE..], crate::RELSEG_SIZE);
    LittleEndian::write_u32(&mut buf[OFF_XLOG_BLCKSZ..], crate::XLOG_BLCKSZ as u32);
    LittleEndian::write_u32(&mut buf[OFF_XLOG_SEG_SIZE..], xlog_seg_size);
    LittleEndian::write_u32(&mut buf[OFF_DATA_CHECKSUM_VERSION..], data_checksum_version);
    let crc = crc32c::crc32c(&buf[0..OFF_CRC]);
    LittleEndian::write_u32(&mut buf[OFF_CRC..], crc);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let image = make_test_controlfile(0xDEADBEEF, Lsn(0x1_0000_0028), 3, 16 * 1024 * 1024, 1);
        let cf = ControlFileData::decode(&image).unwrap();
        assert_eq!(cf.system_identifier, 0xDEADBEEF);
        assert_eq!(cf.checkpoint_redo, Lsn(0x1_0000_0028));
        assert_eq!(cf.checkpoint_tli, 3);
        assert_eq!(cf.xlog_seg_size, 16 * 1024 * 1024);
        assert!(cf.checksums_enabled());
    }

    #[test]
    fn reject_bad_crc() {
        let mut image = make_test_controlfile(1, Lsn(0x100), 1, 16 * 1024 * 1024, 0);
        image[OFF_SYSTEM_IDENTIFIER] ^= 0xFF;
        assert!(matches!(
            ControlFileData::decode(&image),
            Err(ControlFileError::BadCrc { .. })
        ));
    }

    #[test]
    fn reject_unknown_version() {
        let mut image = make_test_controlfile(1, Lsn(0x100), 1, 16 * 1024 * 1024, 0);
        LittleEndian::write_u32(&mut image[OFF_PG_CONTROL_VERSION..], 937);
        // fix the crc so the version check is what fails
        let crc = crc32c::crc32c(&image[0..OFF_CRC]);
        LittleEndian::write_u32(&mut image[OFF_CRC..], crc);
        assert!(matches!(
            ControlFileData::decode(&image),
            Err(ControlFileError::UnsupportedVersion { found: 937 })
        ));
    }

    #[test]
    fn patch_min_recovery_point() {
        let image = make_test_controlfile(1, Lsn(0x100), 2, 16 * 1024 * 1024, 0);
        let cf = ControlFileData::decode(&image).unwrap();
        let patched = cf.encode_with_min_recovery_point(Lsn(0x2_0000_0000), 2);
        let cf2 = ControlFileData::decode(&patched).unwrap();
        assert_eq!(cf2.min_recovery_point, Lsn(0x2_0000_0000));
        assert_eq!(cf2.min_recovery_point_tli, 2);
        assert_eq!(cf2.system_identifier, 1);
    }
}

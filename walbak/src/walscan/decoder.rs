//! Decoding of WAL record contents: block references and the few rmgr
//! payloads the scanner cares about (transaction timestamps, restore point
//! labels).

use byteorder::{ByteOrder, LittleEndian};
use postgres_ffi::pg_constants::*;
use postgres_ffi::xlog_utils::XLogRecord;
use postgres_ffi::{RelFileTag, TimestampTz};
use utils::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub tag: RelFileTag,
    pub blkno: u32,
}

#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// LSN of the record's first byte.
    pub lsn: Lsn,
    pub xid: u32,
    pub prev: Lsn,
    pub rmid: u8,
    pub info: u8,
    pub blocks: Vec<BlockRef>,
    /// Commit or abort timestamp, when the record is a transaction
    /// completion record.
    pub xact_time: Option<TimestampTz>,
    /// Label of a named restore point.
    pub restore_point: Option<String>,
}

impl DecodedRecord {
    /// Opcode bits of `xl_info` (the low bits belong to xloginsert).
    pub fn opcode(&self) -> u8 {
        self.info & XLR_RMGR_INFO_MASK
    }

    pub fn is_xlog_switch(&self) -> bool {
        self.rmid == RM_XLOG_ID && self.opcode() == XLOG_SWITCH
    }

    /// The record claims to modify storage in a way that bypasses block
    /// references. A scanner that does not understand the opcode must not
    /// pretend it extracted all modified pages.
    pub fn has_special_rel_update(&self) -> bool {
        self.info & XLR_SPECIAL_REL_UPDATE != 0
    }

    pub fn is_transaction_completion(&self) -> bool {
        self.rmid == RM_XACT_ID
            && matches!(
                self.info & XLOG_XACT_OPMASK,
                XLOG_XACT_COMMIT | XLOG_XACT_ABORT | XLOG_XACT_COMMIT_PREPARED
                    | XLOG_XACT_ABORT_PREPARED
            )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("record at {lsn} is truncated ({context})")]
    Truncated { lsn: Lsn, context: &'static str },
    #[error("record at {lsn} has invalid block id {id}")]
    BadBlockId { lsn: Lsn, id: u8 },
    #[error("record at {lsn} uses BKPBLOCK_SAME_REL with no previous relation")]
    SameRelWithoutPrev { lsn: Lsn },
}

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
    lsn: Lsn,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.off + n > self.buf.len() {
            return Err(DecodeError::Truncated {
                lsn: self.lsn,
                context,
            });
        }
        let slice = &self.buf[self.off..self.off + n];
        self.off += n;
        Ok(slice)
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, context)?[0])
    }

    fn u16(&mut self, context: &'static str) -> Result<u16, DecodeError> {
        Ok(LittleEndian::read_u16(self.take(2, context)?))
    }

    fn u32(&mut self, context: &'static str) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.take(4, context)?))
    }
}

/// Decode the payload of one record (everything after the fixed header).
///
/// The payload starts with a sequence of block reference headers terminated
/// by a main-data header, followed by the per-block images/data and the main
/// data itself.
pub fn decode_record(
    lsn: Lsn,
    header: &XLogRecord,
    payload: &[u8],
) -> Result<DecodedRecord, DecodeError> {
    let mut cursor = Cursor {
        buf: payload,
        off: 0,
        lsn,
    };

    let mut blocks = Vec::new();
    let mut prev_tag: Option<RelFileTag> = None;
    let mut main_data_len: u32 = 0;
    // bytes of block images and block data preceding the main data
    let mut block_payload_len: u64 = 0;

    // Headers end where the accounted-for block images/data begin: loop
    // while unconsumed bytes exceed what block headers have claimed as data.
    while (cursor.off as u64) < (payload.len() as u64).saturating_sub(block_payload_len) {
        let block_id = cursor.u8("block id")?;
        match block_id {
            XLR_BLOCK_ID_DATA_SHORT => {
                main_data_len = cursor.u8("short data length")? as u32;
                break;
            }
            XLR_BLOCK_ID_DATA_LONG => {
                main_data_len = cursor.u32("long data length")?;
                break;
            }
            XLR_BLOCK_ID_ORIGIN => {
                cursor.take(2, "origin")?;
            }
            XLR_BLOCK_ID_TOPLEVEL_XID => {
                cursor.take(4, "toplevel xid")?;
            }
            id if id <= XLR_MAX_BLOCK_ID => {
                let fork_flags = cursor.u8("fork flags")?;
                let data_len = cursor.u16("block data length")?;
                block_payload_len += data_len as u64;

                if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                    let image_len = cursor.u16("image length")?;
                    let _hole_offset = cursor.u16("image hole offset")?;
                    let bimg_info = cursor.u8("image info")?;
                    if bimg_info & BKPIMAGE_IS_COMPRESSED != 0
                        && bimg_info & BKPIMAGE_HAS_HOLE != 0
                    {
                        let _hole_length = cursor.u16("image hole length")?;
                    }
                    block_payload_len += image_len as u64;
                }

                let tag = if fork_flags & BKPBLOCK_SAME_REL != 0 {
                    prev_tag.ok_or(DecodeError::SameRelWithoutPrev { lsn })?
                } else {
                    let spcnode = cursor.u32("spcnode")?;
                    let dbnode = cursor.u32("dbnode")?;
                    let relnode = cursor.u32("relnode")?;
                    RelFileTag {
                        spcnode,
                        dbnode,
                        relnode,
                        forknum: fork_flags & BKPBLOCK_FORK_MASK,
                    }
                };
                prev_tag = Some(tag);

                let blkno = cursor.u32("block number")?;
                blocks.push(BlockRef { tag, blkno });
            }
            id => return Err(DecodeError::BadBlockId { lsn, id }),
        }
    }

    // Locate the main data to pull out the handful of payloads we read.
    let main_data_off = cursor.off + block_payload_len as usize;
    let main_data = payload
        .get(main_data_off..main_data_off + main_data_len as usize)
        .unwrap_or(&[]);

    let mut record = DecodedRecord {
        lsn,
        xid: header.xl_xid,
        prev: header.xl_prev,
        rmid: header.xl_rmid,
        info: header.xl_info,
        blocks,
        xact_time: None,
        restore_point: None,
    };

    if record.is_transaction_completion() && main_data.len() >= 8 {
        record.xact_time = Some(LittleEndian::read_i64(&main_data[0..8]));
    }
    if record.rmid == RM_XLOG_ID
        && record.opcode() == XLOG_RESTORE_POINT
        && main_data.len() >= 8 + MAXFNAMELEN
    {
        let name_bytes = &main_data[8..8 + MAXFNAMELEN];
        let end = name_bytes.iter().position(|b| *b == 0).unwrap_or(MAXFNAMELEN);
        record.restore_point = Some(String::from_utf8_lossy(&name_bytes[..end]).into_owned());
    }

    Ok(record)
}

/// Encode a record payload in the format [`decode_record`] reads. Used by
/// the tests that synthesize WAL segments, and kept next to the decoder so
/// the two cannot drift apart.
#[doc(hidden)]
pub fn encode_record_payload(blocks: &[BlockRef], main_data: &[u8]) -> Vec<u8> {
    use byteorder::WriteBytesExt;
    let mut out = Vec::new();
    let mut prev_tag: Option<RelFileTag> = None;
    for (i, block) in blocks.iter().enumerate() {
        out.write_u8(i as u8).unwrap();
        let same_rel = prev_tag == Some(block.tag);
        let mut fork_flags = block.tag.forknum & BKPBLOCK_FORK_MASK;
        if same_rel {
            fork_flags |= BKPBLOCK_SAME_REL;
        }
        out.write_u8(fork_flags).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap(); // no block data
        if !same_rel {
            out.write_u32::<LittleEndian>(block.tag.spcnode).unwrap();
            out.write_u32::<LittleEndian>(block.tag.dbnode).unwrap();
            out.write_u32::<LittleEndian>(block.tag.relnode).unwrap();
        }
        out.write_u32::<LittleEndian>(block.blkno).unwrap();
        prev_tag = Some(block.tag);
    }
    if !main_data.is_empty() {
        if main_data.len() < 256 {
            out.write_u8(XLR_BLOCK_ID_DATA_SHORT).unwrap();
            out.write_u8(main_data.len() as u8).unwrap();
        } else {
            out.write_u8(XLR_BLOCK_ID_DATA_LONG).unwrap();
            out.write_u32::<LittleEndian>(main_data.len() as u32).unwrap();
        }
        out.extend_from_slice(main_data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::pg_constants::MAIN_FORKNUM;
    use postgres_ffi::xlog_utils::XLOG_SIZE_OF_XLOG_RECORD;

    fn tag(relnode: u32) -> RelFileTag {
        RelFileTag {
            spcnode: DEFAULTTABLESPACE_OID,
            dbnode: 5,
            relnode,
            forknum: MAIN_FORKNUM,
        }
    }

    fn decode(blocks: &[BlockRef], main_data: &[u8], rmid: u8, info: u8) -> DecodedRecord {
        let payload = encode_record_payload(blocks, main_data);
        let header = XLogRecord {
            xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + payload.len()) as u32,
            xl_xid: 77,
            xl_prev: Lsn(0x1000),
            xl_info: info,
            xl_rmid: rmid,
            xl_crc: 0,
        };
        decode_record(Lsn(0x2000), &header, &payload).unwrap()
    }

    #[test]
    fn block_refs_round_trip() {
        let blocks = vec![
            BlockRef { tag: tag(16384), blkno: 3 },
            // same relation twice exercises BKPBLOCK_SAME_REL
            BlockRef { tag: tag(16384), blkno: 4 },
            BlockRef { tag: tag(16500), blkno: 0 },
        ];
        let record = decode(&blocks, b"", RM_HEAP_ID, 0);
        assert_eq!(record.blocks, blocks);
        assert_eq!(record.xid, 77);
        assert!(!record.has_special_rel_update());
    }

    #[test]
    fn commit_record_carries_timestamp() {
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&1234567890i64.to_le_bytes());
        let record = decode(&[], &main_data, RM_XACT_ID, XLOG_XACT_COMMIT);
        assert!(record.is_transaction_completion());
        assert_eq!(record.xact_time, Some(1234567890));
    }

    #[test]
    fn restore_point_label() {
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&0i64.to_le_bytes());
        let mut name = [0u8; MAXFNAMELEN];
        name[..5].copy_from_slice(b"mark1");
        main_data.extend_from_slice(&name);
        let record = decode(&[], &main_data, RM_XLOG_ID, XLOG_RESTORE_POINT);
        assert_eq!(record.restore_point.as_deref(), Some("mark1"));
    }

    #[test]
    fn xlog_switch_detection() {
        let record = decode(&[], b"", RM_XLOG_ID, XLOG_SWITCH);
        assert!(record.is_xlog_switch());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let blocks = vec![BlockRef { tag: tag(1), blkno: 0 }];
        let mut payload = encode_record_payload(&blocks, b"");
        let header = XLogRecord {
            xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + payload.len()) as u32,
            xl_xid: 0,
            xl_prev: Lsn(0),
            xl_info: 0,
            xl_rmid: RM_HEAP_ID,
            xl_crc: 0,
        };
        payload.truncate(payload.len() - 2);
        assert!(matches!(
            decode_record(Lsn(0x10), &header, &payload),
            Err(DecodeError::Truncated { .. })
        ));
    }
}

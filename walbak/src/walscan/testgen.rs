//! Synthesizes WAL segment files for the scanner tests: correctly framed
//! pages, record CRCs, continuation headers, and segment switches, using
//! the same framing rules the iterator enforces.

use std::collections::BTreeMap;

use camino::Utf8Path;
use postgres_ffi::xlog_utils::{
    encode_page_header, XLogRecord, XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_RECORD,
    XLOG_SIZE_OF_XLOG_SHORT_PHD, XLP_FIRST_IS_CONTRECORD,
};
use postgres_ffi::{pg_constants, TimeLineID, XLogFileName, XLogSegNo, XLOG_BLCKSZ};
use utils::lsn::Lsn;

use super::decoder::{encode_record_payload, BlockRef};

/// Small segments keep the tests fast; 1 MiB is a size PostgreSQL accepts.
pub const TEST_SEG_SIZE: usize = 1024 * 1024;

pub struct SegmentBuilder {
    tli: TimeLineID,
    sysid: u64,
    seg_size: usize,
    segs: BTreeMap<XLogSegNo, Vec<u8>>,
    pos: Lsn,
    prev: Lsn,
}

impl SegmentBuilder {
    pub fn new(tli: TimeLineID, start_segno: XLogSegNo, seg_size: usize) -> SegmentBuilder {
        SegmentBuilder {
            tli,
            sysid: 0x5EED_5EED,
            seg_size,
            segs: BTreeMap::new(),
            pos: Lsn(start_segno * seg_size as u64),
            prev: Lsn::INVALID,
        }
    }

    pub fn position(&self) -> Lsn {
        self.pos
    }

    fn seg_of(&self, lsn: Lsn) -> XLogSegNo {
        lsn.segment_number(self.seg_size)
    }

    fn page_end(&self, lsn: Lsn) -> Lsn {
        Lsn(lsn.0 - lsn.block_offset(XLOG_BLCKSZ as u64) + XLOG_BLCKSZ as u64)
    }

    fn buf_for(&mut self, segno: XLogSegNo) -> &mut Vec<u8> {
        let seg_size = self.seg_size;
        self.segs.entry(segno).or_insert_with(|| vec![0u8; seg_size])
    }

    /// If `pos` sits at a page boundary, emit the page header there and
    /// advance past it. `rem_len` > 0 marks a continuation page.
    fn maybe_start_page(&mut self, rem_len: u32) {
        if self.pos.block_offset(XLOG_BLCKSZ as u64) != 0 {
            return;
        }
        let page_addr = self.pos;
        let long = page_addr.segment_offset(self.seg_size) == 0;
        let mut header = Vec::new();
        encode_page_header(
            &mut header,
            if rem_len > 0 { XLP_FIRST_IS_CONTRECORD } else { 0 },
            self.tli,
            page_addr,
            rem_len,
            long.then_some((self.sysid, self.seg_size as u32)),
        );
        debug_assert_eq!(
            header.len(),
            if long {
                XLOG_SIZE_OF_XLOG_LONG_PHD
            } else {
                XLOG_SIZE_OF_XLOG_SHORT_PHD
            }
        );
        let segno = self.seg_of(page_addr);
        let off = page_addr.segment_offset(self.seg_size);
        self.buf_for(segno)[off..off + header.len()].copy_from_slice(&header);
        self.pos += header.len() as u64;
    }

    /// Append one record, returning its start LSN.
    pub fn append_record(&mut self, rmid: u8, info: u8, xid: u32, payload: &[u8]) -> Lsn {
        self.pos = self.pos.align();
        self.maybe_start_page(0);

        // A record header never straddles a page boundary.
        if (self.page_end(self.pos).0 - self.pos.0) < XLOG_SIZE_OF_XLOG_RECORD as u64 {
            self.pos = self.page_end(self.pos);
            self.maybe_start_page(0);
        }

        let start = self.pos;
        let mut record = XLogRecord {
            xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + payload.len()) as u32,
            xl_xid: xid,
            xl_prev: self.prev,
            xl_info: info,
            xl_rmid: rmid,
            xl_crc: 0,
        };
        record.xl_crc = XLogRecord::compute_crc(&record.encode(), payload);

        let mut bytes = Vec::with_capacity(record.xl_tot_len as usize);
        bytes.extend_from_slice(&record.encode());
        bytes.extend_from_slice(payload);

        let mut written = 0usize;
        while written < bytes.len() {
            let remaining = (bytes.len() - written) as u32;
            self.maybe_start_page(remaining);
            let capacity = (self.page_end(self.pos).0 - self.pos.0) as usize;
            let take = capacity.min(bytes.len() - written);
            let segno = self.seg_of(self.pos);
            let off = self.pos.segment_offset(self.seg_size);
            self.buf_for(segno)[off..off + take].copy_from_slice(&bytes[written..written + take]);
            written += take;
            self.pos += take as u64;
        }
        self.prev = start;
        start
    }

    /// Append a record touching main-fork blocks of relations.
    pub fn append_block_record(&mut self, xid: u32, blocks: &[BlockRef]) -> Lsn {
        let payload = encode_record_payload(blocks, b"");
        self.append_record(pg_constants::RM_HEAP_ID, 0, xid, &payload)
    }

    /// Append a commit record with the given timestamp.
    pub fn append_commit(&mut self, xid: u32, time: i64) -> Lsn {
        let payload = encode_record_payload(&[], &time.to_le_bytes());
        self.append_record(
            pg_constants::RM_XACT_ID,
            pg_constants::XLOG_XACT_COMMIT,
            xid,
            &payload,
        )
    }

    /// Append a named restore point.
    pub fn append_restore_point(&mut self, name: &str) -> Lsn {
        let mut main_data = Vec::new();
        main_data.extend_from_slice(&0i64.to_le_bytes());
        let mut label = [0u8; pg_constants::MAXFNAMELEN];
        label[..name.len()].copy_from_slice(name.as_bytes());
        main_data.extend_from_slice(&label);
        let payload = encode_record_payload(&[], &main_data);
        self.append_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_RESTORE_POINT,
            0,
            &payload,
        )
    }

    /// Append an XLOG_SWITCH record and jump to the next segment; the rest
    /// of the current segment stays zero.
    pub fn switch_segment(&mut self) -> Lsn {
        let payload = encode_record_payload(&[], b"");
        let lsn = self.append_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_SWITCH,
            0,
            &payload,
        );
        let next_seg = self.seg_of(self.pos) + 1;
        self.pos = Lsn(next_seg * self.seg_size as u64);
        lsn
    }

    /// Append filler records until the write position is at least `target`.
    pub fn fill_until(&mut self, target: Lsn) {
        let filler = vec![0xEEu8; 1000];
        let payload = encode_record_payload(&[], &filler);
        while self.pos < target {
            self.append_record(pg_constants::RM_XLOG_ID, pg_constants::XLOG_NOOP, 0, &payload);
        }
    }

    /// Write the finished segments into `dir`, gzipping those in
    /// `gz_segnos`.
    pub fn write_to_dir(&self, dir: &Utf8Path, gz_segnos: &[XLogSegNo]) {
        for (&segno, data) in &self.segs {
            let name = XLogFileName(self.tli, segno, self.seg_size);
            if gz_segnos.contains(&segno) {
                use std::io::Write;
                let path = dir.join(format!("{name}.gz"));
                let file = std::fs::File::create(path).unwrap();
                let mut gz =
                    flate2::write::GzEncoder::new(file, flate2::Compression::default());
                gz.write_all(data).unwrap();
                gz.finish().unwrap();
            } else {
                std::fs::write(dir.join(name), data).unwrap();
            }
        }
    }

    pub fn segments(&self) -> Vec<XLogSegNo> {
        self.segs.keys().copied().collect()
    }
}

//! Concurrent WAL reader: iterates records out of archived segment files,
//! extracts the set of touched pages for PAGE backups, and validates that a
//! recovery target is reachable within a WAL range.
//!
//! Work is partitioned by segment: an atomic counter hands each worker
//! thread the next segment number, each worker iterates the records starting
//! in its segment, and a record that crosses a segment boundary is finished
//! by the thread that started it (cooperative extension). A record is thus
//! processed by exactly one thread, and pagemap updates commute (bit OR), so
//! no cross-thread ordering is needed.

pub mod decoder;
pub mod timeline;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use parking_lot::{Condvar, Mutex};
use postgres_ffi::pg_constants::*;
use postgres_ffi::xlog_utils::{
    XLogPageHeaderData, XLogRecord, XLOG_PAGE_MAGIC, XLOG_SIZE_OF_XLOG_RECORD,
    XLP_FIRST_IS_CONTRECORD,
};
use postgres_ffi::{TimeLineID, TimestampTz, XLogFileName, XLogSegNo, XLOG_BLCKSZ};
use tracing::{debug, warn};
use utils::lsn::Lsn;

use crate::config::RunContext;
use crate::error::WalArchiveFailed;
use crate::incremental::PageMapSet;
use crate::walscan::decoder::{decode_record, DecodedRecord};
use crate::walscan::timeline::TimelineInterval;

/// Where and how to read archived WAL.
#[derive(Debug, Clone, Copy)]
pub struct WalScanSetup<'a> {
    pub wal_dir: &'a Utf8Path,
    pub seg_size: usize,
}

/// A point in the WAL stream a scan has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPoint {
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
    pub xid: u32,
    pub time: Option<TimestampTz>,
}

/// Recovery targets a validation scan can stop at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Lsn(Lsn),
    Xid(u32),
    Time(TimestampTz),
    Name(String),
}

impl ScanTarget {
    fn satisfied_by(&self, record: &DecodedRecord, end_lsn: Lsn) -> bool {
        match self {
            ScanTarget::Lsn(target) => end_lsn >= *target,
            ScanTarget::Xid(target) => {
                record.is_transaction_completion() && record.xid == *target
            }
            ScanTarget::Time(target) => {
                matches!(record.xact_time, Some(t) if t >= *target)
            }
            ScanTarget::Name(target) => {
                matches!(&record.restore_point, Some(name) if name == target)
            }
        }
    }
}

/// Outcome of a validation scan.
#[derive(Debug, Clone, Copy)]
pub struct WalValidateOutcome {
    /// The first record satisfying the target, if one was given and found.
    pub reached: Option<RecordPoint>,
    /// The last valid record within the range.
    pub last: Option<RecordPoint>,
}

/// Suffix probing order for one segment file, after the base name.
const SEGMENT_SUFFIXES: [&str; 4] = ["", ".gz", ".partial", ".gz.partial"];

/// Locate and open one segment, decompressing transparently. `Ok(None)`
/// means no file with any known suffix exists.
fn open_segment(
    wal_dir: &Utf8Path,
    tli: TimeLineID,
    segno: XLogSegNo,
    seg_size: usize,
) -> anyhow::Result<Option<Box<dyn Read>>> {
    let base = XLogFileName(tli, segno, seg_size);
    for suffix in SEGMENT_SUFFIXES {
        let path: Utf8PathBuf = wal_dir.join(format!("{base}{suffix}"));
        match File::open(&path) {
            Ok(file) => {
                let reader = BufReader::new(file);
                let boxed: Box<dyn Read> = if suffix.contains("gz") {
                    Box::new(GzDecoder::new(reader))
                } else {
                    Box::new(reader)
                };
                return Ok(Some(boxed));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("open WAL segment {path}")),
        }
    }
    Ok(None)
}

/// Sequential page-at-a-time view of one segment. Buffers exactly one
/// decoded page.
struct SegmentPages {
    segno: XLogSegNo,
    tli: TimeLineID,
    seg_size: usize,
    reader: Box<dyn Read>,
    page: Vec<u8>,
    /// LSN of the first byte of the buffered page; INVALID before the first
    /// load.
    page_addr: Lsn,
    /// Clean end of data (short read in a .partial segment).
    exhausted: bool,
}

impl SegmentPages {
    fn new(segno: XLogSegNo, tli: TimeLineID, seg_size: usize, reader: Box<dyn Read>) -> Self {
        SegmentPages {
            segno,
            tli,
            seg_size,
            reader,
            page: vec![0u8; XLOG_BLCKSZ],
            page_addr: Lsn::INVALID,
            exhausted: false,
        }
    }

    fn start_lsn(&self) -> Lsn {
        Lsn(self.segno * self.seg_size as u64)
    }

    fn end_lsn(&self) -> Lsn {
        Lsn((self.segno + 1) * self.seg_size as u64)
    }

    /// Load the next page of the segment. Returns false when the data ends
    /// (partial segment or end of file).
    fn load_next_page(&mut self) -> anyhow::Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let next_addr = if self.page_addr.is_valid() {
            self.page_addr + XLOG_BLCKSZ as u64
        } else {
            self.start_lsn()
        };
        if next_addr >= self.end_lsn() {
            return Ok(false);
        }

        let mut filled = 0;
        while filled < XLOG_BLCKSZ {
            let n = self
                .reader
                .read(&mut self.page[filled..])
                .with_context(|| format!("read WAL segment {}", self.segno))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < XLOG_BLCKSZ {
            self.exhausted = true;
            return Ok(false);
        }

        let header = XLogPageHeaderData::decode(&self.page);
        if header.xlp_magic == 0 && self.page.iter().all(|b| *b == 0) {
            // Zero-filled tail of a preallocated or switched segment: the
            // valid data ends here.
            self.exhausted = true;
            return Ok(false);
        }
        anyhow::ensure!(
            header.xlp_magic == XLOG_PAGE_MAGIC,
            "bad page magic {:#x} at {next_addr} in segment {}",
            header.xlp_magic,
            self.segno
        );
        anyhow::ensure!(
            header.xlp_pageaddr == next_addr,
            "page address mismatch: {} vs expected {next_addr}",
            header.xlp_pageaddr
        );
        anyhow::ensure!(
            header.xlp_tli == self.tli,
            "timeline mismatch on page {next_addr}: {} vs expected {}",
            header.xlp_tli,
            self.tli
        );
        self.page_addr = next_addr;
        Ok(true)
    }

    fn header(&self) -> XLogPageHeaderData {
        XLogPageHeaderData::decode(&self.page)
    }
}

/// One fully read record.
#[derive(Debug, Clone)]
pub struct OwnedRecord {
    pub lsn: Lsn,
    pub header: XLogRecord,
    pub payload: Vec<u8>,
}

impl OwnedRecord {
    pub fn end_lsn(&self) -> Lsn {
        self.lsn + self.header.xl_tot_len as u64
    }
}

/// What [`WalIter::next_record`] hands back.
pub enum IterNext {
    Record(OwnedRecord),
    /// The iterator needs the given segment to continue; hand it over with
    /// [`WalIter::push_segment`]. Keeps any partially-read record.
    NeedSegment(XLogSegNo),
    /// Clean end of the WAL stream (zeroed record header or short segment).
    EndOfWal,
}

struct PartialRecord {
    start_lsn: Lsn,
    total_len: usize,
    bytes: Vec<u8>,
}

enum SkipOutcome {
    Skipped,
    RanPastSegment,
}

/// Explicit record iterator. It owns the current segment's page stream and
/// the partial-record buffer; all segment-switching policy stays with the
/// caller, which sees [`IterNext::NeedSegment`] exactly when the iterator
/// runs off the end of the current file.
pub struct WalIter {
    seg_size: usize,
    tli: TimeLineID,
    /// Next byte to read.
    pos: Lsn,
    seg: Option<SegmentPages>,
    partial: Option<PartialRecord>,
}

impl WalIter {
    /// Start iterating at the beginning of `segno`. Records that merely
    /// continue into this segment from the previous one are skipped using
    /// the page header's `rem_len`.
    pub fn at_segment_start(tli: TimeLineID, segno: XLogSegNo, seg_size: usize) -> WalIter {
        WalIter {
            seg_size,
            tli,
            pos: Lsn(segno * seg_size as u64),
            seg: None,
            partial: None,
        }
    }

    pub fn push_segment(&mut self, segno: XLogSegNo, reader: Box<dyn Read>) {
        self.seg = Some(SegmentPages::new(segno, self.tli, self.seg_size, reader));
    }

    fn cur_segno(&self) -> XLogSegNo {
        self.pos.segment_number(self.seg_size)
    }

    /// Make sure the page containing `self.pos` is buffered. Ok(false) means
    /// clean end of data.
    fn ensure_page(&mut self) -> anyhow::Result<Option<bool>> {
        let want_segno = self.cur_segno();
        match &self.seg {
            Some(seg) if seg.segno == want_segno => {}
            _ => return Ok(None), // caller must push the segment
        }
        let seg = self.seg.as_mut().expect("checked above");
        let page_start = Lsn(self.pos.0 - self.pos.block_offset(XLOG_BLCKSZ as u64));
        while !seg.page_addr.is_valid() || seg.page_addr < page_start {
            if !seg.load_next_page()? {
                return Ok(Some(false));
            }
        }
        anyhow::ensure!(
            seg.page_addr == page_start,
            "page stream moved past {page_start} (at {})",
            seg.page_addr
        );
        Ok(Some(true))
    }

    fn page_data_start(&self) -> Lsn {
        let seg = self.seg.as_ref().expect("page is loaded");
        seg.page_addr + seg.header().header_size() as u64
    }

    fn page_end(&self) -> Lsn {
        let seg = self.seg.as_ref().expect("page is loaded");
        seg.page_addr + XLOG_BLCKSZ as u64
    }

    /// Read the next whole record.
    pub fn next_record(&mut self) -> anyhow::Result<IterNext> {
        loop {
            match self.ensure_page()? {
                None => return Ok(IterNext::NeedSegment(self.cur_segno())),
                Some(false) => return Ok(IterNext::EndOfWal),
                Some(true) => {}
            }

            if self.partial.is_some() {
                if let Some(result) = self.fill_partial()? {
                    return Ok(result);
                }
                continue;
            }

            // At a record boundary. Skip the page header if we sit on it.
            let seg_header = {
                let seg = self.seg.as_ref().expect("page is loaded");
                seg.header()
            };
            let data_start = self.page_data_start();
            if self.pos < data_start {
                self.pos = data_start;
                // A continuation left over from a record owned by the
                // previous segment's reader: skip it wholesale. If it runs
                // through the whole segment, no record starts here at all.
                if seg_header.xlp_rem_len > 0 {
                    match self.skip_continuation(seg_header.xlp_rem_len as usize)? {
                        SkipOutcome::Skipped => continue,
                        SkipOutcome::RanPastSegment => return Ok(IterNext::EndOfWal),
                    }
                }
            }

            self.pos = self.pos.align();
            if self.pos >= self.page_end() {
                continue; // next page
            }

            // A record header never straddles a page boundary: if it cannot
            // fit, the remainder of the page is padding.
            if (self.page_end().0 - self.pos.0) < XLOG_SIZE_OF_XLOG_RECORD as u64 {
                self.pos = self.page_end();
                continue;
            }

            let seg = self.seg.as_ref().expect("page is loaded");
            let off = (self.pos.0 - seg.page_addr.0) as usize;
            let tot_len =
                u32::from_le_bytes(seg.page[off..off + 4].try_into().expect("4 bytes")) as usize;
            if tot_len == 0 {
                return Ok(IterNext::EndOfWal);
            }
            anyhow::ensure!(
                tot_len >= XLOG_SIZE_OF_XLOG_RECORD,
                "impossibly short record ({tot_len} bytes) at {}",
                self.pos
            );

            self.partial = Some(PartialRecord {
                start_lsn: self.pos,
                total_len: tot_len,
                bytes: Vec::with_capacity(tot_len),
            });
            if let Some(result) = self.fill_partial()? {
                return Ok(result);
            }
        }
    }

    /// Copy record bytes out of the buffered page; returns Some when the
    /// record completed.
    fn fill_partial(&mut self) -> anyhow::Result<Option<IterNext>> {
        let data_start = self.page_data_start();

        // When resuming at a page boundary, verify the continuation header.
        if self.pos < data_start {
            let header = self.seg.as_ref().expect("page is loaded").header();
            let page_addr = self.seg.as_ref().expect("page is loaded").page_addr;
            let partial = self.partial.as_ref().expect("partial in progress");
            let remaining = partial.total_len - partial.bytes.len();
            anyhow::ensure!(
                header.xlp_info & XLP_FIRST_IS_CONTRECORD != 0,
                "record at {} continues into page {page_addr} which lacks the contrecord flag",
                partial.start_lsn,
            );
            anyhow::ensure!(
                header.xlp_rem_len as usize == remaining,
                "record at {}: continuation length {} does not match remaining {remaining}",
                partial.start_lsn,
                header.xlp_rem_len
            );
            self.pos = data_start;
        }

        let incomplete = {
            // disjoint field borrows: the page buffer and the partial record
            let seg = self.seg.as_ref().expect("page is loaded");
            let partial = self.partial.as_mut().expect("partial in progress");
            let page_off = (self.pos.0 - seg.page_addr.0) as usize;
            let available = XLOG_BLCKSZ - page_off;
            let needed = partial.total_len - partial.bytes.len();
            let take = needed.min(available);
            partial
                .bytes
                .extend_from_slice(&seg.page[page_off..page_off + take]);
            self.pos += take as u64;
            partial.bytes.len() < partial.total_len
        };
        if incomplete {
            // Page exhausted; the loop in next_record reloads or reports
            // NeedSegment when the record runs into the next file.
            return Ok(None);
        }

        let partial = self.partial.take().expect("just filled");
        let header = XLogRecord::decode(&partial.bytes[..XLOG_SIZE_OF_XLOG_RECORD]);
        let payload = partial.bytes[XLOG_SIZE_OF_XLOG_RECORD..].to_vec();
        let expected_crc = XLogRecord::compute_crc(&partial.bytes, &payload);
        anyhow::ensure!(
            header.xl_crc == expected_crc,
            "record at {} fails CRC: stored {:#x}, computed {expected_crc:#x}",
            partial.start_lsn,
            header.xl_crc
        );
        Ok(Some(IterNext::Record(OwnedRecord {
            lsn: partial.start_lsn,
            header,
            payload,
        })))
    }

    /// Skip continuation data of a record owned by a previous segment.
    fn skip_continuation(&mut self, rem_len: usize) -> anyhow::Result<SkipOutcome> {
        let mut remaining = rem_len;
        loop {
            let available = (self.page_end().0 - self.pos.0) as usize;
            let take = remaining.min(available);
            self.pos += take as u64;
            remaining -= take;
            if remaining == 0 {
                self.pos = self.pos.align();
                return Ok(SkipOutcome::Skipped);
            }
            match self.ensure_page()? {
                // The record continues into yet another segment: nothing
                // starts in this one.
                None => return Ok(SkipOutcome::RanPastSegment),
                Some(false) => anyhow::bail!("continuation at {} is truncated", self.pos),
                Some(true) => {
                    let seg = self.seg.as_ref().expect("page is loaded");
                    let header = seg.header();
                    anyhow::ensure!(
                        header.xlp_info & XLP_FIRST_IS_CONTRECORD != 0
                            && header.xlp_rem_len as usize == remaining,
                        "bad continuation chain at {}",
                        seg.page_addr
                    );
                    self.pos = self.page_data_start();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Threaded scan driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum SegStatus {
    Done,
    Missing,
    Failed(String),
}

#[derive(Debug)]
struct SegmentOutcome {
    status: SegStatus,
    last: Option<RecordPoint>,
    found: Option<RecordPoint>,
    pagemap: PageMapSet,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanMode {
    Extract,
    Validate,
}

struct ScanShared<'a> {
    setup: WalScanSetup<'a>,
    interval: TimelineInterval,
    mode: ScanMode,
    target: Option<&'a ScanTarget>,
    start_segno: XLogSegNo,
    end_segno: XLogSegNo,
    next_segno: AtomicU64,
    /// Lowest segment in which the target was found; u64::MAX while unset.
    target_segno: AtomicU64,
    outcomes: Mutex<BTreeMap<XLogSegNo, SegmentOutcome>>,
    outcome_posted: Condvar,
}

impl<'a> ScanShared<'a> {
    /// The consistency rule: before classifying its own failure, a thread
    /// waits for all lower-numbered segments to finish, and reports whether
    /// any of them failed (in which case that failure, not ours, is the
    /// run's outcome).
    fn wait_for_lower(&self, segno: XLogSegNo) -> bool {
        let mut outcomes = self.outcomes.lock();
        loop {
            // The target was found below us: our outcome is irrelevant, and
            // threads between the target and us may have exited without
            // posting. Do not wait on them.
            if self.target_segno.load(Ordering::Acquire) < segno {
                return true;
            }
            let all_done = (self.start_segno..segno).all(|s| outcomes.contains_key(&s));
            if all_done {
                return (self.start_segno..segno).any(|s| {
                    !matches!(outcomes.get(&s), Some(SegmentOutcome { status: SegStatus::Done, .. }))
                });
            }
            self.outcome_posted.wait(&mut outcomes);
        }
    }

    fn post(&self, segno: XLogSegNo, outcome: SegmentOutcome) {
        let mut outcomes = self.outcomes.lock();
        outcomes.insert(segno, outcome);
        self.outcome_posted.notify_all();
    }
}

/// Scan the records of one segment. Records are attributed to the segment
/// their first byte lies in; a record crossing into the next segment is
/// finished here (cooperative extension) without claiming that segment.
fn scan_segment(
    shared: &ScanShared<'_>,
    segno: XLogSegNo,
    ctx: &RunContext,
) -> anyhow::Result<SegmentOutcome> {
    let mut outcome = SegmentOutcome {
        status: SegStatus::Done,
        last: None,
        found: None,
        pagemap: PageMapSet::new(),
    };

    let interval = shared.interval;
    let mut iter = WalIter::at_segment_start(interval.tli, segno, shared.setup.seg_size);

    loop {
        ctx.check_interrupted()?;
        // Another thread found the target in an earlier segment: stop.
        if shared.target_segno.load(Ordering::Acquire) < segno {
            break;
        }

        let record = match iter.next_record() {
            Ok(IterNext::Record(r)) => r,
            Ok(IterNext::EndOfWal) => break,
            Ok(IterNext::NeedSegment(needed)) => {
                match open_segment(
                    shared.setup.wal_dir,
                    interval.tli,
                    needed,
                    shared.setup.seg_size,
                )? {
                    Some(reader) => {
                        iter.push_segment(needed, reader);
                        continue;
                    }
                    None if needed == segno => {
                        outcome.status = SegStatus::Missing;
                        return Ok(outcome);
                    }
                    None => {
                        // A record started here and its tail is gone.
                        outcome.status = SegStatus::Failed(format!(
                            "segment {needed} needed to finish a record started in segment {segno} is missing"
                        ));
                        return Ok(outcome);
                    }
                }
            }
            Err(e) => {
                outcome.status = SegStatus::Failed(format!("{e:#}"));
                return Ok(outcome);
            }
        };

        // Records starting beyond our segment belong to the next thread.
        if record.lsn.segment_number(shared.setup.seg_size) > segno {
            break;
        }
        let end_lsn = record.end_lsn();
        if interval.end.is_valid() && record.lsn >= interval.end {
            break;
        }
        if end_lsn <= interval.begin {
            continue;
        }

        let decoded = match decode_record(record.lsn, &record.header, &record.payload) {
            Ok(d) => d,
            Err(e) => {
                outcome.status = SegStatus::Failed(format!("{e}"));
                return Ok(outcome);
            }
        };

        // A segment switch consumes the zero padding up to the segment
        // boundary; coverage and LSN targets treat it that way.
        let end_lsn = if decoded.is_xlog_switch() {
            Lsn((segno + 1) * shared.setup.seg_size as u64)
        } else {
            end_lsn
        };
        let point = RecordPoint {
            start_lsn: decoded.lsn,
            end_lsn,
            xid: decoded.xid,
            time: decoded.xact_time,
        };
        outcome.last = Some(point);

        match shared.mode {
            ScanMode::Extract => {
                if let Err(e) = extract_record(&decoded, &mut outcome.pagemap) {
                    outcome.status = SegStatus::Failed(format!("{e:#}"));
                    return Ok(outcome);
                }
            }
            ScanMode::Validate => {
                if let Some(target) = shared.target {
                    if target.satisfied_by(&decoded, end_lsn) {
                        outcome.found = Some(point);
                        shared.target_segno.fetch_min(segno, Ordering::AcqRel);
                        break;
                    }
                }
            }
        }

        if decoded.is_xlog_switch() {
            // The rest of the segment is zero padding.
            break;
        }
    }

    Ok(outcome)
}

/// Fold one record's block references into the page map.
fn extract_record(record: &DecodedRecord, pagemap: &mut PageMapSet) -> anyhow::Result<()> {
    match record.rmid {
        // Whole-database create/drop is handled by file traversal.
        RM_DBASE_ID => return Ok(()),
        RM_TBLSPC_ID => return Ok(()),
        // File creation/truncation shows up as a size difference.
        RM_SMGR_ID if matches!(record.opcode(), XLOG_SMGR_CREATE | XLOG_SMGR_TRUNCATE) => {
            return Ok(())
        }
        // Transaction completion does not touch data pages.
        RM_XACT_ID => return Ok(()),
        _ => {}
    }

    if record.has_special_rel_update() {
        // A relation was modified in a way we cannot see through block
        // references; pretending otherwise would silently lose pages.
        anyhow::bail!(
            "record at {} (rmgr {}, info {:#x}) updates relations in a way this tool \
             does not understand",
            record.lsn,
            record.rmid,
            record.info
        );
    }

    for block in &record.blocks {
        if block.tag.forknum != MAIN_FORKNUM {
            continue;
        }
        let (segno, blk_in_seg) = postgres_ffi::RelFileTag::block_location(block.blkno);
        let rel_path = block.tag.segfile_path(segno);
        pagemap.set_block(&rel_path, blk_in_seg);
    }
    Ok(())
}

struct IntervalResult {
    pagemap: PageMapSet,
    last: Option<RecordPoint>,
    found: Option<RecordPoint>,
}

/// Run one interval's scan across a worker pool and aggregate the outcomes
/// in segment order.
fn run_interval(
    setup: WalScanSetup<'_>,
    interval: TimelineInterval,
    mode: ScanMode,
    target: Option<&ScanTarget>,
    num_threads: usize,
    ctx: &RunContext,
) -> anyhow::Result<IntervalResult> {
    let start_segno = interval.begin.segment_number(setup.seg_size);
    let end_segno = if interval.end.is_valid() {
        // end is exclusive; an end on a segment boundary does not require
        // that segment
        Lsn(interval.end.0 - 1).segment_number(setup.seg_size)
    } else {
        XLogSegNo::MAX
    };

    let shared = ScanShared {
        setup,
        interval,
        mode,
        target,
        start_segno,
        end_segno,
        next_segno: AtomicU64::new(start_segno),
        target_segno: AtomicU64::new(u64::MAX),
        outcomes: Mutex::new(BTreeMap::new()),
        outcome_posted: Condvar::new(),
    };

    let workers = num_threads.max(1);
    crossbeam_utils::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|_| loop {
                let segno = shared.next_segno.fetch_add(1, Ordering::AcqRel);
                if segno > shared.end_segno {
                    break;
                }
                if shared.target_segno.load(Ordering::Acquire) < segno {
                    break;
                }
                let outcome = match scan_segment(&shared, segno, ctx) {
                    Ok(outcome) => outcome,
                    Err(e) => SegmentOutcome {
                        status: SegStatus::Failed(format!("{e:#}")),
                        last: None,
                        found: None,
                        pagemap: PageMapSet::new(),
                    },
                };
                match &outcome.status {
                    SegStatus::Done => {}
                    SegStatus::Missing | SegStatus::Failed(_) => {
                        // Wait out lower segments: if one of them failed,
                        // that failure is the run's outcome and ours is just
                        // a consequence.
                        let lower_failed = shared.wait_for_lower(segno);
                        if !lower_failed {
                            if let SegStatus::Failed(msg) = &outcome.status {
                                warn!("WAL segment {segno}: {msg}");
                            }
                        }
                    }
                }
                let stop = !matches!(outcome.status, SegStatus::Done);
                shared.post(segno, outcome);
                if stop {
                    break;
                }
            });
        }
    })
    .map_err(|_| anyhow::anyhow!("WAL scan worker panicked"))?;

    ctx.check_interrupted()?;

    // Aggregate in ascending segment order, cutting at the first defect.
    let outcomes = shared.outcomes.into_inner();
    let mut result = IntervalResult {
        pagemap: PageMapSet::new(),
        last: None,
        found: None,
    };
    let mut expected = start_segno;
    for (segno, outcome) in outcomes {
        if segno != expected {
            // A worker stopped early (target found); segments beyond the
            // gap are irrelevant.
            break;
        }
        match outcome.status {
            SegStatus::Done => {}
            SegStatus::Missing => {
                if interval.end.is_valid() {
                    return Err(WalArchiveFailed(format!(
                        "WAL segment {} (timeline {}) is missing from the archive",
                        XLogFileName(interval.tli, segno, setup.seg_size),
                        interval.tli
                    ))
                    .into());
                }
                // Open-ended scan: the archive simply ends here.
                break;
            }
            SegStatus::Failed(msg) => {
                return Err(WalArchiveFailed(format!(
                    "possible WAL corruption in segment {}: {msg}",
                    XLogFileName(interval.tli, segno, setup.seg_size)
                ))
                .into());
            }
        }
        if outcome.last.is_some() {
            result.last = outcome.last;
        }
        result.pagemap.merge(outcome.pagemap);
        if let Some(found) = outcome.found {
            result.found = Some(found);
            debug!("target reached at {} in segment {segno}", found.start_lsn);
            break;
        }
        expected += 1;
    }

    // A bounded range must actually be covered by records: WAL is a
    // contiguous stream, so anything short of the end means truncation.
    if interval.end.is_valid() && result.found.is_none() {
        let covered = result.last.map(|p| p.end_lsn).unwrap_or(interval.begin);
        if covered < interval.end {
            return Err(WalArchiveFailed(format!(
                "WAL on timeline {} ends at {covered}, but the range up to {} is required",
                interval.tli, interval.end
            ))
            .into());
        }
    }

    Ok(result)
}

/// Build the modified-page map for the WAL range covered by `intervals`
/// (computed by [`timeline::plan_intervals`]). A missing segment anywhere in
/// a bounded interval is fatal: skipping it would silently lose page
/// modifications.
pub fn extract_page_map(
    setup: WalScanSetup<'_>,
    intervals: &[TimelineInterval],
    num_threads: usize,
    ctx: &RunContext,
) -> anyhow::Result<PageMapSet> {
    let mut pagemap = PageMapSet::new();
    for interval in intervals {
        debug!(
            "extracting page map from timeline {} range {}..{}",
            interval.tli, interval.begin, interval.end
        );
        let result = run_interval(setup, *interval, ScanMode::Extract, None, num_threads, ctx)?;
        pagemap.merge(result.pagemap);
    }
    Ok(pagemap)
}

/// Read all WAL in `interval`, verifying record framing and CRCs, optionally
/// stopping at `target`. Returns the first record satisfying the target (if
/// any) and the last valid record seen; the caller compares those against
/// its requirements to decide reachability.
pub fn validate_wal_range(
    setup: WalScanSetup<'_>,
    interval: TimelineInterval,
    target: Option<&ScanTarget>,
    num_threads: usize,
    ctx: &RunContext,
) -> anyhow::Result<WalValidateOutcome> {
    let result = run_interval(setup, interval, ScanMode::Validate, target, num_threads, ctx)?;
    Ok(WalValidateOutcome {
        reached: result.found,
        last: result.last,
    })
}

#[cfg(test)]
pub mod testgen;

#[cfg(test)]
mod tests;

use camino_tempfile::tempdir;
use postgres_ffi::pg_constants::*;
use postgres_ffi::{RelFileTag, XLogFileName};
use utils::lsn::Lsn;

use super::decoder::BlockRef;
use super::testgen::{SegmentBuilder, TEST_SEG_SIZE};
use super::timeline::TimelineInterval;
use super::*;
use crate::error::classify_error;

fn main_rel(relnode: u32) -> RelFileTag {
    RelFileTag {
        spcnode: DEFAULTTABLESPACE_OID,
        dbnode: 5,
        relnode,
        forknum: MAIN_FORKNUM,
    }
}

fn blk(relnode: u32, blkno: u32) -> BlockRef {
    BlockRef {
        tag: main_rel(relnode),
        blkno,
    }
}

fn ctx() -> crate::config::RunContext {
    crate::config::RunContext::new(2)
}

fn interval(tli: u32, begin: u64, end: u64) -> TimelineInterval {
    TimelineInterval {
        tli,
        begin: Lsn(begin),
        end: Lsn(end),
    }
}

fn collect_blocks(maps: &crate::incremental::PageMapSet) -> Vec<(String, Vec<u32>)> {
    let mut all: Vec<(String, Vec<u32>)> = maps
        .iter()
        .map(|((_, path), map)| (path.clone(), map.iter_ones().collect()))
        .collect();
    all.sort();
    all
}

#[test]
fn iterator_reads_records_back() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let lsn1 = builder.append_block_record(10, &[blk(16384, 0)]);
    let lsn2 = builder.append_commit(10, 777);
    builder.write_to_dir(dir.path(), &[]);

    let mut iter = WalIter::at_segment_start(1, 1, TEST_SEG_SIZE);
    let mut lsns = Vec::new();
    loop {
        match iter.next_record().unwrap() {
            IterNext::Record(rec) => {
                // header CRC was verified inside the iterator
                lsns.push(rec.lsn);
            }
            IterNext::NeedSegment(segno) => {
                match open_segment(dir.path(), 1, segno, TEST_SEG_SIZE).unwrap() {
                    Some(reader) => iter.push_segment(segno, reader),
                    None => break,
                }
            }
            IterNext::EndOfWal => break,
        }
    }
    assert_eq!(lsns, vec![lsn1, lsn2]);
}

#[test]
fn iterator_detects_corruption() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    builder.append_commit(1, 1);
    builder.write_to_dir(dir.path(), &[]);

    // flip a byte inside the record payload: long page header (40 bytes),
    // record header (24 bytes), then the payload
    let path = dir.path().join(XLogFileName(1, 1, TEST_SEG_SIZE));
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[40 + 24 + 2] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let mut iter = WalIter::at_segment_start(1, 1, TEST_SEG_SIZE);
    let reader = open_segment(dir.path(), 1, 1, TEST_SEG_SIZE).unwrap().unwrap();
    iter.push_segment(1, reader);
    // first call asks for nothing more; the record fails its CRC
    let err = loop {
        match iter.next_record() {
            Ok(IterNext::Record(_)) => continue,
            Ok(_) => panic!("expected an error"),
            Err(e) => break e,
        }
    };
    assert!(format!("{err:#}").contains("CRC"));
}

#[test]
fn extract_collects_touched_blocks() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_block_record(10, &[blk(16384, 0), blk(16384, 7)]);
    // visibility-map fork reference must not land in the page map
    builder.append_block_record(
        10,
        &[BlockRef {
            tag: RelFileTag {
                forknum: VISIBILITYMAP_FORKNUM,
                ..main_rel(16384)
            },
            blkno: 1,
        }],
    );
    // smgr create and commit records are ignored
    builder.append_record(RM_SMGR_ID, XLOG_SMGR_CREATE, 0, b"");
    builder.append_commit(10, 1);
    // a block far enough to live in relation segment file 1
    builder.append_block_record(11, &[blk(16500, postgres_ffi::RELSEG_SIZE + 3)]);
    let end = builder.position();
    builder.write_to_dir(dir.path(), &[]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let maps = extract_page_map(setup, &[interval(1, begin.0, end.0)], 2, &ctx()).unwrap();
    assert_eq!(
        collect_blocks(&maps),
        vec![
            ("base/5/16384".to_string(), vec![0, 7]),
            ("base/5/16500.1".to_string(), vec![3]),
        ]
    );
}

#[test]
fn extract_spans_segments_and_crossing_records() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_block_record(1, &[blk(16384, 1)]);
    // park the position close to the end of segment 1, then write a record
    // big enough to cross into segment 2
    builder.fill_until(Lsn(2 * TEST_SEG_SIZE as u64 - 3000));
    let crossing_payload =
        super::decoder::encode_record_payload(&[blk(16384, 2)], &vec![0xABu8; 5000]);
    let crossing_lsn = builder.append_record(RM_HEAP_ID, 0, 2, &crossing_payload);
    assert_eq!(crossing_lsn.segment_number(TEST_SEG_SIZE), 1);
    assert_eq!(builder.position().segment_number(TEST_SEG_SIZE), 2);
    // and records fully inside segment 2
    builder.append_block_record(3, &[blk(16384, 3)]);
    let end = builder.position();
    builder.write_to_dir(dir.path(), &[]);
    assert_eq!(builder.segments(), vec![1, 2]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    for threads in [1, 3] {
        let maps =
            extract_page_map(setup, &[interval(1, begin.0, end.0)], threads, &ctx()).unwrap();
        assert_eq!(
            collect_blocks(&maps),
            vec![("base/5/16384".to_string(), vec![1, 2, 3])],
            "with {threads} threads"
        );
    }
}

#[test]
fn extract_walks_across_timeline_switch() {
    let dir = tempdir().unwrap();

    // timeline 1 up to the switchpoint (a segment boundary)
    let mut old = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = old.position();
    old.append_block_record(1, &[blk(16384, 1)]);
    old.switch_segment();
    let switchpoint = old.position();
    old.write_to_dir(dir.path(), &[]);

    // timeline 2 continues from there
    let mut new = SegmentBuilder::new(2, switchpoint.segment_number(TEST_SEG_SIZE), TEST_SEG_SIZE);
    new.append_block_record(2, &[blk(16384, 2)]);
    let end = new.position();
    new.write_to_dir(dir.path(), &[]);
    std::fs::write(
        dir.path().join("00000002.history"),
        format!("1\t{switchpoint}\tno recovery target specified\n"),
    )
    .unwrap();

    let history = super::timeline::read_history(dir.path(), 2).unwrap();
    let intervals = super::timeline::plan_intervals(&history, 2, 1, begin, end).unwrap();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].tli, 1);
    assert_eq!(intervals[1].tli, 2);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let maps = extract_page_map(setup, &intervals, 2, &ctx()).unwrap();
    assert_eq!(
        collect_blocks(&maps),
        vec![("base/5/16384".to_string(), vec![1, 2])]
    );
}

#[test]
fn extract_is_idempotent() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    for i in 0..50 {
        builder.append_block_record(i, &[blk(16384, i % 10), blk(17000 + i, 0)]);
    }
    let end = builder.position();
    builder.write_to_dir(dir.path(), &[]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let first = extract_page_map(setup, &[interval(1, begin.0, end.0)], 2, &ctx()).unwrap();
    let second = extract_page_map(setup, &[interval(1, begin.0, end.0)], 2, &ctx()).unwrap();
    assert_eq!(collect_blocks(&first), collect_blocks(&second));
}

#[test]
fn missing_segment_in_bounded_range_is_fatal() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_block_record(1, &[blk(16384, 1)]);
    builder.switch_segment();
    builder.append_block_record(2, &[blk(16384, 2)]);
    builder.switch_segment();
    builder.append_block_record(3, &[blk(16384, 3)]);
    let end = builder.position();
    builder.write_to_dir(dir.path(), &[]);

    // remove the middle segment
    std::fs::remove_file(dir.path().join(XLogFileName(1, 2, TEST_SEG_SIZE))).unwrap();

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let err = extract_page_map(setup, &[interval(1, begin.0, end.0)], 2, &ctx()).unwrap_err();
    assert_eq!(
        classify_error(&err),
        crate::error::ExitCode::WalArchiveFailed
    );
}

#[test]
fn gzipped_segments_are_read() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_block_record(1, &[blk(16384, 5)]);
    builder.switch_segment();
    builder.append_block_record(2, &[blk(16384, 6)]);
    let end = builder.position();
    // first plain, second gzipped
    builder.write_to_dir(dir.path(), &[2]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let maps = extract_page_map(setup, &[interval(1, begin.0, end.0)], 2, &ctx()).unwrap();
    assert_eq!(
        collect_blocks(&maps),
        vec![("base/5/16384".to_string(), vec![5, 6])]
    );
}

#[test]
fn validate_stops_at_xid_target() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_commit(100, 1000);
    builder.switch_segment();
    let target_lsn = builder.append_commit(200, 2000);
    builder.append_commit(300, 3000);
    builder.write_to_dir(dir.path(), &[]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let outcome = validate_wal_range(
        setup,
        TimelineInterval {
            tli: 1,
            begin,
            end: Lsn::INVALID,
        },
        Some(&ScanTarget::Xid(200)),
        2,
        &ctx(),
    )
    .unwrap();
    let reached = outcome.reached.expect("target should be reached");
    assert_eq!(reached.start_lsn, target_lsn);
    assert_eq!(reached.xid, 200);
    assert_eq!(reached.time, Some(2000));
}

#[test]
fn validate_lsn_target_boundary() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_commit(1, 100);
    builder.append_commit(2, 200);
    builder.write_to_dir(dir.path(), &[]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let open_interval = TimelineInterval {
        tli: 1,
        begin,
        end: Lsn::INVALID,
    };

    // no target: the last record is reported
    let outcome = validate_wal_range(setup, open_interval, None, 1, &ctx()).unwrap();
    let last = outcome.last.expect("records were scanned");
    assert_eq!(last.xid, 2);
    let end_of_wal = last.end_lsn;

    // a target exactly at the end of the last record is reachable
    let outcome = validate_wal_range(
        setup,
        open_interval,
        Some(&ScanTarget::Lsn(end_of_wal)),
        1,
        &ctx(),
    )
    .unwrap();
    assert!(outcome.reached.is_some());

    // one byte past it is not
    let outcome = validate_wal_range(
        setup,
        open_interval,
        Some(&ScanTarget::Lsn(end_of_wal + 1)),
        1,
        &ctx(),
    )
    .unwrap();
    assert!(outcome.reached.is_none());
    assert_eq!(outcome.last.map(|p| p.end_lsn), Some(end_of_wal));
}

#[test]
fn validate_finds_named_restore_point() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_commit(1, 100);
    let mark = builder.append_restore_point("before_upgrade");
    builder.write_to_dir(dir.path(), &[]);

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let outcome = validate_wal_range(
        setup,
        TimelineInterval {
            tli: 1,
            begin,
            end: Lsn::INVALID,
        },
        Some(&ScanTarget::Name("before_upgrade".to_string())),
        1,
        &ctx(),
    )
    .unwrap();
    assert_eq!(outcome.reached.map(|p| p.start_lsn), Some(mark));
}

#[test]
fn bounded_validate_requires_all_segments() {
    let dir = tempdir().unwrap();
    let mut builder = SegmentBuilder::new(1, 1, TEST_SEG_SIZE);
    let begin = builder.position();
    builder.append_commit(1, 100);
    builder.switch_segment();
    builder.append_commit(2, 200);
    let end = builder.position();
    builder.write_to_dir(dir.path(), &[]);
    std::fs::remove_file(dir.path().join(XLogFileName(1, 1, TEST_SEG_SIZE))).unwrap();

    let setup = WalScanSetup {
        wal_dir: dir.path(),
        seg_size: TEST_SEG_SIZE,
    };
    let err = validate_wal_range(
        setup,
        TimelineInterval {
            tli: 1,
            begin,
            end,
        },
        None,
        2,
        &ctx(),
    )
    .unwrap_err();
    assert_eq!(
        classify_error(&err),
        crate::error::ExitCode::WalArchiveFailed
    );
}

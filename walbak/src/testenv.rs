//! Shared fixtures for the engine tests: a synthetic data directory, a
//! catalog in a temp dir, and a fake cluster that stands in for the server
//! side of a backup run.

use byteorder::{ByteOrder, LittleEndian};
use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use chrono::Utc;
use utils::bitmap::BlockBitmap;
use utils::lsn::Lsn;

use postgres_ffi::controlfile::make_test_controlfile;
use postgres_ffi::page_layout::make_valid_page;
use postgres_ffi::{TimeLineID, XLogFileName, BLCKSZ};

use crate::backup::ClusterApi;
use crate::catalog::Catalog;
use crate::config::{CatalogPaths, InstanceConfig, RunContext};
use crate::node::StopBackupInfo;
use crate::walscan::testgen::TEST_SEG_SIZE;

pub const TEST_SYSTEM_ID: u64 = 0x5EED_0001;

pub struct TestEnv {
    pub catalog: Catalog,
    pub instance: InstanceConfig,
    pub ctx: RunContext,
    // owns the temp trees
    pub catalog_dir: Utf8TempDir,
    pub pgdata_dir: Utf8TempDir,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let catalog_dir = camino_tempfile::tempdir().unwrap();
        let pgdata_dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::open(CatalogPaths::new(catalog_dir.path(), "main"));
        std::fs::create_dir_all(catalog.paths.backups_dir()).unwrap();
        std::fs::create_dir_all(catalog.paths.wal_dir()).unwrap();

        make_pgdata(pgdata_dir.path());

        let instance = InstanceConfig {
            pgdata: pgdata_dir.path().to_owned(),
            system_identifier: TEST_SYSTEM_ID,
            block_size: BLCKSZ as u32,
            xlog_block_size: BLCKSZ as u32,
            wal_seg_size: TEST_SEG_SIZE as u32,
            external_dirs: Vec::new(),
            archive_timeout: std::time::Duration::from_secs(5),
        };
        instance.save(&catalog.paths.instance_config_path()).unwrap();

        TestEnv {
            catalog,
            instance,
            ctx: RunContext::new(2),
            catalog_dir,
            pgdata_dir,
        }
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.catalog.paths.wal_dir()
    }
}

/// Minimal but structurally plausible data directory: control file, version
/// file, config, one 3-page relation, and the runtime dirs a real cluster
/// has.
pub fn make_pgdata(root: &Utf8Path) {
    for dir in [
        "global",
        "base",
        "base/5",
        "pg_wal",
        "pg_stat_tmp",
        "pg_notify",
        "pg_subtrans",
        "pg_dynshmem",
        "pg_serial",
        "pg_snapshots",
        "pg_replslot",
        "pg_tblspc",
    ] {
        std::fs::create_dir_all(root.join(dir)).unwrap();
    }
    let control = make_test_controlfile(
        TEST_SYSTEM_ID,
        Lsn(0x1_0000_0028),
        1,
        TEST_SEG_SIZE as u32,
        1,
    );
    std::fs::write(root.join(crate::PG_CONTROL_PATH), control).unwrap();
    std::fs::write(root.join("PG_VERSION"), "14\n").unwrap();
    std::fs::write(root.join("base/5/PG_VERSION"), "14\n").unwrap();
    std::fs::write(root.join("postgresql.conf"), "shared_buffers = 128MB\n").unwrap();
    // things that must never be backed up
    std::fs::write(root.join("postmaster.pid"), "12345\n").unwrap();
    std::fs::write(root.join("pg_wal/000000010000000000000001"), "junk").unwrap();

    let mut datafile = Vec::new();
    for (i, lsn) in [0x1_0000_1000u64, 0x1_0000_2000, 0x1_0000_3000]
        .iter()
        .enumerate()
    {
        let mut page = make_valid_page(*lsn, 64, 8000);
        page[8100] = i as u8;
        stamp_checksum(&mut page, i as u32);
        datafile.extend_from_slice(&page);
    }
    std::fs::write(root.join("base/5/16384"), datafile).unwrap();
}

/// Write a valid block checksum into a page, the way a checksum-enabled
/// cluster would.
pub fn stamp_checksum(page: &mut [u8], blkno: u32) {
    let sum = postgres_ffi::page_layout::checksum_page(page, blkno);
    LittleEndian::write_u16(&mut page[8..10], sum);
}

/// Overwrite one page of a relation file with a fresh page carrying `lsn`.
pub fn write_page(path: &Utf8Path, blkno: u32, lsn: u64) {
    let mut contents = std::fs::read(path).unwrap();
    let mut page = make_valid_page(lsn, 64, 8000);
    // distinct content so byte comparisons are meaningful
    LittleEndian::write_u64(&mut page[8100..8108], lsn);
    stamp_checksum(&mut page, blkno);
    let off = blkno as usize * BLCKSZ as usize;
    if contents.len() < off + BLCKSZ as usize {
        contents.resize(off + BLCKSZ as usize, 0);
    }
    contents[off..off + BLCKSZ as usize].copy_from_slice(&page);
    std::fs::write(path, contents).unwrap();
}

/// Stand-in for the server side of a backup: hands out LSNs, marks
/// stop-backup by dropping a file with the stop segment's name into the
/// archive (enough for the orchestrator's archived-segment wait).
pub struct FakeCluster {
    pub tli: TimeLineID,
    pub next_lsn: Lsn,
    pub in_recovery: bool,
    pub archive_stop_segment: bool,
    /// Pretend this much WAL was written between start and stop.
    pub advance_on_stop: Option<Lsn>,
    pub cancelled: bool,
    pub ptrack_maps: Vec<(String, BlockBitmap)>,
    wal_dir: Utf8PathBuf,
    seg_size: usize,
}

impl FakeCluster {
    pub fn new(env: &TestEnv, tli: TimeLineID, start_lsn: Lsn) -> FakeCluster {
        FakeCluster {
            tli,
            next_lsn: start_lsn,
            in_recovery: false,
            archive_stop_segment: true,
            advance_on_stop: None,
            cancelled: false,
            ptrack_maps: Vec::new(),
            wal_dir: env.wal_dir(),
            seg_size: env.instance.wal_seg_size as usize,
        }
    }

    /// Pretend WAL was written: the next backup will start at `lsn`.
    pub fn advance(&mut self, lsn: Lsn) {
        assert!(lsn >= self.next_lsn);
        self.next_lsn = lsn;
    }

    fn archive_segment_of(&self, lsn: Lsn) {
        let segno = if lsn.segment_offset(self.seg_size) == 0 {
            lsn.segment_number(self.seg_size).saturating_sub(1)
        } else {
            lsn.segment_number(self.seg_size)
        };
        let name = XLogFileName(self.tli, segno, self.seg_size);
        let path = self.wal_dir.join(name);
        if !path.exists() {
            std::fs::write(path, b"").unwrap();
        }
    }
}

impl ClusterApi for FakeCluster {
    fn is_in_recovery(&mut self) -> anyhow::Result<bool> {
        Ok(self.in_recovery)
    }

    fn current_timeline(&mut self) -> anyhow::Result<TimeLineID> {
        Ok(self.tli)
    }

    fn start_backup(&mut self, _label: &str) -> anyhow::Result<Lsn> {
        Ok(self.next_lsn)
    }

    fn stop_backup(&mut self) -> anyhow::Result<StopBackupInfo> {
        if let Some(lsn) = self.advance_on_stop.take() {
            self.advance(lsn);
        }
        let stop_lsn = self.next_lsn;
        if self.archive_stop_segment {
            self.archive_segment_of(stop_lsn);
        }
        Ok(StopBackupInfo {
            stop_lsn,
            stop_time: Utc::now(),
        })
    }

    fn cancel_backup(&mut self) {
        self.cancelled = true;
    }

    fn ptrack_page_maps(&mut self, _since: Lsn) -> anyhow::Result<Vec<(String, BlockBitmap)>> {
        Ok(self.ptrack_maps.clone())
    }
}

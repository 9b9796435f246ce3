//! The backup orchestrator: drives start-backup, data directory listing,
//! page-map construction, the worker pool, stop-backup, and finalization.
//!
//! The run is a linear sequence of steps; any failure after the backup
//! directory exists transitions the catalog entry to `ERROR` and fires a
//! best-effort stop-backup at the server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, info, warn};
use utils::bitmap::BlockBitmap;
use utils::lsn::Lsn;

use postgres_ffi::{ControlFileData, Oid, TimeLineID, XLogFileName, XLogSegNo};

use crate::catalog::{Backup, BackupFilter, BackupId, BackupMode, BackupStatus, Catalog, ChainVerdict, CompressAlg};
use crate::config::{InstanceConfig, RunContext};
use crate::error::{ServerIncompatible, WalArchiveFailed};
use crate::filelist::{self, FileEntry, FileKind, WRITE_SIZE_INHERITED};
use crate::headermap::{HeaderMapSlot, HeaderMapWriter};
use crate::incremental::{self, CopyDecision, IncrementalRules, PageMapSet};
use crate::node::StopBackupInfo;
use crate::pagefile;
use crate::walscan::{self, timeline::TimelineInterval, WalScanSetup};
use crate::PG_CONTROL_PATH;

/// The server-side operations a backup run needs. [`crate::node::NodeClient`]
/// is the production implementation; tests substitute a local fake.
pub trait ClusterApi {
    fn is_in_recovery(&mut self) -> anyhow::Result<bool>;
    fn current_timeline(&mut self) -> anyhow::Result<TimeLineID>;
    fn start_backup(&mut self, label: &str) -> anyhow::Result<Lsn>;
    fn stop_backup(&mut self) -> anyhow::Result<StopBackupInfo>;
    fn cancel_backup(&mut self);
    fn ptrack_page_maps(&mut self, since: Lsn) -> anyhow::Result<Vec<(String, BlockBitmap)>>;
}

impl ClusterApi for crate::node::NodeClient {
    fn is_in_recovery(&mut self) -> anyhow::Result<bool> {
        crate::node::NodeClient::is_in_recovery(self)
    }
    fn current_timeline(&mut self) -> anyhow::Result<TimeLineID> {
        crate::node::NodeClient::current_timeline(self)
    }
    fn start_backup(&mut self, label: &str) -> anyhow::Result<Lsn> {
        crate::node::NodeClient::start_backup(self, label)
    }
    fn stop_backup(&mut self) -> anyhow::Result<StopBackupInfo> {
        crate::node::NodeClient::stop_backup(self)
    }
    fn cancel_backup(&mut self) {
        crate::node::NodeClient::cancel_backup(self)
    }
    fn ptrack_page_maps(&mut self, since: Lsn) -> anyhow::Result<Vec<(String, BlockBitmap)>> {
        crate::node::NodeClient::ptrack_page_maps(self, since)
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub mode: BackupMode,
    pub stream: bool,
    pub compress_alg: CompressAlg,
    pub compress_level: u32,
    pub note: Option<String>,
    pub no_validate: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            mode: BackupMode::Full,
            stream: false,
            compress_alg: CompressAlg::None,
            compress_level: 1,
            note: None,
            no_validate: false,
        }
    }
}

/// Top-level directories whose contents are runtime state and never belong
/// in a backup; the directories themselves are kept so restore recreates
/// them.
const EXCLUDED_DIR_CONTENTS: [&str; 8] = [
    "pg_wal",
    "pg_stat_tmp",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
];

/// File names excluded wherever they appear.
const EXCLUDED_FILES: [&str; 7] = [
    "postmaster.pid",
    "postmaster.opts",
    "pg_internal.init",
    "recovery.signal",
    "standby.signal",
    "backup_label.old",
    "current_logfiles",
];

fn is_excluded(rel_path: &str, file_name: &str) -> bool {
    if EXCLUDED_FILES.contains(&file_name) {
        return true;
    }
    if rel_path.starts_with("log/") || rel_path.contains("pgsql_tmp") {
        return true;
    }
    for dir in EXCLUDED_DIR_CONTENTS {
        if let Some(rest) = rel_path.strip_prefix(dir) {
            if rest.starts_with('/') {
                return true;
            }
        }
    }
    false
}

/// The database OID a path belongs to, datafile or not, for partial-restore
/// filtering.
fn db_oid_of(rel_path: &str) -> Oid {
    let mut parts = rel_path.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("base"), Some(oid), Some(_)) => oid.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Enumerate one source directory into FileEntries, applying the exclusion
/// rules and marking candidate datafiles. Returned unsorted.
pub fn list_source_dir(
    root: &Utf8Path,
    external_dir_num: u32,
    ctx: &RunContext,
) -> anyhow::Result<Vec<FileEntry>> {
    let mut entries = Vec::new();

    for entry in walkdir::WalkDir::new(root).follow_links(true).min_depth(1) {
        ctx.check_interrupted()?;
        let entry = entry.with_context(|| format!("walk {root}"))?;
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| anyhow::anyhow!("non-UTF8 path {:?}", entry.path()))?;
        let rel_path = path
            .strip_prefix(root)
            .expect("walkdir yields children of root")
            .as_str()
            .to_string();
        let file_name = path.file_name().unwrap_or_default();

        if external_dir_num == 0 && is_excluded(&rel_path, file_name) {
            continue;
        }

        let metadata = entry
            .metadata()
            .with_context(|| format!("stat {path}"))?;
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = 0o600;

        if metadata.is_dir() {
            entries.push(FileEntry::new_directory(rel_path, external_dir_num, mode));
            continue;
        }

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let now = Utc::now();
        incremental::check_clock_sanity(now, mtime, &rel_path)?;
        incremental::wait_out_mtime_boundary(now, mtime);

        let mut file = FileEntry {
            rel_path: rel_path.clone(),
            external_dir_num,
            kind: FileKind::Regular,
            mode,
            size: metadata.len(),
            read_size: 0,
            write_size: 0,
            uncompressed_size: 0,
            crc: 0,
            is_datafile: false,
            is_cfs: false,
            segno: 0,
            n_blocks: 0,
            db_oid: if external_dir_num == 0 { db_oid_of(&rel_path) } else { 0 },
            mtime,
            link_target: None,
            pagemap: None,
            hdr_off: None,
            hdr_len: 0,
            hdr_crc: 0,
            claimed: Default::default(),
        };
        if external_dir_num == 0 {
            if let Some((_tag, segno)) = postgres_ffi::relpath::parse_relfile_path(&rel_path) {
                file.is_datafile = true;
                file.segno = segno;
            }
        }
        entries.push(file);
    }
    Ok(entries)
}

/// Poll the archive until the segment containing `lsn` shows up (plain or
/// compressed; a `.partial` file does not count as archived).
pub fn wait_wal_archived(
    wal_dir: &Utf8Path,
    tli: TimeLineID,
    lsn: Lsn,
    seg_size: usize,
    timeout: Duration,
    ctx: &RunContext,
) -> anyhow::Result<XLogSegNo> {
    // An LSN exactly on a segment boundary was written by the previous
    // segment.
    let segno = if lsn.segment_offset(seg_size) == 0 {
        lsn.segment_number(seg_size).saturating_sub(1)
    } else {
        lsn.segment_number(seg_size)
    };
    let name = XLogFileName(tli, segno, seg_size);
    let deadline = Instant::now() + timeout;
    info!("waiting for WAL segment {name} to be archived");
    loop {
        ctx.check_interrupted()?;
        for candidate in [name.clone(), format!("{name}.gz")] {
            if wal_dir.join(&candidate).exists() {
                return Ok(segno);
            }
        }
        if Instant::now() >= deadline {
            return Err(WalArchiveFailed(format!(
                "WAL segment {name} was not archived within {timeout:?}"
            ))
            .into());
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

/// Fields a copy worker produces for one file; applied to the shared list
/// after the pool joins.
#[derive(Debug, Default)]
struct CopyPatch {
    read_size: u64,
    write_size: i64,
    uncompressed_size: u64,
    crc: u32,
    n_blocks: u32,
    pagemap: Option<BlockBitmap>,
    hdr: Option<HeaderMapSlot>,
}

struct CopyJob<'a> {
    files: &'a [FileEntry],
    /// Indices into `files`, largest files first.
    order: &'a [usize],
    src_root: &'a Utf8Path,
    external_roots: &'a [Utf8PathBuf],
    dst_backup_dir: &'a Utf8Path,
    rules: &'a IncrementalRules<'a>,
    header_map: &'a HeaderMapWriter,
    compress_alg: CompressAlg,
    compress_level: u32,
    block_size: u16,
    /// Cursor into `order`, shared by the pool.
    next: AtomicUsize,
}

impl<'a> CopyJob<'a> {
    fn src_path(&self, entry: &FileEntry) -> Utf8PathBuf {
        if entry.external_dir_num == 0 {
            self.src_root.join(&entry.rel_path)
        } else {
            self.external_roots[(entry.external_dir_num - 1) as usize].join(&entry.rel_path)
        }
    }

    fn dst_path(&self, entry: &FileEntry) -> Utf8PathBuf {
        if entry.external_dir_num == 0 {
            self.dst_backup_dir
                .join(crate::DATABASE_DIR)
                .join(&entry.rel_path)
        } else {
            self.dst_backup_dir
                .join(crate::EXTERNAL_DIR)
                .join(entry.external_dir_num.to_string())
                .join(&entry.rel_path)
        }
    }

    /// One worker: claim files in size-descending order and copy them.
    fn run_worker(&self, ctx: &RunContext) -> anyhow::Result<Vec<(usize, CopyPatch)>> {
        let mut patches = Vec::new();
        loop {
            ctx.check_interrupted()?;
            let slot = self.next.fetch_add(1, Ordering::AcqRel);
            if slot >= self.order.len() {
                break;
            }
            let index = self.order[slot];
            let entry = &self.files[index];
            if !entry.claim() {
                continue;
            }
            if let Some(patch) = self.copy_one(entry, ctx)? {
                patches.push((index, patch));
            }
        }
        Ok(patches)
    }

    fn copy_one(&self, entry: &FileEntry, ctx: &RunContext) -> anyhow::Result<Option<CopyPatch>> {
        if entry.kind != FileKind::Regular {
            return Ok(None);
        }
        let src = self.src_path(entry);
        let dst = self.dst_path(entry);

        match self.rules.decide(entry) {
            CopyDecision::Unchanged => Ok(Some(CopyPatch {
                write_size: WRITE_SIZE_INHERITED,
                ..Default::default()
            })),
            CopyDecision::CopyWhole => {
                let stats = pagefile::backup_plain_file(
                    &src,
                    &dst,
                    self.compress_alg,
                    self.compress_level,
                    ctx,
                )
                .with_context(|| format!("copy {src}"))?;
                debug!("copied {} ({} bytes)", entry.rel_path, stats.write_size);
                Ok(Some(CopyPatch {
                    read_size: stats.uncompressed_size,
                    write_size: stats.write_size as i64,
                    uncompressed_size: stats.uncompressed_size,
                    crc: stats.crc,
                    ..Default::default()
                }))
            }
            CopyDecision::CopyPages {
                threshold,
                prefilter,
            } => {
                let result = pagefile::backup_data_file(
                    &src,
                    &dst,
                    self.block_size,
                    threshold,
                    prefilter.as_ref(),
                    self.compress_alg,
                    self.compress_level,
                    ctx,
                )
                .with_context(|| format!("copy datafile {src}"))?;

                if result.pagemap.is_empty() && self.rules.mode.is_incremental() {
                    // No page changed: record the file as unchanged instead
                    // of keeping an empty stream on disk.
                    std::fs::remove_file(&dst).with_context(|| format!("remove empty {dst}"))?;
                    return Ok(Some(CopyPatch {
                        read_size: result.read_size,
                        write_size: 0,
                        n_blocks: result.n_blocks,
                        ..Default::default()
                    }));
                }

                let hdr = self.header_map.append(&result.headers)?;
                debug!(
                    "copied datafile {} ({} pages, {} bytes)",
                    entry.rel_path,
                    result.pagemap.count_ones(),
                    result.stats.write_size
                );
                Ok(Some(CopyPatch {
                    read_size: result.read_size,
                    write_size: result.stats.write_size as i64,
                    uncompressed_size: result.stats.uncompressed_size,
                    crc: result.stats.crc,
                    n_blocks: result.n_blocks,
                    pagemap: Some(result.pagemap),
                    hdr: Some(hdr),
                }))
            }
        }
    }
}

/// Copy every regular file except `global/pg_control`, which the caller
/// copies last.
fn run_copy_pool(job: &CopyJob<'_>, ctx: &RunContext) -> anyhow::Result<Vec<(usize, CopyPatch)>> {
    let workers = ctx.num_threads.max(1);
    let results = crossbeam_utils::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| scope.spawn(|_| job.run_worker(ctx)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("copy worker panicked"))
            .collect::<Vec<_>>()
    })
    .map_err(|_| anyhow::anyhow!("copy pool panicked"))?;

    let mut patches = Vec::new();
    for result in results {
        patches.extend(result?);
    }
    Ok(patches)
}

/// Take one backup. Returns the new backup's id.
pub fn do_backup(
    catalog: &Catalog,
    instance: &InstanceConfig,
    cluster: &mut dyn ClusterApi,
    options: &BackupOptions,
    ctx: &RunContext,
) -> anyhow::Result<BackupId> {
    let _instance_lock = catalog.lock_instance()?;
    let arena = catalog.load_arena(&BackupFilter::default())?;

    // The id must be strictly greater than every existing backup's.
    let mut id = BackupId::from_time(Utc::now());
    if let Some(newest) = arena.newest() {
        if id <= newest.id {
            id = BackupId(newest.id.0 + chrono::Duration::seconds(1));
        }
    }

    // Source compatibility against what add-instance recorded.
    let control_path = instance.pgdata.join(PG_CONTROL_PATH);
    let control_bytes =
        std::fs::read(&control_path).with_context(|| format!("read {control_path}"))?;
    let control = ControlFileData::decode(&control_bytes)
        .with_context(|| format!("parse {control_path}"))?;
    if control.system_identifier != instance.system_identifier {
        return Err(ServerIncompatible(format!(
            "system identifier mismatch: cluster {:#x}, catalog {:#x}",
            control.system_identifier, instance.system_identifier
        ))
        .into());
    }
    if control.blcksz != instance.block_size || control.xlog_blcksz != instance.xlog_block_size {
        return Err(ServerIncompatible(format!(
            "block size mismatch: cluster {}/{}, catalog {}/{}",
            control.blcksz, control.xlog_blcksz, instance.block_size, instance.xlog_block_size
        ))
        .into());
    }

    let from_replica = cluster.is_in_recovery()?;
    let tli = cluster.current_timeline()?;

    // Parent chain for incremental modes. No silent fallback to FULL: a
    // missing or unusable parent is an error.
    let parent = if options.mode.is_incremental() {
        let parent = arena
            .sorted_desc()
            .into_iter()
            .find(|b| b.status.is_usable())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no usable parent backup for {} mode; take a FULL backup first",
                    options.mode
                )
            })?;
        match arena.scan_chain(parent.id) {
            ChainVerdict::Ok(_) => {}
            verdict => bail!("parent backup {} has a bad chain: {verdict:?}", parent.id),
        }
        if parent.tli != tli {
            bail!(
                "parent backup {} is on timeline {} but the cluster is on timeline {tli}",
                parent.id,
                parent.tli
            );
        }
        Some(parent.clone())
    } else {
        None
    };

    // Create the catalog entry in RUNNING state.
    let backup_dir = catalog.backup_dir(id);
    utils::crashsafe::create_dir_all(&backup_dir)?;
    utils::crashsafe::create_dir(&catalog.database_dir(id))?;
    let mut backup = Backup {
        id,
        mode: options.mode,
        status: BackupStatus::Running,
        tli,
        start_lsn: Lsn::INVALID,
        stop_lsn: Lsn::INVALID,
        end_time: None,
        recovery_xid: 0,
        recovery_time: None,
        data_bytes: 0,
        wal_bytes: 0,
        block_size: instance.block_size,
        xlog_block_size: instance.xlog_block_size,
        checksum_version: control.data_checksum_version,
        program_version: crate::program_version(),
        compress_alg: options.compress_alg,
        compress_level: options.compress_level,
        from_replica,
        stream: options.stream,
        parent_backup_id: parent.as_ref().map(|p| p.id),
        merge_dest_id: None,
        external_dirs: instance.external_dirs.clone(),
        expire_time: None,
        note: options.note.clone(),
        content_crc: 0,
    };
    catalog.write_backup(&backup, true)?;
    info!("backup {id} started, mode {}", options.mode);

    match run_backup_steps(catalog, instance, cluster, options, &mut backup, parent, ctx) {
        Ok(()) => {}
        Err(e) => {
            warn!("backup {id} failed: {e:#}");
            cluster.cancel_backup();
            if let Err(persist_err) = catalog.set_status(&mut backup, BackupStatus::Error) {
                warn!("could not persist ERROR status of {id}: {persist_err:#}");
            }
            return Err(e);
        }
    }

    if !options.no_validate {
        crate::validate::validate_backup(catalog, id, None, ctx)
            .with_context(|| format!("validate fresh backup {id}"))?;
    }
    Ok(id)
}

/// Everything between "catalog entry exists" and "status DONE". Failures
/// here roll the entry to ERROR in the caller.
#[allow(clippy::too_many_arguments)]
fn run_backup_steps(
    catalog: &Catalog,
    instance: &InstanceConfig,
    cluster: &mut dyn ClusterApi,
    options: &BackupOptions,
    backup: &mut Backup,
    parent: Option<Backup>,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    let id = backup.id;
    let label = format!("walbak backup {id}");
    let start_lsn = cluster.start_backup(&label)?;
    backup.start_lsn = start_lsn;
    info!("start LSN {start_lsn}, timeline {}", backup.tli);

    // List the data directory and the external directories.
    let mut files = list_source_dir(&instance.pgdata, 0, ctx)?;
    for (i, dir) in instance.external_dirs.iter().enumerate() {
        files.extend(list_source_dir(dir, (i + 1) as u32, ctx)?);
    }
    filelist::sort_by_path(&mut files);
    backup.data_bytes = files.iter().map(|f| f.size).sum();
    catalog.write_backup(backup, false)?;

    // Parent file list, for the non-datafile fast path and page thresholds.
    let parent_files = match &parent {
        Some(parent) => {
            let list = filelist::read_file_list(
                &catalog.content_file_path(parent.id),
                Some(parent.content_crc),
            )
            .with_context(|| format!("load parent {} file list", parent.id))?;
            Some(list)
        }
        None => None,
    };

    // Build the page map where the mode pre-selects pages.
    let page_maps = match options.mode {
        BackupMode::Page => {
            let parent = parent.as_ref().expect("incremental mode has a parent");
            let wal_dir = catalog.paths.wal_dir();
            let history = walscan::timeline::read_history(&wal_dir, backup.tli)?;
            let intervals = walscan::timeline::plan_intervals(
                &history,
                backup.tli,
                parent.tli,
                parent.stop_lsn,
                start_lsn,
            )?;
            let setup = WalScanSetup {
                wal_dir: &wal_dir,
                seg_size: instance.wal_seg_size as usize,
            };
            let maps = walscan::extract_page_map(setup, &intervals, ctx.num_threads, ctx)?;
            info!("page map built from WAL: {} files changed", maps.len());
            Some(maps)
        }
        BackupMode::Ptrack => {
            let parent = parent.as_ref().expect("incremental mode has a parent");
            let mut maps = PageMapSet::new();
            for (path, bitmap) in cluster.ptrack_page_maps(parent.start_lsn)? {
                maps.insert(path, bitmap);
            }
            info!("page map built from ptrack: {} files changed", maps.len());
            Some(maps)
        }
        BackupMode::Full | BackupMode::Delta => None,
    };

    let rules = IncrementalRules {
        mode: options.mode,
        parent_start_lsn: parent.as_ref().map(|p| p.start_lsn).unwrap_or(Lsn::INVALID),
        parent_files: parent_files.as_deref(),
        page_maps: page_maps.as_ref(),
    };

    // Create destination directories first, ascending path order, so that
    // workers never race a missing parent directory.
    let backup_dir = catalog.backup_dir(id);
    for entry in files.iter().filter(|f| f.kind == FileKind::Directory) {
        let dst = if entry.external_dir_num == 0 {
            backup_dir.join(crate::DATABASE_DIR).join(&entry.rel_path)
        } else {
            backup_dir
                .join(crate::EXTERNAL_DIR)
                .join(entry.external_dir_num.to_string())
                .join(&entry.rel_path)
        };
        std::fs::create_dir_all(&dst).with_context(|| format!("create {dst}"))?;
    }
    // Parent dirs of regular files whose directory entry was excluded.
    for entry in files.iter().filter(|f| f.kind == FileKind::Regular) {
        if let Some(parent_dir) = Utf8Path::new(&entry.rel_path).parent() {
            if !parent_dir.as_str().is_empty() {
                let dst = backup_dir.join(crate::DATABASE_DIR).join(parent_dir);
                if entry.external_dir_num == 0 && !dst.exists() {
                    std::fs::create_dir_all(&dst)?;
                }
            }
        }
    }

    for entry in &files {
        entry.reset_claim();
    }

    // pg_control goes strictly last.
    let order: Vec<usize> = {
        let mut order = filelist::order_by_size_desc(&files);
        order.retain(|&i| files[i].rel_path != PG_CONTROL_PATH || files[i].external_dir_num != 0);
        order
    };

    let header_map = HeaderMapWriter::create(&catalog.header_map_path(id))?;
    let patches = {
        let job = CopyJob {
            files: &files,
            order: &order,
            src_root: &instance.pgdata,
            external_roots: &instance.external_dirs,
            dst_backup_dir: &backup_dir,
            rules: &rules,
            header_map: &header_map,
            compress_alg: options.compress_alg,
            compress_level: options.compress_level,
            block_size: instance.block_size as u16,
            next: AtomicUsize::new(0),
        };
        run_copy_pool(&job, ctx)?
    };
    for (index, patch) in patches {
        let entry = &mut files[index];
        entry.read_size = patch.read_size;
        entry.write_size = patch.write_size;
        entry.uncompressed_size = patch.uncompressed_size;
        entry.crc = patch.crc;
        entry.n_blocks = patch.n_blocks;
        entry.pagemap = patch.pagemap;
        if let Some(hdr) = patch.hdr {
            entry.set_header_slot(hdr);
        }
    }

    // Copy pg_control after everything else completed.
    let pg_control_index = files
        .iter()
        .position(|f| f.external_dir_num == 0 && f.rel_path == PG_CONTROL_PATH)
        .ok_or_else(|| anyhow::anyhow!("source cluster has no {PG_CONTROL_PATH}"))?;
    {
        let src = instance.pgdata.join(PG_CONTROL_PATH);
        let dst = backup_dir.join(crate::DATABASE_DIR).join(PG_CONTROL_PATH);
        let stats =
            pagefile::backup_plain_file(&src, &dst, options.compress_alg, options.compress_level, ctx)?;
        let entry = &mut files[pg_control_index];
        entry.read_size = stats.uncompressed_size;
        entry.write_size = stats.write_size as i64;
        entry.uncompressed_size = stats.uncompressed_size;
        entry.crc = stats.crc;
    }

    let stop = cluster.stop_backup()?;
    let mut stop_lsn = stop.stop_lsn;
    let wal_dir = catalog.paths.wal_dir();
    let seg_size = instance.wal_seg_size as usize;

    // A replica can, in rare races, report an invalid stop LSN. Retry once
    // against the newest record actually archived; if that also fails the
    // run is lost.
    if !stop_lsn.is_valid() {
        warn!("server reported invalid stop LSN, probing the archive for the last record");
        let outcome = walscan::validate_wal_range(
            WalScanSetup { wal_dir: &wal_dir, seg_size },
            TimelineInterval {
                tli: backup.tli,
                begin: start_lsn,
                end: Lsn::INVALID,
            },
            None,
            1,
            ctx,
        )?;
        stop_lsn = outcome
            .last
            .map(|p| p.end_lsn)
            .ok_or_else(|| anyhow::anyhow!("no WAL record found after the invalid stop LSN"))?;
    }
    anyhow::ensure!(
        start_lsn <= stop_lsn,
        "stop LSN {stop_lsn} precedes start LSN {start_lsn}"
    );
    backup.stop_lsn = stop_lsn;
    backup.wal_bytes = stop_lsn.0 - start_lsn.0;

    // The backup is unusable until the WAL range it needs is safe in the
    // archive.
    let stop_segno =
        wait_wal_archived(&wal_dir, backup.tli, stop_lsn, seg_size, instance.archive_timeout, ctx)?;

    // Recovery position, as recorded when the WAL containing stop_lsn was
    // reached.
    let scan_end = if stop_lsn > start_lsn { stop_lsn } else { Lsn::INVALID };
    if scan_end.is_valid() {
        let outcome = walscan::validate_wal_range(
            WalScanSetup { wal_dir: &wal_dir, seg_size },
            TimelineInterval {
                tli: backup.tli,
                begin: start_lsn,
                end: scan_end,
            },
            None,
            ctx.num_threads,
            ctx,
        )?;
        if let Some(last) = outcome.last {
            backup.recovery_xid = last.xid;
            backup.recovery_time = last
                .time
                .map(|t| {
                    chrono::DateTime::from_timestamp(postgres_ffi::to_unix_secs(t), 0)
                        .unwrap_or_else(Utc::now)
                });
        }
    }
    if backup.recovery_time.is_none() {
        backup.recovery_time = Some(stop.stop_time);
    }

    // Stream mode: the needed WAL lives inside the backup, not only in the
    // archive. The segments were archived above; pull them in.
    if options.stream {
        let pg_wal_dir = backup_dir.join(crate::DATABASE_DIR).join("pg_wal");
        std::fs::create_dir_all(&pg_wal_dir)?;
        let first = start_lsn.segment_number(seg_size);
        for segno in first..=stop_segno {
            ctx.check_interrupted()?;
            let name = XLogFileName(backup.tli, segno, seg_size);
            let dst = pg_wal_dir.join(&name);
            crate::archive::fetch_segment(&wal_dir, &name, &dst)?;
            let metadata = std::fs::metadata(&dst)?;
            files.push(FileEntry {
                size: metadata.len(),
                read_size: metadata.len(),
                write_size: metadata.len() as i64,
                uncompressed_size: metadata.len(),
                crc: pagefile::stored_file_crc(&dst)?.0,
                mtime: 0,
                ..FileEntry::new_directory(format!("pg_wal/{name}"), 0, 0o600)
            });
            let entry = files.last_mut().expect("just pushed");
            entry.kind = FileKind::Regular;
        }
    }

    // From a replica, the restored cluster must not consider itself
    // consistent before stop_lsn.
    if backup.from_replica {
        let dst = backup_dir.join(crate::DATABASE_DIR).join(PG_CONTROL_PATH);
        let raw = read_stored_control_file(&dst, options.compress_alg)?;
        let control = ControlFileData::decode(&raw)?;
        let patched = control.encode_with_min_recovery_point(stop_lsn, backup.tli);
        let sink_stats = {
            use std::io::Write;
            let mut sink = pagefile::StoreSink::create(&dst, options.compress_alg, options.compress_level)?;
            sink.write_all(&patched)?;
            sink.finish()?
        };
        let entry = &mut files[pg_control_index];
        entry.write_size = sink_stats.write_size as i64;
        entry.uncompressed_size = sink_stats.uncompressed_size;
        entry.crc = sink_stats.crc;
    }

    // Serialize the final file list and flip to DONE.
    filelist::sort_by_path(&mut files);
    let content_crc = filelist::write_file_list(&catalog.content_file_path(id), &files)?;
    backup.content_crc = content_crc;
    backup.end_time = Some(Utc::now());

    header_map.sync()?;
    if !ctx.no_sync {
        sync_dir_recursive(&backup_dir)?;
    }
    catalog.set_status(backup, BackupStatus::Done)?;
    info!(
        "backup {id} done: {} files, {} bytes of WAL",
        files.len(),
        backup.wal_bytes
    );
    Ok(())
}

fn read_stored_control_file(path: &Utf8Path, compress_alg: CompressAlg) -> anyhow::Result<Vec<u8>> {
    let mut reader = pagefile::open_store_reader(path, compress_alg)?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut buf)?;
    Ok(buf)
}

/// Fsync every file and directory under `root`.
pub fn sync_dir_recursive(root: &Utf8Path) -> anyhow::Result<()> {
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walk {root}"))?;
        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| anyhow::anyhow!("non-UTF8 path {:?}", entry.path()))?;
        utils::crashsafe::fsync(path)?;
    }
    Ok(())
}

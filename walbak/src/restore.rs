//! The restore engine: rebuilds a data directory from a backup chain, with
//! optional incremental reuse of blocks already on disk, partial restore by
//! database OID, and recovery-target configuration.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};
use utils::bitmap::BlockBitmap;
use utils::lsn::Lsn;

use postgres_ffi::page_layout::{classify_page, PageHeaderData, PageVerdict};
use postgres_ffi::{ControlFileData, Oid};

use crate::catalog::{Backup, BackupFilter, BackupId, BackupStatus, Catalog, ChainVerdict};
use crate::config::{InstanceConfig, RunContext};
use crate::error::BackupCorrupt;
use crate::filelist::{self, FileEntry, FileKind, WRITE_SIZE_INHERITED};
use crate::headermap;
use crate::pagefile;
use crate::walscan::{self, timeline::TimelineInterval, ScanTarget, WalScanSetup};
use crate::PG_CONTROL_PATH;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RecoveryTargetSpec {
    /// Replay all available WAL.
    #[default]
    Latest,
    /// Stop as soon as consistency is reached.
    Immediate,
    Lsn(Lsn),
    Xid(u32),
    Time(chrono::DateTime<chrono::Utc>),
    Name(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncrementalMode {
    /// Fresh restore into an empty directory.
    #[default]
    None,
    /// Reuse on-disk pages whose block checksum matches the backup's.
    Checksum,
    /// Reuse on-disk pages older than the shift LSN.
    Lsn,
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Default: the newest usable backup.
    pub backup_id: Option<BackupId>,
    pub target: RecoveryTargetSpec,
    pub incremental: IncrementalMode,
    /// Non-empty: restore only these databases (plus shared files).
    pub db_include: Vec<Oid>,
    /// Databases to replace with zero-length placeholders.
    pub db_exclude: Vec<Oid>,
    /// Remap external directory n to a different root.
    pub external_remap: HashMap<u32, Utf8PathBuf>,
    pub restore_command: Option<String>,
    pub no_validate: bool,
    /// Allow cleaning a non-empty destination in fresh mode.
    pub force: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreSummary {
    pub files_restored: usize,
    /// Bytes of datafile pages actually written (skipped pages excluded).
    pub datafile_bytes_written: u64,
}

/// One chain member with its loaded file list, path-ascending.
struct ChainMember {
    backup: Backup,
    files: Vec<FileEntry>,
}

fn load_chain(catalog: &Catalog, chain_ids: &[BackupId]) -> anyhow::Result<Vec<ChainMember>> {
    let mut members = Vec::with_capacity(chain_ids.len());
    for &id in chain_ids {
        let backup = catalog.read_backup(id)?;
        let mut files =
            filelist::read_file_list(&catalog.content_file_path(id), Some(backup.content_crc))
                .with_context(|| format!("load file list of {id}"))?;
        filelist::sort_by_path(&mut files);
        members.push(ChainMember { backup, files });
    }
    Ok(members)
}

/// Restore `options.backup_id` (or the newest usable backup) into
/// `dest_dir`.
pub fn do_restore(
    catalog: &Catalog,
    instance: &InstanceConfig,
    dest_dir: &Utf8Path,
    options: &RestoreOptions,
    ctx: &RunContext,
) -> anyhow::Result<RestoreSummary> {
    let arena = catalog.load_arena(&BackupFilter::default())?;
    let target_id = match options.backup_id {
        Some(id) => id,
        None => {
            arena
                .sorted_desc()
                .into_iter()
                .find(|b| b.status == BackupStatus::Ok)
                .ok_or_else(|| anyhow::anyhow!("no backup in OK status to restore"))?
                .id
        }
    };

    let chain_ids = match arena.scan_chain(target_id) {
        ChainVerdict::Ok(chain) => chain,
        ChainVerdict::Invalid { oldest_bad } => {
            return Err(BackupCorrupt(
                target_id,
                format!("chain member {oldest_bad} is not usable"),
            )
            .into());
        }
        ChainVerdict::Broken { missing, .. } => {
            return Err(BackupCorrupt(
                target_id,
                format!("chain member {missing} is missing from the catalog"),
            )
            .into());
        }
    };

    // Readers take shared locks on every member for the duration.
    let mut locks = Vec::new();
    for &id in &chain_ids {
        locks.push(catalog.lock_backup(id, true)?);
    }

    if !options.no_validate {
        for &id in &chain_ids {
            crate::validate::validate_backup(catalog, id, None, ctx)
                .with_context(|| format!("validate chain member {id}"))?;
        }
    }

    let members = load_chain(catalog, &chain_ids)?;
    let target = members.last().expect("chain is never empty");
    info!(
        "restoring backup {target_id} (chain of {}) into {dest_dir}",
        members.len()
    );

    // Incremental modes build per-file skip maps from what is already on
    // disk; fresh mode wants the directory empty.
    let (skip_maps, skip_shift) = match options.incremental {
        IncrementalMode::None => {
            prepare_fresh_destination(dest_dir, options.force)?;
            (HashMap::new(), None)
        }
        IncrementalMode::Checksum => {
            anyhow::ensure!(
                target.backup.checksum_version != 0,
                "checksum-based incremental restore requires data checksums on the source cluster"
            );
            (build_checksum_skip_maps(catalog, &members, dest_dir, ctx)?, None)
        }
        IncrementalMode::Lsn => {
            let shift_lsn = compute_shift_lsn(catalog, &members, dest_dir)?;
            info!("LSN-based incremental restore, shift LSN {shift_lsn}");
            (
                build_lsn_skip_maps(target, dest_dir, shift_lsn, ctx)?,
                Some(shift_lsn),
            )
        }
    };

    // Directories first, ascending path order.
    std::fs::create_dir_all(dest_dir)?;
    for entry in target.files.iter().filter(|f| f.kind == FileKind::Directory) {
        let dst = dest_path(dest_dir, options, entry);
        std::fs::create_dir_all(&dst).with_context(|| format!("create {dst}"))?;
    }

    let mut summary = RestoreSummary::default();
    let mut pg_control_entry = None;
    for entry in &target.files {
        ctx.check_interrupted()?;
        if entry.kind != FileKind::Regular {
            continue;
        }
        // pg_control is finalized strictly last.
        if entry.external_dir_num == 0 && entry.rel_path == PG_CONTROL_PATH {
            pg_control_entry = Some(entry);
            continue;
        }
        let written =
            restore_one_file(catalog, &members, entry, dest_dir, options, &skip_maps, skip_shift, ctx)?;
        summary.files_restored += 1;
        summary.datafile_bytes_written += written;
    }

    if let Some(entry) = pg_control_entry {
        restore_one_file(catalog, &members, entry, dest_dir, options, &skip_maps, skip_shift, ctx)?;
        summary.files_restored += 1;
    }

    write_recovery_conf(dest_dir, options, &target.backup)?;

    if !ctx.no_sync {
        crate::backup::sync_dir_recursive(dest_dir)?;
    }
    info!(
        "restore of {target_id} complete: {} files, {} datafile bytes written",
        summary.files_restored, summary.datafile_bytes_written
    );
    Ok(summary)
}

fn prepare_fresh_destination(dest_dir: &Utf8Path, force: bool) -> anyhow::Result<()> {
    let non_empty = match dest_dir.read_dir_utf8() {
        Ok(mut entries) => entries.next().is_some(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(e).with_context(|| format!("inspect {dest_dir}")),
    };
    if !non_empty {
        return Ok(());
    }
    if !force {
        bail!(
            "restore destination {dest_dir} is not empty; \
             pass --force to let the restore remove its contents"
        );
    }
    warn!("cleaning non-empty restore destination {dest_dir}");
    for entry in dest_dir.read_dir_utf8()? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}

fn dest_path(dest_dir: &Utf8Path, options: &RestoreOptions, entry: &FileEntry) -> Utf8PathBuf {
    if entry.external_dir_num == 0 {
        dest_dir.join(&entry.rel_path)
    } else if let Some(remapped) = options.external_remap.get(&entry.external_dir_num) {
        remapped.join(&entry.rel_path)
    } else {
        // Without a remap, external directories land next to the data
        // directory under external_<n>.
        dest_dir
            .parent()
            .unwrap_or(dest_dir)
            .join(format!("external_{}", entry.external_dir_num))
            .join(&entry.rel_path)
    }
}

fn is_db_excluded(options: &RestoreOptions, db_oid: Oid) -> bool {
    if db_oid == 0 {
        return false; // shared files always restored
    }
    if options.db_exclude.contains(&db_oid) {
        return true;
    }
    if !options.db_include.is_empty() && !options.db_include.contains(&db_oid) {
        return true;
    }
    false
}

/// Store path of one file inside one backup.
fn store_path(catalog: &Catalog, backup: &Backup, entry: &FileEntry) -> Utf8PathBuf {
    if entry.external_dir_num == 0 {
        catalog.database_dir(backup.id).join(&entry.rel_path)
    } else {
        catalog
            .external_dir(backup.id, entry.external_dir_num)
            .join(&entry.rel_path)
    }
}

/// Materialize one file from the chain. Returns datafile bytes written.
#[allow(clippy::too_many_arguments)]
fn restore_one_file(
    catalog: &Catalog,
    members: &[ChainMember],
    entry: &FileEntry,
    dest_dir: &Utf8Path,
    options: &RestoreOptions,
    skip_maps: &HashMap<(u32, String), BlockBitmap>,
    skip_shift: Option<Lsn>,
    ctx: &RunContext,
) -> anyhow::Result<u64> {
    let dst = dest_path(dest_dir, options, entry);

    // Partial restore: an excluded database's file becomes a zero-length
    // placeholder so later WAL replay does not trip over a missing file.
    if is_db_excluded(options, entry.db_oid) {
        File::create(&dst).with_context(|| format!("create placeholder {dst}"))?;
        return Ok(0);
    }

    if !entry.is_datafile {
        // Walk newest-to-oldest for the first member that actually stored
        // the content.
        for member in members.iter().rev() {
            let Some(version) =
                filelist::find_by_path(&member.files, entry.external_dir_num, &entry.rel_path)
            else {
                continue;
            };
            if version.write_size == WRITE_SIZE_INHERITED {
                continue;
            }
            let store = store_path(catalog, &member.backup, version);
            pagefile::restore_plain_file(&store, member.backup.compress_alg, &dst)
                .with_context(|| format!("restore {}", entry.rel_path))?;
            set_file_mode(&dst, entry.mode);
            return Ok(0);
        }
        bail!(
            "file {} is not resolvable in the backup chain",
            entry.rel_path
        );
    }

    // Datafile: size comes from the newest entry; pages accumulate from the
    // oldest provider up.
    let mut out = File::options()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&dst)
        .with_context(|| format!("open {dst}"))?;
    out.set_len(entry.size)
        .with_context(|| format!("size {dst}"))?;

    let skip = skip_maps.get(&(entry.external_dir_num, entry.rel_path.clone()));
    let block_limit = Some(entry.n_blocks);
    let mut written = 0u64;
    for member in members.iter() {
        ctx.check_interrupted()?;
        let Some(version) =
            filelist::find_by_path(&member.files, entry.external_dir_num, &entry.rel_path)
        else {
            continue;
        };
        if version.write_size <= 0 {
            // inherited or unchanged: nothing stored in this member
            continue;
        }
        let store = store_path(catalog, &member.backup, version);
        written += pagefile::apply_data_file_records(
            &store,
            member.backup.compress_alg,
            member.backup.block_size as u16,
            &mut out,
            skip,
            skip_shift,
            block_limit,
            ctx,
        )
        .with_context(|| format!("apply pages of {} from {}", entry.rel_path, member.backup.id))?;
    }
    drop(out);
    set_file_mode(&dst, entry.mode);
    Ok(written)
}

fn set_file_mode(path: &Utf8Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if mode != 0 {
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
}

/// Final per-block page state of the chain: for each datafile, the newest
/// stored header per block.
fn final_page_state(
    catalog: &Catalog,
    members: &[ChainMember],
) -> anyhow::Result<HashMap<(u32, String), HashMap<u32, (u64, u16)>>> {
    let mut state: HashMap<(u32, String), HashMap<u32, (u64, u16)>> = HashMap::new();
    // newest first; first write per block wins
    for member in members.iter().rev() {
        let map_path = catalog.header_map_path(member.backup.id);
        for entry in &member.files {
            if !entry.is_datafile || entry.hdr_off.is_none() {
                continue;
            }
            let headers = headermap::read_headers(&map_path, entry)?;
            let per_file = state
                .entry((entry.external_dir_num, entry.rel_path.clone()))
                .or_default();
            for header in headers {
                per_file.entry(header.block).or_insert((header.lsn, header.checksum));
            }
        }
    }
    Ok(state)
}

/// Checksum-mode skip maps: blocks whose on-disk page carries a valid block
/// checksum equal to the chain's final state for that block.
fn build_checksum_skip_maps(
    catalog: &Catalog,
    members: &[ChainMember],
    dest_dir: &Utf8Path,
    ctx: &RunContext,
) -> anyhow::Result<HashMap<(u32, String), BlockBitmap>> {
    let final_state = final_page_state(catalog, members)?;
    let target = members.last().expect("chain is never empty");
    let blcksz = target.backup.block_size as u16;

    let mut skip_maps = HashMap::new();
    for entry in target.files.iter().filter(|f| f.is_datafile) {
        let on_disk = dest_dir.join(&entry.rel_path);
        let Ok(mut file) = File::open(&on_disk) else {
            continue;
        };
        let Some(per_file) = final_state.get(&(entry.external_dir_num, entry.rel_path.clone()))
        else {
            continue;
        };
        let mut skip = BlockBitmap::new();
        let mut page = vec![0u8; blcksz as usize];
        let mut blkno = 0u32;
        loop {
            ctx.check_interrupted()?;
            match read_full_page(&mut file, &mut page)? {
                false => break,
                true => {}
            }
            if let Some(&(lsn, checksum)) = per_file.get(&blkno) {
                if postgres_ffi::page_layout::verify_page_checksum(&page, blkno) {
                    let header = PageHeaderData::decode(&page);
                    if header.pd_lsn.0 == lsn && header.pd_checksum == checksum {
                        skip.set(blkno);
                    }
                }
            }
            blkno += 1;
        }
        debug!(
            "{}: {} of {} on-disk pages reusable",
            entry.rel_path,
            skip.count_ones(),
            blkno
        );
        skip_maps.insert((entry.external_dir_num, entry.rel_path.clone()), skip);
    }
    Ok(skip_maps)
}

fn read_full_page(file: &mut File, page: &mut [u8]) -> anyhow::Result<bool> {
    let mut filled = 0;
    while filled < page.len() {
        let n = file.read(&mut page[filled..])?;
        if n == 0 {
            return Ok(false); // partial tail pages are never reused
        }
        filled += n;
    }
    Ok(true)
}

/// The shift LSN: stop LSN of the newest chain member that is an ancestor
/// of the destination directory's current redo point.
fn compute_shift_lsn(
    catalog: &Catalog,
    members: &[ChainMember],
    dest_dir: &Utf8Path,
) -> anyhow::Result<Lsn> {
    let control_path = dest_dir.join(PG_CONTROL_PATH);
    let control_bytes = std::fs::read(&control_path).with_context(|| {
        format!("LSN-based incremental restore needs a readable {control_path}")
    })?;
    let control = ControlFileData::decode(&control_bytes)?;
    let dest_redo = control.checkpoint_redo;
    let dest_tli = control.checkpoint_tli;

    let history = walscan::timeline::read_history(&catalog.paths.wal_dir(), dest_tli)
        .unwrap_or_default();

    for member in members.iter().rev() {
        let compatible = walscan::timeline::is_ancestor(
            &history,
            dest_tli,
            member.backup.tli,
            member.backup.stop_lsn,
        );
        if compatible && member.backup.stop_lsn <= dest_redo {
            return Ok(member.backup.stop_lsn);
        }
    }
    bail!(
        "no chain member is an ancestor of the destination's redo point {dest_redo} \
         on timeline {dest_tli}; LSN-based incremental restore is not possible"
    );
}

/// LSN-mode skip maps: on-disk pages whose LSN is strictly below the shift
/// LSN need not be rewritten.
fn build_lsn_skip_maps(
    target: &ChainMember,
    dest_dir: &Utf8Path,
    shift_lsn: Lsn,
    ctx: &RunContext,
) -> anyhow::Result<HashMap<(u32, String), BlockBitmap>> {
    let blcksz = target.backup.block_size as u16;
    let mut skip_maps = HashMap::new();
    for entry in target.files.iter().filter(|f| f.is_datafile) {
        let on_disk = dest_dir.join(&entry.rel_path);
        let Ok(mut file) = File::open(&on_disk) else {
            continue;
        };
        let mut skip = BlockBitmap::new();
        let mut page = vec![0u8; blcksz as usize];
        let mut blkno = 0u32;
        loop {
            ctx.check_interrupted()?;
            if !read_full_page(&mut file, &mut page)? {
                break;
            }
            if let PageVerdict::Valid { .. } = classify_page(&page, blcksz) {
                let header = PageHeaderData::decode(&page);
                if header.pd_lsn < shift_lsn {
                    skip.set(blkno);
                }
            }
            blkno += 1;
        }
        skip_maps.insert((entry.external_dir_num, entry.rel_path.clone()), skip);
    }
    Ok(skip_maps)
}

/// Write recovery directives for the server version family this tool
/// understands (v12+): parameters in `postgresql.auto.conf` plus a
/// `recovery.signal` marker.
fn write_recovery_conf(
    dest_dir: &Utf8Path,
    options: &RestoreOptions,
    backup: &Backup,
) -> anyhow::Result<()> {
    let needs_recovery =
        options.restore_command.is_some() || options.target != RecoveryTargetSpec::Latest || !backup.stream;
    if !needs_recovery {
        return Ok(());
    }

    let mut conf = String::new();
    conf.push_str("\n# recovery settings added by backup restore\n");
    if let Some(cmd) = &options.restore_command {
        conf.push_str(&format!("restore_command = '{cmd}'\n"));
    }
    match &options.target {
        RecoveryTargetSpec::Latest => {}
        RecoveryTargetSpec::Immediate => conf.push_str("recovery_target = 'immediate'\n"),
        RecoveryTargetSpec::Lsn(lsn) => {
            conf.push_str(&format!("recovery_target_lsn = '{lsn}'\n"))
        }
        RecoveryTargetSpec::Xid(xid) => {
            conf.push_str(&format!("recovery_target_xid = '{xid}'\n"))
        }
        RecoveryTargetSpec::Time(time) => conf.push_str(&format!(
            "recovery_target_time = '{}'\n",
            time.format("%Y-%m-%d %H:%M:%S%.6f+00")
        )),
        RecoveryTargetSpec::Name(name) => {
            conf.push_str(&format!("recovery_target_name = '{name}'\n"))
        }
    }
    if options.target != RecoveryTargetSpec::Latest {
        conf.push_str("recovery_target_action = 'promote'\n");
    }

    let auto_conf = dest_dir.join("postgresql.auto.conf");
    let mut file = File::options()
        .create(true)
        .append(true)
        .open(&auto_conf)
        .with_context(|| format!("open {auto_conf}"))?;
    file.write_all(conf.as_bytes())?;

    std::fs::write(dest_dir.join("recovery.signal"), b"")?;
    Ok(())
}

/// Confirm that a recovery target is reachable with the archived WAL that
/// follows the backup. Used by `restore` before touching the destination
/// when a point-in-time target was requested.
pub fn check_target_reachable(
    catalog: &Catalog,
    instance: &InstanceConfig,
    backup: &Backup,
    target: &RecoveryTargetSpec,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    let scan_target = match target {
        RecoveryTargetSpec::Latest | RecoveryTargetSpec::Immediate => return Ok(()),
        RecoveryTargetSpec::Lsn(lsn) => ScanTarget::Lsn(*lsn),
        RecoveryTargetSpec::Xid(xid) => ScanTarget::Xid(*xid),
        RecoveryTargetSpec::Time(time) => {
            let micros = (time.timestamp() - postgres_ffi::PG_EPOCH_OFFSET_SECS) * 1_000_000;
            ScanTarget::Time(micros)
        }
        RecoveryTargetSpec::Name(name) => ScanTarget::Name(name.clone()),
    };

    let wal_dir = catalog.paths.wal_dir();
    let outcome = walscan::validate_wal_range(
        WalScanSetup {
            wal_dir: &wal_dir,
            seg_size: instance.wal_seg_size as usize,
        },
        TimelineInterval {
            tli: backup.tli,
            begin: backup.start_lsn,
            end: Lsn::INVALID,
        },
        Some(&scan_target),
        ctx.num_threads,
        ctx,
    )?;
    if outcome.reached.is_none() {
        bail!(
            "recovery target {target:?} is not reachable from backup {} with the archived WAL",
            backup.id
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{do_backup, BackupOptions};
    use crate::catalog::BackupMode;
    use crate::testenv::{self, FakeCluster, TestEnv};
    use postgres_ffi::BLCKSZ;

    /// Take a FULL backup of the env's pgdata and mark it OK.
    fn take_full(env: &TestEnv, cluster: &mut FakeCluster) -> BackupId {
        let id = do_backup(
            &env.catalog,
            &env.instance,
            cluster,
            &BackupOptions {
                no_validate: true,
                ..Default::default()
            },
            &env.ctx,
        )
        .unwrap();
        let mut backup = env.catalog.read_backup(id).unwrap();
        env.catalog
            .set_status(&mut backup, BackupStatus::Ok)
            .unwrap();
        id
    }

    fn take_delta(env: &TestEnv, cluster: &mut FakeCluster) -> BackupId {
        let id = do_backup(
            &env.catalog,
            &env.instance,
            cluster,
            &BackupOptions {
                mode: BackupMode::Delta,
                no_validate: true,
                ..Default::default()
            },
            &env.ctx,
        )
        .unwrap();
        let mut backup = env.catalog.read_backup(id).unwrap();
        env.catalog
            .set_status(&mut backup, BackupStatus::Ok)
            .unwrap();
        id
    }

    fn restore_opts(id: BackupId) -> RestoreOptions {
        RestoreOptions {
            backup_id: Some(id),
            no_validate: true,
            ..Default::default()
        }
    }

    #[test]
    fn fresh_restore_reproduces_source() {
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let full_id = take_full(&env, &mut cluster);

        let dest = camino_tempfile::tempdir().unwrap();
        do_restore(
            &env.catalog,
            &env.instance,
            dest.path(),
            &restore_opts(full_id),
            &env.ctx,
        )
        .unwrap();

        for rel in ["base/5/16384", "PG_VERSION", "postgresql.conf", crate::PG_CONTROL_PATH] {
            assert_eq!(
                std::fs::read(dest.path().join(rel)).unwrap(),
                std::fs::read(env.instance.pgdata.join(rel)).unwrap(),
                "{rel} differs"
            );
        }
        // runtime dirs recreated empty
        assert!(dest.path().join("pg_wal").is_dir());
        assert_eq!(
            dest.path().join("pg_wal").read_dir_utf8().unwrap().count(),
            0
        );
        // runtime files were never backed up
        assert!(!dest.path().join("postmaster.pid").exists());
        // recovery settings written (archive restore is assumed)
        assert!(dest.path().join("recovery.signal").exists());
    }

    #[test]
    fn chain_restore_applies_increments() {
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        take_full(&env, &mut cluster);

        let datafile = env.instance.pgdata.join("base/5/16384");
        testenv::write_page(&datafile, 1, 0x1_0000_9000);
        // grow the relation by one page
        testenv::write_page(&datafile, 3, 0x1_0000_9500);
        cluster.advance(Lsn(0x1_0001_0000));
        let delta_id = take_delta(&env, &mut cluster);

        let dest = camino_tempfile::tempdir().unwrap();
        do_restore(
            &env.catalog,
            &env.instance,
            dest.path(),
            &restore_opts(delta_id),
            &env.ctx,
        )
        .unwrap();

        assert_eq!(
            std::fs::read(dest.path().join("base/5/16384")).unwrap(),
            std::fs::read(&datafile).unwrap()
        );
    }

    #[test]
    fn restore_refuses_non_empty_destination() {
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let full_id = take_full(&env, &mut cluster);

        let dest = camino_tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("leftover"), b"x").unwrap();
        let err = do_restore(
            &env.catalog,
            &env.instance,
            dest.path(),
            &restore_opts(full_id),
            &env.ctx,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("not empty"));

        // with force it cleans and restores
        let mut opts = restore_opts(full_id);
        opts.force = true;
        do_restore(&env.catalog, &env.instance, dest.path(), &opts, &env.ctx).unwrap();
        assert!(!dest.path().join("leftover").exists());
        assert!(dest.path().join("base/5/16384").exists());
    }

    #[test]
    fn partial_restore_zeroes_excluded_database() {
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let full_id = take_full(&env, &mut cluster);

        let dest = camino_tempfile::tempdir().unwrap();
        let mut opts = restore_opts(full_id);
        opts.db_exclude = vec![5];
        do_restore(&env.catalog, &env.instance, dest.path(), &opts, &env.ctx).unwrap();

        // present but empty
        let placeholder = dest.path().join("base/5/16384");
        assert!(placeholder.exists());
        assert_eq!(std::fs::metadata(&placeholder).unwrap().len(), 0);
        // shared files restored normally
        assert!(std::fs::metadata(dest.path().join(crate::PG_CONTROL_PATH)).unwrap().len() > 0);
    }

    #[test]
    fn checksum_incremental_rewrites_only_divergent_pages() {
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let full_id = take_full(&env, &mut cluster);

        // first a fresh restore
        let dest = camino_tempfile::tempdir().unwrap();
        do_restore(
            &env.catalog,
            &env.instance,
            dest.path(),
            &restore_opts(full_id),
            &env.ctx,
        )
        .unwrap();

        // untouched destination: every page is reusable
        let mut opts = restore_opts(full_id);
        opts.incremental = IncrementalMode::Checksum;
        let summary = do_restore(&env.catalog, &env.instance, dest.path(), &opts, &env.ctx).unwrap();
        assert_eq!(summary.datafile_bytes_written, 0);

        // diverge one page on disk; only it is rewritten
        testenv::write_page(&dest.path().join("base/5/16384"), 2, 0x2_0000_0000);
        let summary = do_restore(&env.catalog, &env.instance, dest.path(), &opts, &env.ctx).unwrap();
        assert_eq!(summary.datafile_bytes_written, BLCKSZ as u64);
        assert_eq!(
            std::fs::read(dest.path().join("base/5/16384")).unwrap(),
            std::fs::read(env.instance.pgdata.join("base/5/16384")).unwrap()
        );
    }

    #[test]
    fn lsn_incremental_skips_pages_below_shift() {
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let full_id = take_full(&env, &mut cluster);

        let dest = camino_tempfile::tempdir().unwrap();
        do_restore(
            &env.catalog,
            &env.instance,
            dest.path(),
            &restore_opts(full_id),
            &env.ctx,
        )
        .unwrap();

        // pretend the destination cluster recovered up to the FULL's stop:
        // its redo point then makes the FULL the shift ancestor
        let full = env.catalog.read_backup(full_id).unwrap();
        let control = postgres_ffi::controlfile::make_test_controlfile(
            testenv::TEST_SYSTEM_ID,
            full.stop_lsn,
            1,
            env.instance.wal_seg_size,
            1,
        );
        std::fs::write(dest.path().join(crate::PG_CONTROL_PATH), control).unwrap();

        // take a DELTA that changes one page and grows the file by another
        testenv::write_page(&env.instance.pgdata.join("base/5/16384"), 1, 0x1_0000_9000);
        testenv::write_page(&env.instance.pgdata.join("base/5/16384"), 3, 0x1_0000_9500);
        cluster.advance(Lsn(0x1_0001_0000));
        let delta_id = take_delta(&env, &mut cluster);

        let mut opts = restore_opts(delta_id);
        opts.incremental = IncrementalMode::Lsn;
        let summary =
            do_restore(&env.catalog, &env.instance, dest.path(), &opts, &env.ctx).unwrap();
        // only the two pages newer than the shift were written; the rest
        // was reused from disk
        assert_eq!(summary.datafile_bytes_written, 2 * BLCKSZ as u64);
        assert_eq!(
            std::fs::read(dest.path().join("base/5/16384")).unwrap(),
            std::fs::read(env.instance.pgdata.join("base/5/16384")).unwrap()
        );
    }
}

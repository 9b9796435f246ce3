//! The merge engine: folds an incremental backup (and every intermediate
//! member) down into its FULL ancestor, mutating the FULL in place until it
//! becomes the destination backup.
//!
//! Crash safety comes from the status markers written at each step: on
//! restart, the state is inferred from (FULL status, merge_dest, which
//! directories still exist) and the merge resumes at the earliest
//! unfinished step. The fold itself is idempotent: reconstructing a file
//! from an already partially merged FULL yields the same bytes.

use std::collections::BTreeSet;
use std::fs::File;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use fail::fail_point;
use tracing::{debug, info};
use utils::lsn::Lsn;

use crate::catalog::{
    Backup, BackupFilter, BackupId, BackupMode, BackupStatus, Catalog, ChainVerdict,
};
use crate::config::RunContext;
use crate::filelist::{self, FileEntry, FileKind, WRITE_SIZE_INHERITED};
use crate::headermap::HeaderMapWriter;
use crate::pagefile;

/// Merge the chain of `dest_id` into its FULL ancestor. Returns the id the
/// merged backup ends up with (the destination's id).
pub fn do_merge(catalog: &Catalog, dest_id: BackupId, ctx: &RunContext) -> anyhow::Result<BackupId> {
    let _lock = catalog.lock_instance()?;

    // Resume: a FULL that already carries merge_dest for us takes priority
    // over starting from scratch. The directory may even be renamed already
    // with a stale id inside, which load_arena would skip, so scan raw.
    if let Some((dir_id, full)) = find_merge_marker(catalog, dest_id)? {
        match full.status {
            BackupStatus::Merging => {
                info!("resuming interrupted merge of {dest_id} (fold phase)");
                return merge_from_fold(catalog, dir_id, dest_id, ctx);
            }
            BackupStatus::Merged => {
                info!("resuming interrupted merge of {dest_id} (finalize phase)");
                return finalize_merge(catalog, dir_id, full, dest_id);
            }
            status => bail!(
                "backup {dir_id} has merge_dest {dest_id} but unexpected status {status}"
            ),
        }
    }

    merge_from_scratch(catalog, dest_id, ctx)
}

/// Find a backup directory whose metadata marks it as the merge target of
/// `dest_id`. Returns the directory name it currently lives under and the
/// parsed metadata.
fn find_merge_marker(
    catalog: &Catalog,
    dest_id: BackupId,
) -> anyhow::Result<Option<(BackupId, Backup)>> {
    let dir = catalog.paths.backups_dir();
    let entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("list {dir}")),
    };
    for entry in entries {
        let entry = entry?;
        let Ok(dir_id) = entry.file_name().parse::<BackupId>() else {
            continue;
        };
        let control_path = catalog.control_file_path(dir_id);
        let Ok(contents) = std::fs::read_to_string(&control_path) else {
            continue;
        };
        let Ok(backup) = Backup::from_control_string(&contents) else {
            continue;
        };
        if backup.merge_dest_id == Some(dest_id) {
            return Ok(Some((dir_id, backup)));
        }
    }
    Ok(None)
}

fn merge_from_scratch(
    catalog: &Catalog,
    dest_id: BackupId,
    ctx: &RunContext,
) -> anyhow::Result<BackupId> {
    let mut arena = catalog.load_arena(&BackupFilter::default())?;
    let dest = arena
        .get(dest_id)
        .ok_or_else(|| anyhow::anyhow!("backup {dest_id} not found"))?
        .clone();
    if dest.mode == BackupMode::Full {
        bail!("backup {dest_id} is already FULL; nothing to merge");
    }
    let chain_ids = match arena.scan_chain(dest_id) {
        ChainVerdict::Ok(chain) => chain,
        verdict => bail!("cannot merge {dest_id}: chain is not intact ({verdict:?})"),
    };
    let full_id = chain_ids[0];

    // Preflight: validate every member and refuse mixed storage formats.
    for &id in &chain_ids {
        crate::validate::validate_backup(catalog, id, None, ctx)
            .with_context(|| format!("preflight validation of chain member {id}"))?;
    }
    let members: Vec<Backup> = chain_ids
        .iter()
        .map(|&id| catalog.read_backup(id))
        .collect::<anyhow::Result<_>>()?;
    let full = &members[0];
    if members
        .iter()
        .any(|m| m.compress_alg != full.compress_alg || m.block_size != full.block_size)
    {
        bail!(
            "chain of {dest_id} mixes compression algorithms or block sizes; \
             in-place merge is not possible"
        );
    }

    // Mark the whole chain as merging; the FULL additionally records the
    // destination so an interrupted merge can be recognized.
    for &id in &chain_ids {
        let mut backup = catalog.read_backup(id)?;
        backup.merge_dest_id = (id == full_id).then_some(dest_id);
        catalog.set_status(&mut backup, BackupStatus::Merging)?;
        arena.get_mut(id).expect("chain member loaded").status = BackupStatus::Merging;
    }

    merge_from_fold(catalog, full_id, dest_id, ctx)
}

/// The fold phase and everything after it. Entered both on a fresh merge
/// (chain freshly marked MERGING) and when resuming one.
fn merge_from_fold(
    catalog: &Catalog,
    full_id: BackupId,
    dest_id: BackupId,
    ctx: &RunContext,
) -> anyhow::Result<BackupId> {
    let mut full = catalog.read_backup(full_id)?;
    let chain_ids = merging_chain_ids(catalog, full_id, dest_id)?;
    let members: Vec<(Backup, Vec<FileEntry>)> = chain_ids
        .iter()
        .map(|&id| -> anyhow::Result<_> {
            let backup = catalog.read_backup(id)?;
            let mut files = filelist::read_file_list(
                &catalog.content_file_path(id),
                Some(backup.content_crc),
            )?;
            filelist::sort_by_path(&mut files);
            Ok((backup, files))
        })
        .collect::<anyhow::Result<_>>()?;
    let dest = &members.last().expect("chain is never empty").0;
    let dest_files = &members.last().expect("chain is never empty").1;

    fail_point!("merge-before-fold", |_| {
        bail!("failpoint merge-before-fold")
    });

    let header_map = HeaderMapWriter::open_for_append(&catalog.header_map_path(full_id))?;
    let mut merged_files: Vec<FileEntry> = Vec::with_capacity(dest_files.len());

    for entry in dest_files {
        ctx.check_interrupted()?;
        let merged = fold_one_file(catalog, &members, entry, &header_map, ctx)
            .with_context(|| format!("fold {}", entry.rel_path))?;
        merged_files.push(merged);
    }
    header_map.sync()?;

    // Files present in the FULL but gone from the destination are deleted
    // bottom-up.
    let full_files = &members[0].1;
    let dest_paths: BTreeSet<(u32, &str)> = dest_files
        .iter()
        .map(|f| (f.external_dir_num, f.rel_path.as_str()))
        .collect();
    let mut doomed: Vec<&FileEntry> = full_files
        .iter()
        .filter(|f| !dest_paths.contains(&(f.external_dir_num, f.rel_path.as_str())))
        .collect();
    doomed.sort_by(|a, b| b.cmp_path(a));
    for entry in doomed {
        let path = member_store_path(catalog, full_id, entry);
        debug!("removing {} (absent in destination)", entry.rel_path);
        let result = match entry.kind {
            FileKind::Directory => std::fs::remove_dir(&path),
            _ => std::fs::remove_file(&path),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {path}")),
        }
    }

    // Persist the merged list and flip the FULL to MERGED with the
    // destination's coordinates. From here on the merge only deletes and
    // renames.
    filelist::sort_by_path(&mut merged_files);
    let content_crc =
        filelist::write_file_list(&catalog.content_file_path(full_id), &merged_files)?;
    full.content_crc = content_crc;
    full.tli = dest.tli;
    full.start_lsn = dest.start_lsn;
    full.stop_lsn = dest.stop_lsn;
    full.recovery_xid = dest.recovery_xid;
    full.recovery_time = dest.recovery_time;
    full.end_time = dest.end_time;
    full.data_bytes = dest.data_bytes;
    full.wal_bytes = dest.wal_bytes;
    full.stream = dest.stream;
    full.note = dest.note.clone();
    full.expire_time = full.expire_time.max(dest.expire_time);
    if !ctx.no_sync {
        crate::backup::sync_dir_recursive(&catalog.backup_dir(full_id))?;
    }
    catalog.set_status(&mut full, BackupStatus::Merged)?;

    fail_point!("merge-after-merged-status", |_| {
        bail!("failpoint merge-after-merged-status")
    });

    finalize_merge(catalog, full_id, full, dest_id)
}

/// Chain ids participating in the merge, FULL first. On a resume the
/// in-between members are recognized by their MERGING status.
fn merging_chain_ids(
    catalog: &Catalog,
    full_id: BackupId,
    dest_id: BackupId,
) -> anyhow::Result<Vec<BackupId>> {
    let arena = catalog.load_arena(&BackupFilter::default())?;
    match arena.scan_chain(dest_id) {
        ChainVerdict::Ok(chain) => {
            anyhow::ensure!(
                chain.first() == Some(&full_id),
                "chain of {dest_id} does not start at {full_id}"
            );
            Ok(chain)
        }
        // Mid-merge the members are MERGING, which scan_chain reports as
        // invalid; reconstruct the chain by parent links regardless.
        ChainVerdict::Invalid { .. } => {
            let mut chain = vec![dest_id];
            let mut current = dest_id;
            while let Some(backup) = arena.get(current) {
                match backup.parent_backup_id {
                    Some(parent) => {
                        chain.push(parent);
                        current = parent;
                    }
                    None => break,
                }
            }
            chain.reverse();
            anyhow::ensure!(
                chain.first() == Some(&full_id),
                "merging chain of {dest_id} does not start at {full_id}"
            );
            Ok(chain)
        }
        verdict => bail!("cannot merge {dest_id}: {verdict:?}"),
    }
}

fn member_store_path(catalog: &Catalog, id: BackupId, entry: &FileEntry) -> Utf8PathBuf {
    if entry.external_dir_num == 0 {
        catalog.database_dir(id).join(&entry.rel_path)
    } else {
        catalog
            .external_dir(id, entry.external_dir_num)
            .join(&entry.rel_path)
    }
}

/// Fold one destination file into the FULL. Returns the merged FileEntry.
fn fold_one_file(
    catalog: &Catalog,
    members: &[(Backup, Vec<FileEntry>)],
    entry: &FileEntry,
    header_map: &HeaderMapWriter,
    ctx: &RunContext,
) -> anyhow::Result<FileEntry> {
    let (full, full_files) = &members[0];
    let full_path = member_store_path(catalog, full.id, entry);

    if entry.kind == FileKind::Directory {
        std::fs::create_dir_all(&full_path)?;
        return Ok(entry.clone());
    }
    if entry.kind != FileKind::Regular {
        return Ok(entry.clone());
    }

    // Unchanged throughout the chain: every non-FULL member inherited it or
    // recorded zero changed pages. The FULL's on-disk copy and header-map
    // slot stay as they are (fast in-place path).
    let unchanged = members[1..].iter().all(|(_, files)| {
        match filelist::find_by_path(files, entry.external_dir_num, &entry.rel_path) {
            Some(version) => version.write_size == WRITE_SIZE_INHERITED || version.write_size == 0,
            None => true,
        }
    });
    if unchanged {
        let full_version =
            filelist::find_by_path(full_files, entry.external_dir_num, &entry.rel_path);
        if let Some(full_version) = full_version {
            let mut merged = full_version.clone();
            // fresh metadata comes from the destination's view of the file
            merged.mtime = entry.mtime;
            merged.mode = entry.mode;
            merged.n_blocks = merged.n_blocks.max(entry.n_blocks);
            return Ok(merged);
        }
        // Inherited but the FULL never stored it: broken chain content.
        bail!(
            "file {} is inherited through the whole chain but absent in the FULL",
            entry.rel_path
        );
    }

    if !entry.is_datafile {
        // Newest stored version wins wholesale.
        for (backup, files) in members.iter().rev() {
            let Some(version) =
                filelist::find_by_path(files, entry.external_dir_num, &entry.rel_path)
            else {
                continue;
            };
            if version.write_size == WRITE_SIZE_INHERITED {
                continue;
            }
            let src = member_store_path(catalog, backup.id, version);
            let tmp = utils::crashsafe::path_with_suffix_extension(&full_path, "merge_tmp2");
            std::fs::copy(&src, &tmp).with_context(|| format!("copy {src} to {tmp}"))?;
            utils::crashsafe::durable_rename(&tmp, &full_path)?;
            let mut merged = version.clone();
            merged.mtime = entry.mtime;
            merged.mode = entry.mode;
            return Ok(merged);
        }
        bail!("file {} is not resolvable in the chain", entry.rel_path);
    }

    // Datafile: reconstruct the final content the same way restore does,
    // then repackage it as a fresh backup store file.
    let tmp1 = utils::crashsafe::path_with_suffix_extension(&full_path, "merge_tmp1");
    let tmp2 = utils::crashsafe::path_with_suffix_extension(&full_path, "merge_tmp2");

    {
        let mut out = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&tmp1)
            .with_context(|| format!("create {tmp1}"))?;
        out.set_len(entry.size)?;
        for (backup, files) in members.iter() {
            let Some(version) =
                filelist::find_by_path(files, entry.external_dir_num, &entry.rel_path)
            else {
                continue;
            };
            if version.write_size <= 0 {
                continue;
            }
            let store = member_store_path(catalog, backup.id, version);
            pagefile::apply_data_file_records(
                &store,
                backup.compress_alg,
                backup.block_size as u16,
                &mut out,
                None,
                None,
                Some(entry.n_blocks),
                ctx,
            )
            .with_context(|| format!("reconstruct from {}", backup.id))?;
        }
    }

    let result = pagefile::backup_data_file(
        &tmp1,
        &tmp2,
        full.block_size as u16,
        Lsn::INVALID,
        None,
        full.compress_alg,
        full.compress_level,
        ctx,
    )?;
    std::fs::remove_file(&tmp1).with_context(|| format!("remove {tmp1}"))?;
    utils::crashsafe::durable_rename(&tmp2, &full_path)?;

    let slot = header_map.append(&result.headers)?;
    let mut merged = entry.clone();
    merged.read_size = result.read_size;
    merged.write_size = result.stats.write_size as i64;
    merged.uncompressed_size = result.stats.uncompressed_size;
    merged.crc = result.stats.crc;
    merged.n_blocks = result.n_blocks;
    merged.pagemap = Some(result.pagemap);
    merged.set_header_slot(slot);
    Ok(merged)
}

/// Everything after the FULL reached MERGED: delete the old incremental
/// directories bottom-up, rename the FULL's directory to the destination's
/// id, and rewrite its identity.
fn finalize_merge(
    catalog: &Catalog,
    full_dir_id: BackupId,
    mut full: Backup,
    dest_id: BackupId,
) -> anyhow::Result<BackupId> {
    // Remaining MERGING entries are this merge's consumed members.
    let arena = catalog.load_arena(&BackupFilter::default())?;
    let mut doomed: Vec<BackupId> = arena
        .backups
        .values()
        .filter(|b| b.status == BackupStatus::Merging && b.id != full_dir_id)
        .map(|b| b.id)
        .collect();
    doomed.sort();
    for id in doomed.into_iter().rev() {
        info!("removing consumed incremental backup {id}");
        catalog.remove_backup_dir(id)?;
    }

    fail_point!("merge-after-delete", |_| {
        bail!("failpoint merge-after-delete")
    });

    // Rename the FULL into the destination's identity. The control file is
    // rewritten right after the rename; a crash between the two leaves a
    // directory whose metadata still carries merge_dest, which the resume
    // path recognizes.
    if full_dir_id != dest_id {
        let from = catalog.backup_dir(full_dir_id);
        let to = catalog.backup_dir(dest_id);
        std::fs::rename(&from, &to).with_context(|| format!("rename {from} to {to}"))?;
        utils::crashsafe::fsync(&catalog.paths.backups_dir())?;
    }

    full.id = dest_id;
    full.mode = BackupMode::Full;
    full.parent_backup_id = None;
    full.merge_dest_id = None;
    full.program_version = crate::program_version();
    full.status = BackupStatus::Ok;
    catalog.write_backup(&full, true)?;
    info!("merge complete: backup {dest_id} is now FULL");
    Ok(dest_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{do_backup, BackupOptions};
    use crate::restore::{do_restore, RestoreOptions};
    use crate::testenv::{self, FakeCluster, TestEnv};
    use once_cell::sync::Lazy;

    // Failpoints are process-global; merge tests must not see each other's.
    static MERGE_TESTS: Lazy<parking_lot::Mutex<()>> = Lazy::new(Default::default);

    fn backup(env: &TestEnv, cluster: &mut FakeCluster, mode: BackupMode) -> BackupId {
        let id = do_backup(
            &env.catalog,
            &env.instance,
            cluster,
            &BackupOptions {
                mode,
                no_validate: true,
                ..Default::default()
            },
            &env.ctx,
        )
        .unwrap();
        let mut b = env.catalog.read_backup(id).unwrap();
        env.catalog.set_status(&mut b, BackupStatus::Ok).unwrap();
        id
    }

    /// FULL + one DELTA with a changed page, a grown relation, a changed
    /// config file, and a deleted file.
    fn chain_fixture(env: &TestEnv, cluster: &mut FakeCluster) -> (BackupId, BackupId) {
        std::fs::write(env.instance.pgdata.join("droppable.conf"), b"old").unwrap();
        let full_id = backup(env, cluster, BackupMode::Full);

        let datafile = env.instance.pgdata.join("base/5/16384");
        testenv::write_page(&datafile, 1, 0x1_0000_9000);
        testenv::write_page(&datafile, 3, 0x1_0000_9500);
        std::fs::write(env.instance.pgdata.join("postgresql.conf"), b"changed = on\n").unwrap();
        std::fs::remove_file(env.instance.pgdata.join("droppable.conf")).unwrap();
        cluster.advance(Lsn(0x1_0001_0000));
        let delta_id = backup(env, cluster, BackupMode::Delta);
        (full_id, delta_id)
    }

    fn assert_merged_matches_source(env: &TestEnv, merged_id: BackupId) {
        let merged = env.catalog.read_backup(merged_id).unwrap();
        assert_eq!(merged.status, BackupStatus::Ok);
        assert_eq!(merged.mode, BackupMode::Full);
        assert_eq!(merged.parent_backup_id, None);
        assert_eq!(merged.merge_dest_id, None);

        // the merged backup must validate and restore to the live state
        crate::validate::validate_backup(&env.catalog, merged_id, None, &env.ctx).unwrap();
        let dest = camino_tempfile::tempdir().unwrap();
        do_restore(
            &env.catalog,
            &env.instance,
            dest.path(),
            &RestoreOptions {
                backup_id: Some(merged_id),
                no_validate: true,
                ..Default::default()
            },
            &env.ctx,
        )
        .unwrap();
        for rel in ["base/5/16384", "postgresql.conf"] {
            assert_eq!(
                std::fs::read(dest.path().join(rel)).unwrap(),
                std::fs::read(env.instance.pgdata.join(rel)).unwrap(),
                "{rel} differs after merge+restore"
            );
        }
        assert!(!dest.path().join("droppable.conf").exists());
    }

    #[test]
    fn merge_folds_delta_into_full() {
        let _guard = MERGE_TESTS.lock();
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let (full_id, delta_id) = chain_fixture(&env, &mut cluster);

        let merged_id = do_merge(&env.catalog, delta_id, &env.ctx).unwrap();
        assert_eq!(merged_id, delta_id);

        // the old FULL's directory is gone, the old incremental identity
        // now holds the merged FULL
        assert!(!env.catalog.backup_dir(full_id).exists());
        assert_merged_matches_source(&env, merged_id);

        let arena = env.catalog.load_arena(&BackupFilter::default()).unwrap();
        assert_eq!(arena.backups.len(), 1);
    }

    #[test]
    fn merge_of_full_is_rejected() {
        let _guard = MERGE_TESTS.lock();
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let full_id = backup(&env, &mut cluster, BackupMode::Full);
        let err = do_merge(&env.catalog, full_id, &env.ctx).unwrap_err();
        assert!(format!("{err:#}").contains("already FULL"));
    }

    #[test]
    fn merge_resumes_after_crash_before_rename() {
        let _guard = MERGE_TESTS.lock();
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let (full_id, delta_id) = chain_fixture(&env, &mut cluster);

        // crash after the FULL is marked MERGED but before any deletion or
        // rename happened
        fail::cfg("merge-after-merged-status", "return").unwrap();
        let err = do_merge(&env.catalog, delta_id, &env.ctx).unwrap_err();
        assert!(format!("{err:#}").contains("merge-after-merged-status"));
        fail::remove("merge-after-merged-status");

        let full = env.catalog.read_backup(full_id).unwrap();
        assert_eq!(full.status, BackupStatus::Merged);
        assert!(env.catalog.backup_dir(delta_id).exists());

        // re-running the merge completes it
        let merged_id = do_merge(&env.catalog, delta_id, &env.ctx).unwrap();
        assert_eq!(merged_id, delta_id);
        assert!(!env.catalog.backup_dir(full_id).exists());
        assert_merged_matches_source(&env, merged_id);
    }

    #[test]
    fn merge_resumes_after_crash_during_fold() {
        let _guard = MERGE_TESTS.lock();
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let (_full_id, delta_id) = chain_fixture(&env, &mut cluster);

        fail::cfg("merge-before-fold", "return").unwrap();
        let err = do_merge(&env.catalog, delta_id, &env.ctx).unwrap_err();
        assert!(format!("{err:#}").contains("merge-before-fold"));
        fail::remove("merge-before-fold");

        // the chain is marked MERGING; a plain restore would refuse it now,
        // but the merge can resume and finish
        let merged_id = do_merge(&env.catalog, delta_id, &env.ctx).unwrap();
        assert_merged_matches_source(&env, merged_id);
    }

    #[test]
    fn merge_resumes_after_crash_after_delete() {
        let _guard = MERGE_TESTS.lock();
        let env = TestEnv::new();
        let mut cluster = FakeCluster::new(&env, 1, Lsn(0x1_0000_8000));
        let (full_id, delta_id) = chain_fixture(&env, &mut cluster);

        fail::cfg("merge-after-delete", "return").unwrap();
        let err = do_merge(&env.catalog, delta_id, &env.ctx).unwrap_err();
        assert!(format!("{err:#}").contains("merge-after-delete"));
        fail::remove("merge-after-delete");

        // the incremental directory is gone, the FULL still has its old id
        assert!(!env.catalog.backup_dir(delta_id).exists());
        assert!(env.catalog.backup_dir(full_id).exists());

        let merged_id = do_merge(&env.catalog, delta_id, &env.ctx).unwrap();
        assert_merged_matches_source(&env, merged_id);
    }
}

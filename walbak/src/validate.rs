//! Backup validation: file existence, sizes, file CRCs, per-page record
//! CRCs and header sanity, and replayability of the WAL range the backup
//! depends on. A single invalid file makes the backup `CORRUPT`, which also
//! orphans its descendants.

use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use camino::Utf8PathBuf;
use tracing::{info, warn};
use utils::lsn::Lsn;

use crate::catalog::{Backup, BackupFilter, BackupId, BackupStatus, Catalog, ChainVerdict};
use crate::config::{InstanceConfig, RunContext};
use crate::error::BackupCorrupt;
use crate::filelist::{self, FileEntry, FileKind};
use crate::headermap;
use crate::pagefile::{self, PageRecordHeader, PAGE_RECORD_HEADER_LEN};
use crate::walscan::{self, timeline::TimelineInterval, ScanTarget, WalScanSetup};

/// Validate one backup. On success a `DONE` (or healed `ORPHAN`) backup is
/// promoted to `OK`; on any defect the backup is marked `CORRUPT`, its
/// descendants are orphaned, and an error is returned.
///
/// `target` optionally also checks that a recovery target is reachable in
/// the WAL that follows the backup.
pub fn validate_backup(
    catalog: &Catalog,
    id: BackupId,
    target: Option<&ScanTarget>,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    let _lock = catalog.lock_backup(id, true)?;
    let mut backup = catalog.read_backup(id)?;

    match backup.status {
        BackupStatus::Ok
        | BackupStatus::Done
        | BackupStatus::Orphan
        | BackupStatus::Corrupt
        | BackupStatus::Merging
        | BackupStatus::Merged => {}
        status => {
            anyhow::bail!("backup {id} cannot be validated in status {status}");
        }
    }

    let result = verify_files(catalog, &backup, ctx).and_then(|()| verify_wal(catalog, &backup, ctx));

    match result {
        Ok(()) => {
            if matches!(backup.status, BackupStatus::Done | BackupStatus::Orphan) {
                // An orphan whose chain healed goes back to OK as well.
                let arena = catalog.load_arena(&BackupFilter::default())?;
                let chain_ok = matches!(arena.scan_chain(id), ChainVerdict::Ok(_));
                if backup.status == BackupStatus::Done || chain_ok {
                    catalog.set_status(&mut backup, BackupStatus::Ok)?;
                }
            }
            info!("backup {id} is valid");
        }
        Err(e) => {
            warn!("backup {id} failed validation: {e:#}");
            catalog.set_status(&mut backup, BackupStatus::Corrupt)?;
            let mut arena = catalog.load_arena(&BackupFilter::default())?;
            catalog.orphanize_descendants(&mut arena, id)?;
            return Err(BackupCorrupt(id, format!("{e:#}")).into());
        }
    }

    // A recovery target past the backup is a property of the request, not
    // of the backup: unreachability is an error but not corruption.
    if let Some(target) = target {
        verify_target(catalog, &backup, target, ctx)?;
    }
    Ok(())
}

/// Parallel verification of every stored file against its FileEntry.
fn verify_files(catalog: &Catalog, backup: &Backup, ctx: &RunContext) -> anyhow::Result<()> {
    let files = filelist::read_file_list(
        &catalog.content_file_path(backup.id),
        Some(backup.content_crc),
    )
    .with_context(|| format!("load file list of {}", backup.id))?;

    for entry in &files {
        entry.reset_claim();
    }
    let next = AtomicUsize::new(0);
    let workers = ctx.num_threads.max(1);

    let results = crossbeam_utils::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(|_| -> anyhow::Result<()> {
                    loop {
                        ctx.check_interrupted()?;
                        let index = next.fetch_add(1, Ordering::AcqRel);
                        if index >= files.len() {
                            return Ok(());
                        }
                        let entry = &files[index];
                        if !entry.claim() {
                            continue;
                        }
                        verify_one_file(catalog, backup, entry)?;
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("validation worker panicked"))
            .collect::<Vec<_>>()
    })
    .map_err(|_| anyhow::anyhow!("validation pool panicked"))?;

    for result in results {
        result?;
    }
    Ok(())
}

fn store_path(catalog: &Catalog, backup: &Backup, entry: &FileEntry) -> Utf8PathBuf {
    if entry.external_dir_num == 0 {
        catalog.database_dir(backup.id).join(&entry.rel_path)
    } else {
        catalog
            .external_dir(backup.id, entry.external_dir_num)
            .join(&entry.rel_path)
    }
}

fn verify_one_file(catalog: &Catalog, backup: &Backup, entry: &FileEntry) -> anyhow::Result<()> {
    if entry.kind != FileKind::Regular {
        return Ok(());
    }
    // Inherited and unchanged files hold no bytes in this backup; each
    // chain member is validated on its own.
    if entry.write_size <= 0 {
        return Ok(());
    }

    let path = store_path(catalog, backup, entry);
    let metadata = std::fs::metadata(&path)
        .with_context(|| format!("stored file {} is missing", entry.rel_path))?;
    anyhow::ensure!(
        metadata.len() == entry.write_size as u64,
        "stored file {} has size {}, expected {}",
        entry.rel_path,
        metadata.len(),
        entry.write_size
    );

    let (crc, _) = pagefile::stored_file_crc(&path)?;
    anyhow::ensure!(
        crc == entry.crc,
        "stored file {} has CRC {crc:#x}, expected {:#x}",
        entry.rel_path,
        entry.crc
    );

    if entry.is_datafile && entry.hdr_off.is_some() {
        verify_page_records(catalog, backup, entry, &path)?;
    }
    Ok(())
}

/// Walk a datafile's record stream next to its header-map slots.
fn verify_page_records(
    catalog: &Catalog,
    backup: &Backup,
    entry: &FileEntry,
    path: &Utf8PathBuf,
) -> anyhow::Result<()> {
    use std::io::Read;

    let headers = headermap::read_headers(&catalog.header_map_path(backup.id), entry)?;
    let mut reader = pagefile::open_store_reader(path, backup.compress_alg)?;
    let mut pos = 0u64;

    for header in &headers {
        anyhow::ensure!(
            header.pos == pos,
            "datafile {}: record for block {} at stream offset {pos}, header map says {}",
            entry.rel_path,
            header.block,
            header.pos
        );
        let mut record = vec![0u8; header.len as usize];
        reader
            .read_exact(&mut record)
            .with_context(|| format!("datafile {} truncated at block {}", entry.rel_path, header.block))?;

        let crc = crc32c::crc32c(&record);
        anyhow::ensure!(
            crc == header.crc,
            "datafile {} block {}: page record CRC {crc:#x}, expected {:#x}",
            entry.rel_path,
            header.block,
            header.crc
        );

        let rec_header = PageRecordHeader::decode(&record[..PAGE_RECORD_HEADER_LEN]);
        anyhow::ensure!(
            rec_header.block == header.block,
            "datafile {}: record block {} does not match header map block {}",
            entry.rel_path,
            rec_header.block,
            header.block
        );
        anyhow::ensure!(
            rec_header.payload_len as usize + PAGE_RECORD_HEADER_LEN == record.len()
                && rec_header.payload_len as usize + rec_header.hole_length as usize
                    <= backup.block_size as usize,
            "datafile {} block {}: implausible record geometry",
            entry.rel_path,
            rec_header.block
        );
        pos += header.len as u64;
    }

    // Nothing may follow the last described record.
    let mut trailing = [0u8; 1];
    anyhow::ensure!(
        reader.read(&mut trailing)? == 0,
        "datafile {} has bytes past its last page record",
        entry.rel_path
    );
    Ok(())
}

/// Stream backups carry their WAL inside; archive backups use the instance
/// archive.
fn wal_location(catalog: &Catalog, backup: &Backup) -> anyhow::Result<(Utf8PathBuf, usize)> {
    let wal_dir = if backup.stream {
        catalog.database_dir(backup.id).join("pg_wal")
    } else {
        catalog.paths.wal_dir()
    };
    let instance = InstanceConfig::load(&catalog.paths.instance_config_path())?;
    Ok((wal_dir, instance.wal_seg_size as usize))
}

/// Replay (without applying) the WAL between start and stop to confirm the
/// backup can reach consistency.
fn verify_wal(catalog: &Catalog, backup: &Backup, ctx: &RunContext) -> anyhow::Result<()> {
    if backup.start_lsn == backup.stop_lsn {
        // Nothing happened during the backup; there is nothing to replay.
        return Ok(());
    }
    let (wal_dir, seg_size) = wal_location(catalog, backup)?;
    walscan::validate_wal_range(
        WalScanSetup {
            wal_dir: &wal_dir,
            seg_size,
        },
        TimelineInterval {
            tli: backup.tli,
            begin: backup.start_lsn,
            end: backup.stop_lsn,
        },
        None,
        ctx.num_threads,
        ctx,
    )
    .with_context(|| {
        format!(
            "WAL between {} and {} is not replayable",
            backup.start_lsn, backup.stop_lsn
        )
    })?;
    Ok(())
}

/// Check that `target` is reachable in the WAL following the backup.
fn verify_target(
    catalog: &Catalog,
    backup: &Backup,
    target: &ScanTarget,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    let (wal_dir, seg_size) = wal_location(catalog, backup)?;
    let outcome = walscan::validate_wal_range(
        WalScanSetup {
            wal_dir: &wal_dir,
            seg_size,
        },
        TimelineInterval {
            tli: backup.tli,
            begin: backup.start_lsn,
            end: Lsn::INVALID,
        },
        Some(target),
        ctx.num_threads,
        ctx,
    )?;
    anyhow::ensure!(
        outcome.reached.is_some(),
        "recovery target {target:?} is not reachable from backup {}",
        backup.id
    );
    Ok(())
}

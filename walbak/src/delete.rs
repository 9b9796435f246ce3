//! Deleting backups, pinning them against deletion, and pruning archived
//! WAL that no surviving backup can ever need.

use anyhow::{bail, Context};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use postgres_ffi::{is_xlog_file_name, XLogFromFileName};

use crate::catalog::{BackupFilter, BackupId, BackupStatus, Catalog};
use crate::config::{InstanceConfig, RunContext};

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub backup_id: BackupId,
    /// Also remove archived WAL older than anything still needed.
    pub prune_wal: bool,
}

/// Delete one backup. Its descendants survive as `ORPHAN`s (they can heal
/// by a later merge or re-validate against a new chain never happens; they
/// are kept for operator inspection rather than silently cascaded away).
pub fn do_delete(catalog: &Catalog, options: &DeleteOptions, ctx: &RunContext) -> anyhow::Result<()> {
    let _lock = catalog.lock_instance()?;
    let mut arena = catalog.load_arena(&BackupFilter::default())?;
    let id = options.backup_id;
    let backup = arena
        .get(id)
        .ok_or_else(|| anyhow::anyhow!("backup {id} not found"))?;

    if let Some(expire) = backup.expire_time {
        if expire > Utc::now() {
            bail!("backup {id} is pinned until {expire}; refusing to delete");
        }
    }

    // Descendants lose their ancestor; mark them before the directory goes.
    catalog.orphanize_descendants(&mut arena, id)?;

    let mut backup = arena.get(id).expect("looked up above").clone();
    catalog.set_status(&mut backup, BackupStatus::Deleting)?;
    ctx.check_interrupted()?;
    catalog.remove_backup_dir(id)?;
    arena.backups.remove(&id);
    info!("backup {id} deleted");

    if options.prune_wal {
        prune_wal(catalog, ctx)?;
    }
    Ok(())
}

/// Remove archived segments older than the start of the oldest backup that
/// is still usable (or orphaned; orphans may become usable again after a
/// merge). With no surviving backups the archive is left alone: pruning
/// everything on an empty catalog is never what the operator meant.
fn prune_wal(catalog: &Catalog, ctx: &RunContext) -> anyhow::Result<()> {
    let arena = catalog.load_arena(&BackupFilter::default())?;
    let keep_from = arena
        .backups
        .values()
        .filter(|b| {
            matches!(
                b.status,
                BackupStatus::Ok | BackupStatus::Done | BackupStatus::Orphan | BackupStatus::Running
            )
        })
        .map(|b| b.start_lsn)
        .min();
    let Some(keep_from) = keep_from else {
        warn!("no surviving backups; not pruning the WAL archive");
        return Ok(());
    };

    let instance = InstanceConfig::load(&catalog.paths.instance_config_path())?;
    let seg_size = instance.wal_seg_size as usize;
    let keep_segno = keep_from.segment_number(seg_size);

    let wal_dir = catalog.paths.wal_dir();
    let mut removed = 0usize;
    for entry in wal_dir
        .read_dir_utf8()
        .with_context(|| format!("list {wal_dir}"))?
    {
        ctx.check_interrupted()?;
        let entry = entry?;
        let name = entry.file_name();
        let base = name
            .strip_suffix(".gz")
            .or_else(|| name.strip_suffix(".partial"))
            .unwrap_or(name);
        if !is_xlog_file_name(base) {
            continue; // history files and unrelated files stay
        }
        let Some((segno, _tli)) = XLogFromFileName(base, seg_size) else {
            continue;
        };
        if segno < keep_segno {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("remove {}", entry.path()))?;
            removed += 1;
        }
    }
    info!("pruned {removed} archived WAL segments older than segment {keep_segno}");
    Ok(())
}

/// Pin (or unpin) a backup: a pinned backup refuses deletion until the pin
/// lapses.
pub fn do_set_backup(
    catalog: &Catalog,
    id: BackupId,
    ttl: Option<Duration>,
    expire_time: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let _lock = catalog.lock_backup(id, false)?;
    let mut backup = catalog.read_backup(id)?;
    backup.expire_time = match (ttl, expire_time) {
        (Some(_), Some(_)) => bail!("--ttl and --expire-time are mutually exclusive"),
        (Some(ttl), None) => Some(Utc::now() + ttl),
        (None, Some(t)) => Some(t),
        (None, None) => None, // unpin
    };
    match backup.expire_time {
        Some(expire) => info!("backup {id} pinned until {expire}"),
        None => info!("backup {id} unpinned"),
    }
    catalog.write_backup(&backup, true)
}

//! The backup catalog: on-disk layout of backups, metadata read/write with
//! atomic rewrite, chain traversal, and status transitions.
//!
//! Backups are kept in an arena keyed by [`BackupId`]; parent/descendant
//! links are ids, never owning pointers, so orphan propagation is a plain
//! graph walk. The relation is acyclic because a parent id is always
//! strictly older than its child's.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utils::lock_file::{LockError, LockFile};
use utils::lsn::Lsn;

use crate::config::CatalogPaths;
use crate::error::CatalogCorrupt;
use crate::{BACKUP_CONTENT_FILE, BACKUP_CONTROL_FILE, BACKUP_LOCK_FILE};

/// Identity of one backup: its start time, second precision, UTC. Doubles as
/// the directory name. Chronological order is identity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BackupId(pub NaiveDateTime);

const BACKUP_ID_FORMAT: &str = "%Y%m%d-%H%M%S";

impl BackupId {
    pub fn from_time(t: DateTime<Utc>) -> BackupId {
        use chrono::Timelike;
        // Truncate to whole seconds; sub-second precision would leak into
        // directory names without buying anything.
        BackupId(
            t.naive_utc()
                .with_nanosecond(0)
                .expect("zero nanosecond is valid"),
        )
    }

    pub fn as_time(&self) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(self.0, Utc)
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(BACKUP_ID_FORMAT))
    }
}

impl FromStr for BackupId {
    type Err = chrono::ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(BackupId(NaiveDateTime::parse_from_str(s, BACKUP_ID_FORMAT)?))
    }
}

impl TryFrom<String> for BackupId {
    type Error = chrono::ParseError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BackupId> for String {
    fn from(id: BackupId) -> String {
        id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupMode {
    Full,
    Page,
    Ptrack,
    Delta,
}

impl BackupMode {
    pub fn is_incremental(&self) -> bool {
        !matches!(self, BackupMode::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Running,
    Done,
    Ok,
    Error,
    Corrupt,
    Orphan,
    Merging,
    Merged,
    Deleting,
    Deleted,
}

impl BackupStatus {
    /// Statuses a backup must be in to serve as a restore source or an
    /// incremental parent.
    pub fn is_usable(&self) -> bool {
        matches!(self, BackupStatus::Ok | BackupStatus::Done)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[derive(strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CompressAlg {
    #[default]
    None,
    Zlib,
}

/// Everything `backup.control` records about one backup.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub id: BackupId,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: postgres_ffi::TimeLineID,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub end_time: Option<DateTime<Utc>>,
    pub recovery_xid: u32,
    pub recovery_time: Option<DateTime<Utc>>,
    /// Total bytes of the source cluster covered by this backup.
    pub data_bytes: u64,
    /// Bytes of WAL between start and stop.
    pub wal_bytes: u64,
    pub block_size: u32,
    pub xlog_block_size: u32,
    pub checksum_version: u32,
    pub program_version: String,
    pub compress_alg: CompressAlg,
    pub compress_level: u32,
    pub from_replica: bool,
    /// True when the WAL needed by this backup is stored inside the backup
    /// itself rather than only in the archive.
    pub stream: bool,
    pub parent_backup_id: Option<BackupId>,
    pub merge_dest_id: Option<BackupId>,
    pub external_dirs: Vec<Utf8PathBuf>,
    pub expire_time: Option<DateTime<Utc>>,
    pub note: Option<String>,
    /// CRC-32C of the serialized file list, checked on every load.
    pub content_crc: u32,
}

impl Backup {
    pub fn start_time(&self) -> DateTime<Utc> {
        self.id.as_time()
    }

    /// Render as `KEY = VALUE` lines.
    pub fn to_control_string(&self) -> String {
        let mut out = String::with_capacity(1024);
        let mut put = |k: &str, v: String| {
            out.push_str(k);
            out.push_str(" = ");
            out.push_str(&v);
            out.push('\n');
        };
        put("backup-id", self.id.to_string());
        put("backup-mode", self.mode.to_string());
        put("status", self.status.to_string());
        put("tli", self.tli.to_string());
        put("start-lsn", self.start_lsn.to_string());
        put("stop-lsn", self.stop_lsn.to_string());
        put("start-time", self.start_time().to_rfc3339());
        if let Some(t) = self.end_time {
            put("end-time", t.to_rfc3339());
        }
        put("recovery-xid", self.recovery_xid.to_string());
        if let Some(t) = self.recovery_time {
            put("recovery-time", t.to_rfc3339());
        }
        put("data-bytes", self.data_bytes.to_string());
        put("wal-bytes", self.wal_bytes.to_string());
        put("block-size", self.block_size.to_string());
        put("xlog-block-size", self.xlog_block_size.to_string());
        put("checksum-version", self.checksum_version.to_string());
        put("program-version", self.program_version.clone());
        put("compress-alg", self.compress_alg.to_string());
        put("compress-level", self.compress_level.to_string());
        put("from-replica", self.from_replica.to_string());
        put("stream", self.stream.to_string());
        if let Some(parent) = self.parent_backup_id {
            put("parent-backup-id", parent.to_string());
        }
        if let Some(dest) = self.merge_dest_id {
            put("merge-dest-id", dest.to_string());
        }
        if !self.external_dirs.is_empty() {
            let joined: Vec<&str> = self.external_dirs.iter().map(|d| d.as_str()).collect();
            put("external-dirs", joined.join(":"));
        }
        if let Some(t) = self.expire_time {
            put("expire-time", t.to_rfc3339());
        }
        if let Some(note) = &self.note {
            put("note", note.clone());
        }
        put("content-crc", self.content_crc.to_string());
        out
    }

    /// Parse `KEY = VALUE` lines. Unknown keys are tolerated (older versions
    /// of the tool must be able to read newer catalogs far enough to warn).
    pub fn from_control_string(contents: &str) -> anyhow::Result<Backup> {
        let mut kv = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("malformed control line {line:?}"))?;
            kv.insert(key.trim().to_string(), value.trim().to_string());
        }

        let req = |key: &str| -> anyhow::Result<&String> {
            kv.get(key).ok_or_else(|| anyhow::anyhow!("missing key '{key}'"))
        };
        let parse_time = |s: &str| -> anyhow::Result<DateTime<Utc>> {
            Ok(DateTime::parse_from_rfc3339(s)
                .with_context(|| format!("bad timestamp {s:?}"))?
                .with_timezone(&Utc))
        };

        Ok(Backup {
            id: req("backup-id")?.parse()?,
            mode: req("backup-mode")?.parse()?,
            status: req("status")?.parse()?,
            tli: req("tli")?.parse()?,
            start_lsn: req("start-lsn")?
                .parse()
                .map_err(|e| anyhow::anyhow!("bad start-lsn: {e}"))?,
            stop_lsn: req("stop-lsn")?
                .parse()
                .map_err(|e| anyhow::anyhow!("bad stop-lsn: {e}"))?,
            end_time: kv.get("end-time").map(|s| parse_time(s)).transpose()?,
            recovery_xid: req("recovery-xid")?.parse()?,
            recovery_time: kv.get("recovery-time").map(|s| parse_time(s)).transpose()?,
            data_bytes: req("data-bytes")?.parse()?,
            wal_bytes: req("wal-bytes")?.parse()?,
            block_size: req("block-size")?.parse()?,
            xlog_block_size: req("xlog-block-size")?.parse()?,
            checksum_version: req("checksum-version")?.parse()?,
            program_version: req("program-version")?.clone(),
            compress_alg: req("compress-alg")?.parse()?,
            compress_level: req("compress-level")?.parse()?,
            from_replica: req("from-replica")?.parse()?,
            stream: req("stream")?.parse()?,
            parent_backup_id: kv.get("parent-backup-id").map(|s| s.parse()).transpose()?,
            merge_dest_id: kv.get("merge-dest-id").map(|s| s.parse()).transpose()?,
            external_dirs: kv
                .get("external-dirs")
                .map(|s| s.split(':').map(Utf8PathBuf::from).collect())
                .unwrap_or_default(),
            expire_time: kv.get("expire-time").map(|s| parse_time(s)).transpose()?,
            note: kv.get("note").cloned(),
            content_crc: req("content-crc")?.parse()?,
        })
    }
}

/// Result of walking a backup's parent chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerdict {
    /// Chain is complete and every member usable; ids ordered FULL first.
    Ok(Vec<BackupId>),
    /// Every parent exists but `oldest_bad` is not in a usable status.
    Invalid { oldest_bad: BackupId },
    /// A parent referenced by `child` does not exist in the catalog.
    Broken { child: BackupId, missing: BackupId },
}

/// In-memory arena of backups keyed by id.
#[derive(Debug, Default)]
pub struct BackupArena {
    pub backups: BTreeMap<BackupId, Backup>,
}

impl BackupArena {
    pub fn get(&self, id: BackupId) -> Option<&Backup> {
        self.backups.get(&id)
    }

    pub fn get_mut(&mut self, id: BackupId) -> Option<&mut Backup> {
        self.backups.get_mut(&id)
    }

    pub fn newest(&self) -> Option<&Backup> {
        self.backups.values().next_back()
    }

    /// Backups sorted by start time, newest first.
    pub fn sorted_desc(&self) -> Vec<&Backup> {
        self.backups.values().rev().collect()
    }

    /// Walk parent links until a FULL backup, classifying the chain.
    pub fn scan_chain(&self, id: BackupId) -> ChainVerdict {
        let mut chain = vec![id];
        let mut oldest_bad = None;
        let mut current = id;
        loop {
            let backup = match self.get(current) {
                Some(b) => b,
                None => {
                    let child = *chain.get(chain.len().wrapping_sub(2)).unwrap_or(&id);
                    return ChainVerdict::Broken {
                        child,
                        missing: current,
                    };
                }
            };
            // The selected backup itself may be freshly DONE; parents must be
            // usable (MERGING/MERGED appear only mid-merge and make the chain
            // unusable for everyone else).
            if current != id && !backup.status.is_usable() {
                oldest_bad = Some(current);
            }
            match backup.parent_backup_id {
                Some(parent) => {
                    chain.push(parent);
                    current = parent;
                }
                None => break,
            }
        }
        if let Some(oldest_bad) = oldest_bad {
            return ChainVerdict::Invalid { oldest_bad };
        }
        chain.reverse();
        ChainVerdict::Ok(chain)
    }

    /// The FULL ancestor of a backup, or the chain defect that prevents
    /// finding it.
    pub fn find_full_ancestor(&self, id: BackupId) -> Result<&Backup, ChainVerdict> {
        match self.scan_chain(id) {
            ChainVerdict::Ok(chain) => Ok(self.get(chain[0]).expect("chain members exist")),
            verdict => Err(verdict),
        }
    }

    /// All transitive descendants of `id`, oldest first.
    pub fn descendants_of(&self, id: BackupId) -> Vec<BackupId> {
        let mut result = Vec::new();
        // Ascending id order guarantees parents are classified before
        // children, so one pass suffices.
        for (bid, backup) in self.backups.iter() {
            if let Some(parent) = backup.parent_backup_id {
                if parent == id || result.contains(&parent) {
                    result.push(*bid);
                }
            }
        }
        result
    }
}

/// Filter for `list-backups`.
#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub since: Option<BackupId>,
    pub until: Option<BackupId>,
    pub statuses: Option<Vec<BackupStatus>>,
}

impl BackupFilter {
    fn matches(&self, backup: &Backup) -> bool {
        if let Some(since) = self.since {
            if backup.id < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if backup.id > until {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&backup.status) {
                return false;
            }
        }
        true
    }
}

/// Handle to one instance's catalog on disk.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub paths: CatalogPaths,
}

impl Catalog {
    pub fn open(paths: CatalogPaths) -> Catalog {
        Catalog { paths }
    }

    pub fn backup_dir(&self, id: BackupId) -> Utf8PathBuf {
        self.paths.backups_dir().join(id.to_string())
    }

    pub fn database_dir(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join(crate::DATABASE_DIR)
    }

    pub fn external_dir(&self, id: BackupId, dir_num: u32) -> Utf8PathBuf {
        self.backup_dir(id)
            .join(crate::EXTERNAL_DIR)
            .join(dir_num.to_string())
    }

    pub fn control_file_path(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join(BACKUP_CONTROL_FILE)
    }

    pub fn content_file_path(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join(BACKUP_CONTENT_FILE)
    }

    pub fn header_map_path(&self, id: BackupId) -> Utf8PathBuf {
        self.backup_dir(id).join(crate::PAGE_HEADER_MAP_FILE)
    }

    /// Exclusive instance-level lock serializing destructive operations.
    pub fn lock_instance(&self) -> Result<LockFile, LockError> {
        LockFile::lock_exclusive(&self.paths.instance_lock_path())
    }

    /// Per-backup lock: shared for readers, exclusive for mutators.
    pub fn lock_backup(&self, id: BackupId, shared: bool) -> Result<LockFile, LockError> {
        let path = self.backup_dir(id).join(BACKUP_LOCK_FILE);
        if shared {
            LockFile::lock_shared(&path)
        } else {
            LockFile::lock_exclusive(&path)
        }
    }

    pub fn read_backup(&self, id: BackupId) -> anyhow::Result<Backup> {
        let path = self.control_file_path(id);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("read backup metadata {path}"))?;
        let backup = Backup::from_control_string(&contents)
            .map_err(|e| CatalogCorrupt(format!("bad metadata in {path}: {e:#}")))?;
        if backup.id != id {
            return Err(CatalogCorrupt(format!(
                "metadata in {path} names backup {} instead of {id}",
                backup.id
            ))
            .into());
        }
        Ok(backup)
    }

    /// Atomic rewrite of `backup.control`. With `strict = false` (periodic
    /// size updates during a long backup) the fsyncs are skipped.
    pub fn write_backup(&self, backup: &Backup, strict: bool) -> anyhow::Result<()> {
        let path = self.control_file_path(backup.id);
        let contents = backup.to_control_string();
        if strict {
            utils::crashsafe::overwrite_file(&path, contents.as_bytes())
                .with_context(|| format!("write backup metadata {path}"))?;
        } else {
            let tmp = utils::crashsafe::path_with_suffix_extension(&path, crate::TEMP_FILE_SUFFIX);
            std::fs::write(&tmp, contents.as_bytes())
                .with_context(|| format!("write {tmp}"))?;
            std::fs::rename(&tmp, &path).with_context(|| format!("rename {tmp} into place"))?;
        }
        Ok(())
    }

    /// Persist a status transition.
    pub fn set_status(&self, backup: &mut Backup, status: BackupStatus) -> anyhow::Result<()> {
        tracing::info!("backup {}: {} -> {}", backup.id, backup.status, status);
        backup.status = status;
        self.write_backup(backup, true)
    }

    /// Walk `backups/<instance>/`, parse every `backup.control`, skip
    /// entries that do not match the filter. Corrupted metadata produces a
    /// warning and is skipped, not fatal.
    pub fn load_arena(&self, filter: &BackupFilter) -> anyhow::Result<BackupArena> {
        let dir = self.paths.backups_dir();
        let mut arena = BackupArena::default();
        let entries = match dir.read_dir_utf8() {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(arena),
            Err(e) => return Err(e).with_context(|| format!("list {dir}")),
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("list {dir}"))?;
            let name = entry.file_name();
            let id: BackupId = match name.parse() {
                Ok(id) => id,
                // instance.toml, lock files, stray temp dirs
                Err(_) => continue,
            };
            match self.read_backup(id) {
                Ok(backup) => {
                    if filter.matches(&backup) {
                        arena.backups.insert(id, backup);
                    }
                }
                Err(e) => {
                    warn!("skipping backup {name}: {e:#}");
                }
            }
        }
        Ok(arena)
    }

    /// Set `ORPHAN` on every usable descendant of a backup that stopped
    /// being usable, and persist each transition.
    pub fn orphanize_descendants(
        &self,
        arena: &mut BackupArena,
        parent: BackupId,
    ) -> anyhow::Result<()> {
        for id in arena.descendants_of(parent) {
            let backup = arena.get_mut(id).expect("descendant exists");
            if backup.status.is_usable() {
                warn!(
                    "backup {id} is orphaned because its ancestor {parent} is no longer valid"
                );
                self.set_status(backup, BackupStatus::Orphan)?;
            }
        }
        Ok(())
    }

    /// Remove a backup directory, bottom-up, files before their directories.
    pub fn remove_backup_dir(&self, id: BackupId) -> anyhow::Result<()> {
        let dir = self.backup_dir(id);
        if !dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&dir).with_context(|| format!("remove {dir}"))?;
        utils::crashsafe::fsync(&self.paths.backups_dir())?;
        Ok(())
    }
}

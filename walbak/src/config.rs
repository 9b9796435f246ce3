//! Catalog layout, per-instance configuration, and the per-run context that
//! replaces process-wide mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::Interrupted;

/// Default bounded wait for the server to archive a WAL segment.
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Locations inside the catalog root. All derived paths go through here so
/// that the on-disk layout is written down exactly once.
#[derive(Debug, Clone)]
pub struct CatalogPaths {
    pub root: Utf8PathBuf,
    pub instance: String,
}

impl CatalogPaths {
    pub fn new(root: impl Into<Utf8PathBuf>, instance: impl Into<String>) -> Self {
        CatalogPaths {
            root: root.into(),
            instance: instance.into(),
        }
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.root.join("backups").join(&self.instance)
    }

    pub fn wal_dir(&self) -> Utf8PathBuf {
        self.root.join("wal").join(&self.instance)
    }

    pub fn instance_config_path(&self) -> Utf8PathBuf {
        self.backups_dir().join("instance.toml")
    }

    pub fn instance_lock_path(&self) -> Utf8PathBuf {
        self.backups_dir().join(crate::BACKUP_LOCK_FILE)
    }
}

/// Per-instance configuration, written by `add-instance` and consulted by
/// every later command for compatibility checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub pgdata: Utf8PathBuf,
    pub system_identifier: u64,
    pub block_size: u32,
    pub xlog_block_size: u32,
    pub wal_seg_size: u32,
    pub external_dirs: Vec<Utf8PathBuf>,
    pub archive_timeout: Duration,
}

impl InstanceConfig {
    pub fn load(path: &Utf8Path) -> anyhow::Result<InstanceConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read instance config {path}"))?;
        let doc = contents
            .parse::<toml_edit::Document>()
            .with_context(|| format!("parse instance config {path}"))?;

        let get_str = |key: &str| -> anyhow::Result<&str> {
            doc.get(key)
                .and_then(|i| i.as_str())
                .ok_or_else(|| anyhow::anyhow!("missing or non-string '{key}' in {path}"))
        };
        let get_u64 = |key: &str| -> anyhow::Result<u64> {
            doc.get(key)
                .and_then(|i| i.as_str())
                .ok_or_else(|| anyhow::anyhow!("missing '{key}' in {path}"))?
                .parse::<u64>()
                .with_context(|| format!("bad '{key}' in {path}"))
        };

        let pgdata = Utf8PathBuf::from(get_str("pgdata")?);
        if !pgdata.is_absolute() {
            bail!("pgdata path '{pgdata}' must be absolute");
        }

        let external_dirs = match doc.get("external_dirs") {
            None => Vec::new(),
            Some(item) => {
                let arr = item
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("'external_dirs' must be an array in {path}"))?;
                let mut dirs = Vec::new();
                for v in arr.iter() {
                    let s = v
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("'external_dirs' entries must be strings"))?;
                    let dir = Utf8PathBuf::from(s);
                    if !dir.is_absolute() {
                        bail!("external directory '{dir}' must be absolute");
                    }
                    dirs.push(dir);
                }
                dirs
            }
        };

        let archive_timeout = match doc.get("archive_timeout") {
            None => DEFAULT_ARCHIVE_TIMEOUT,
            Some(item) => {
                let s = item
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("'archive_timeout' must be a string"))?;
                humantime::parse_duration(s).with_context(|| format!("bad archive_timeout in {path}"))?
            }
        };

        Ok(InstanceConfig {
            pgdata,
            system_identifier: get_u64("system_identifier")?,
            block_size: get_u64("block_size")? as u32,
            xlog_block_size: get_u64("xlog_block_size")? as u32,
            wal_seg_size: get_u64("wal_seg_size")? as u32,
            external_dirs,
            archive_timeout,
        })
    }

    pub fn save(&self, path: &Utf8Path) -> anyhow::Result<()> {
        let mut doc = toml_edit::Document::new();
        doc["pgdata"] = toml_edit::value(self.pgdata.as_str());
        // 64-bit values do not fit toml integers reliably; store as strings.
        doc["system_identifier"] = toml_edit::value(self.system_identifier.to_string());
        doc["block_size"] = toml_edit::value(self.block_size.to_string());
        doc["xlog_block_size"] = toml_edit::value(self.xlog_block_size.to_string());
        doc["wal_seg_size"] = toml_edit::value(self.wal_seg_size.to_string());
        if !self.external_dirs.is_empty() {
            let mut arr = toml_edit::Array::new();
            for d in &self.external_dirs {
                arr.push(d.as_str());
            }
            doc["external_dirs"] = toml_edit::value(arr);
        }
        doc["archive_timeout"] =
            toml_edit::value(humantime::format_duration(self.archive_timeout).to_string());

        utils::crashsafe::overwrite_file(path, doc.to_string().as_bytes())
            .with_context(|| format!("write instance config {path}"))?;
        Ok(())
    }
}

/// Owned per-run state. There are no process-wide singletons: the interrupt
/// flag is an atomic shared with the signal handler, everything else is
/// plain data threaded through call chains.
#[derive(Debug, Clone)]
pub struct RunContext {
    interrupted: Arc<AtomicBool>,
    pub num_threads: usize,
    pub no_sync: bool,
}

impl RunContext {
    pub fn new(num_threads: usize) -> RunContext {
        RunContext {
            interrupted: Arc::new(AtomicBool::new(false)),
            num_threads: num_threads.max(1),
            no_sync: false,
        }
    }

    /// The flag to hand to `signal_hook::flag::register`.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    /// Workers call this on every per-file and per-page boundary.
    pub fn check_interrupted(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    #[cfg(test)]
    pub fn interrupt_for_test(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
    }
}

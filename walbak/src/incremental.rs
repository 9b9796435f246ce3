//! Per-file copy decisions for incremental backups.
//!
//! Given the mode and the parent backup's state, decide for each source file
//! whether to skip it, copy it whole, or copy it page-by-page with an LSN
//! threshold and an optional pre-selection bitmap.

use std::collections::HashMap;

use anyhow::bail;
use chrono::{DateTime, Utc};
use utils::bitmap::BlockBitmap;
use utils::lsn::Lsn;

use crate::catalog::BackupMode;
use crate::filelist::{find_by_path, FileEntry, FileKind};

/// Page maps for many files, keyed by (external dir, relative path). Built
/// from WAL in PAGE mode, from ptrack in PTRACK mode.
#[derive(Debug, Default)]
pub struct PageMapSet {
    maps: HashMap<(u32, String), BlockBitmap>,
}

impl PageMapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, external_dir_num: u32, rel_path: &str) -> Option<&BlockBitmap> {
        self.maps.get(&(external_dir_num, rel_path.to_string()))
    }

    pub fn set_block(&mut self, rel_path: &str, block: u32) {
        self.maps
            .entry((0, rel_path.to_string()))
            .or_default()
            .set(block);
    }

    pub fn insert(&mut self, rel_path: String, map: BlockBitmap) {
        self.maps.entry((0, rel_path)).or_default().merge(&map);
    }

    /// Union with another set. Commutative; used to join per-thread results.
    pub fn merge(&mut self, other: PageMapSet) {
        for (key, map) in other.maps {
            self.maps.entry(key).or_default().merge(&map);
        }
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(u32, String), &BlockBitmap)> {
        self.maps.iter()
    }
}

/// What to do with one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyDecision {
    /// Unchanged since the parent backup: record `write_size` as inherited,
    /// copy nothing.
    Unchanged,
    /// Copy the file in full as an opaque stream.
    CopyWhole,
    /// Copy page-by-page. Pages with LSN below `threshold` are skipped;
    /// with a `prefilter`, only those blocks are considered at all.
    CopyPages {
        threshold: Lsn,
        prefilter: Option<BlockBitmap>,
    },
}

/// The decision rules for one backup run.
pub struct IncrementalRules<'a> {
    pub mode: BackupMode,
    /// `start_lsn` of the parent backup; the page threshold for DELTA/PAGE.
    pub parent_start_lsn: Lsn,
    /// Parent's file list, path-ascending, for the mtime fast path.
    pub parent_files: Option<&'a [FileEntry]>,
    /// Pre-selected changed blocks (PAGE and PTRACK modes).
    pub page_maps: Option<&'a PageMapSet>,
}

impl<'a> IncrementalRules<'a> {
    pub fn full() -> IncrementalRules<'static> {
        IncrementalRules {
            mode: BackupMode::Full,
            parent_start_lsn: Lsn::INVALID,
            parent_files: None,
            page_maps: None,
        }
    }

    pub fn decide(&self, entry: &FileEntry) -> CopyDecision {
        if entry.kind != FileKind::Regular {
            return CopyDecision::Unchanged;
        }

        if !entry.is_datafile {
            // Non-datafiles go by the mtime fast path: same mtime and size
            // as the parent's copy means unchanged.
            if let Some(parent_files) = self.parent_files {
                if let Some(parent_entry) =
                    find_by_path(parent_files, entry.external_dir_num, &entry.rel_path)
                {
                    if parent_entry.mtime == entry.mtime && parent_entry.size == entry.size {
                        return CopyDecision::Unchanged;
                    }
                }
            }
            return CopyDecision::CopyWhole;
        }

        match self.mode {
            BackupMode::Full => CopyDecision::CopyPages {
                threshold: Lsn::INVALID,
                prefilter: None,
            },
            BackupMode::Delta => CopyDecision::CopyPages {
                threshold: self.parent_start_lsn,
                prefilter: None,
            },
            BackupMode::Page | BackupMode::Ptrack => {
                let prefilter = self
                    .page_maps
                    .and_then(|maps| maps.get(entry.external_dir_num, &entry.rel_path))
                    .cloned()
                    // No recorded changes: an empty prefilter reads nothing.
                    .unwrap_or_default();
                CopyDecision::CopyPages {
                    threshold: self.parent_start_lsn,
                    prefilter: Some(prefilter),
                }
            }
        }
    }
}

/// Abort if the wall clock went backwards relative to a file's mtime: the
/// mtime fast path is meaningless with a rewound clock.
pub fn check_clock_sanity(now: DateTime<Utc>, mtime_unix: i64, rel_path: &str) -> anyhow::Result<()> {
    if mtime_unix > now.timestamp() {
        bail!(
            "file {rel_path} has modification time in the future \
             (mtime {mtime_unix}, now {}); clock moved backwards?",
            now.timestamp()
        );
    }
    Ok(())
}

/// If a file was modified within the current second, an in-progress write
/// might not be reflected in its mtime yet. Wait out the boundary so the
/// next change is guaranteed to bump mtime.
pub fn wait_out_mtime_boundary(now: DateTime<Utc>, mtime_unix: i64) {
    if mtime_unix == now.timestamp() {
        let nanos_into_second = now.timestamp_subsec_nanos() as u64;
        let remaining = 1_000_000_000u64.saturating_sub(nanos_into_second);
        std::thread::sleep(std::time::Duration::from_nanos(remaining + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filelist::tests::make_file;
    use crate::filelist::sort_by_path;

    #[test]
    fn non_datafile_mtime_fast_path() {
        let mut parent_files = vec![make_file("postgresql.conf", 100)];
        parent_files[0].mtime = 1000;
        sort_by_path(&mut parent_files);

        let rules = IncrementalRules {
            mode: BackupMode::Delta,
            parent_start_lsn: Lsn(0x100),
            parent_files: Some(&parent_files),
            page_maps: None,
        };

        let mut entry = make_file("postgresql.conf", 100);
        entry.mtime = 1000;
        assert_eq!(rules.decide(&entry), CopyDecision::Unchanged);

        entry.mtime = 1001;
        assert_eq!(rules.decide(&entry), CopyDecision::CopyWhole);

        // size change with equal mtime still copies
        entry.mtime = 1000;
        entry.size = 101;
        assert_eq!(rules.decide(&entry), CopyDecision::CopyWhole);
    }

    #[test]
    fn datafile_decisions_by_mode() {
        let mut entry = make_file("base/5/16384", 8192);
        entry.is_datafile = true;

        assert_eq!(
            IncrementalRules::full().decide(&entry),
            CopyDecision::CopyPages {
                threshold: Lsn::INVALID,
                prefilter: None
            }
        );

        let delta = IncrementalRules {
            mode: BackupMode::Delta,
            parent_start_lsn: Lsn(0x5000),
            parent_files: None,
            page_maps: None,
        };
        assert_eq!(
            delta.decide(&entry),
            CopyDecision::CopyPages {
                threshold: Lsn(0x5000),
                prefilter: None
            }
        );

        let mut maps = PageMapSet::new();
        maps.set_block("base/5/16384", 7);
        let page = IncrementalRules {
            mode: BackupMode::Page,
            parent_start_lsn: Lsn(0x5000),
            parent_files: None,
            page_maps: Some(&maps),
        };
        match page.decide(&entry) {
            CopyDecision::CopyPages {
                threshold,
                prefilter: Some(filter),
            } => {
                assert_eq!(threshold, Lsn(0x5000));
                assert_eq!(filter.iter_ones().collect::<Vec<_>>(), vec![7]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // a datafile with no recorded changes gets an empty prefilter
        let mut other_entry = make_file("base/5/99999", 8192);
        other_entry.is_datafile = true;
        match page.decide(&other_entry) {
            CopyDecision::CopyPages {
                prefilter: Some(filter),
                ..
            } => assert!(filter.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn page_map_set_merges() {
        let mut a = PageMapSet::new();
        a.set_block("base/5/1", 1);
        let mut b = PageMapSet::new();
        b.set_block("base/5/1", 2);
        b.set_block("base/5/2", 0);
        a.merge(b);
        assert_eq!(a.len(), 2);
        assert_eq!(
            a.get(0, "base/5/1").unwrap().iter_ones().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn clock_rewind_is_fatal() {
        let now = Utc::now();
        assert!(check_clock_sanity(now, now.timestamp() - 10, "f").is_ok());
        assert!(check_clock_sanity(now, now.timestamp() + 10, "f").is_err());
    }
}

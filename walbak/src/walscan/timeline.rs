//! Timeline history: reading `.history` files from the archive and planning
//! which `(timeline, lsn range)` intervals a multi-timeline WAL scan must
//! cover.

use anyhow::Context;
use camino::Utf8Path;
use postgres_ffi::xlog_utils::{parse_history_file, TimelineHistoryEntry};
use postgres_ffi::TimeLineID;
use utils::lsn::Lsn;

/// A half-open LSN range `[begin, end)` on one timeline. `end` may be
/// [`Lsn::INVALID`], meaning "to the latest available WAL".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineInterval {
    pub tli: TimeLineID,
    pub begin: Lsn,
    pub end: Lsn,
}

/// Load the ancestor list of a timeline from the archive. Timeline 1 has no
/// history file and no ancestors.
pub fn read_history(wal_dir: &Utf8Path, tli: TimeLineID) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    if tli == 1 {
        return Ok(Vec::new());
    }
    let path = wal_dir.join(format!("{tli:>08X}.history"));
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("read timeline history {path}"))?;
    parse_history_file(&contents).with_context(|| format!("parse timeline history {path}"))
}

/// True when a backup finished at `(backup_tli, backup_stop_lsn)` lies on
/// the history of `target_tli`, i.e. WAL written on the target timeline can
/// replay on top of it.
pub fn is_ancestor(
    history_of_target: &[TimelineHistoryEntry],
    target_tli: TimeLineID,
    backup_tli: TimeLineID,
    backup_stop_lsn: Lsn,
) -> bool {
    if backup_tli == target_tli {
        return true;
    }
    history_of_target
        .iter()
        .any(|e| e.tli == backup_tli && backup_stop_lsn <= e.switchpoint)
}

/// Plan the scan intervals for the range `[start_lsn, end_lsn)` that begins
/// on `start_tli` and ends on `end_tli`, walking the end timeline's history
/// backwards until the start timeline is reached.
///
/// Fails if `start_tli` is not an ancestor of `end_tli`: the WAL range is
/// then not a single lineage and an incremental backup across it would be
/// bogus.
pub fn plan_intervals(
    history_of_end: &[TimelineHistoryEntry],
    end_tli: TimeLineID,
    start_tli: TimeLineID,
    start_lsn: Lsn,
    end_lsn: Lsn,
) -> anyhow::Result<Vec<TimelineInterval>> {
    if start_tli == end_tli {
        return Ok(vec![TimelineInterval {
            tli: start_tli,
            begin: start_lsn,
            end: end_lsn,
        }]);
    }

    // history entries are ordered oldest-first; timeline N covers
    // [previous entry's switchpoint, own switchpoint)
    let position = history_of_end
        .iter()
        .position(|e| e.tli == start_tli)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "timeline {start_tli} is not an ancestor of timeline {end_tli}"
            )
        })?;

    let mut intervals = Vec::new();
    let mut begin = start_lsn;
    for entry in &history_of_end[position..] {
        anyhow::ensure!(
            begin <= entry.switchpoint,
            "timeline {} switched at {} which is before the requested start {}",
            entry.tli,
            entry.switchpoint,
            begin
        );
        intervals.push(TimelineInterval {
            tli: entry.tli,
            begin,
            end: entry.switchpoint,
        });
        begin = entry.switchpoint;
    }
    intervals.push(TimelineInterval {
        tli: end_tli,
        begin,
        end: end_lsn,
    });
    // Drop empty intervals: a switch exactly at the range start contributes
    // nothing.
    intervals.retain(|i| !i.end.is_valid() || i.begin < i.end);
    Ok(intervals)
}

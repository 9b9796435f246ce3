//! The `show` command: an instance summary table, or the full metadata of
//! one backup as JSON.

use anyhow::Context;
use comfy_table::{presets::NOTHING, Cell, ContentArrangement, Table};

use crate::catalog::{Backup, BackupFilter, BackupId, Catalog};

fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

fn wal_range(backup: &Backup) -> String {
    format!("{}/{}", backup.start_lsn, backup.stop_lsn)
}

/// Render the instance's backups, newest first.
pub fn show_instance(catalog: &Catalog, filter: &BackupFilter) -> anyhow::Result<String> {
    let arena = catalog.load_arena(filter)?;

    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "Instance", "ID", "Mode", "Status", "TLI", "Parent", "Data", "WAL", "Start LSN/Stop LSN",
        ]);

    for backup in arena.sorted_desc() {
        table.add_row(vec![
            Cell::new(&catalog.paths.instance),
            Cell::new(backup.id),
            Cell::new(backup.mode),
            Cell::new(backup.status),
            Cell::new(backup.tli),
            Cell::new(
                backup
                    .parent_backup_id
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(humanize_bytes(backup.data_bytes)),
            Cell::new(humanize_bytes(backup.wal_bytes)),
            Cell::new(wal_range(backup)),
        ]);
    }
    Ok(table.to_string())
}

/// Full metadata of one backup, pretty-printed JSON.
pub fn show_backup_json(catalog: &Catalog, id: BackupId) -> anyhow::Result<String> {
    let backup = catalog.read_backup(id)?;
    serde_json::to_string_pretty(&backup).context("serialize backup metadata")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::make_backup;
    use crate::catalog::BackupMode;
    use crate::config::CatalogPaths;

    fn catalog_with_backups() -> (camino_tempfile::Utf8TempDir, Catalog) {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::open(CatalogPaths::new(dir.path(), "main"));
        for (id, mode, parent) in [
            ("20260101-000000", BackupMode::Full, None),
            ("20260102-000000", BackupMode::Page, Some("20260101-000000")),
        ] {
            let backup = make_backup(id, mode, parent);
            utils::crashsafe::create_dir_all(&catalog.backup_dir(backup.id)).unwrap();
            catalog.write_backup(&backup, true).unwrap();
        }
        (dir, catalog)
    }

    #[test]
    fn table_lists_newest_first() {
        let (_dir, catalog) = catalog_with_backups();
        let rendered = show_instance(&catalog, &BackupFilter::default()).unwrap();
        assert!(rendered.contains("20260101-000000"));
        assert!(rendered.contains("20260102-000000"));
        assert!(
            rendered.find("20260102-000000").unwrap() < rendered.find("20260101-000000").unwrap()
        );
        assert!(rendered.contains("PAGE"));
    }

    #[test]
    fn json_detail() {
        let (_dir, catalog) = catalog_with_backups();
        let json = show_backup_json(&catalog, "20260102-000000".parse().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], "20260102-000000");
        assert_eq!(value["mode"], "PAGE");
        assert_eq!(value["parent_backup_id"], "20260101-000000");
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(humanize_bytes(512), "512B");
        assert_eq!(humanize_bytes(2048), "2.0kB");
        assert_eq!(humanize_bytes(3 * 1024 * 1024), "3.0MB");
    }
}

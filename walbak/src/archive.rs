//! `archive-push` / `archive-get`: the archive_command / restore_command
//! helpers that move one WAL file between the server's pg_wal and the
//! catalog's archive, optionally gzip-compressed, with temp-file + rename
//! commits and idempotent re-pushes.

use std::io::Read;

use anyhow::{bail, Context};
use camino::Utf8Path;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::RunContext;

#[derive(Debug, Clone, Default)]
pub struct ArchivePushOptions {
    pub compress: bool,
    pub compress_level: u32,
    pub overwrite: bool,
}

fn read_decompressed(path: &Utf8Path) -> anyhow::Result<Vec<u8>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {path}"))?;
    let mut contents = Vec::new();
    if path.as_str().ends_with(".gz") {
        GzDecoder::new(file)
            .read_to_end(&mut contents)
            .with_context(|| format!("decompress {path}"))?;
    } else {
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_end(&mut contents)
            .with_context(|| format!("read {path}"))?;
    }
    Ok(contents)
}

/// Copy one WAL file from `source` (the path the server passed as `%p`)
/// into the archive under `file_name` (`%f`).
///
/// Re-pushing a file with identical content succeeds idempotently; pushing
/// different content under an existing name fails unless overwriting was
/// requested.
pub fn do_archive_push(
    catalog: &Catalog,
    source: &Utf8Path,
    file_name: &str,
    options: &ArchivePushOptions,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    ctx.check_interrupted()?;
    let wal_dir = catalog.paths.wal_dir();
    utils::crashsafe::create_dir_all(&wal_dir)?;

    let final_name = if options.compress {
        format!("{file_name}.gz")
    } else {
        file_name.to_string()
    };
    let dst = wal_dir.join(&final_name);

    // Existing file under either suffix: the archive_command contract is
    // "error on different content, success on identical re-push".
    for existing_name in [file_name.to_string(), format!("{file_name}.gz")] {
        let existing = wal_dir.join(&existing_name);
        if !existing.exists() {
            continue;
        }
        if options.overwrite {
            break;
        }
        let old = read_decompressed(&existing)?;
        let new = std::fs::read(source).with_context(|| format!("read {source}"))?;
        if old == new {
            info!("{file_name} is already archived with identical content");
            return Ok(());
        }
        bail!(
            "WAL file {existing_name} already exists in the archive with different content"
        );
    }

    let tmp = utils::crashsafe::path_with_suffix_extension(&dst, crate::TEMP_FILE_SUFFIX);
    {
        let mut reader = std::fs::File::open(source).with_context(|| format!("open {source}"))?;
        let out = std::fs::File::create(&tmp).with_context(|| format!("create {tmp}"))?;
        if options.compress {
            let mut encoder =
                GzEncoder::new(out, Compression::new(options.compress_level.clamp(1, 9)));
            std::io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?.sync_all()?;
        } else {
            let mut out = out;
            std::io::copy(&mut reader, &mut out)?;
            out.sync_all()?;
        }
    }
    utils::crashsafe::durable_rename(&tmp, &dst)?;
    info!("archived {final_name}");
    Ok(())
}

/// Fetch one WAL file from the archive into `dest` (the path the server
/// passed as `%p`), decompressing if needed. Used both by `archive-get` and
/// by stream-backup WAL bundling.
pub fn fetch_segment(wal_dir: &Utf8Path, file_name: &str, dest: &Utf8Path) -> anyhow::Result<()> {
    let tmp = utils::crashsafe::path_with_suffix_extension(dest, crate::TEMP_FILE_SUFFIX);

    let plain = wal_dir.join(file_name);
    let gz = wal_dir.join(format!("{file_name}.gz"));
    if plain.exists() {
        std::fs::copy(&plain, &tmp).with_context(|| format!("copy {plain}"))?;
    } else if gz.exists() {
        let file = std::fs::File::open(&gz).with_context(|| format!("open {gz}"))?;
        let mut decoder = GzDecoder::new(std::io::BufReader::new(file));
        let mut out = std::fs::File::create(&tmp).with_context(|| format!("create {tmp}"))?;
        std::io::copy(&mut decoder, &mut out).with_context(|| format!("decompress {gz}"))?;
        out.sync_all()?;
    } else {
        bail!("WAL file {file_name} is not in the archive");
    }

    std::fs::rename(&tmp, dest).with_context(|| format!("rename {tmp} into place"))?;
    Ok(())
}

pub fn do_archive_get(
    catalog: &Catalog,
    file_name: &str,
    dest: &Utf8Path,
    ctx: &RunContext,
) -> anyhow::Result<()> {
    ctx.check_interrupted()?;
    fetch_segment(&catalog.paths.wal_dir(), file_name, dest)?;
    info!("fetched {file_name} from the archive");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogPaths;

    fn setup() -> (camino_tempfile::Utf8TempDir, Catalog, RunContext) {
        let dir = camino_tempfile::tempdir().unwrap();
        let catalog = Catalog::open(CatalogPaths::new(dir.path(), "main"));
        (dir, catalog, RunContext::new(1))
    }

    const SEG: &str = "000000010000000000000005";

    #[test]
    fn push_and_get_round_trip() {
        let (dir, catalog, ctx) = setup();
        let source = dir.path().join("pg_wal_segment");
        std::fs::write(&source, b"wal segment bytes").unwrap();

        do_archive_push(&catalog, &source, SEG, &ArchivePushOptions::default(), &ctx).unwrap();
        assert!(catalog.paths.wal_dir().join(SEG).exists());

        let fetched = dir.path().join("fetched");
        do_archive_get(&catalog, SEG, &fetched, &ctx).unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"wal segment bytes");
    }

    #[test]
    fn compressed_push_and_get() {
        let (dir, catalog, ctx) = setup();
        let source = dir.path().join("seg");
        std::fs::write(&source, vec![0xAA; 64 * 1024]).unwrap();

        do_archive_push(
            &catalog,
            &source,
            SEG,
            &ArchivePushOptions {
                compress: true,
                compress_level: 5,
                overwrite: false,
            },
            &ctx,
        )
        .unwrap();
        let stored = catalog.paths.wal_dir().join(format!("{SEG}.gz"));
        assert!(stored.exists());
        assert!(std::fs::metadata(&stored).unwrap().len() < 64 * 1024);

        let fetched = dir.path().join("fetched");
        do_archive_get(&catalog, SEG, &fetched, &ctx).unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), vec![0xAA; 64 * 1024]);
    }

    #[test]
    fn identical_repush_is_idempotent() {
        let (dir, catalog, ctx) = setup();
        let source = dir.path().join("seg");
        std::fs::write(&source, b"same bytes").unwrap();

        let opts = ArchivePushOptions::default();
        do_archive_push(&catalog, &source, SEG, &opts, &ctx).unwrap();
        do_archive_push(&catalog, &source, SEG, &opts, &ctx).unwrap();
    }

    #[test]
    fn conflicting_push_is_rejected_without_overwrite() {
        let (dir, catalog, ctx) = setup();
        let source = dir.path().join("seg");
        std::fs::write(&source, b"first content").unwrap();
        let opts = ArchivePushOptions::default();
        do_archive_push(&catalog, &source, SEG, &opts, &ctx).unwrap();

        std::fs::write(&source, b"second content").unwrap();
        let err = do_archive_push(&catalog, &source, SEG, &opts, &ctx).unwrap_err();
        assert!(format!("{err:#}").contains("different content"));

        // content conflict across compression settings is caught too
        let err = do_archive_push(
            &catalog,
            &source,
            SEG,
            &ArchivePushOptions {
                compress: true,
                compress_level: 1,
                overwrite: false,
            },
            &ctx,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("different content"));

        // with overwrite it wins
        do_archive_push(
            &catalog,
            &source,
            SEG,
            &ArchivePushOptions {
                overwrite: true,
                ..Default::default()
            },
            &ctx,
        )
        .unwrap();
        let fetched = dir.path().join("fetched");
        do_archive_get(&catalog, SEG, &fetched, &ctx).unwrap();
        assert_eq!(std::fs::read(&fetched).unwrap(), b"second content");
    }

    #[test]
    fn get_missing_segment_fails() {
        let (dir, catalog, ctx) = setup();
        let err = do_archive_get(&catalog, SEG, &dir.path().join("out"), &ctx).unwrap_err();
        assert!(format!("{err:#}").contains("not in the archive"));
    }
}

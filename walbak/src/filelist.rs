//! The in-memory list of files in a backup, its sort orders, and the
//! line-oriented `backup_content.control` codec.
//!
//! One [`FileEntry`] per file copied (or recorded-as-empty). Parallel
//! workers split the list by atomically claiming entries, so the list can be
//! shared immutably across threads.

use std::cmp::Ordering;
use std::io::{BufReader, Write};
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use utils::bitmap::BlockBitmap;

/// Sentinel for `write_size`: the file was unchanged since the parent backup
/// and was not copied; resolve it by walking the parent chain.
pub const WRITE_SIZE_INHERITED: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the data directory, or to an external-directory root.
    pub rel_path: String,
    /// 0 = main data directory, n > 0 = n-th configured external directory.
    #[serde(default)]
    pub external_dir_num: u32,
    pub kind: FileKind,
    /// Unix permission bits.
    pub mode: u32,
    /// Source file size at backup time.
    pub size: u64,
    /// Bytes actually read from the source (smaller than `size` when only
    /// some pages changed).
    #[serde(default)]
    pub read_size: u64,
    /// Bytes written into the backup, or [`WRITE_SIZE_INHERITED`].
    pub write_size: i64,
    /// Size of the restored content (differs from `write_size` under
    /// compression and hole compaction).
    #[serde(default)]
    pub uncompressed_size: u64,
    /// CRC-32C of the stored bytes.
    pub crc: u32,
    pub is_datafile: bool,
    /// Kept for format compatibility with compressed-filesystem tablespaces;
    /// always false in this implementation.
    #[serde(default)]
    pub is_cfs: bool,
    /// Relation segment number for split relations.
    #[serde(default)]
    pub segno: u32,
    /// Total blocks in the source file at backup time.
    #[serde(default)]
    pub n_blocks: u32,
    /// Database OID the file belongs to; 0 for shared or non-relation files.
    #[serde(default)]
    pub db_oid: u32,
    /// Source mtime, unix seconds. The fast path for non-datafiles.
    #[serde(default)]
    pub mtime: i64,
    /// Symlink target, for `kind == Symlink`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    /// Blocks present in this backup's copy of the file.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "pagemap_base64")]
    pub pagemap: Option<BlockBitmap>,
    /// Location of this file's page headers in `page_header_map`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdr_off: Option<u64>,
    #[serde(default)]
    pub hdr_len: u32,
    #[serde(default)]
    pub hdr_crc: u32,

    /// Claim flag for parallel workers. Not persisted.
    #[serde(skip)]
    pub claimed: AtomicBool,
}

impl Clone for FileEntry {
    fn clone(&self) -> Self {
        FileEntry {
            rel_path: self.rel_path.clone(),
            external_dir_num: self.external_dir_num,
            kind: self.kind,
            mode: self.mode,
            size: self.size,
            read_size: self.read_size,
            write_size: self.write_size,
            uncompressed_size: self.uncompressed_size,
            crc: self.crc,
            is_datafile: self.is_datafile,
            is_cfs: self.is_cfs,
            segno: self.segno,
            n_blocks: self.n_blocks,
            db_oid: self.db_oid,
            mtime: self.mtime,
            link_target: self.link_target.clone(),
            pagemap: self.pagemap.clone(),
            hdr_off: self.hdr_off,
            hdr_len: self.hdr_len,
            hdr_crc: self.hdr_crc,
            // claims never survive a clone
            claimed: AtomicBool::new(false),
        }
    }
}

mod pagemap_base64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use utils::bitmap::BlockBitmap;

    pub fn serialize<S: Serializer>(
        value: &Option<BlockBitmap>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(map) => base64::encode(map.as_bytes()).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<BlockBitmap>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            None => Ok(None),
            Some(s) => {
                let bytes = base64::decode(&s).map_err(serde::de::Error::custom)?;
                Ok(Some(BlockBitmap::from_bytes(bytes)))
            }
        }
    }
}

impl FileEntry {
    pub fn new_directory(rel_path: String, external_dir_num: u32, mode: u32) -> FileEntry {
        FileEntry {
            rel_path,
            external_dir_num,
            kind: FileKind::Directory,
            mode,
            size: 0,
            read_size: 0,
            write_size: 0,
            uncompressed_size: 0,
            crc: 0,
            is_datafile: false,
            is_cfs: false,
            segno: 0,
            n_blocks: 0,
            db_oid: 0,
            mtime: 0,
            link_target: None,
            pagemap: None,
            hdr_off: None,
            hdr_len: 0,
            hdr_crc: 0,
            claimed: AtomicBool::new(false),
        }
    }

    /// The identity a file is looked up by: external directory first, then
    /// relative path.
    pub fn sort_key(&self) -> (u32, &str) {
        (self.external_dir_num, self.rel_path.as_str())
    }

    pub fn cmp_path(&self, other: &FileEntry) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }

    /// Atomically claim this entry for one worker. Returns true exactly once.
    pub fn claim(&self) -> bool {
        !self
            .claimed
            .swap(true, std::sync::atomic::Ordering::AcqRel)
    }

    pub fn reset_claim(&self) {
        self.claimed
            .store(false, std::sync::atomic::Ordering::Release);
    }
}

/// Sort ascending by (external_dir_num, rel_path): directory creation order,
/// and the order binary search expects.
pub fn sort_by_path(files: &mut [FileEntry]) {
    files.sort_by(|a, b| a.cmp_path(b));
}

/// Sort descending by path: safe bottom-up deletion order.
pub fn sort_by_path_desc(files: &mut [FileEntry]) {
    files.sort_by(|a, b| b.cmp_path(a));
}

/// Indices of `files` ordered by source size, largest first: worker pools
/// start with the big files so the tail of the run stays balanced.
pub fn order_by_size_desc(files: &[FileEntry]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..files.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(files[i].size));
    order
}

/// Binary search in a path-ascending list.
pub fn find_by_path<'a>(
    files: &'a [FileEntry],
    external_dir_num: u32,
    rel_path: &str,
) -> Option<&'a FileEntry> {
    files
        .binary_search_by(|probe| probe.sort_key().cmp(&(external_dir_num, rel_path)))
        .ok()
        .map(|i| &files[i])
}

/// Serialize the file list, one JSON object per line. Returns the CRC-32C of
/// the serialized bytes, which the caller records in `backup.control`.
pub fn write_file_list(path: &Utf8Path, files: &[FileEntry]) -> anyhow::Result<u32> {
    let mut buf = Vec::with_capacity(files.len() * 256);
    for entry in files {
        serde_json::to_writer(&mut buf, entry).context("serialize file entry")?;
        buf.push(b'\n');
    }
    let crc = crc32c::crc32c(&buf);
    utils::crashsafe::overwrite_file(path, &buf).with_context(|| format!("write {path}"))?;
    Ok(crc)
}

/// Load a file list and verify it against the CRC recorded in the backup
/// metadata.
pub fn read_file_list(path: &Utf8Path, expected_crc: Option<u32>) -> anyhow::Result<Vec<FileEntry>> {
    let file = std::fs::File::open(path).with_context(|| format!("open {path}"))?;
    let mut reader = BufReader::new(file);

    if let Some(expected) = expected_crc {
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut contents)?;
        let actual = crc32c::crc32c(&contents);
        if actual != expected {
            anyhow::bail!(
                "file list {path} is corrupt: CRC {actual:#x}, expected {expected:#x}"
            );
        }
        return parse_file_list(&contents, path);
    }

    let mut contents = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut contents)?;
    parse_file_list(&contents, path)
}

fn parse_file_list(contents: &[u8], path: &Utf8Path) -> anyhow::Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    for (lineno, line) in contents.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let entry: FileEntry = serde_json::from_slice(line)
            .with_context(|| format!("parse {path} line {}", lineno + 1))?;
        files.push(entry);
    }
    Ok(files)
}

/// Stream variant used by merge to write the merged list without building
/// the serialized image twice.
pub struct FileListWriter<W: Write> {
    writer: W,
    crc: u32,
}

impl<W: Write> FileListWriter<W> {
    pub fn new(writer: W) -> Self {
        FileListWriter { writer, crc: 0 }
    }

    pub fn push(&mut self, entry: &FileEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry).context("serialize file entry")?;
        line.push(b'\n');
        self.crc = crc32c::crc32c_append(self.crc, &line);
        self.writer.write_all(&line)?;
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<(W, u32)> {
        self.writer.flush()?;
        Ok((self.writer, self.crc))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub fn make_file(rel_path: &str, size: u64) -> FileEntry {
        FileEntry {
            rel_path: rel_path.to_string(),
            external_dir_num: 0,
            kind: FileKind::Regular,
            mode: 0o600,
            size,
            read_size: size,
            write_size: size as i64,
            uncompressed_size: size,
            crc: 0,
            is_datafile: false,
            is_cfs: false,
            segno: 0,
            n_blocks: 0,
            db_oid: 0,
            mtime: 0,
            link_target: None,
            pagemap: None,
            hdr_off: None,
            hdr_len: 0,
            hdr_crc: 0,
            claimed: AtomicBool::new(false),
        }
    }

    #[test]
    fn sort_orders() {
        let mut files = vec![
            make_file("base/1/200", 10),
            make_file("base/1/100", 30),
            make_file("base", 0),
        ];
        files[2].kind = FileKind::Directory;

        sort_by_path(&mut files);
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["base", "base/1/100", "base/1/200"]);

        let by_size = order_by_size_desc(&files);
        assert_eq!(files[by_size[0]].rel_path, "base/1/100");

        sort_by_path_desc(&mut files);
        assert_eq!(files[0].rel_path, "base/1/200");
    }

    #[test]
    fn external_dirs_sort_after_main() {
        let mut files = vec![make_file("zzz", 1), make_file("aaa", 1)];
        files[1].external_dir_num = 1;
        sort_by_path(&mut files);
        assert_eq!(files[0].rel_path, "zzz");
        assert_eq!(files[1].rel_path, "aaa");
        assert!(find_by_path(&files, 1, "aaa").is_some());
        assert!(find_by_path(&files, 0, "aaa").is_none());
    }

    #[test]
    fn claims_are_exclusive() {
        let entry = make_file("base/1/100", 1);
        assert!(entry.claim());
        assert!(!entry.claim());
        entry.reset_claim();
        assert!(entry.claim());
    }

    #[test]
    fn file_list_round_trip() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("backup_content.control");

        let mut entry = make_file("base/5/16384", 8192 * 3);
        entry.is_datafile = true;
        entry.n_blocks = 3;
        entry.db_oid = 5;
        let mut map = BlockBitmap::new();
        map.set(0);
        map.set(2);
        entry.pagemap = Some(map);
        entry.hdr_off = Some(1024);
        entry.hdr_len = 96;

        let inherited = FileEntry {
            write_size: WRITE_SIZE_INHERITED,
            ..make_file("base/5/16385", 8192)
        };

        let files = vec![entry, inherited];
        let crc = write_file_list(&path, &files).unwrap();

        let loaded = read_file_list(&path, Some(crc)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].rel_path, "base/5/16384");
        assert_eq!(
            loaded[0].pagemap.as_ref().unwrap().iter_ones().collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(loaded[0].hdr_off, Some(1024));
        assert_eq!(loaded[1].write_size, WRITE_SIZE_INHERITED);

        // CRC mismatch is detected
        assert!(read_file_list(&path, Some(crc ^ 1)).is_err());
    }

    #[test]
    fn streamed_writer_matches_batch_crc() {
        let files = vec![make_file("a", 1), make_file("b", 2)];
        let mut streamed = FileListWriter::new(Vec::new());
        for f in &files {
            streamed.push(f).unwrap();
        }
        let (bytes, crc) = streamed.finish().unwrap();
        assert_eq!(crc, crc32c::crc32c(&bytes));
    }
}

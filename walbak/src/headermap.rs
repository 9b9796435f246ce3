//! The per-backup `page_header_map` side file.
//!
//! Per-page metadata of all datafiles in a backup is coalesced here instead
//! of being inlined next to each page record: one bincode-encoded array of
//! [`StoredPageHeader`] per datafile, located by the `(hdr_off, hdr_len)`
//! recorded in the FileEntry and guarded by `hdr_crc`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::filelist::FileEntry;

/// Header of one stored page record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPageHeader {
    /// Block number within the relation segment file.
    pub block: u32,
    /// Offset of the page record in the (uncompressed) backup file stream.
    pub pos: u64,
    /// Length of the stored payload, including the inline record header.
    pub len: u32,
    /// The page's LSN at backup time.
    pub lsn: u64,
    /// The page's own `pd_checksum` field at backup time (zero when the
    /// cluster has checksums disabled).
    pub checksum: u16,
    /// CRC-32C of the stored payload bytes.
    pub crc: u32,
}

/// Location of one file's headers inside the map, to be copied into the
/// FileEntry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMapSlot {
    pub off: u64,
    pub len: u32,
    pub crc: u32,
}

/// Append-only writer. Workers finish files concurrently, so the file handle
/// and tail offset live under one mutex; each append is one contiguous slot.
pub struct HeaderMapWriter {
    path: Utf8PathBuf,
    inner: Mutex<WriterInner>,
}

struct WriterInner {
    file: File,
    offset: u64,
}

impl HeaderMapWriter {
    pub fn create(path: &Utf8Path) -> anyhow::Result<HeaderMapWriter> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("create header map {path}"))?;
        Ok(HeaderMapWriter {
            path: path.to_owned(),
            inner: Mutex::new(WriterInner { file, offset: 0 }),
        })
    }

    /// Open an existing map for appending; merge re-points surviving files
    /// into the tail of the FULL backup's map.
    pub fn open_for_append(path: &Utf8Path) -> anyhow::Result<HeaderMapWriter> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open header map {path}"))?;
        let offset = file.seek(SeekFrom::End(0))?;
        Ok(HeaderMapWriter {
            path: path.to_owned(),
            inner: Mutex::new(WriterInner { file, offset }),
        })
    }

    /// Append one file's headers, returning the slot to record in its entry.
    pub fn append(&self, headers: &[StoredPageHeader]) -> anyhow::Result<HeaderMapSlot> {
        let encoded = bincode::serialize(headers).context("encode page headers")?;
        let crc = crc32c::crc32c(&encoded);

        let mut inner = self.inner.lock();
        let off = inner.offset;
        inner
            .file
            .write_all(&encoded)
            .with_context(|| format!("write header map {}", self.path))?;
        inner.offset += encoded.len() as u64;
        Ok(HeaderMapSlot {
            off,
            len: encoded.len() as u32,
            crc,
        })
    }

    pub fn sync(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock();
        inner
            .file
            .sync_all()
            .with_context(|| format!("fsync header map {}", self.path))
    }
}

/// Read back one file's headers, verifying the CRC recorded in its entry.
pub fn read_headers(map_path: &Utf8Path, entry: &FileEntry) -> anyhow::Result<Vec<StoredPageHeader>> {
    let off = entry
        .hdr_off
        .ok_or_else(|| anyhow::anyhow!("file {} has no header map slot", entry.rel_path))?;

    let mut file =
        File::open(map_path).with_context(|| format!("open header map {map_path}"))?;
    file.seek(SeekFrom::Start(off))?;
    let mut buf = vec![0u8; entry.hdr_len as usize];
    file.read_exact(&mut buf)
        .with_context(|| format!("read header map slot of {}", entry.rel_path))?;

    let actual_crc = crc32c::crc32c(&buf);
    if actual_crc != entry.hdr_crc {
        anyhow::bail!(
            "header map entry of {} is corrupt: CRC {actual_crc:#x}, expected {:#x}",
            entry.rel_path,
            entry.hdr_crc
        );
    }

    let headers: Vec<StoredPageHeader> =
        bincode::deserialize(&buf).with_context(|| format!("decode headers of {}", entry.rel_path))?;
    Ok(headers)
}

impl FileEntry {
    pub fn set_header_slot(&mut self, slot: HeaderMapSlot) {
        self.hdr_off = Some(slot.off);
        self.hdr_len = slot.len;
        self.hdr_crc = slot.crc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filelist::tests::make_file;

    fn headers(n: u32) -> Vec<StoredPageHeader> {
        (0..n)
            .map(|i| StoredPageHeader {
                block: i,
                pos: (i as u64) * 100,
                len: 100,
                lsn: 0x1000 + i as u64,
                checksum: i as u16,
                crc: 0xAA00 + i,
            })
            .collect()
    }

    #[test]
    fn write_and_read_back() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::create(&path).unwrap();

        let first = headers(3);
        let second = headers(5);
        let slot1 = writer.append(&first).unwrap();
        let slot2 = writer.append(&second).unwrap();
        writer.sync().unwrap();
        assert_eq!(slot2.off, slot1.off + slot1.len as u64);

        let mut entry1 = make_file("base/1/10", 0);
        entry1.set_header_slot(slot1);
        let mut entry2 = make_file("base/1/20", 0);
        entry2.set_header_slot(slot2);

        assert_eq!(read_headers(&path, &entry1).unwrap(), first);
        assert_eq!(read_headers(&path, &entry2).unwrap(), second);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::create(&path).unwrap();
        let slot = writer.append(&headers(4)).unwrap();
        writer.sync().unwrap();

        let mut entry = make_file("base/1/10", 0);
        entry.set_header_slot(slot);
        entry.hdr_crc ^= 0x1;
        assert!(read_headers(&path, &entry).is_err());
    }

    #[test]
    fn append_mode_continues_at_tail() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("page_header_map");
        let writer = HeaderMapWriter::create(&path).unwrap();
        let slot1 = writer.append(&headers(2)).unwrap();
        drop(writer);

        let writer = HeaderMapWriter::open_for_append(&path).unwrap();
        let slot2 = writer.append(&headers(2)).unwrap();
        assert_eq!(slot2.off, slot1.off + slot1.len as u64);

        let mut entry = make_file("x", 0);
        entry.set_header_slot(slot1);
        assert_eq!(read_headers(&path, &entry).unwrap(), headers(2));
    }
}

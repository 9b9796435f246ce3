//! Reading and writing data-file pages in the backup store format.
//!
//! A backed-up datafile is a stream of page records. Each record is a small
//! inline header followed by the page payload with the free-space hole
//! between `pd_lower` and `pd_upper` stripped; invalid or unknown-layout
//! pages fall back to verbatim payloads. The stream is optionally deflate-
//! compressed as a whole. Per-page metadata (LSN, checksum, position) goes
//! to the header map, not into the stream.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use anyhow::Context;
use byteorder::{ByteOrder, LittleEndian};
use camino::Utf8Path;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use postgres_ffi::page_layout::{classify_page, PageHeaderData, PageVerdict};
use utils::bitmap::BlockBitmap;
use utils::lsn::Lsn;

use crate::catalog::CompressAlg;
use crate::config::RunContext;
use crate::headermap::StoredPageHeader;

/// Size of the inline record header: block, payload length, hole offset,
/// hole length.
pub const PAGE_RECORD_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRecordHeader {
    pub block: u32,
    pub payload_len: u32,
    pub hole_offset: u16,
    pub hole_length: u16,
}

impl PageRecordHeader {
    pub fn encode(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.block);
        LittleEndian::write_u32(&mut buf[4..8], self.payload_len);
        LittleEndian::write_u16(&mut buf[8..10], self.hole_offset);
        LittleEndian::write_u16(&mut buf[10..12], self.hole_length);
    }

    pub fn decode(buf: &[u8]) -> PageRecordHeader {
        PageRecordHeader {
            block: LittleEndian::read_u32(&buf[0..4]),
            payload_len: LittleEndian::read_u32(&buf[4..8]),
            hole_offset: LittleEndian::read_u16(&buf[8..10]),
            hole_length: LittleEndian::read_u16(&buf[10..12]),
        }
    }
}

/// A writer that tracks CRC-32C and byte count of everything passing
/// through, i.e. of the stored on-disk form.
pub struct CrcWriter<W: Write> {
    inner: W,
    crc: u32,
    bytes: u64,
}

impl<W: Write> CrcWriter<W> {
    pub fn new(inner: W) -> Self {
        CrcWriter {
            inner,
            crc: 0,
            bytes: 0,
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CrcWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reading twin of [`CrcWriter`].
pub struct CrcReader<R: Read> {
    inner: R,
    crc: u32,
    bytes: u64,
}

impl<R: Read> CrcReader<R> {
    pub fn new(inner: R) -> Self {
        CrcReader {
            inner,
            crc: 0,
            bytes: 0,
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl<R: Read> Read for CrcReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// The "writable byte stream" seam: plain file or gzip, decided per backup.
enum StoreWriter {
    Plain(CrcWriter<BufWriter<File>>),
    Gzip(GzEncoder<CrcWriter<BufWriter<File>>>),
}

/// Sink for one stored file. Tracks the stored CRC/size underneath any
/// compression, and the uncompressed size above it.
pub struct StoreSink {
    writer: Option<StoreWriter>,
    uncompressed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Bytes written to disk (post compression).
    pub write_size: u64,
    /// CRC-32C of the stored bytes.
    pub crc: u32,
    /// Bytes before compression.
    pub uncompressed_size: u64,
}

impl StoreSink {
    pub fn create(
        path: &Utf8Path,
        compress_alg: CompressAlg,
        compress_level: u32,
    ) -> anyhow::Result<StoreSink> {
        let file = File::create(path).with_context(|| format!("create {path}"))?;
        let crc_writer = CrcWriter::new(BufWriter::new(file));
        let writer = match compress_alg {
            CompressAlg::None => StoreWriter::Plain(crc_writer),
            CompressAlg::Zlib => StoreWriter::Gzip(GzEncoder::new(
                crc_writer,
                Compression::new(compress_level.clamp(1, 9)),
            )),
        };
        Ok(StoreSink {
            writer: Some(writer),
            uncompressed: 0,
        })
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.uncompressed
    }

    pub fn finish(mut self) -> anyhow::Result<StoreStats> {
        let crc_writer = match self.writer.take().expect("finish called once") {
            StoreWriter::Plain(w) => w,
            StoreWriter::Gzip(gz) => gz.finish().context("finish gzip stream")?,
        };
        let stats = StoreStats {
            write_size: crc_writer.bytes(),
            crc: crc_writer.crc(),
            uncompressed_size: self.uncompressed,
        };
        let mut inner = crc_writer.into_inner();
        inner.flush().context("flush store file")?;
        Ok(stats)
    }
}

impl Write for StoreSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.writer.as_mut().expect("sink not finished") {
            StoreWriter::Plain(w) => w.write(buf)?,
            StoreWriter::Gzip(w) => w.write(buf)?,
        };
        self.uncompressed += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut().expect("sink not finished") {
            StoreWriter::Plain(w) => w.flush(),
            StoreWriter::Gzip(w) => w.flush(),
        }
    }
}

/// The "readable byte stream" seam, mirroring [`StoreSink`].
pub fn open_store_reader(
    path: &Utf8Path,
    compress_alg: CompressAlg,
) -> anyhow::Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("open {path}"))?;
    let reader = BufReader::new(file);
    Ok(match compress_alg {
        CompressAlg::None => Box::new(reader),
        CompressAlg::Zlib => Box::new(GzDecoder::new(reader)),
    })
}

/// Result of backing up one datafile.
#[derive(Debug)]
pub struct DatafileBackupResult {
    pub read_size: u64,
    pub stats: StoreStats,
    pub n_blocks: u32,
    /// Blocks actually present in the stored stream.
    pub pagemap: BlockBitmap,
    pub headers: Vec<StoredPageHeader>,
}

/// Copy the pages of `src` that the incremental rules select into a new
/// store file at `dst`.
///
/// - `threshold_lsn`: pages whose LSN is below it are skipped (FULL passes
///   [`Lsn::INVALID`], which skips nothing).
/// - `prefilter`: blocks to consider at all; blocks absent from it are
///   assumed unchanged and are not even read (PAGE/PTRACK modes).
///
/// All-zero pages are never stored: restore recreates them from the file
/// size. Invalid and unknown-layout pages are stored verbatim.
pub fn backup_data_file(
    src: &Utf8Path,
    dst: &Utf8Path,
    blcksz: u16,
    threshold_lsn: Lsn,
    prefilter: Option<&BlockBitmap>,
    compress_alg: CompressAlg,
    compress_level: u32,
    ctx: &RunContext,
) -> anyhow::Result<DatafileBackupResult> {
    let mut src_file = File::open(src).with_context(|| format!("open {src}"))?;
    let src_size = src_file
        .metadata()
        .with_context(|| format!("stat {src}"))?
        .len();
    let n_blocks = src_size.div_ceil(blcksz as u64) as u32;

    let mut sink = StoreSink::create(dst, compress_alg, compress_level)?;
    let mut page_buf = vec![0u8; blcksz as usize];
    let mut headers = Vec::new();
    let mut pagemap = BlockBitmap::new();
    let mut read_size = 0u64;
    let mut pos = 0u64;

    let mut store_page = |sink: &mut StoreSink,
                          pos: &mut u64,
                          block: u32,
                          page: &[u8],
                          verdict: PageVerdict|
     -> anyhow::Result<StoredPageHeader> {
        let (hole_offset, hole_length) = match verdict {
            PageVerdict::Valid {
                hole_offset,
                hole_length,
            } => (hole_offset, hole_length),
            _ => (0, 0),
        };
        let payload_len = page.len() - hole_length as usize;
        let rec_header = PageRecordHeader {
            block,
            payload_len: payload_len as u32,
            hole_offset,
            hole_length,
        };
        let mut rec = vec![0u8; PAGE_RECORD_HEADER_LEN + payload_len];
        rec_header.encode(&mut rec[0..PAGE_RECORD_HEADER_LEN]);
        rec[PAGE_RECORD_HEADER_LEN..PAGE_RECORD_HEADER_LEN + hole_offset as usize]
            .copy_from_slice(&page[..hole_offset as usize]);
        rec[PAGE_RECORD_HEADER_LEN + hole_offset as usize..]
            .copy_from_slice(&page[(hole_offset + hole_length) as usize..]);

        sink.write_all(&rec).context("write page record")?;

        let page_header = if matches!(verdict, PageVerdict::Valid { .. }) {
            Some(PageHeaderData::decode(page))
        } else {
            None
        };
        let header = StoredPageHeader {
            block,
            pos: *pos,
            len: rec.len() as u32,
            lsn: page_header.map(|h| h.pd_lsn.0).unwrap_or(0),
            checksum: page_header.map(|h| h.pd_checksum).unwrap_or(0),
            crc: crc32c::crc32c(&rec),
        };
        *pos += rec.len() as u64;
        Ok(header)
    };

    let mut process_block = |sink: &mut StoreSink,
                             pos: &mut u64,
                             block: u32,
                             page: &[u8],
                             pagemap: &mut BlockBitmap,
                             headers: &mut Vec<StoredPageHeader>|
     -> anyhow::Result<()> {
        if page.len() == blcksz as usize {
            match classify_page(page, blcksz) {
                PageVerdict::New => return Ok(()),
                verdict @ PageVerdict::Valid { .. } => {
                    let lsn = PageHeaderData::decode(page).pd_lsn;
                    if threshold_lsn.is_valid() && lsn < threshold_lsn {
                        return Ok(());
                    }
                    let header = store_page(sink, pos, block, page, verdict)?;
                    pagemap.set(block);
                    headers.push(header);
                }
                verdict @ (PageVerdict::UnknownLayout | PageVerdict::Invalid) => {
                    if matches!(verdict, PageVerdict::UnknownLayout) {
                        tracing::warn!(
                            "unknown page layout in {src} block {block}, copying verbatim"
                        );
                    }
                    let header = store_page(sink, pos, block, page, verdict)?;
                    pagemap.set(block);
                    headers.push(header);
                }
            }
        } else {
            // Short tail block: torn write at EOF, always copied verbatim.
            let header = store_page(sink, pos, block, page, PageVerdict::Invalid)?;
            pagemap.set(block);
            headers.push(header);
        }
        Ok(())
    };

    match prefilter {
        Some(filter) => {
            for block in filter.iter_ones() {
                ctx.check_interrupted()?;
                if block >= n_blocks {
                    break;
                }
                let offset = block as u64 * blcksz as u64;
                src_file.seek(SeekFrom::Start(offset))?;
                let len = std::cmp::min(blcksz as u64, src_size - offset) as usize;
                src_file
                    .read_exact(&mut page_buf[..len])
                    .with_context(|| format!("read block {block} of {src}"))?;
                read_size += len as u64;
                process_block(
                    &mut sink,
                    &mut pos,
                    block,
                    &page_buf[..len],
                    &mut pagemap,
                    &mut headers,
                )?;
            }
        }
        None => {
            for block in 0..n_blocks {
                ctx.check_interrupted()?;
                let offset = block as u64 * blcksz as u64;
                let len = std::cmp::min(blcksz as u64, src_size - offset) as usize;
                src_file
                    .read_exact(&mut page_buf[..len])
                    .with_context(|| format!("read block {block} of {src}"))?;
                read_size += len as u64;
                process_block(
                    &mut sink,
                    &mut pos,
                    block,
                    &page_buf[..len],
                    &mut pagemap,
                    &mut headers,
                )?;
            }
        }
    }

    let stats = sink.finish()?;
    Ok(DatafileBackupResult {
        read_size,
        stats,
        n_blocks,
        pagemap,
        headers,
    })
}

/// Apply a stored datafile's page records onto `out`, which must already be
/// opened read-write and sized. Blocks in `skip_blocks` are left untouched,
/// as are blocks at or past `block_limit` (pages an older chain member had
/// before the file shrank). With `skip_shift`, the skip bitmap only
/// suppresses records whose stored page LSN is below that shift: content
/// newer than the shift is always written, however the disk looks.
/// Returns the number of bytes actually written.
pub fn apply_data_file_records(
    store_path: &Utf8Path,
    compress_alg: CompressAlg,
    blcksz: u16,
    out: &mut File,
    skip_blocks: Option<&BlockBitmap>,
    skip_shift: Option<Lsn>,
    block_limit: Option<u32>,
    ctx: &RunContext,
) -> anyhow::Result<u64> {
    let mut reader = open_store_reader(store_path, compress_alg)?;
    let mut header_buf = [0u8; PAGE_RECORD_HEADER_LEN];
    let mut page = vec![0u8; blcksz as usize];
    let mut written = 0u64;
    let mut last_block: Option<u32> = None;

    loop {
        ctx.check_interrupted()?;
        match reader.read_exact(&mut header_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).with_context(|| format!("read record header in {store_path}")),
        }
        let rec = PageRecordHeader::decode(&header_buf);
        if rec.payload_len as usize + (rec.hole_length as usize) > blcksz as usize
            || rec.hole_offset as usize > rec.payload_len as usize
        {
            anyhow::bail!(
                "corrupt page record in {store_path}: payload {} hole {}+{}",
                rec.payload_len,
                rec.hole_offset,
                rec.hole_length
            );
        }
        // Within one file, records are in ascending block order.
        if let Some(last) = last_block {
            if rec.block <= last {
                anyhow::bail!(
                    "page records out of order in {store_path}: block {} after {last}",
                    rec.block
                );
            }
        }
        last_block = Some(rec.block);

        let payload_len = rec.payload_len as usize;
        let restored_len = payload_len + rec.hole_length as usize;
        page[..restored_len].iter_mut().for_each(|b| *b = 0);
        reader
            .read_exact(&mut page[..payload_len])
            .with_context(|| format!("read record payload in {store_path}"))?;

        if let Some(skip) = skip_blocks {
            if skip.contains(rec.block) {
                let suppressed = match skip_shift {
                    None => true,
                    Some(shift) => {
                        // the stored payload starts with the page header
                        let record_lsn = if payload_len >= 8 {
                            let hi = LittleEndian::read_u32(&page[0..4]);
                            let lo = LittleEndian::read_u32(&page[4..8]);
                            Lsn(((hi as u64) << 32) | lo as u64)
                        } else {
                            Lsn::MAX
                        };
                        record_lsn < shift
                    }
                };
                if suppressed {
                    continue;
                }
            }
        }
        if let Some(limit) = block_limit {
            if rec.block >= limit {
                continue;
            }
        }

        // Re-insert the hole: move the tail up and zero the middle.
        if rec.hole_length > 0 {
            let hole_off = rec.hole_offset as usize;
            let tail_len = payload_len - hole_off;
            page.copy_within(hole_off..payload_len, hole_off + rec.hole_length as usize);
            // zero the hole proper
            page[hole_off..hole_off + rec.hole_length as usize]
                .iter_mut()
                .for_each(|b| *b = 0);
            debug_assert_eq!(hole_off + rec.hole_length as usize + tail_len, restored_len);
        }

        out.seek(SeekFrom::Start(rec.block as u64 * blcksz as u64))?;
        out.write_all(&page[..restored_len])
            .with_context(|| format!("write block {}", rec.block))?;
        written += restored_len as u64;
    }
    Ok(written)
}

/// Stream a non-datafile into the store.
pub fn backup_plain_file(
    src: &Utf8Path,
    dst: &Utf8Path,
    compress_alg: CompressAlg,
    compress_level: u32,
    ctx: &RunContext,
) -> anyhow::Result<StoreStats> {
    let mut src_file = File::open(src).with_context(|| format!("open {src}"))?;
    let mut sink = StoreSink::create(dst, compress_alg, compress_level)?;
    let mut buf = vec![0u8; 128 * 1024];
    loop {
        ctx.check_interrupted()?;
        let n = src_file.read(&mut buf).with_context(|| format!("read {src}"))?;
        if n == 0 {
            break;
        }
        sink.write_all(&buf[..n]).with_context(|| format!("write {dst}"))?;
    }
    sink.finish()
}

/// Materialize a stored non-datafile at `out_path`.
pub fn restore_plain_file(
    store_path: &Utf8Path,
    compress_alg: CompressAlg,
    out_path: &Utf8Path,
) -> anyhow::Result<u64> {
    let mut reader = open_store_reader(store_path, compress_alg)?;
    let mut out = File::create(out_path).with_context(|| format!("create {out_path}"))?;
    let n = io::copy(&mut reader, &mut out).with_context(|| format!("restore {out_path}"))?;
    Ok(n)
}

/// Recompute the CRC and size of a stored file as it sits on disk.
pub fn stored_file_crc(path: &Utf8Path) -> anyhow::Result<(u32, u64)> {
    let file = File::open(path).with_context(|| format!("open {path}"))?;
    let mut reader = CrcReader::new(BufReader::new(file));
    io::copy(&mut reader, &mut io::sink())?;
    Ok((reader.crc(), CrcReader::bytes(&reader)))
}
